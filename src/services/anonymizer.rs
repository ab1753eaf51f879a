use crate::config::CryptoSettings;
use crate::error::{IngestError, IngestResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A format-preserving cipher bound to one format.
pub trait FpeCipher: Send + Sync {
    fn format(&self) -> &str;
    fn protect(&self, plaintext: &str) -> IngestResult<String>;
    fn access(&self, ciphertext: &str) -> IngestResult<String>;
}

/// An acquired FPE policy. Dropping it releases the policy.
pub trait PolicyHandle: Send + Sync {
    fn build_cipher(
        &self,
        format: &str,
        shared_secret: &str,
        identity: &str,
    ) -> IngestResult<Arc<dyn FpeCipher>>;
}

pub trait FpeProvider: Send + Sync {
    fn open_policy(&self, settings: &CryptoSettings) -> IngestResult<Box<dyn PolicyHandle>>;
}

/// Per-worker crypto state: one policy handle plus the format-indexed
/// cipher cache.
pub struct CryptoContext {
    // Declared before `policy` so ciphers are dropped first.
    ciphers: DashMap<String, Arc<dyn FpeCipher>>,
    policy: Box<dyn PolicyHandle>,
    shared_secret: String,
    identity: String,
}

impl CryptoContext {
    pub fn open(provider: &dyn FpeProvider, settings: &CryptoSettings) -> IngestResult<Self> {
        let policy = provider.open_policy(settings)?;
        info!("🔐 FPE policy acquired for identity {}", settings.identity);
        Ok(Self {
            ciphers: DashMap::new(),
            policy,
            shared_secret: settings.shared_secret.clone(),
            identity: settings.identity.clone(),
        })
    }

    /// Returns the cached cipher for `format`, building it on first use.
    ///
    /// The shard lock is held while building, so concurrent callers never
    /// build the same format twice nor see a half-built entry.
    pub fn cipher(&self, format: &str) -> IngestResult<Arc<dyn FpeCipher>> {
        if let Some(cipher) = self.ciphers.get(format) {
            return Ok(Arc::clone(cipher.value()));
        }

        let entry = self
            .ciphers
            .entry(format.to_string())
            .or_try_insert_with(|| {
                debug!("Building FPE cipher for format {}", format);
                self.policy
                    .build_cipher(format, &self.shared_secret, &self.identity)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Builds every listed format up front.
    pub fn prepare<S: AsRef<str>>(&self, formats: &[S]) -> IngestResult<()> {
        for format in formats {
            self.cipher(format.as_ref())?;
        }
        Ok(())
    }

    pub fn cipher_count(&self) -> usize {
        self.ciphers.len()
    }
}

impl Drop for CryptoContext {
    fn drop(&mut self) {
        let released = self.ciphers.len();
        self.ciphers.clear();
        debug!("Released {} FPE cipher(s) before the policy handle", released);
    }
}

/// Column-level protection backed by a shared [`CryptoContext`].
#[derive(Clone)]
pub struct Anonymizer {
    context: Arc<CryptoContext>,
}

impl Anonymizer {
    pub fn new(context: Arc<CryptoContext>) -> Self {
        Self { context }
    }

    pub fn protect(&self, format: &str, plaintext: &str) -> IngestResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        self.context
            .cipher(format)?
            .protect(plaintext)
            .map_err(|e| match e {
                IngestError::Crypto(_) => e,
                other => IngestError::Crypto(other.to_string()),
            })
    }

    pub fn context(&self) -> &Arc<CryptoContext> {
        &self.context
    }
}
