//! File-backed FPE provider.
//!
//! Policy document (JSON):
//! `{"formats": {"SSN": {"preserve": "digits"}, "Name": {"preserve": "alphanumeric"}}}`
//!
//! Each format gets its own key, derived with HKDF-SHA256 from the shared
//! secret (salted with the identity). Values are encrypted with a ten-round
//! alternating Feistel network over the preserved symbols only; every other
//! character keeps its position, so length and character classes survive.

use crate::config::CryptoSettings;
use crate::error::{IngestError, IngestResult};
use crate::services::anonymizer::{FpeCipher, FpeProvider, PolicyHandle};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const ROUNDS: u8 = 10;
const POLICY_CACHE_FILE: &str = "policy.json";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preserve {
    Digits,
    Alphanumeric,
}

#[derive(Debug, Clone, Deserialize)]
struct FormatPolicy {
    preserve: Preserve,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyDocument {
    formats: HashMap<String, FormatPolicy>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFpeProvider;

impl LocalFpeProvider {
    fn policy_location(settings: &CryptoSettings) -> IngestResult<PathBuf> {
        let url = settings.policy_url.trim();
        if let Some(rest) = url.strip_prefix("file://") {
            return Url::parse(url)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .or_else(|| Some(PathBuf::from(rest)))
                .ok_or_else(|| IngestError::Crypto(format!("bad policy URL {}", url)));
        }
        if !url.is_empty() && !url.contains("://") {
            return Ok(PathBuf::from(url));
        }
        match &settings.cache_path {
            Some(cache) => Ok(cache.join(POLICY_CACHE_FILE)),
            None => Err(IngestError::Crypto(format!(
                "policy {} is remote and no cache path is configured",
                url
            ))),
        }
    }
}

impl FpeProvider for LocalFpeProvider {
    fn open_policy(&self, settings: &CryptoSettings) -> IngestResult<Box<dyn PolicyHandle>> {
        if let Some(trust_store) = &settings.trust_store_path {
            if !trust_store.is_dir() {
                return Err(IngestError::Crypto(format!(
                    "trust store {} is not a directory",
                    trust_store.display()
                )));
            }
        }

        let location = Self::policy_location(settings)?;
        let policy = LocalPolicy::load(&location)?;
        info!(
            "📜 Loaded FPE policy from {} ({} formats)",
            location.display(),
            policy.formats.len()
        );
        Ok(Box::new(policy))
    }
}

pub struct LocalPolicy {
    formats: HashMap<String, Preserve>,
}

impl LocalPolicy {
    pub fn load(path: &Path) -> IngestResult<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            IngestError::Crypto(format!("cannot read policy {}: {}", path.display(), e))
        })?;
        let doc: PolicyDocument = serde_json::from_slice(&raw).map_err(|e| {
            IngestError::Crypto(format!("malformed policy {}: {}", path.display(), e))
        })?;
        Ok(Self {
            formats: doc
                .formats
                .into_iter()
                .map(|(name, f)| (name, f.preserve))
                .collect(),
        })
    }
}

impl PolicyHandle for LocalPolicy {
    fn build_cipher(
        &self,
        format: &str,
        shared_secret: &str,
        identity: &str,
    ) -> IngestResult<Arc<dyn FpeCipher>> {
        let preserve = *self
            .formats
            .get(format)
            .ok_or_else(|| IngestError::Crypto(format!("format {} is not in the policy", format)))?;
        let cipher = FeistelCipher::new(format, preserve, shared_secret, identity)?;
        Ok(Arc::new(cipher))
    }
}

impl Drop for LocalPolicy {
    fn drop(&mut self) {
        debug!("FPE policy released");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolClass {
    Digit,
    Lower,
    Upper,
}

impl SymbolClass {
    fn radix(self) -> u16 {
        match self {
            SymbolClass::Digit => 10,
            SymbolClass::Lower | SymbolClass::Upper => 26,
        }
    }

    fn base(self) -> u8 {
        match self {
            SymbolClass::Digit => b'0',
            SymbolClass::Lower => b'a',
            SymbolClass::Upper => b'A',
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
    class: SymbolClass,
    value: u16,
}

pub struct FeistelCipher {
    format: String,
    preserve: Preserve,
    key: [u8; 32],
}

impl FeistelCipher {
    pub fn new(
        format: &str,
        preserve: Preserve,
        shared_secret: &str,
        identity: &str,
    ) -> IngestResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(identity.as_bytes()), shared_secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(format!("fpe:{}", format).as_bytes(), &mut key)
            .map_err(|e| IngestError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(Self {
            format: format.to_string(),
            preserve,
            key,
        })
    }

    fn classify(&self, c: char) -> Option<SymbolClass> {
        match c {
            '0'..='9' => Some(SymbolClass::Digit),
            'a'..='z' if self.preserve == Preserve::Alphanumeric => Some(SymbolClass::Lower),
            'A'..='Z' if self.preserve == Preserve::Alphanumeric => Some(SymbolClass::Upper),
            _ => None,
        }
    }

    /// Round function: one pseudo-random `u16` per target position.
    fn round_values(
        &self,
        round: u8,
        total: usize,
        source: &[Symbol],
        count: usize,
    ) -> IngestResult<Vec<u16>> {
        let mut out = Vec::with_capacity(count);
        let mut counter: u32 = 0;
        while out.len() < count {
            let mut mac = HmacSha256::new_from_slice(&self.key)
                .map_err(|e| IngestError::Crypto(e.to_string()))?;
            mac.update(&[round]);
            mac.update(&(total as u32).to_be_bytes());
            mac.update(&counter.to_be_bytes());
            for s in source {
                mac.update(&s.value.to_be_bytes());
            }
            let block = mac.finalize().into_bytes();
            for pair in block.chunks_exact(2) {
                if out.len() == count {
                    break;
                }
                out.push(u16::from_be_bytes([pair[0], pair[1]]));
            }
            counter += 1;
        }
        Ok(out)
    }

    fn apply(&self, input: &str, forward: bool) -> IngestResult<String> {
        let chars: Vec<char> = input.chars().collect();
        let mut positions = Vec::new();
        let mut symbols = Vec::new();
        for (i, &c) in chars.iter().enumerate() {
            if let Some(class) = self.classify(c) {
                positions.push(i);
                symbols.push(Symbol {
                    class,
                    value: (c as u8 - class.base()) as u16,
                });
            }
        }

        let total = symbols.len();
        if total == 0 {
            return Ok(input.to_string());
        }

        let split = total / 2;
        let rounds: Vec<u8> = if forward {
            (0..ROUNDS).collect()
        } else {
            (0..ROUNDS).rev().collect()
        };

        for round in rounds {
            let (left, right) = symbols.split_at_mut(split);
            let (target, source) = if round % 2 == 0 {
                (left, &*right)
            } else {
                (right, &*left)
            };
            let shifts = self.round_values(round, total, source, target.len())?;
            for (sym, shift) in target.iter_mut().zip(shifts) {
                let radix = sym.class.radix();
                let shift = shift % radix;
                sym.value = if forward {
                    (sym.value + shift) % radix
                } else {
                    (sym.value + radix - shift) % radix
                };
            }
        }

        let mut out = chars;
        for (pos, sym) in positions.into_iter().zip(symbols) {
            out[pos] = (sym.class.base() + sym.value as u8) as char;
        }
        Ok(out.into_iter().collect())
    }
}

impl FpeCipher for FeistelCipher {
    fn format(&self) -> &str {
        &self.format
    }

    fn protect(&self, plaintext: &str) -> IngestResult<String> {
        self.apply(plaintext, true)
    }

    fn access(&self, ciphertext: &str) -> IngestResult<String> {
        self.apply(ciphertext, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const POLICY: &str =
        r#"{"formats":{"SSN":{"preserve":"digits"},"Name":{"preserve":"alphanumeric"}}}"#;

    fn cipher(format: &str, preserve: Preserve) -> FeistelCipher {
        FeistelCipher::new(format, preserve, "s3cret", "etl@example.com").unwrap()
    }

    #[test]
    fn test_digits_keep_shape() {
        let c = cipher("SSN", Preserve::Digits);
        let out = c.protect("123-45-6789").unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(&out[3..4], "-");
        assert_eq!(&out[6..7], "-");
        assert!(out.chars().filter(|c| *c != '-').all(|c| c.is_ascii_digit()));
        assert_ne!(out, "123-45-6789");
        assert_eq!(c.access(&out).unwrap(), "123-45-6789");
    }

    #[test]
    fn test_alphanumeric_keeps_case() {
        let c = cipher("Name", Preserve::Alphanumeric);
        let out = c.protect("Alice Smith 42").unwrap();
        assert_eq!(out.chars().count(), 14);
        for (a, b) in "Alice Smith 42".chars().zip(out.chars()) {
            assert_eq!(a.is_ascii_uppercase(), b.is_ascii_uppercase());
            assert_eq!(a.is_ascii_lowercase(), b.is_ascii_lowercase());
            assert_eq!(a.is_ascii_digit(), b.is_ascii_digit());
        }
        assert_eq!(c.access(&out).unwrap(), "Alice Smith 42");
    }

    #[test]
    fn test_deterministic_and_key_separated() {
        let a = cipher("SSN", Preserve::Digits);
        let b = cipher("SSN", Preserve::Digits);
        assert_eq!(a.protect("987654321").unwrap(), b.protect("987654321").unwrap());

        let other = FeistelCipher::new("SSN", Preserve::Digits, "different", "etl@example.com")
            .unwrap();
        assert_ne!(a.protect("987654321").unwrap(), other.protect("987654321").unwrap());
    }

    #[test]
    fn test_short_values() {
        let c = cipher("SSN", Preserve::Digits);
        assert_eq!(c.protect("no digits").unwrap(), "no digits");
        let one = c.protect("7").unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(c.access(&one).unwrap(), "7");
    }

    #[test]
    fn test_policy_from_file_url() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, POLICY).unwrap();

        let settings = CryptoSettings {
            policy_url: format!("file://{}", path.display()),
            identity: "etl@example.com".to_string(),
            shared_secret: "s3cret".to_string(),
            trust_store_path: Some(dir.path().to_path_buf()),
            cache_path: None,
        };
        let policy = LocalFpeProvider.open_policy(&settings).unwrap();
        assert!(policy.build_cipher("SSN", "s3cret", "id").is_ok());
        assert!(matches!(
            policy.build_cipher("Passport", "s3cret", "id"),
            Err(IngestError::Crypto(_))
        ));
    }

    #[test]
    fn test_remote_policy_reads_cache() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(POLICY_CACHE_FILE), POLICY).unwrap();

        let settings = CryptoSettings {
            policy_url: "https://policy.example.com/fpe".to_string(),
            cache_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let policy = LocalFpeProvider.open_policy(&settings).unwrap();
        assert!(policy.build_cipher("Name", "s", "i").is_ok());

        let settings = CryptoSettings {
            policy_url: "https://policy.example.com/fpe".to_string(),
            ..Default::default()
        };
        assert!(LocalFpeProvider.open_policy(&settings).is_err());
    }

    #[test]
    fn test_trust_store_must_exist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, POLICY).unwrap();
        let settings = CryptoSettings {
            policy_url: path.display().to_string(),
            trust_store_path: Some(dir.path().join("missing")),
            ..Default::default()
        };
        assert!(LocalFpeProvider.open_policy(&settings).is_err());
    }
}
