use crate::config::{Encryption, RunConfig};
use crate::error::{IngestError, IngestResult};
use crate::models::{FileDescriptor, FileOutcome, RunSummary};
use crate::services::anonymizer::{Anonymizer, CryptoContext, FpeProvider};
use crate::services::file_processor::{DestinationLayout, FileProcessor};
use crate::services::source_fs::SourceFs;
use crate::services::storage::Uploader;
use crate::services::transform::{ChainFactory, PgpKey};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Runs files through one [`FileProcessor`] while owning the resources the
/// files share: the crypto context and the PGP key.
pub struct Worker {
    // Dropped first: it holds clones of the crypto context.
    processor: FileProcessor,
    crypto: Option<Arc<CryptoContext>>,
    pgp_key: Option<Arc<PgpKey>>,
    cancel: CancellationToken,
}

impl Worker {
    /// Acquires the crypto context and every configured cipher up front, so a
    /// format the policy does not know fails here rather than mid-file.
    pub fn new(
        config: &RunConfig,
        provider: &dyn FpeProvider,
        source_fs: Arc<dyn SourceFs>,
        uploader: Arc<dyn Uploader>,
    ) -> IngestResult<Self> {
        let formats = config.anonymized_formats();
        let crypto = if formats.is_empty() {
            None
        } else {
            let context = CryptoContext::open(provider, &config.crypto)?;
            context.prepare(&formats)?;
            Some(Arc::new(context))
        };

        let pgp_key = match config.encryption {
            Encryption::Pgp => {
                let path = config.public_key_path.as_deref().ok_or_else(|| {
                    IngestError::invalid_config("publicKeyPath", "required for pgp encryption")
                })?;
                Some(Arc::new(PgpKey::load(path)?))
            }
            Encryption::None => None,
        };

        let chains = ChainFactory::new(
            config,
            crypto.as_ref().map(|c| Anonymizer::new(Arc::clone(c))),
            pgp_key.clone(),
        )?;
        let layout = DestinationLayout {
            bucket: config.destination.bucket.clone(),
            prefix: config.destination_path.clone(),
        };
        let processor =
            FileProcessor::new(source_fs, uploader, chains, layout, config.buffer_size);

        Ok(Self {
            processor,
            crypto,
            pgp_key,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling it aborts in-flight files and skips the ones not started.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn crypto_context(&self) -> Option<&Arc<CryptoContext>> {
        self.crypto.as_ref()
    }

    pub fn cipher_count(&self) -> usize {
        self.crypto.as_ref().map_or(0, |c| c.cipher_count())
    }

    pub fn has_pgp_key(&self) -> bool {
        self.pgp_key.is_some()
    }

    pub async fn process(&self, descriptor: FileDescriptor) -> FileOutcome {
        self.processor
            .process_with_cancel(descriptor, self.cancel.child_token())
            .await
    }

    /// Processes `descriptors` with at most `concurrency` files in flight.
    pub async fn run(&self, descriptors: Vec<FileDescriptor>, concurrency: usize) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_files(descriptors, concurrency).instrument(span).await
    }

    async fn run_files(&self, descriptors: Vec<FileDescriptor>, concurrency: usize) -> RunSummary {
        let concurrency = concurrency.max(1);
        info!(
            "🚀 Worker started: {} file(s), concurrency {}",
            descriptors.len(),
            concurrency
        );

        let mut outcomes = futures::stream::iter(descriptors)
            .map(|descriptor| self.process(descriptor))
            .buffer_unordered(concurrency);

        let mut summary = RunSummary::default();
        let mut cancel_seen = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    warn!("🛑 Run cancelled, aborting in-flight files");
                    cancel_seen = true;
                }
                next = outcomes.next() => match next {
                    Some(outcome) => summary.record(outcome),
                    None => break,
                }
            }
        }

        info!(
            "✅ Run finished: {} succeeded, {} failed, {} skipped",
            summary.succeeded, summary.failed, summary.skipped
        );
        summary
    }

    /// Releases cipher handles, then the policy handle.
    ///
    /// Fails without releasing anything if a caller still holds the crypto
    /// context; the last holder's drop performs the release instead.
    pub fn shutdown(self) -> IngestResult<()> {
        let Worker {
            processor,
            crypto,
            pgp_key,
            cancel,
        } = self;
        cancel.cancel();
        drop(processor);
        drop(pgp_key);
        if let Some(context) = crypto {
            let context = Arc::try_unwrap(context).map_err(|shared| {
                let holders = Arc::strong_count(&shared) - 1;
                warn!("Crypto context still held by {} other owner(s)", holders);
                IngestError::Crypto(format!(
                    "crypto context still held by {} other owner(s) at shutdown",
                    holders
                ))
            })?;
            drop(context);
        }
        info!("🛑 Worker shut down");
        Ok(())
    }
}
