use crate::error::IngestResult;
use crate::models::{FileDescriptor, FileOutcome, UploadReport, UploadTarget};
use crate::services::bridge::{self, is_consumer_gone};
use crate::services::source_fs::SourceFs;
use crate::services::storage::Uploader;
use crate::services::transform::ChainFactory;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where outputs land: bucket plus the key prefix (already carrying the
/// rendered time segment).
#[derive(Debug, Clone)]
pub struct DestinationLayout {
    pub bucket: String,
    pub prefix: String,
}

impl DestinationLayout {
    pub fn key_for(&self, relative_path: &str, extension: &str) -> String {
        let mut key = self.prefix.clone();
        if !key.is_empty() && !key.ends_with('/') {
            key.push('/');
        }
        key.push_str(relative_path.trim_start_matches('/'));
        key.push_str(extension);
        key
    }
}

/// Moves one descriptor from source to destination.
pub struct FileProcessor {
    source_fs: Arc<dyn SourceFs>,
    uploader: Arc<dyn Uploader>,
    chains: ChainFactory,
    layout: DestinationLayout,
    buffer_size: usize,
}

impl FileProcessor {
    pub fn new(
        source_fs: Arc<dyn SourceFs>,
        uploader: Arc<dyn Uploader>,
        chains: ChainFactory,
        layout: DestinationLayout,
        buffer_size: usize,
    ) -> Self {
        Self {
            source_fs,
            uploader,
            chains,
            layout,
            buffer_size,
        }
    }

    pub async fn process(&self, descriptor: FileDescriptor) -> FileOutcome {
        self.process_with_cancel(descriptor, CancellationToken::new())
            .await
    }

    /// Never fails: every error ends up in the returned outcome.
    pub async fn process_with_cancel(
        &self,
        descriptor: FileDescriptor,
        cancel: CancellationToken,
    ) -> FileOutcome {
        if descriptor.relative_path.is_empty() || descriptor.full_path.is_empty() {
            warn!("Skipping descriptor with empty path: {:?}", descriptor);
            return FileOutcome::skipped(descriptor, "relative or full path is empty");
        }
        if cancel.is_cancelled() {
            return FileOutcome::skipped(descriptor, "run cancelled before the file started");
        }

        let started = Instant::now();
        match self.transfer(&descriptor, cancel).await {
            Ok(report) => {
                info!(
                    "✅ {} -> {} ({} bytes, {:?})",
                    descriptor.full_path,
                    report.key,
                    report.bytes,
                    started.elapsed()
                );
                FileOutcome::ok(descriptor, report)
            }
            Err(e) => {
                error!("❌ {} failed [{}]: {}", descriptor.full_path, e.kind(), e);
                FileOutcome::failed(descriptor, &e)
            }
        }
    }

    async fn transfer(
        &self,
        descriptor: &FileDescriptor,
        cancel: CancellationToken,
    ) -> IngestResult<UploadReport> {
        let source = self.source_fs.open(descriptor).await?;
        let chain = self.chains.for_file(&source.metadata)?;

        let target = UploadTarget {
            bucket: self.layout.bucket.clone(),
            key: self.layout.key_for(&descriptor.relative_path, chain.extension()),
            content_type: chain.content_type().to_string(),
        };
        debug!(
            source = %descriptor.full_path,
            key = %target.key,
            chain = %chain.describe(),
            size = source.metadata.size,
            "Starting transfer"
        );

        let reader_input = source.reader;
        let (reader, producer) = bridge::spawn(self.buffer_size, Some(cancel), move |out| {
            chain.produce(reader_input, out)
        });

        let uploaded = self.uploader.upload(&target, Box::new(reader)).await;
        let produced = producer.join().await;

        match (uploaded, produced) {
            (Ok(report), Ok(_)) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(upload_err), Ok(_)) => Err(upload_err),
            (Err(upload_err), Err(producer_err)) => {
                // A producer that only saw the reader go away has nothing to add.
                if is_consumer_gone(&producer_err) {
                    Err(upload_err)
                } else {
                    Err(producer_err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let layout = DestinationLayout {
            bucket: "b".to_string(),
            prefix: "landing/2024-03-07/".to_string(),
        };
        assert_eq!(
            layout.key_for("dir/a.csv", ".zip"),
            "landing/2024-03-07/dir/a.csv.zip"
        );

        let layout = DestinationLayout {
            bucket: "b".to_string(),
            prefix: "landing".to_string(),
        };
        assert_eq!(layout.key_for("a.csv", ""), "landing/a.csv");

        let layout = DestinationLayout {
            bucket: "b".to_string(),
            prefix: String::new(),
        };
        assert_eq!(layout.key_for("a.csv", ".gz.pgp"), "a.csv.gz.pgp");
    }
}
