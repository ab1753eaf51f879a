use crate::error::{IngestError, IngestResult};
use crate::models::{FileDescriptor, SourceMetadata};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tokio_util::io::SyncIoBridge;
use tracing::debug;
use url::Url;

/// An opened source object. The reader is blocking and single-pass.
pub struct SourceStream {
    pub reader: Box<dyn Read + Send>,
    pub metadata: SourceMetadata,
}

#[async_trait]
pub trait SourceFs: Send + Sync {
    async fn open(&self, descriptor: &FileDescriptor) -> IngestResult<SourceStream>;

    /// Regular files under `source_path`, sorted by path.
    async fn list(
        &self,
        source_path: &str,
        host_uri: &str,
        recursive: bool,
    ) -> IngestResult<Vec<FileDescriptor>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceScheme {
    Local,
    ObjectStore { bucket: String },
    Unsupported(String),
}

fn scheme_of(host_uri: &str) -> IngestResult<SourceScheme> {
    let host_uri = host_uri.trim();
    if host_uri.is_empty() || host_uri == "/" {
        return Ok(SourceScheme::Local);
    }
    let url = Url::parse(host_uri)
        .map_err(|e| IngestError::InvalidSource(format!("bad host URI '{}': {}", host_uri, e)))?;
    Ok(match url.scheme() {
        "file" => SourceScheme::Local,
        "s3" | "gs" => SourceScheme::ObjectStore {
            bucket: url.host_str().unwrap_or_default().to_string(),
        },
        other => SourceScheme::Unsupported(other.to_string()),
    })
}

fn millis_since_epoch(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Routes by the descriptor's host URI: local paths directly, `s3://` and
/// `gs://` through an S3-compatible client.
#[derive(Clone, Default)]
pub struct SchemeSourceFs {
    object_store: Option<Client>,
}

impl SchemeSourceFs {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_object_store(client: Client) -> Self {
        Self {
            object_store: Some(client),
        }
    }

    fn client(&self) -> IngestResult<&Client> {
        self.object_store.as_ref().ok_or_else(|| {
            IngestError::InvalidSource("no object store client is configured".to_string())
        })
    }

    async fn open_local(&self, descriptor: &FileDescriptor) -> IngestResult<SourceStream> {
        let path = &descriptor.full_path;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IngestError::InvalidSource(format!("cannot open {}: {}", path, e)))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| IngestError::InvalidSource(format!("cannot stat {}: {}", path, e)))?;
        if !meta.is_file() {
            return Err(IngestError::InvalidSource(format!(
                "{} is not a regular file",
                path
            )));
        }

        let metadata = SourceMetadata {
            name: descriptor.file_name.clone(),
            size: meta.len(),
            last_modified_millis: millis_since_epoch(&meta),
        };
        let file = file.into_std().await;
        Ok(SourceStream {
            reader: Box::new(BufReader::new(file)),
            metadata,
        })
    }

    async fn open_object(
        &self,
        bucket: &str,
        descriptor: &FileDescriptor,
    ) -> IngestResult<SourceStream> {
        let key = descriptor.full_path.trim_start_matches('/');
        let res = self
            .client()?
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                IngestError::InvalidSource(format!(
                    "cannot open {}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(e)
                ))
            })?;

        let metadata = SourceMetadata {
            name: descriptor.file_name.clone(),
            size: res.content_length().unwrap_or(0).max(0) as u64,
            last_modified_millis: res
                .last_modified()
                .and_then(|t| t.to_millis().ok())
                .unwrap_or(0),
        };
        let body = Box::pin(res.body.into_async_read());
        Ok(SourceStream {
            reader: Box::new(SyncIoBridge::new(body)),
            metadata,
        })
    }

    async fn list_local(
        &self,
        source_path: &str,
        host_uri: &str,
        recursive: bool,
    ) -> IngestResult<Vec<FileDescriptor>> {
        let source = source_path.to_string();
        let host = host_uri.to_string();
        let root = Path::new(source_path).to_path_buf();
        if !root.exists() {
            return Err(IngestError::InvalidSource(format!(
                "{} does not exist",
                source_path
            )));
        }

        tokio::task::spawn_blocking(move || {
            let walker = walkdir::WalkDir::new(&root)
                .max_depth(if recursive { usize::MAX } else { 1 })
                .sort_by_file_name();
            let mut descriptors = Vec::new();
            for entry in walker {
                let entry = entry
                    .map_err(|e| IngestError::InvalidSource(format!("cannot list: {}", e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let full_path = entry.path().to_string_lossy().into_owned();
                descriptors.push(FileDescriptor::from_path(&full_path, &source, &host)?);
            }
            descriptors.sort_by(|a, b| a.full_path.cmp(&b.full_path));
            Ok(descriptors)
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))?
    }

    async fn list_objects(
        &self,
        bucket: &str,
        source_path: &str,
        host_uri: &str,
        recursive: bool,
    ) -> IngestResult<Vec<FileDescriptor>> {
        let client = self.client()?;
        let prefix = source_path.trim_start_matches('/');
        let mut descriptors = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token);
            if !recursive {
                request = request.delimiter("/");
            }
            let res = request.send().await.map_err(|e| {
                IngestError::InvalidSource(format!(
                    "cannot list {}/{}: {}",
                    bucket,
                    prefix,
                    DisplayErrorContext(e)
                ))
            })?;

            if let Some(contents) = res.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        if key.ends_with('/') {
                            continue;
                        }
                        descriptors.push(FileDescriptor::from_path(&key, prefix, host_uri)?);
                    }
                }
            }

            if res.is_truncated.unwrap_or(false) {
                continuation_token = res.next_continuation_token;
            } else {
                break;
            }
        }

        descriptors.sort_by(|a, b| a.full_path.cmp(&b.full_path));
        Ok(descriptors)
    }
}

#[async_trait]
impl SourceFs for SchemeSourceFs {
    async fn open(&self, descriptor: &FileDescriptor) -> IngestResult<SourceStream> {
        debug!("Opening {} ({})", descriptor.full_path, descriptor.host_uri);
        match scheme_of(&descriptor.host_uri)? {
            SourceScheme::Local => self.open_local(descriptor).await,
            SourceScheme::ObjectStore { bucket } => self.open_object(&bucket, descriptor).await,
            SourceScheme::Unsupported(scheme) => Err(IngestError::InvalidSource(format!(
                "no filesystem for scheme '{}'",
                scheme
            ))),
        }
    }

    async fn list(
        &self,
        source_path: &str,
        host_uri: &str,
        recursive: bool,
    ) -> IngestResult<Vec<FileDescriptor>> {
        match scheme_of(host_uri)? {
            SourceScheme::Local => self.list_local(source_path, host_uri, recursive).await,
            SourceScheme::ObjectStore { bucket } => {
                self.list_objects(&bucket, source_path, host_uri, recursive)
                    .await
            }
            SourceScheme::Unsupported(scheme) => Err(IngestError::InvalidSource(format!(
                "no filesystem for scheme '{}'",
                scheme
            ))),
        }
    }
}
