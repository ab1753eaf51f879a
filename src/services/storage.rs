use crate::error::{IngestError, IngestResult};
use crate::models::{UploadReport, UploadTarget};
use crate::utils::hash::StreamDigest;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Smallest part S3 accepts for every part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Streams `reader` to `target`, committing only after a clean EOF.
    async fn upload<'a>(
        &self,
        target: &UploadTarget,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> IngestResult<UploadReport>;
}

fn upload_err(action: &str, err: impl std::error::Error) -> IngestError {
    IngestError::Upload(format!("{} failed: {}", action, DisplayErrorContext(err)))
}

/// Multipart upload into an S3-compatible store.
pub struct S3Uploader {
    client: Client,
    buffer_size: usize,
    part_size: usize,
    project: Option<String>,
    buckets: DashMap<String, Arc<OnceCell<()>>>,
}

impl S3Uploader {
    pub fn new(client: Client, buffer_size: usize) -> Self {
        Self {
            client,
            buffer_size: buffer_size.max(1),
            part_size: DEFAULT_PART_SIZE,
            project: None,
            buckets: DashMap::new(),
        }
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    /// Attached to every object as `project` metadata.
    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    async fn ensure_bucket(&self, bucket: &str) -> IngestResult<()> {
        let cell = self
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            match self.client.head_bucket().bucket(bucket).send().await {
                Ok(_) => {
                    debug!("Bucket '{}' is ready", bucket);
                    Ok::<(), IngestError>(())
                }
                Err(_) => {
                    info!("🪣 Bucket '{}' not found, creating...", bucket);
                    self.client
                        .create_bucket()
                        .bucket(bucket)
                        .send()
                        .await
                        .map_err(|e| upload_err("create_bucket", e))?;
                    info!("✅ Bucket '{}' created successfully", bucket);
                    Ok(())
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> IngestResult<CompletedPart> {
        debug!(key = %target.key, part_number, bytes = data.len(), "Uploading part");
        let res = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .body(ByteStream::from(data))
            .part_number(part_number)
            .send()
            .await
            .map_err(|e| upload_err("upload_part", e))?;

        Ok(CompletedPart::builder()
            .e_tag(res.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build())
    }

    async fn stream_parts<'a>(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send + 'a),
    ) -> IngestResult<UploadReport> {
        let mut window = vec![0u8; self.buffer_size];
        let mut part = Vec::with_capacity(self.part_size);
        let mut completed_parts = Vec::new();
        let mut digest = StreamDigest::new();
        let mut part_number = 1;

        loop {
            let n = reader.read(&mut window).await?;
            if n == 0 {
                break;
            }
            digest.update(&window[..n]);
            part.extend_from_slice(&window[..n]);

            if part.len() >= self.part_size {
                let data = std::mem::replace(&mut part, Vec::with_capacity(self.part_size));
                completed_parts.push(self.upload_part(target, upload_id, part_number, data).await?);
                part_number += 1;
            }
        }

        // The last part may be short; an empty object still needs one part.
        if !part.is_empty() || completed_parts.is_empty() {
            completed_parts.push(self.upload_part(target, upload_id, part_number, part).await?);
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(|e| upload_err("complete_multipart_upload", e))?;

        let (sha256, bytes) = digest.finish();
        Ok(UploadReport {
            key: target.key.clone(),
            bytes,
            sha256,
        })
    }

    async fn abort(&self, target: &UploadTarget, upload_id: &str) {
        let res = self
            .client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .send()
            .await;

        if let Err(e) = res {
            tracing::error!(
                "S3 abort_multipart_upload failed: {}/{}, error={}",
                target.bucket,
                target.key,
                DisplayErrorContext(e)
            );
        } else {
            warn!("Aborted upload of {}/{}", target.bucket, target.key);
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload<'a>(
        &self,
        target: &UploadTarget,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> IngestResult<UploadReport> {
        self.ensure_bucket(&target.bucket).await?;

        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .content_type(&target.content_type);
        if let Some(project) = &self.project {
            request = request.metadata("project", project);
        }
        let multipart_upload_res = request
            .send()
            .await
            .map_err(|e| upload_err("create_multipart_upload", e))?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| IngestError::Upload("No upload ID".to_string()))?
            .to_string();

        match self.stream_parts(target, &upload_id, reader.as_mut()).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abort(target, &upload_id).await;
                Err(e)
            }
        }
    }
}

/// Writes objects under `<root>/<bucket>/<key>`.
///
/// Bytes go to a temporary file next to the destination, which is renamed
/// into place on EOF and deleted on any error.
pub struct LocalUploader {
    root: PathBuf,
    buffer_size: usize,
}

impl LocalUploader {
    pub fn new(root: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            root: root.into(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        if !bucket.is_empty() {
            path.push(bucket);
        }
        path.push(key.trim_start_matches('/'));
        path
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn upload<'a>(
        &self,
        target: &UploadTarget,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> IngestResult<UploadReport> {
        let path = self.object_path(&target.bucket, &target.key);
        let parent = path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| IngestError::Upload(format!("invalid key {}", target.key)))?;
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| upload_err("create destination directory", e))?;

        let temp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| upload_err("create temporary object", e))?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut window = vec![0u8; self.buffer_size];
        let mut digest = StreamDigest::new();
        loop {
            let n = reader.read(&mut window).await?;
            if n == 0 {
                break;
            }
            digest.update(&window[..n]);
            file.write_all(&window[..n])
                .await
                .map_err(|e| upload_err("write", e))?;
        }
        file.flush().await.map_err(|e| upload_err("flush", e))?;
        file.sync_all().await.map_err(|e| upload_err("sync", e))?;
        drop(file);

        temp_path
            .persist(&path)
            .map_err(|e| upload_err("commit", e.error))?;
        let (sha256, bytes) = digest.finish();
        debug!("Committed {} ({} bytes)", path.display(), bytes);

        Ok(UploadReport {
            key: target.key.clone(),
            bytes,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::calculate_hash;
    use std::io;
    use crate::infrastructure::storage::{StorageSettings, setup_client};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, BufReader, ReadBuf};
    use tokio::net::TcpListener;

    /// Yields `data` and then fails instead of reporting EOF.
    struct FailingReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl FailingReader {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let n = buf.remaining().min(self.data.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.data[start..start + n]);
                self.pos += n;
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(IngestError::EmptyInput("x.csv".to_string()).into_io()))
        }
    }

    const INITIATE_UPLOAD: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <InitiateMultipartUploadResult><Bucket>bucket</Bucket><Key>x.csv</Key>\
        <UploadId>upload-1</UploadId></InitiateMultipartUploadResult>";

    /// Path-style S3 endpoint answering the calls a multipart upload makes.
    /// Returns its URL and the request lines it has seen.
    async fn fake_s3() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut read = BufReader::new(read);
                    loop {
                        let mut request_line = String::new();
                        if read.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let request_line = request_line.trim_end().to_string();
                        let mut content_length = 0usize;
                        loop {
                            let mut header = String::new();
                            if read.read_line(&mut header).await.unwrap_or(0) == 0 {
                                return;
                            }
                            let header = header.trim_end();
                            if header.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = header.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    content_length = value.trim().parse().unwrap_or(0);
                                }
                            }
                        }
                        let mut body = vec![0u8; content_length];
                        if read.read_exact(&mut body).await.is_err() {
                            return;
                        }

                        let (status, payload) = if request_line.starts_with("POST ")
                            && request_line.contains("uploads")
                        {
                            ("200 OK", INITIATE_UPLOAD)
                        } else if request_line.starts_with("DELETE ") {
                            ("204 No Content", "")
                        } else {
                            ("200 OK", "")
                        };
                        seen.lock().unwrap().push(request_line);

                        let response = format!(
                            "HTTP/1.1 {}\r\ncontent-type: application/xml\r\n\
                             content-length: {}\r\n\r\n{}",
                            status,
                            payload.len(),
                            payload
                        );
                        if write.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (format!("http://{}", addr), requests)
    }

    fn target(key: &str) -> UploadTarget {
        UploadTarget {
            bucket: "bucket".to_string(),
            key: key.to_string(),
            content_type: "text/csv".to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_upload_commits() {
        let dir = tempdir().unwrap();
        let uploader = LocalUploader::new(dir.path(), 4);
        let report = uploader
            .upload(&target("a/b/c.txt"), Box::new(&b"hello world"[..]))
            .await
            .unwrap();

        assert_eq!(report.bytes, 11);
        assert_eq!(report.sha256, calculate_hash(b"hello world"));
        let stored = std::fs::read(dir.path().join("bucket/a/b/c.txt")).unwrap();
        assert_eq!(stored, b"hello world");
    }

    #[tokio::test]
    async fn test_local_upload_aborts_on_reader_error() {
        let dir = tempdir().unwrap();
        let uploader = LocalUploader::new(dir.path(), 4);
        let reader = FailingReader::new(b"partial");
        let err = uploader
            .upload(&target("x.csv"), Box::new(reader))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::EmptyInput(_)));
        assert!(!dir.path().join("bucket/x.csv").exists());
        let leftovers = std::fs::read_dir(dir.path().join("bucket")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_local_upload_empty_stream() {
        let dir = tempdir().unwrap();
        let uploader = LocalUploader::new(dir.path(), 4);
        let report = uploader
            .upload(&target("empty.bin"), Box::new(&b""[..]))
            .await
            .unwrap();
        assert_eq!(report.bytes, 0);
        assert!(dir.path().join("bucket/empty.bin").exists());
    }

    #[tokio::test]
    async fn test_s3_upload_aborts_multipart_on_reader_error() {
        let (endpoint, requests) = fake_s3().await;
        let settings = StorageSettings {
            endpoint: Some(endpoint),
            region: Some("us-east-1".to_string()),
            access_key: Some("ak".to_string()),
            secret_key: Some("sk".to_string()),
        };
        let uploader = S3Uploader::new(setup_client(&settings).await, 4);

        let err = uploader
            .upload(&target("x.csv"), Box::new(FailingReader::new(b"partial")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyInput(_)));

        let requests = requests.lock().unwrap().clone();
        assert!(
            requests
                .iter()
                .any(|r| r.starts_with("POST /bucket/x.csv?uploads")),
            "{:?}",
            requests
        );
        let abort = requests
            .iter()
            .find(|r| r.starts_with("DELETE /bucket/x.csv"))
            .unwrap_or_else(|| panic!("no abort in {:?}", requests));
        assert!(abort.contains("uploadId=upload-1"));
        assert!(
            !requests
                .iter()
                .any(|r| r.starts_with("POST ") && r.contains("uploadId="))
        );
        assert!(!requests.iter().any(|r| r.starts_with("PUT ")));
    }
}
