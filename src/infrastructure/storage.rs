use crate::config::{DestinationScheme, RunConfig};
use crate::error::{IngestError, IngestResult};
use crate::services::storage::{LocalUploader, S3Uploader, Uploader};
use aws_sdk_s3::config::{Credentials, Region};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const DEFAULT_REGION: &str = "us-east-1";
const GCS_INTEROP_ENDPOINT: &str = "https://storage.googleapis.com";

/// Object-store connection settings, from the environment or a service file.
#[derive(Clone, Default, Deserialize)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    #[serde(alias = "access_key_id")]
    pub access_key: Option<String>,
    #[serde(alias = "secret_access_key")]
    pub secret_key: Option<String>,
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StorageSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION"),
            access_key: var("S3_ACCESS_KEY"),
            secret_key: var("S3_SECRET_KEY"),
        }
    }

    pub fn from_service_file(path: &Path) -> IngestResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::invalid_config(
                crate::config::OPT_SERVICE_FILE_PATH,
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            IngestError::invalid_config(
                crate::config::OPT_SERVICE_FILE_PATH,
                format!("{} is not a credentials document: {}", path.display(), e),
            )
        })
    }

    /// The service file wins over the environment when one is configured.
    pub fn for_run(config: &RunConfig) -> IngestResult<Self> {
        let mut settings = match &config.service_file_path {
            Some(path) => Self::from_service_file(path)?,
            None => Self::from_env(),
        };
        if settings.endpoint.is_none() && config.destination.scheme == DestinationScheme::Gcs {
            settings.endpoint = Some(GCS_INTEROP_ENDPOINT.to_string());
        }
        Ok(settings)
    }
}

pub async fn setup_client(settings: &StorageSettings) -> aws_sdk_s3::Client {
    let region = settings
        .region
        .clone()
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    let mut loader = aws_config::from_env().region(Region::new(region));
    if let Some(endpoint) = &settings.endpoint {
        info!("☁️  Object store endpoint: {}", endpoint);
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(access), Some(secret)) = (&settings.access_key, &settings.secret_key) {
        loader = loader.credentials_provider(Credentials::new(
            access.clone(),
            secret.clone(),
            None,
            None,
            "static",
        ));
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(settings.endpoint.is_some())
        .build();
    aws_sdk_s3::Client::from_conf(s3_config)
}

/// Builds the uploader matching the destination scheme.
///
/// A configured proxy is logged and otherwise left alone; see
/// [`crate::config::ProxyConfig`].
pub async fn setup_uploader(config: &RunConfig) -> IngestResult<Arc<dyn Uploader>> {
    if let Some(proxy) = &config.proxy {
        info!("🌐 Object store proxy: {}", proxy.url());
    }

    match config.destination.scheme {
        DestinationScheme::Local => {
            let root = config.destination.local_root.clone().ok_or_else(|| {
                IngestError::invalid_config(
                    crate::config::OPT_PATH,
                    "local destination has no root",
                )
            })?;
            info!("📁 Local storage: {}", root.display());
            Ok(Arc::new(LocalUploader::new(root, config.buffer_size)))
        }
        DestinationScheme::S3 | DestinationScheme::Gcs => {
            let settings = StorageSettings::for_run(config)?;
            let client = setup_client(&settings).await;
            info!(
                "☁️  Object storage bucket: {} (prefix '{}')",
                config.destination.bucket, config.destination_path
            );
            Ok(Arc::new(
                S3Uploader::new(client, config.buffer_size).with_project(config.project.clone()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_service_file_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(
            &path,
            r#"{"endpoint":"http://localhost:9000","access_key_id":"ak","secret_access_key":"sk"}"#,
        )
        .unwrap();

        let settings = StorageSettings::from_service_file(&path).unwrap();
        assert_eq!(settings.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(settings.access_key.as_deref(), Some("ak"));
        assert_eq!(settings.secret_key.as_deref(), Some("sk"));
        assert!(!format!("{:?}", settings).contains("\"sk\""));
    }

    #[test]
    fn test_bad_service_file_is_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, "not json").unwrap();
        let err = StorageSettings::from_service_file(&path).unwrap_err();
        assert!(matches!(err, IngestError::InvalidConfig { .. }));
    }

    #[test]
    fn test_gcs_defaults_to_interop_endpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, r#"{"access_key":"ak","secret_key":"sk"}"#).unwrap();

        let mut options = BTreeMap::new();
        options.insert("path".to_string(), "gs://landing/raw".to_string());
        options.insert(
            "serviceFilePath".to_string(),
            path.to_string_lossy().into_owned(),
        );
        let config = RunConfig::from_options(&options).unwrap();
        let settings = StorageSettings::for_run(&config).unwrap();
        assert_eq!(settings.endpoint.as_deref(), Some(GCS_INTEROP_ENDPOINT));
    }

    #[tokio::test]
    async fn test_local_destination_uses_local_uploader() {
        let dir = tempdir().unwrap();
        let mut options = BTreeMap::new();
        options.insert(
            "path".to_string(),
            format!("file://{}", dir.path().display()),
        );
        let config = RunConfig::from_options(&options).unwrap();
        assert!(setup_uploader(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_proxy_is_reported_not_applied() {
        let dir = tempdir().unwrap();
        let mut options = BTreeMap::new();
        options.insert(
            "path".to_string(),
            format!("file://{}", dir.path().display()),
        );
        options.insert("proxyType".to_string(), "socks".to_string());
        options.insert("proxy".to_string(), "proxy.internal:1080".to_string());
        let config = RunConfig::from_options(&options).unwrap();

        let proxy = config.proxy.as_ref().unwrap();
        assert_eq!(proxy.url(), "socks5://proxy.internal:1080");
        assert!(setup_uploader(&config).await.is_ok());
    }
}
