pub mod suffix;

use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

pub use suffix::SuffixPattern;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const AUTO_DETECT: &str = "auto-detect";

pub const OPT_PATH: &str = "path";
pub const OPT_SUFFIX: &str = "suffix";
pub const OPT_PROJECT: &str = "project";
pub const OPT_SERVICE_FILE_PATH: &str = "serviceFilePath";
pub const OPT_BUFFER_SIZE: &str = "bufferSize";
pub const OPT_POLICY_URL: &str = "policyUrl";
pub const OPT_IDENTITY: &str = "identity";
pub const OPT_SHARED_SECRET: &str = "sharedSecret";
pub const OPT_TRUST_STORE_PATH: &str = "trustStorePath";
pub const OPT_CACHE_PATH: &str = "cachePath";
pub const OPT_FORMAT: &str = "format";
pub const OPT_IGNORE_HEADER: &str = "ignoreHeader";
pub const OPT_FIELD_LIST: &str = "fieldList";
pub const OPT_COMPRESSION: &str = "compression";
pub const OPT_ENCRYPTION: &str = "encryption";
pub const OPT_PUBLIC_KEY_PATH: &str = "publicKeyPath";
pub const OPT_PROXY: &str = "proxy";
pub const OPT_PROXY_TYPE: &str = "proxyType";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zip,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    Pgp,
}

/// Column policy for the CSV rewrite stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub anonymize: bool,
    pub format: String,
}

impl FieldSpec {
    /// Parses `<name>:<Yes|No>:<format>[,...]`. Entries with fewer than
    /// three components are dropped.
    pub fn parse_list(list: &str) -> Vec<FieldSpec> {
        list.split(',')
            .filter_map(|entry| {
                let mut parts = entry.splitn(3, ':');
                let name = parts.next()?;
                let flag = parts.next()?;
                let format = parts.next()?;
                Some(FieldSpec {
                    name: name.trim().to_string(),
                    anonymize: flag.trim().eq_ignore_ascii_case("yes"),
                    format: format.trim().to_string(),
                })
            })
            .collect()
    }
}

/// Parameters for acquiring the FPE policy and building per-format ciphers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CryptoSettings {
    pub policy_url: String,
    pub identity: String,
    pub shared_secret: String,
    pub trust_store_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
}

impl std::fmt::Debug for CryptoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSettings")
            .field("policy_url", &self.policy_url)
            .field("identity", &self.identity)
            .field("shared_secret", &"<redacted>")
            .field("trust_store_path", &self.trust_store_path)
            .field("cache_path", &self.cache_path)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks,
}

/// Validated `proxyType`/`proxy` pair.
///
/// Informational only: the object-store client is not routed through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
}

impl ProxyConfig {
    pub fn parse(spec: &str, kind: ProxyKind) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 2 || parts[0].trim().is_empty() {
            return Err(format!("'{}' must be in \"host:port\" format", spec));
        }
        let port: u16 = parts[1].trim().parse().unwrap_or(0);
        if port == 0 {
            return Err(format!("'{}' has an invalid port", spec));
        }
        Ok(Self {
            host: parts[0].trim().to_string(),
            port,
            kind,
        })
    }

    pub fn url(&self) -> String {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks => "socks5",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationScheme {
    Gcs,
    S3,
    Local,
}

/// Parsed `path` option: `gs://bucket/prefix`, `s3://bucket/prefix` or
/// `file:///root/dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub scheme: DestinationScheme,
    pub bucket: String,
    pub prefix: String,
    pub local_root: Option<PathBuf>,
}

impl Destination {
    pub fn parse(path: &str) -> Result<Self, String> {
        let url = Url::parse(path).map_err(|e| format!("'{}' is not a valid URI: {}", path, e))?;
        match url.scheme() {
            "gs" | "s3" => {
                let bucket = url.host_str().unwrap_or_default().to_string();
                if bucket.is_empty() {
                    return Err(format!("'{}' does not name a bucket", path));
                }
                let scheme = if url.scheme() == "gs" {
                    DestinationScheme::Gcs
                } else {
                    DestinationScheme::S3
                };
                Ok(Self {
                    scheme,
                    bucket,
                    prefix: url.path().trim_start_matches('/').to_string(),
                    local_root: None,
                })
            }
            "file" => {
                let root = url
                    .to_file_path()
                    .map_err(|_| format!("'{}' is not a local path", path))?;
                Ok(Self {
                    scheme: DestinationScheme::Local,
                    bucket: String::new(),
                    prefix: String::new(),
                    local_root: Some(root),
                })
            }
            other => Err(format!("unsupported destination scheme '{}'", other)),
        }
    }
}

/// Destination prefix with the optional time segment, computed once per run.
pub fn resolve_destination_path(
    prefix: &str,
    suffix: Option<&SuffixPattern>,
    now: &DateTime<Local>,
) -> String {
    let mut path = prefix.to_string();
    if !path.is_empty() && !path.ends_with('/') {
        path.push('/');
    }
    if let Some(suffix) = suffix {
        path.push_str(&suffix.render(now));
        path.push('/');
    }
    path
}

/// Process-wide settings for one run, immutable after validation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub destination: Destination,
    /// Destination prefix including the rendered suffix segment.
    pub destination_path: String,
    pub suffix: Option<SuffixPattern>,
    pub project: Option<String>,
    pub service_file_path: Option<PathBuf>,
    pub buffer_size: usize,
    pub file_format: FileFormat,
    pub ignore_header: bool,
    pub fields: Vec<FieldSpec>,
    pub compression: Compression,
    pub encryption: Encryption,
    pub crypto: CryptoSettings,
    pub public_key_path: Option<PathBuf>,
    pub proxy: Option<ProxyConfig>,
}

impl RunConfig {
    pub fn from_options(options: &BTreeMap<String, String>) -> IngestResult<Self> {
        Self::from_options_at(options, &Local::now())
    }

    pub fn from_options_at(
        options: &BTreeMap<String, String>,
        now: &DateTime<Local>,
    ) -> IngestResult<Self> {
        let get = |name: &str| {
            options
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let path = get(OPT_PATH)
            .ok_or_else(|| IngestError::invalid_config(OPT_PATH, "destination path is required"))?;
        let destination =
            Destination::parse(path).map_err(|e| IngestError::invalid_config(OPT_PATH, e))?;

        let suffix = get(OPT_SUFFIX)
            .map(SuffixPattern::parse)
            .transpose()
            .map_err(|e| IngestError::invalid_config(OPT_SUFFIX, e))?;
        let destination_path = resolve_destination_path(&destination.prefix, suffix.as_ref(), now);

        let project = get(OPT_PROJECT)
            .filter(|p| !p.eq_ignore_ascii_case(AUTO_DETECT))
            .map(str::to_string);
        let service_file_path = get(OPT_SERVICE_FILE_PATH)
            .filter(|p| !p.eq_ignore_ascii_case(AUTO_DETECT))
            .map(PathBuf::from);

        let buffer_size = parse_buffer_size(get(OPT_BUFFER_SIZE));

        let file_format = match get(OPT_FORMAT).map(str::to_ascii_lowercase).as_deref() {
            None | Some("binary") => FileFormat::Binary,
            Some("csv") => FileFormat::Csv,
            Some(other) => {
                return Err(IngestError::invalid_config(
                    OPT_FORMAT,
                    format!("'{}' is not one of csv, binary", other),
                ));
            }
        };

        let ignore_header = parse_yes_no(OPT_IGNORE_HEADER, get(OPT_IGNORE_HEADER))?;

        let fields = match get(OPT_FIELD_LIST) {
            Some(list) => FieldSpec::parse_list(list),
            None => Vec::new(),
        };
        if file_format == FileFormat::Csv && fields.is_empty() {
            return Err(IngestError::invalid_config(
                OPT_FIELD_LIST,
                "expected \"<field>:<anonymize-flag>:<format>[,...]\" with at least one entry",
            ));
        }

        let compression = match get(OPT_COMPRESSION).map(str::to_ascii_lowercase).as_deref() {
            None | Some("none") => Compression::None,
            Some("zip") => Compression::Zip,
            Some("gzip") => Compression::Gzip,
            Some(other) => {
                return Err(IngestError::invalid_config(
                    OPT_COMPRESSION,
                    format!("'{}' is not one of none, zip, gzip", other),
                ));
            }
        };

        let encryption = match get(OPT_ENCRYPTION).map(str::to_ascii_lowercase).as_deref() {
            None | Some("none") => Encryption::None,
            Some("pgp") => Encryption::Pgp,
            Some(other) => {
                return Err(IngestError::invalid_config(
                    OPT_ENCRYPTION,
                    format!("'{}' is not one of none, pgp", other),
                ));
            }
        };

        let public_key_path = get(OPT_PUBLIC_KEY_PATH).map(PathBuf::from);
        if encryption == Encryption::Pgp && public_key_path.is_none() {
            return Err(IngestError::invalid_config(
                OPT_PUBLIC_KEY_PATH,
                "a public key is required when encryption is pgp",
            ));
        }

        let crypto = CryptoSettings {
            policy_url: get(OPT_POLICY_URL).unwrap_or_default().to_string(),
            identity: get(OPT_IDENTITY).unwrap_or_default().to_string(),
            shared_secret: get(OPT_SHARED_SECRET).unwrap_or_default().to_string(),
            trust_store_path: get(OPT_TRUST_STORE_PATH).map(PathBuf::from),
            cache_path: get(OPT_CACHE_PATH).map(PathBuf::from),
        };
        if file_format == FileFormat::Csv && fields.iter().any(|f| f.anonymize) {
            for (option, value) in [
                (OPT_POLICY_URL, &crypto.policy_url),
                (OPT_IDENTITY, &crypto.identity),
                (OPT_SHARED_SECRET, &crypto.shared_secret),
            ] {
                if value.is_empty() {
                    return Err(IngestError::invalid_config(
                        option,
                        "required when a field is anonymized",
                    ));
                }
            }
        }

        let proxy = match get(OPT_PROXY_TYPE).map(str::to_ascii_lowercase).as_deref() {
            None | Some("none") => None,
            Some(kind) => {
                let kind = match kind {
                    "http" => ProxyKind::Http,
                    "socks" => ProxyKind::Socks,
                    other => {
                        return Err(IngestError::invalid_config(
                            OPT_PROXY_TYPE,
                            format!("'{}' is not one of none, http, socks", other),
                        ));
                    }
                };
                let spec = get(OPT_PROXY).ok_or_else(|| {
                    IngestError::invalid_config(OPT_PROXY, "proxy host and port are required")
                })?;
                Some(
                    ProxyConfig::parse(spec, kind)
                        .map_err(|e| IngestError::invalid_config(OPT_PROXY, e))?,
                )
            }
        };

        Ok(Self {
            destination,
            destination_path,
            suffix,
            project,
            service_file_path,
            buffer_size,
            file_format,
            ignore_header,
            fields,
            compression,
            encryption,
            crypto,
            public_key_path,
            proxy,
        })
    }

    /// Formats that need an FPE cipher, in field order without repeats.
    pub fn anonymized_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = Vec::new();
        if self.file_format != FileFormat::Csv {
            return formats;
        }
        for field in self.fields.iter().filter(|f| f.anonymize) {
            if !formats.contains(&field.format) {
                formats.push(field.format.clone());
            }
        }
        formats
    }
}

/// Non-numeric or non-positive values fall back to the default.
pub fn parse_buffer_size(value: Option<&str>) -> usize {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|&n| n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(DEFAULT_BUFFER_SIZE)
}

fn parse_yes_no(option: &str, value: Option<&str>) -> IngestResult<bool> {
    match value {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("no") => Ok(false),
        Some(v) => Err(IngestError::invalid_config(
            option,
            format!("'{}' is not one of Yes, No", v),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use chrono::TimeZone;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn csv_options() -> Vec<(&'static str, &'static str)> {
        vec![
            (OPT_PATH, "gs://my-bucket/landing"),
            (OPT_FORMAT, "csv"),
            (OPT_FIELD_LIST, "id:No:_,ssn:Yes:SSN,name:No:_"),
            (OPT_POLICY_URL, "file:///etc/fpe/policy.json"),
            (OPT_IDENTITY, "etl@example.com"),
            (OPT_SHARED_SECRET, "s3cret"),
        ]
    }

    fn invalid_option(pairs: &[(&str, &str)]) -> String {
        match RunConfig::from_options(&options(pairs)) {
            Err(IngestError::InvalidConfig { option, .. }) => option,
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_csv_config() {
        let config = RunConfig::from_options(&options(&csv_options())).unwrap();
        assert_eq!(config.destination.bucket, "my-bucket");
        assert_eq!(config.destination_path, "landing/");
        assert_eq!(config.file_format, FileFormat::Csv);
        assert_eq!(config.fields.len(), 3);
        assert!(config.fields[1].anonymize);
        assert_eq!(config.anonymized_formats(), vec!["SSN".to_string()]);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_buffer_size_fallback() {
        assert_eq!(parse_buffer_size(Some("4096")), 4096);
        assert_eq!(parse_buffer_size(Some("0")), DEFAULT_BUFFER_SIZE);
        assert_eq!(parse_buffer_size(Some("-12")), DEFAULT_BUFFER_SIZE);
        assert_eq!(parse_buffer_size(Some("lots")), DEFAULT_BUFFER_SIZE);
        assert_eq!(parse_buffer_size(None), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_field_list_skips_malformed_entries() {
        let fields = FieldSpec::parse_list("a:yes:SSN,broken,b:No:_,c:YES:fmt:with:colons");
        assert_eq!(fields.len(), 3);
        assert!(fields[0].anonymize);
        assert!(!fields[1].anonymize);
        assert_eq!(fields[2].format, "fmt:with:colons");
    }

    #[test]
    fn test_field_list_required_for_csv() {
        let mut pairs = csv_options();
        pairs.retain(|(k, _)| *k != OPT_FIELD_LIST);
        assert_eq!(invalid_option(&pairs), OPT_FIELD_LIST);

        let mut pairs = csv_options();
        pairs.retain(|(k, _)| *k != OPT_FIELD_LIST);
        pairs.push((OPT_FIELD_LIST, "only-two:Yes"));
        assert_eq!(invalid_option(&pairs), OPT_FIELD_LIST);
    }

    #[test]
    fn test_crypto_settings_required_when_anonymizing() {
        let mut pairs = csv_options();
        pairs.retain(|(k, _)| *k != OPT_SHARED_SECRET);
        assert_eq!(invalid_option(&pairs), OPT_SHARED_SECRET);
    }

    #[test]
    fn test_pgp_requires_public_key() {
        let pairs = [(OPT_PATH, "s3://bucket"), (OPT_ENCRYPTION, "PGP")];
        assert_eq!(invalid_option(&pairs), OPT_PUBLIC_KEY_PATH);
    }

    #[test]
    fn test_unknown_modes_rejected() {
        assert_eq!(
            invalid_option(&[(OPT_PATH, "s3://b"), (OPT_COMPRESSION, "bzip2")]),
            OPT_COMPRESSION
        );
        assert_eq!(
            invalid_option(&[(OPT_PATH, "s3://b"), (OPT_FORMAT, "parquet")]),
            OPT_FORMAT
        );
        assert_eq!(
            invalid_option(&[(OPT_PATH, "s3://b"), (OPT_IGNORE_HEADER, "maybe")]),
            OPT_IGNORE_HEADER
        );
        assert_eq!(invalid_option(&[(OPT_PATH, "ftp://b/x")]), OPT_PATH);
        assert_eq!(invalid_option(&[(OPT_SUFFIX, "yyyy")]), OPT_PATH);
    }

    #[test]
    fn test_proxy_validation() {
        let base = (OPT_PATH, "gs://b");
        assert_eq!(
            invalid_option(&[base, (OPT_PROXY_TYPE, "http")]),
            OPT_PROXY
        );
        assert_eq!(
            invalid_option(&[base, (OPT_PROXY_TYPE, "http"), (OPT_PROXY, "host")]),
            OPT_PROXY
        );
        assert_eq!(
            invalid_option(&[base, (OPT_PROXY_TYPE, "socks"), (OPT_PROXY, "host:0")]),
            OPT_PROXY
        );
        assert_eq!(
            invalid_option(&[base, (OPT_PROXY_TYPE, "http"), (OPT_PROXY, "a:b:c")]),
            OPT_PROXY
        );
        assert_eq!(
            invalid_option(&[base, (OPT_PROXY_TYPE, "ftp"), (OPT_PROXY, "h:1")]),
            OPT_PROXY_TYPE
        );

        let config = RunConfig::from_options(&options(&[
            base,
            (OPT_PROXY_TYPE, "SOCKS"),
            (OPT_PROXY, "proxy.local:1080"),
        ]))
        .unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Socks);
        assert_eq!(proxy.url(), "socks5://proxy.local:1080");

        let config = RunConfig::from_options(&options(&[
            base,
            (OPT_PROXY_TYPE, "none"),
            (OPT_PROXY, "garbage"),
        ]))
        .unwrap();
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_suffix_segment() {
        let now = Local.with_ymd_and_hms(2023, 11, 2, 14, 30, 0).unwrap();
        let pairs = options(&[(OPT_PATH, "gs://b/out"), (OPT_SUFFIX, "yyyy-MM-dd")]);
        let config = RunConfig::from_options_at(&pairs, &now).unwrap();
        assert_eq!(config.destination_path, "out/2023-11-02/");

        let pairs = options(&[(OPT_PATH, "gs://b"), (OPT_SUFFIX, "yyyy-MM-dd")]);
        let config = RunConfig::from_options_at(&pairs, &now).unwrap();
        assert_eq!(config.destination_path, "2023-11-02/");

        assert_eq!(
            invalid_option(&[(OPT_PATH, "gs://b"), (OPT_SUFFIX, "yyyy-QQ")]),
            OPT_SUFFIX
        );
    }

    #[test]
    fn test_local_destination() {
        let config = RunConfig::from_options(&options(&[(OPT_PATH, "file:///tmp/out")])).unwrap();
        assert_eq!(config.destination.scheme, DestinationScheme::Local);
        assert_eq!(
            config.destination.local_root,
            Some(PathBuf::from("/tmp/out"))
        );
        assert_eq!(config.destination_path, "");
    }

    #[test]
    fn test_auto_detect_project() {
        let config = RunConfig::from_options(&options(&[
            (OPT_PATH, "gs://b"),
            (OPT_PROJECT, "auto-detect"),
            (OPT_SERVICE_FILE_PATH, "auto-detect"),
        ]))
        .unwrap();
        assert!(config.project.is_none());
        assert!(config.service_file_path.is_none());
    }

    #[test]
    fn test_invalid_config_kind() {
        let err = RunConfig::from_options(&BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidConfig);
    }
}
