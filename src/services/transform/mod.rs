//! Byte-level transform chain run by the producer side of the bridge.
//!
//! A chain is at most one CSV rewrite reading the source, followed by exactly
//! one encoder writing to the sink. Compression requested together with PGP
//! is done inside the PGP message rather than as a second outer stage.

pub mod compress;
pub mod csv_rewrite;
pub mod pgp;

use crate::config::{Compression, Encryption, FieldSpec, FileFormat, RunConfig};
use crate::error::{IngestError, IngestResult};
use crate::models::SourceMetadata;
use crate::services::anonymizer::Anonymizer;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub use csv_rewrite::CsvRewrite;
pub use pgp::{PgpEncrypt, PgpKey};

pub const CONTENT_TYPE_CSV: &str = "text/csv";
pub const CONTENT_TYPE_ZIP: &str = "application/zip";
pub const CONTENT_TYPE_GZIP: &str = "application/gzip";
pub const CONTENT_TYPE_PGP: &str = "application/pgp-encrypted";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// An encoder that must be told when the stream ends.
pub trait StageWriter: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub enum TransformStage {
    CsvRewrite(CsvRewrite),
    PgpEncrypt(PgpEncrypt),
    ZipDeflate { entry_name: String },
    GzipDeflate,
    Identity,
}

impl TransformStage {
    fn name(&self) -> &'static str {
        match self {
            TransformStage::CsvRewrite(_) => "csv",
            TransformStage::PgpEncrypt(_) => "pgp",
            TransformStage::ZipDeflate { .. } => "zip",
            TransformStage::GzipDeflate => "gzip",
            TransformStage::Identity => "identity",
        }
    }

    fn open<'a>(
        &'a self,
        sink: &'a mut (dyn Write + Send + Sync),
    ) -> IngestResult<Box<dyn StageWriter + 'a>> {
        match self {
            TransformStage::Identity => Ok(Box::new(compress::Identity(sink))),
            TransformStage::GzipDeflate => Ok(Box::new(compress::gzip(sink))),
            TransformStage::ZipDeflate { entry_name } => {
                Ok(Box::new(compress::ZipStage::new(sink, entry_name)?))
            }
            TransformStage::PgpEncrypt(pgp) => pgp.open(sink),
            TransformStage::CsvRewrite(_) => Err(IngestError::Io(io::Error::other(
                "a CSV rewrite cannot terminate a transform chain",
            ))),
        }
    }
}

/// Per-worker recipe for building one chain per file.
#[derive(Clone)]
pub struct ChainFactory {
    file_format: FileFormat,
    ignore_header: bool,
    fields: Arc<[FieldSpec]>,
    compression: Compression,
    encryption: Encryption,
    buffer_size: usize,
    armor: bool,
    anonymizer: Option<Anonymizer>,
    pgp_key: Option<Arc<PgpKey>>,
}

impl ChainFactory {
    pub fn new(
        config: &RunConfig,
        anonymizer: Option<Anonymizer>,
        pgp_key: Option<Arc<PgpKey>>,
    ) -> IngestResult<Self> {
        if config.encryption == Encryption::Pgp && pgp_key.is_none() {
            return Err(IngestError::invalid_config(
                crate::config::OPT_PUBLIC_KEY_PATH,
                "encryption is pgp but no public key was loaded",
            ));
        }
        Ok(Self {
            file_format: config.file_format,
            ignore_header: config.ignore_header,
            fields: config.fields.clone().into(),
            compression: config.compression,
            encryption: config.encryption,
            buffer_size: config.buffer_size,
            armor: false,
            anonymizer,
            pgp_key,
        })
    }

    /// ASCII-armored PGP output instead of binary.
    pub fn with_armor(mut self, armor: bool) -> Self {
        self.armor = armor;
        self
    }

    pub fn for_file(&self, source: &SourceMetadata) -> IngestResult<TransformChain> {
        let mut stages = Vec::with_capacity(2);

        if self.file_format == FileFormat::Csv {
            stages.push(TransformStage::CsvRewrite(CsvRewrite::new(
                Arc::clone(&self.fields),
                self.ignore_header,
                self.anonymizer.clone(),
                source.name.clone(),
            )?));
        }

        let encoder = match (self.encryption, self.compression) {
            (Encryption::Pgp, compression) => {
                let key = self.pgp_key.clone().ok_or_else(|| {
                    IngestError::Crypto("no PGP key loaded for this worker".to_string())
                })?;
                TransformStage::PgpEncrypt(PgpEncrypt {
                    key,
                    with_integrity: true,
                    compress: compression != Compression::None,
                    armor: self.armor,
                    file_name: source.name.clone(),
                    modified: modified_time(source.last_modified_millis),
                })
            }
            (Encryption::None, Compression::Zip) => TransformStage::ZipDeflate {
                entry_name: source.name.clone(),
            },
            (Encryption::None, Compression::Gzip) => TransformStage::GzipDeflate,
            (Encryption::None, Compression::None) => TransformStage::Identity,
        };
        stages.push(encoder);

        Ok(TransformChain {
            stages,
            compression: self.compression,
            buffer_size: self.buffer_size,
        })
    }
}

fn modified_time(millis: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

pub struct TransformChain {
    stages: Vec<TransformStage>,
    compression: Compression,
    buffer_size: usize,
}

impl TransformChain {
    pub fn stages(&self) -> &[TransformStage] {
        &self.stages
    }

    pub fn describe(&self) -> String {
        self.stages
            .iter()
            .map(TransformStage::name)
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn rewrite_stage(&self) -> Option<&CsvRewrite> {
        match self.stages.first() {
            Some(TransformStage::CsvRewrite(csv)) => Some(csv),
            _ => None,
        }
    }

    fn encoder(&self) -> Option<&TransformStage> {
        self.stages
            .last()
            .filter(|s| !matches!(s, TransformStage::CsvRewrite(_)))
    }

    pub fn content_type(&self) -> &'static str {
        match self.encoder() {
            Some(TransformStage::PgpEncrypt(_)) => CONTENT_TYPE_PGP,
            Some(TransformStage::ZipDeflate { .. }) => CONTENT_TYPE_ZIP,
            Some(TransformStage::GzipDeflate) => CONTENT_TYPE_GZIP,
            _ if self.rewrite_stage().is_some() => CONTENT_TYPE_CSV,
            _ => CONTENT_TYPE_BINARY,
        }
    }

    /// Suffix appended to the destination key.
    pub fn extension(&self) -> &'static str {
        match (self.encoder(), self.compression) {
            (Some(TransformStage::PgpEncrypt(_)), Compression::Zip) => ".zip.pgp",
            (Some(TransformStage::PgpEncrypt(_)), Compression::Gzip) => ".gz.pgp",
            (Some(TransformStage::PgpEncrypt(_)), Compression::None) => ".pgp",
            (Some(TransformStage::ZipDeflate { .. }), _) => ".zip",
            (Some(TransformStage::GzipDeflate), _) => ".gz",
            _ => "",
        }
    }

    /// Reads `source` to EOF and writes the transformed bytes to `sink`.
    pub fn produce(
        &self,
        mut source: Box<dyn Read + Send>,
        sink: &mut (dyn Write + Send + Sync),
    ) -> IngestResult<()> {
        let encoder = self.encoder().ok_or_else(|| {
            IngestError::Io(io::Error::other("transform chain has no encoder"))
        })?;
        let mut writer = encoder.open(sink)?;

        match self.rewrite_stage() {
            Some(csv) => {
                csv.rewrite(source, &mut writer)?;
            }
            None => {
                copy_buffered(&mut source, &mut writer, self.buffer_size)?;
            }
        }

        writer.finish()?;
        Ok(())
    }
}

fn copy_buffered<R, W>(source: &mut R, sink: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}
