//! Reads uploaded objects back into typed records.
//!
//! Input is decrypted (PGP) or decompressed (zip, gzip) first; the CSV parser
//! is always built on top of whatever plaintext stream that yields.

use crate::config::Compression;
use crate::error::{IngestError, IngestResult};
use crate::services::transform::pgp::{PgpSecretKey, decrypt_reader};
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use zip::CompressionMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decryption {
    None,
    Pgp {
        secret_key_path: PathBuf,
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Long,
    Date,
    String,
    Boolean,
    Bytes,
    Double,
    Decimal,
    Float,
    TimeMicros,
    TimestampMicros,
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "int" => FieldType::Int,
            "long" => FieldType::Long,
            "date" => FieldType::Date,
            "string" => FieldType::String,
            "boolean" => FieldType::Boolean,
            "bytes" => FieldType::Bytes,
            "double" => FieldType::Double,
            "decimal" => FieldType::Decimal,
            "float" => FieldType::Float,
            "time_micros" => FieldType::TimeMicros,
            "timestamp_micros" => FieldType::TimestampMicros,
            other => return Err(format!("unsupported type '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

impl SchemaField {
    /// Parses `name:type[,name:type...]`.
    pub fn parse_list(spec: &str) -> IngestResult<Vec<SchemaField>> {
        let mut fields = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, ty) = entry.split_once(':').ok_or_else(|| {
                IngestError::invalid_config("schema", format!("'{}' is not name:type", entry))
            })?;
            let field_type = ty
                .parse()
                .map_err(|e: String| IngestError::invalid_config("schema", e))?;
            fields.push(SchemaField {
                name: name.trim().to_string(),
                field_type,
            });
        }
        if fields.is_empty() {
            return Err(IngestError::invalid_config("schema", "no fields declared"));
        }
        Ok(fields)
    }
}

#[derive(Debug, Clone)]
pub struct RecordSourceConfig {
    pub decryption: Decryption,
    /// With PGP the compressed layer lives inside the message and is
    /// unwrapped by the decryptor.
    pub decompression: Compression,
    pub schema: Vec<SchemaField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Date(NaiveDate),
    String(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    Double(f64),
    Decimal(BigDecimal),
    Float(f32),
    TimeMicros(i64),
    TimestampMicros(i64),
}

impl Value {
    pub fn parse(field_type: FieldType, cell: &str) -> Result<Value, String> {
        if cell.is_empty() {
            return Ok(Value::Null);
        }
        let bad = |e: &dyn std::fmt::Display| {
            format!("'{}' is not a valid {:?}: {}", cell, field_type, e)
        };
        Ok(match field_type {
            FieldType::Int => Value::Int(cell.parse::<i32>().map_err(|e| bad(&e))?),
            FieldType::Long => Value::Long(cell.parse::<i64>().map_err(|e| bad(&e))?),
            FieldType::Date => {
                Value::Date(NaiveDate::parse_from_str(cell, "%Y-%m-%d").map_err(|e| bad(&e))?)
            }
            FieldType::String => Value::String(cell.to_string()),
            FieldType::Boolean => Value::Boolean(cell.eq_ignore_ascii_case("true")),
            FieldType::Bytes => Value::Bytes(cell.as_bytes().to_vec()),
            FieldType::Double => Value::Double(cell.parse::<f64>().map_err(|e| bad(&e))?),
            FieldType::Decimal => Value::Decimal(BigDecimal::from_str(cell).map_err(|e| bad(&e))?),
            FieldType::Float => Value::Float(cell.parse::<f32>().map_err(|e| bad(&e))?),
            FieldType::TimeMicros => {
                let time =
                    NaiveTime::parse_from_str(cell, "%H:%M:%S%.f").map_err(|e| bad(&e))?;
                Value::TimeMicros(
                    i64::from(time.num_seconds_from_midnight()) * 1_000_000
                        + i64::from(time.nanosecond() / 1_000),
                )
            }
            FieldType::TimestampMicros => {
                let ts = NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|e| bad(&e))?;
                Value::TimestampMicros(ts.and_utc().timestamp_micros())
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub key: u64,
    pub values: Vec<Value>,
}

impl Record {
    /// `{"<field>": <value>, ...}` in schema order.
    pub fn to_json(&self, schema: &[SchemaField]) -> serde_json::Value {
        let map = schema
            .iter()
            .zip(&self.values)
            .map(|(field, value)| {
                (
                    field.name.clone(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Counts bytes pulled through it into a shared counter.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

pub struct RecordReader {
    records: csv::StringRecordsIntoIter<Box<dyn Read>>,
    columns: Vec<usize>,
    schema: Arc<[SchemaField]>,
    file_name: String,
    key: u64,
    bytes_read: Arc<AtomicU64>,
    total_bytes: Option<u64>,
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("file_name", &self.file_name)
            .field("key", &self.key)
            .finish()
    }
}

impl RecordReader {
    pub fn open(path: &Path, config: &RecordSourceConfig) -> IngestResult<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path).map_err(|e| {
            IngestError::InvalidSource(format!("cannot open {}: {}", path.display(), e))
        })?;
        let file_size = file.metadata().ok().map(|m| m.len());
        let bytes_read = Arc::new(AtomicU64::new(0));

        let (stream, total_bytes): (Box<dyn Read>, Option<u64>) = match &config.decryption {
            Decryption::Pgp {
                secret_key_path,
                password,
            } => {
                let key = PgpSecretKey::load(secret_key_path, password.as_deref())?;
                let counted = CountingReader {
                    inner: BufReader::new(file),
                    count: Arc::clone(&bytes_read),
                };
                (decrypt_reader(counted, &key)?, file_size)
            }
            Decryption::None => match config.decompression {
                Compression::None => (
                    Box::new(CountingReader {
                        inner: BufReader::new(file),
                        count: Arc::clone(&bytes_read),
                    }),
                    file_size,
                ),
                Compression::Gzip => (
                    Box::new(MultiGzDecoder::new(CountingReader {
                        inner: BufReader::new(file),
                        count: Arc::clone(&bytes_read),
                    })),
                    file_size,
                ),
                Compression::Zip => {
                    let (entry, size) =
                        first_zip_entry(file, &file_name, Arc::clone(&bytes_read))?;
                    (entry, Some(size))
                }
            },
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(stream);

        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Err(IngestError::EmptyInput(file_name));
        }
        let columns = config
            .schema
            .iter()
            .map(|field| {
                headers
                    .iter()
                    .position(|h| h.eq_ignore_ascii_case(&field.name))
                    .ok_or_else(|| IngestError::SchemaMismatch {
                        file: file_name.clone(),
                        row: 1,
                        message: format!("column '{}' is not in the header", field.name),
                    })
            })
            .collect::<IngestResult<Vec<_>>>()?;

        info!(
            "📖 Reading {} ({} column(s), {:?})",
            file_name,
            columns.len(),
            config.decryption
        );
        Ok(Self {
            records: reader.into_records(),
            columns,
            schema: config.schema.clone().into(),
            file_name,
            key: 0,
            bytes_read,
            total_bytes,
        })
    }

    pub fn schema(&self) -> &[SchemaField] {
        &self.schema
    }

    /// Fraction of the input consumed, when its size is known.
    pub fn progress(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => {
                let read = self.bytes_read.load(Ordering::Relaxed).min(total);
                Some(read as f32 / total as f32)
            }
            None => None,
        }
    }

    pub fn next_record(&mut self) -> IngestResult<Option<Record>> {
        let row = match self.records.next() {
            Some(row) => row?,
            None => return Ok(None),
        };
        self.key += 1;
        // The header is line 1.
        let line = self.key + 1;

        let mut values = Vec::with_capacity(self.columns.len());
        for (field, &index) in self.schema.iter().zip(&self.columns) {
            let cell = row.get(index).ok_or_else(|| IngestError::SchemaMismatch {
                file: self.file_name.clone(),
                row: line,
                message: format!("missing column '{}'", field.name),
            })?;
            let value =
                Value::parse(field.field_type, cell).map_err(|message| IngestError::SchemaMismatch {
                    file: self.file_name.clone(),
                    row: line,
                    message: format!("column '{}': {}", field.name, message),
                })?;
            values.push(value);
        }
        debug!(key = self.key, "Decoded record");
        Ok(Some(Record {
            key: self.key,
            values,
        }))
    }
}

impl Iterator for RecordReader {
    type Item = IngestResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Streams the first archive entry straight out of `file`, inflating as it
/// goes. The returned length is the entry's compressed size, which is what
/// `count` sees.
fn first_zip_entry(
    file: File,
    file_name: &str,
    count: Arc<AtomicU64>,
) -> IngestResult<(Box<dyn Read>, u64)> {
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        IngestError::InvalidSource(format!("{} is not a zip archive: {}", file_name, e))
    })?;
    if archive.is_empty() {
        return Err(IngestError::EmptyInput(file_name.to_string()));
    }
    let (data_start, compressed_size, method) = {
        let entry = archive
            .by_index_raw(0)
            .map_err(|e| IngestError::InvalidSource(format!("{}: {}", file_name, e)))?;
        debug!("Streaming zip entry {} from {}", entry.name(), file_name);
        (entry.data_start(), entry.compressed_size(), entry.compression())
    };

    let mut file = archive.into_inner().into_inner();
    file.seek(SeekFrom::Start(data_start))?;
    let raw = CountingReader {
        inner: BufReader::new(file).take(compressed_size),
        count,
    };
    let stream: Box<dyn Read> = match method {
        CompressionMethod::Stored => Box::new(raw),
        CompressionMethod::Deflated => Box::new(DeflateDecoder::new(raw)),
        other => {
            return Err(IngestError::InvalidSource(format!(
                "{}: unsupported zip compression {:?}",
                file_name, other
            )));
        }
    };
    Ok((stream, compressed_size))
}

/// Reads every record of `path` on the blocking pool.
pub async fn read_all(path: PathBuf, config: RecordSourceConfig) -> IngestResult<Vec<Record>> {
    tokio::task::spawn_blocking(move || {
        let reader = RecordReader::open(&path, &config)?;
        reader.collect()
    })
    .await
    .map_err(|e| IngestError::Io(io::Error::other(e)))?
}
