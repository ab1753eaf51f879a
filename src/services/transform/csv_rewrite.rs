use crate::config::FieldSpec;
use crate::error::{IngestError, IngestResult};
use crate::services::anonymizer::Anonymizer;
use csv::{ByteRecord, ReaderBuilder, Terminator, WriterBuilder};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteState {
    Init,
    ReadingHeader,
    ReadingBody,
    Done,
    Aborted,
}

/// Rewrites CSV rows, replacing the non-empty cells of anonymized columns.
///
/// Rows keep their column count; cells past the configured fields are
/// copied as they are.
#[derive(Clone)]
pub struct CsvRewrite {
    fields: Arc<[FieldSpec]>,
    ignore_header: bool,
    anonymizer: Option<Anonymizer>,
    file_name: String,
}

impl CsvRewrite {
    pub fn new(
        fields: Arc<[FieldSpec]>,
        ignore_header: bool,
        anonymizer: Option<Anonymizer>,
        file_name: impl Into<String>,
    ) -> IngestResult<Self> {
        if anonymizer.is_none() && fields.iter().any(|f| f.anonymize) {
            return Err(IngestError::invalid_config(
                crate::config::OPT_FIELD_LIST,
                "anonymized fields need a crypto context",
            ));
        }
        Ok(Self {
            fields,
            ignore_header,
            anonymizer,
            file_name: file_name.into(),
        })
    }

    /// Copies `input` to `output`, returning the number of rows written.
    pub fn rewrite<R: Read, W: Write>(&self, input: R, output: W) -> IngestResult<u64> {
        let mut state = RewriteState::Init;
        let result = self.run(input, output, &mut state);
        if let Err(e) = &result {
            debug!(file = %self.file_name, ?state, "CSV rewrite aborted: {}", e);
        }
        result
    }

    fn run<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
        state: &mut RewriteState,
    ) -> IngestResult<u64> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .terminator(Terminator::CRLF)
            .from_writer(output);
        *state = RewriteState::ReadingHeader;

        let mut record = ByteRecord::new();
        let mut row: u64 = 0;
        loop {
            let more = reader.read_byte_record(&mut record).inspect_err(|_| {
                *state = RewriteState::Aborted;
            })?;
            if !more {
                break;
            }
            row += 1;

            let rewritten = self.rewrite_record(&record, row, *state);
            let written = rewritten.and_then(|r| Ok(writer.write_byte_record(&r)?));
            if let Err(e) = written {
                *state = RewriteState::Aborted;
                return Err(e);
            }
            if *state == RewriteState::ReadingHeader {
                *state = RewriteState::ReadingBody;
            }
        }

        if row == 0 {
            *state = RewriteState::Aborted;
            return Err(IngestError::EmptyInput(self.file_name.clone()));
        }

        if let Err(e) = writer.flush() {
            *state = RewriteState::Aborted;
            return Err(e.into());
        }
        *state = RewriteState::Done;
        debug!(file = %self.file_name, rows = row, "CSV rewrite complete");
        Ok(row)
    }

    fn rewrite_record(
        &self,
        record: &ByteRecord,
        row: u64,
        state: RewriteState,
    ) -> IngestResult<ByteRecord> {
        if record.len() < self.fields.len() {
            return Err(IngestError::SchemaMismatch {
                file: self.file_name.clone(),
                row,
                message: format!(
                    "expected at least {} columns, found {}",
                    self.fields.len(),
                    record.len()
                ),
            });
        }

        if state == RewriteState::ReadingHeader && self.ignore_header {
            return Ok(record.clone());
        }

        let mut out = ByteRecord::with_capacity(record.as_slice().len(), record.len());
        for (i, cell) in record.iter().enumerate() {
            match self.fields.get(i) {
                Some(field) if field.anonymize && !cell.is_empty() => {
                    let text = std::str::from_utf8(cell).map_err(|_| IngestError::SchemaMismatch {
                        file: self.file_name.clone(),
                        row,
                        message: format!("column '{}' is not valid UTF-8", field.name),
                    })?;
                    let anonymizer = self.anonymizer.as_ref().ok_or_else(|| {
                        IngestError::Crypto("no crypto context available".to_string())
                    })?;
                    let protected = anonymizer.protect(&field.format, text)?;
                    out.push_field(protected.as_bytes());
                }
                _ => out.push_field(cell),
            }
        }
        Ok(out)
    }
}
