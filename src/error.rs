use serde::Serialize;
use std::io;
use thiserror::Error;

/// Classification reported for a failed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    InvalidConfig,
    InvalidSource,
    EmptyInput,
    SchemaMismatch,
    CryptoError,
    UploadError,
    IoError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::InvalidConfig => "InvalidConfig",
            FailureKind::InvalidSource => "InvalidSource",
            FailureKind::EmptyInput => "EmptyInput",
            FailureKind::SchemaMismatch => "SchemaMismatch",
            FailureKind::CryptoError => "CryptoError",
            FailureKind::UploadError => "UploadError",
            FailureKind::IoError => "IOError",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid config '{option}': {message}")]
    InvalidConfig { option: String, message: String },

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Schema mismatch in '{file}' at row {row}: {message}")]
    SchemaMismatch {
        file: String,
        row: u64,
        message: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(io::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    pub fn invalid_config(option: &str, message: impl Into<String>) -> Self {
        IngestError::InvalidConfig {
            option: option.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::InvalidConfig { .. } => FailureKind::InvalidConfig,
            IngestError::InvalidSource(_) => FailureKind::InvalidSource,
            IngestError::EmptyInput(_) => FailureKind::EmptyInput,
            IngestError::SchemaMismatch { .. } => FailureKind::SchemaMismatch,
            IngestError::Crypto(_) => FailureKind::CryptoError,
            IngestError::Upload(_) => FailureKind::UploadError,
            IngestError::Io(_) => FailureKind::IoError,
        }
    }

    /// Wraps the error so it can travel through `std::io` plumbing and be
    /// recovered intact on the other side.
    pub fn into_io(self) -> io::Error {
        match self {
            IngestError::Io(e) if e.get_ref().is_none() => e,
            other => io::Error::other(other),
        }
    }
}

impl Clone for IngestError {
    fn clone(&self) -> Self {
        match self {
            IngestError::InvalidConfig { option, message } => IngestError::InvalidConfig {
                option: option.clone(),
                message: message.clone(),
            },
            IngestError::InvalidSource(m) => IngestError::InvalidSource(m.clone()),
            IngestError::EmptyInput(m) => IngestError::EmptyInput(m.clone()),
            IngestError::SchemaMismatch { file, row, message } => IngestError::SchemaMismatch {
                file: file.clone(),
                row: *row,
                message: message.clone(),
            },
            IngestError::Crypto(m) => IngestError::Crypto(m.clone()),
            IngestError::Upload(m) => IngestError::Upload(m.clone()),
            IngestError::Io(e) => match e.get_ref() {
                Some(inner) => IngestError::Io(io::Error::new(e.kind(), inner.to_string())),
                None => IngestError::Io(io::Error::from(e.kind())),
            },
        }
    }
}

impl From<io::Error> for IngestError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<IngestError>()) {
            return IngestError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<IngestError>() {
                Ok(original) => *original,
                Err(other) => IngestError::Io(io::Error::new(kind, other)),
            },
            None => IngestError::Io(io::Error::from(kind)),
        }
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(e) => IngestError::from(e),
                other => IngestError::Io(io::Error::other(format!("{:?}", other))),
            }
        } else {
            IngestError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
        }
    }
}
