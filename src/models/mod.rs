use crate::error::{FailureKind, IngestError, IngestResult};
use serde::{Deserialize, Serialize};

/// One file handed to the engine by the upstream lister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub file_name: String,
    pub full_path: String,
    pub relative_path: String,
    #[serde(rename = "hostURI")]
    pub host_uri: String,
}

impl FileDescriptor {
    /// Builds a descriptor for `full_path`, found while listing `source_path`.
    ///
    /// The relative path keeps everything after the last `/` of the source
    /// path, so listing `/data/in` yields `in/<file>` while `/data/in/`
    /// yields `<file>`.
    pub fn from_path(full_path: &str, source_path: &str, host_uri: &str) -> IngestResult<Self> {
        if !full_path.starts_with(source_path) {
            return Err(IngestError::InvalidSource(format!(
                "source path '{}' is not a prefix of '{}'",
                source_path, full_path
            )));
        }

        let cut = source_path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let relative_path = full_path[cut..].to_string();
        let file_name = full_path
            .rsplit('/')
            .next()
            .unwrap_or(full_path)
            .to_string();

        Ok(Self {
            file_name,
            full_path: full_path.to_string(),
            relative_path,
            host_uri: host_uri.to_string(),
        })
    }
}

/// Size and timestamp of an opened source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    pub name: String,
    pub size: u64,
    pub last_modified_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub key: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok(UploadReport),
    Skipped { reason: String },
    Failed { kind: FailureKind, message: String },
}

/// Terminal result for one descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub descriptor: FileDescriptor,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl FileOutcome {
    pub fn ok(descriptor: FileDescriptor, report: UploadReport) -> Self {
        Self {
            descriptor,
            status: OutcomeStatus::Ok(report),
        }
    }

    pub fn skipped(descriptor: FileDescriptor, reason: impl Into<String>) -> Self {
        Self {
            descriptor,
            status: OutcomeStatus::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(descriptor: FileDescriptor, err: &IngestError) -> Self {
        Self {
            descriptor,
            status: OutcomeStatus::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, OutcomeStatus::Ok(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            OutcomeStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<FileOutcome>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome.status {
            OutcomeStatus::Ok(_) => self.succeeded += 1,
            OutcomeStatus::Skipped { .. } => self.skipped += 1,
            OutcomeStatus::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}
