use uuid::Uuid;

use crate::core::{EntityKind, Status};

// ---------------------------------------------------------------------------
// Sub-error types
// ---------------------------------------------------------------------------

/// Bad input shape. Always reported before any durable write.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("corpus name must not be empty")]
    EmptyCorpusName,
    #[error("prompt text must not be empty")]
    EmptyPromptText,
    #[error("{0} must not be empty")]
    MissingValue(&'static str),
    #[error("field_names must not be empty")]
    EmptyFieldNames,
    #[error("duplicate field name: {0}")]
    DuplicateFieldName(String),
    #[error("field name {0} is reserved for result provenance")]
    ReservedFieldName(String),
    #[error("{role} field {field} is not declared in field_names")]
    UndeclaredField { role: &'static str, field: String },
    #[error("target example count must be at least 1")]
    ZeroTargetCount,
    #[error("unknown status value: {0}")]
    UnknownStatus(String),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("dataset {id} is {status}, expected DONE")]
    DatasetNotDone { id: Uuid, status: Status },
    #[error("{kind} {id} is {status}; only PLANNING entities can be resubmitted")]
    NotResubmittable {
        kind: EntityKind,
        id: Uuid,
        status: Status,
    },
    #[error("csv header mismatch: expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("csv file has no header row")]
    MissingHeader,
    #[error("field name in column {column} is empty")]
    BlankFieldName { column: usize },
    #[error("malformed csv: {0}")]
    MalformedCsv(String),
    #[error("item {0} appears more than once")]
    DuplicateItemId(Uuid),
    #[error("item {0} does not belong to this dataset")]
    UnknownItemId(Uuid),
    #[error("row {row} corrects {corrects_id}, which is not an earlier item")]
    DanglingCorrection { row: usize, corrects_id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    #[error("{kind} {id} not found")]
    Entity { kind: EntityKind, id: Uuid },
    #[error("project {0} not found")]
    Project(Uuid),
    #[error("corpus {0} not found")]
    Corpus(Uuid),
    #[error("prompt {0} not found")]
    Prompt(Uuid),
}

/// Violations of the positional `values` <-> `field_names` correspondence
/// or of the result-file contract. The whole operation is aborted.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("row {row} has {found} values, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("no result files found under {prefix}")]
    NoResultFiles { prefix: String },
    #[error("field {field} not found in annotation")]
    FieldNotFound {
        field: String,
        key: String,
        annotation: usize,
    },
    #[error("malformed result file {key}: {reason}")]
    MalformedResult { key: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob store unreachable: {0}")]
    Unreachable(String),
    #[error("object {0} not found")]
    ObjectNotFound(String),
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("blob store i/o error: {0}")]
    Io(String),
}

/// Failures of collaborators this core does not control. The triggering
/// entity is left untouched so the operation can be retried.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("entity store failed: {0}")]
    Store(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for ExternalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    External(#[from] ExternalError),
}

impl From<BlobError> for PipelineError {
    fn from(err: BlobError) -> Self {
        Self::External(ExternalError::Blob(err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::External(err.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
