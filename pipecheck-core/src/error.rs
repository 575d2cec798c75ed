//! Error types for the pipecheck-core crate.
//!
//! Every failure that is fatal to a single verification case is a variant of
//! [`HarnessError`]. Per-field disagreements are not errors; they are recorded
//! as [`crate::comparator::ComparisonResult::Mismatch`] and surface through the
//! case verdict.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for one verification case.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Fixture not found: {path}")]
    NotFound { path: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Evaluation error at record {record}: {source}")]
    Evaluation {
        record: usize,
        #[source]
        source: EvaluationError,
    },

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Fixture error in {path}: {message}")]
    Fixture { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl HarnessError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn fixture(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fixture {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while decoding an object-graph stream into a pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Unrecognized format tag {found:?}")]
    BadMagic { found: Vec<u8> },

    #[error("Unsupported format version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("Truncated stream at offset {offset}: needed {needed} bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("Unknown value tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("Malformed {what} at offset {offset}: {message}")]
    Malformed {
        what: &'static str,
        offset: usize,
        message: String,
    },

    #[error("Back-reference {index} does not name a completed object ({available} available)")]
    InvalidReference { index: u32, available: usize },

    #[error("Object graph nested deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("{trailing} trailing bytes after root value")]
    TrailingBytes { trailing: usize },

    #[error("No factory registered for type '{type_name}'")]
    UnknownType { type_name: String },

    #[error("Type '{type_name}': missing attribute '{attribute}'")]
    MissingAttribute { type_name: String, attribute: String },

    #[error("Type '{type_name}': attribute '{attribute}' {message}")]
    InvalidAttribute {
        type_name: String,
        attribute: String,
        message: String,
    },

    #[error("Expected {expected}, got {found}")]
    UnexpectedKind { expected: String, found: String },

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Expression syntax error at column {position}: {message}")]
    Expression { position: usize, message: String },
}

/// Errors raised while compiling a pipeline into a scoring document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Step '{step}' ({type_name}) is not supported: {reason}")]
    Unsupported {
        step: String,
        type_name: String,
        reason: String,
    },

    #[error("Step '{step}' references artifact '{path}' that has not been resolved to a local file")]
    UnresolvedArtifact { step: String, path: String },

    #[error("Step '{step}': cannot read artifact {path}: {message}")]
    ArtifactUnreadable {
        step: String,
        path: PathBuf,
        message: String,
    },

    #[error("Step '{step}': {message}")]
    FeatureMismatch { step: String, message: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// Errors raised while evaluating a record, natively or through a document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("Input field '{0}' is not present in the record")]
    MissingField(String),

    #[error("Field '{field}': invalid value '{value}'")]
    InvalidValue { field: String, value: String },

    #[error("Expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("{guard} guard tripped: nesting depth exceeds {limit}")]
    GuardViolation { guard: &'static str, limit: usize },

    #[error("Artifact-backed step '{0}' used before its artifact was resolved")]
    UnresolvedArtifact(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// Errors raised while staging or loading an out-of-band artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Invalid model description in {path}: {message}")]
    Format { path: PathBuf, message: String },

    #[error("Step '{0}' does not reference an artifact")]
    NoArtifact(String),
}
