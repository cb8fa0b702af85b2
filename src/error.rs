/// Error types for cursors, lookups, materialized views and sequences
///
/// Every fallible operation in the crate returns [`CursorError`]. Errors fall
/// into four families, reported by [`CursorError::kind`]:
///
/// - `Definition`: the request refers to something that does not exist or is
///   malformed (unknown column, bad filter text, bad catalog)
/// - `Validation`: the request is well-formed but breaks a rule (type
///   mismatch, unindexed lookup, decimal overflow, exhausted sequence)
/// - `NotFound`: an explicit lookup found no row
/// - `Conflict`: the write collides with existing state (duplicate key,
///   stale record version)
///
/// All failures are local and synchronous. A failed call never leaves a
/// cursor or lookup half-modified.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CursorError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CursorError {
    // Definition errors
    #[error("Relation not found: {0}")]
    UnknownRelation(String),

    #[error("Column '{column}' not found in relation '{relation}'")]
    UnknownColumn { relation: String, column: String },

    #[error("Sequence not found: {0}")]
    UnknownSequence(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid sequence definition '{name}': {reason}")]
    InvalidSequence { name: String, reason: String },

    #[error("Invalid filter on column '{column}': {reason}")]
    InvalidFilter { column: String, reason: String },

    #[error("Invalid order by: {0}")]
    InvalidOrder(String),

    #[error("Invalid navigation: {0}")]
    InvalidNavigation(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Lookup error: {0}")]
    InvalidLookup(String),

    #[error("Cursors belong to different sessions")]
    ForeignSession,

    #[error("Expected a cursor over '{expected}', got one over '{found}'")]
    RelationMismatch { expected: String, found: String },

    // Validation errors
    #[error("Type mismatch on column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Columns {columns:?} are not a prefix of any index on relation '{relation}'")]
    UnindexedLookup {
        relation: String,
        columns: Vec<String>,
    },

    #[error("Lookup columns of '{target}' and '{auxiliary}' have no index with the same order")]
    LookupIndexMismatch { target: String, auxiliary: String },

    #[error("Value {value} does not fit column '{column}' of type DECIMAL({precision},{scale})")]
    DecimalOverflow {
        column: String,
        value: String,
        precision: u32,
        scale: u32,
    },

    #[error("Value for column '{column}' is {length} characters long, maximum is {max_length}")]
    StringTooLong {
        column: String,
        length: usize,
        max_length: usize,
    },

    #[error("Column '{0}' cannot be NULL")]
    NullViolation(String),

    #[error("Sequence '{0}' is exhausted")]
    SequenceExhausted(String),

    #[error("Relation '{0}' is read-only")]
    ReadOnly(String),

    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Hook failed: {0}")]
    Hook(String),

    // Not found
    #[error("Record {key} not found in relation '{relation}'")]
    NotFound { relation: String, key: String },

    // Conflicts
    #[error("Record {key} already exists in relation '{relation}'")]
    DuplicateKey { relation: String, key: String },

    #[error("Record {key} in relation '{relation}' has been already modified")]
    VersionConflict { relation: String, key: String },
}

/// Error families, see the module documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Definition,
    Validation,
    NotFound,
    Conflict,
}

impl CursorError {
    pub fn kind(&self) -> ErrorKind {
        use CursorError::*;
        match self {
            UnknownRelation(_)
            | UnknownColumn { .. }
            | UnknownSequence(_)
            | InvalidCatalog(_)
            | InvalidSequence { .. }
            | InvalidFilter { .. }
            | InvalidOrder(_)
            | InvalidNavigation(_)
            | InvalidKey(_)
            | InvalidLookup(_)
            | ForeignSession
            | RelationMismatch { .. } => ErrorKind::Definition,
            TypeMismatch { .. }
            | UnindexedLookup { .. }
            | LookupIndexMismatch { .. }
            | DecimalOverflow { .. }
            | StringTooLong { .. }
            | NullViolation(_)
            | SequenceExhausted(_)
            | ReadOnly(_)
            | Overflow(_)
            | Hook(_) => ErrorKind::Validation,
            NotFound { .. } => ErrorKind::NotFound,
            DuplicateKey { .. } | VersionConflict { .. } => ErrorKind::Conflict,
        }
    }

    pub fn unknown_column(relation: &str, column: &str) -> Self {
        CursorError::UnknownColumn {
            relation: relation.to_string(),
            column: column.to_string(),
        }
    }
}
