//! Error types for `diaform-migrate`.
//!
//! Every error can be classified into one of the handling classes the
//! pipeline cares about (see [`ErrorClass`]): transient failures are
//! retried, key conflicts are skipped, configuration problems abort the
//! run before it starts, and everything else is a per-row failure.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration (DIAF-001).
    #[error("[DIAF-001] Configuration error: {0}")]
    Config(String),

    /// Source store unreachable or returned an error (DIAF-002).
    #[error("[DIAF-002] Source connection error: {0}")]
    SourceConnection(String),

    /// Destination store unreachable at startup (DIAF-003).
    #[error("[DIAF-003] Destination connection error: {0}")]
    DestinationConnection(String),

    /// Credentials rejected by a store (DIAF-004).
    #[error("[DIAF-004] Authentication failed: {0}")]
    Authentication(String),

    /// Source asked us to slow down; value is the suggested wait in seconds (DIAF-005).
    #[error("[DIAF-005] Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Malformed response from the source (DIAF-006).
    #[error("[DIAF-006] Extraction error: {0}")]
    Extraction(String),

    /// A single source document could not be decoded (DIAF-007).
    #[error("[DIAF-007] Cannot decode {collection} document: {reason}")]
    Decode {
        /// Source collection the document came from.
        collection: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// Row with the same primary key already exists (DIAF-008).
    #[error("[DIAF-008] Constraint violation: {entity} '{name}' of user '{user}' already exists")]
    ConstraintViolation {
        /// Entity kind (`thing` or `connection`).
        entity: &'static str,
        /// Owning user.
        user: String,
        /// Row name.
        name: String,
    },

    /// User exists in the target with a different credential (DIAF-009).
    #[error("[DIAF-009] Duplicate key: user '{0}' already exists with different data")]
    DuplicateKey(String),

    /// Transaction used out of order (DIAF-010).
    #[error("[DIAF-010] Transaction error: {0}")]
    Transaction(String),

    /// Run cancelled before commit (DIAF-011).
    #[error("[DIAF-011] Migration interrupted before commit")]
    Interrupted,

    /// HTTP transport error (DIAF-012).
    #[error("[DIAF-012] HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database driver error (DIAF-013).
    #[cfg(feature = "postgres")]
    #[error("[DIAF-013] Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (DIAF-014).
    #[error("[DIAF-014] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (DIAF-015).
    #[error("[DIAF-015] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error (DIAF-016).
    #[error("[DIAF-016] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network or connection trouble; retry the operation.
    Transient,
    /// Duplicate primary key on insert; log and skip the row.
    ConstraintViolation,
    /// User row exists with different data; log and skip the row.
    DuplicateKey,
    /// Missing credentials or unreachable store; abort before any phase.
    FatalConfig,
    /// Any other failure confined to a single row.
    Row,
}

impl Error {
    /// Returns the error code (e.g., "DIAF-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "DIAF-001",
            Self::SourceConnection(_) => "DIAF-002",
            Self::DestinationConnection(_) => "DIAF-003",
            Self::Authentication(_) => "DIAF-004",
            Self::RateLimit(_) => "DIAF-005",
            Self::Extraction(_) => "DIAF-006",
            Self::Decode { .. } => "DIAF-007",
            Self::ConstraintViolation { .. } => "DIAF-008",
            Self::DuplicateKey(_) => "DIAF-009",
            Self::Transaction(_) => "DIAF-010",
            Self::Interrupted => "DIAF-011",
            Self::Http(_) => "DIAF-012",
            #[cfg(feature = "postgres")]
            Self::Database(_) => "DIAF-013",
            Self::Io(_) => "DIAF-014",
            Self::Json(_) => "DIAF-015",
            Self::Yaml(_) => "DIAF-016",
        }
    }

    /// Classifies the error for the pipeline's handling policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_)
            | Self::DestinationConnection(_)
            | Self::Authentication(_)
            | Self::Yaml(_) => ErrorClass::FatalConfig,
            Self::ConstraintViolation { .. } => ErrorClass::ConstraintViolation,
            Self::DuplicateKey(_) => ErrorClass::DuplicateKey,
            _ if crate::retry::is_retryable_error(self) => ErrorClass::Transient,
            _ => ErrorClass::Row,
        }
    }

    /// Returns true for errors that only affect the row being written.
    #[must_use]
    pub fn is_row_level(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ConstraintViolation | ErrorClass::DuplicateKey | ErrorClass::Row
        )
    }
}
