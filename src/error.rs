//! Canonical error type for the delta WAL ingestion and upload core.

use thiserror::Error;

/// Errors produced by the delta WAL engine and its collaborators.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// The request was parked on the backoff queue because the cache is
    /// full or the WAL is over capacity. Internal signal only — never
    /// surfaced to a producer as a terminal failure.
    #[error("append parked on backoff queue")]
    Backoff,

    /// A `fastRead` caller missed the cache and the engine refused to
    /// fall through to the block cache.
    #[error("fast read missed the log cache")]
    FastReadFailFast,

    /// A merged read produced a gap between the block-cache suffix and
    /// the log-cache prefix.
    #[error("continuity violation: expected base offset {expected}, got {actual}")]
    ContinuityViolation {
        /// Offset the next record was required to start at.
        expected: u64,
        /// Offset the next record actually started at.
        actual: u64,
    },

    /// The underlying WAL device rejected an append because it is over
    /// capacity. Handled internally by Admission; never returned to a caller.
    #[error("WAL is over capacity")]
    WalOverCapacity,

    /// The `prepare` or `upload` stage of the upload pipeline failed.
    /// Non-fatal: propagated to `forceUpload` callers for the affected
    /// stream; later blocks still commit in order once this one retires.
    #[error("persist failed: {0}")]
    PersistFailure(String),

    /// The `commit` stage failed. This breaks the invariant tying the
    /// WAL trim point to committed objects and is always fatal.
    #[error("commit failed (fatal): {0}")]
    CommitFailure(String),

    /// The engine is shutting down; pending backoff requests and new
    /// appends are rejected with this error.
    #[error("engine is shutting down")]
    Shutdown,

    /// WAL replay produced a prefix that does not match the committed
    /// `endOffset` for some stream. Startup aborts.
    #[error("recovery invariant violated: {0}")]
    RecoveryInvariant(String),

    /// A requested object/stream/record was not present.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Kind of entity that was missing.
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// A caller passed an argument that violates a documented invariant.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error surfaced by a collaborator implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization error surfaced while encoding/decoding a record
    /// batch or a WAL-recovered byte block.
    #[error("codec error: {0}")]
    Codec(String),
}

impl DeltaError {
    /// True if this error represents a transient, internally-handled
    /// condition rather than a terminal producer-facing failure.
    #[must_use]
    pub fn is_backoff(&self) -> bool {
        matches!(self, Self::Backoff | Self::WalOverCapacity)
    }

    /// True if this error must abort the process per `spec.md` §7.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CommitFailure(_))
    }
}

impl From<bincode::Error> for DeltaError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Convenient result alias for engine operations.
pub type Result<T> = std::result::Result<T, DeltaError>;
