//! Error types for the chunk migration subsystem.

use crate::types::{ChunkVersion, CollectionUuid, ShardId};
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// The taxonomy mirrors how callers must react:
/// - routing/staleness errors are retried after a metadata refresh,
/// - conflict errors are surfaced to the balancer immediately,
/// - timeout errors abort the migration cleanly,
/// - fatal errors abort before any data movement.
#[derive(Error, Debug)]
pub enum Error {
    /// Cached chunk version does not match authoritative state.
    #[error("stale chunk version: expected {expected}, found {actual}")]
    StaleVersion {
        expected: ChunkVersion,
        actual: ChunkVersion,
    },

    /// This shard does not own the targeted key range.
    #[error("shard {shard} does not own the targeted key")]
    NotOwner { shard: ShardId },

    /// Writes to the migrating range are briefly blocked while the
    /// donor hands off ownership; routers retry after a refresh.
    #[error("write blocked: migration critical section active")]
    CriticalSectionActive,

    /// Another migration overlaps the requested range.
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    /// A range deletion task overlapping the requested range already exists.
    #[error("overlapping range deletion task exists: {0}")]
    OverlappingRangeDeletion(String),

    /// The catch-up phase could not converge within its budget.
    #[error("migration exceeded time limit during catch-up")]
    MigrationExceededTimeLimit,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled before the critical section.
    #[error("operation cancelled")]
    Cancelled,

    /// The recipient collection is non-empty and lacks donor indexes.
    #[error("destination is missing required indexes: {missing:?}")]
    IndexesMissingForMigration { missing: Vec<String> },

    /// Donor and recipient disagree on the collection identity.
    #[error("collection uuid mismatch: donor {donor}, recipient {recipient}")]
    CollectionUuidMismatch {
        donor: CollectionUuid,
        recipient: CollectionUuid,
    },

    /// No migration with this id is known.
    #[error("migration not found: {0}")]
    MigrationNotFound(Uuid),

    /// A state machine transition was attempted out of order.
    #[error("invalid migration state: {0}")]
    InvalidMigrationState(String),

    /// Too many migrations in flight on this shard.
    #[error("too many concurrent migrations")]
    TooManyMigrations,

    /// Crash recovery could not observe authoritative state.
    #[error("manual intervention required: {0}")]
    ManualInterventionRequired(String),

    /// The named collection is unknown on this shard.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Routing/staleness errors the router resolves by refreshing its
    /// cached routing info and re-issuing the operation.
    pub fn is_retryable_routing(&self) -> bool {
        matches!(
            self,
            Error::StaleVersion { .. } | Error::NotOwner { .. } | Error::CriticalSectionActive
        )
    }

    /// Stable numeric code surfaced by the administrative command layer.
    pub fn code(&self) -> u32 {
        match self {
            Error::StaleVersion { .. } => 10,
            Error::NotOwner { .. } => 11,
            Error::CriticalSectionActive => 12,
            Error::ConflictingOperationInProgress(_) => 20,
            Error::OverlappingRangeDeletion(_) => 21,
            Error::TooManyMigrations => 22,
            Error::MigrationExceededTimeLimit => 30,
            Error::Timeout => 31,
            Error::Cancelled => 32,
            Error::IndexesMissingForMigration { .. } => 40,
            Error::CollectionUuidMismatch { .. } => 41,
            Error::CollectionNotFound(_) => 42,
            Error::MigrationNotFound(_) => 50,
            Error::InvalidMigrationState(_) => 51,
            Error::ManualInterventionRequired(_) => 60,
            Error::Storage(_) => 70,
            Error::Serialization(_) => 71,
            Error::Io(_) => 72,
            Error::Internal(_) => 100,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
