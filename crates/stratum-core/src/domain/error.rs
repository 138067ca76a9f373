//! Domain-level error taxonomy for the retention engine.

use crate::domain::Stratum;
use stratum_state::StorageError;

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("entry not found: {id}")]
    NotFound { id: String },

    #[error("invalid stratum transition: {from} -> {to}")]
    InvalidTransition { from: Stratum, to: Stratum },

    #[error("compression inputs span more than one stratum: {found:?}")]
    IncompatibleStrata { found: Vec<Stratum> },

    #[error("compression requires at least one input entry")]
    EmptyInput,

    #[error("utility update for unregistered entry: {id}")]
    UnknownEntry { id: String },

    #[error("verification failed on attempt {attempt}: {reason}")]
    VerificationFailed { attempt: u32, reason: String },

    #[error("self-repair exhausted after {attempts} attempts for agent {agent_id}")]
    SelfRepairExhausted { agent_id: String, attempts: u32 },

    #[error("storage unavailable after {attempts} attempts: {source}")]
    StorageUnavailable {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
