//! Typed error kinds the core distinguishes (spec §7).
//!
//! The teacher crate propagates `Result<_, String>` everywhere; here we
//! need callers (transport adapters) to match on error *kind*, so errors
//! are a `thiserror` enum instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("queue '{queue}' is full")]
    QueueFull { queue: String },

    #[error("queue '{queue}' is closed")]
    QueueClosed { queue: String },

    #[error("operation canceled")]
    Canceled,

    #[error("circuit open for queue '{queue}'")]
    CircuitOpen { queue: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch")]
    InvalidChecksum,
    #[error("corrupted data: {0}")]
    Corrupted(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
