//! Error types for the manager contract.
//!
//! Every variant maps to a stable code string so the operation layer can
//! report it without matching on messages.  Callers are expected to branch
//! on [`DbError::NotImplemented`] and [`DbError::NotSupported`]: they mean
//! "this engine lacks the capability", not "the attempt failed".

use thiserror::Error;

/// Failures surfaced by a [`crate::engines::manager::DbManager`].
#[derive(Debug, Error)]
pub enum DbError {
    /// The engine has no implementation for this operation.
    #[error("{operation} is not implemented for engine {engine}")]
    NotImplemented {
        engine: &'static str,
        operation: &'static str,
    },

    /// The engine cannot support this capability at all (e.g. locking).
    #[error("{operation} is not supported by engine {engine}")]
    NotSupported {
        engine: &'static str,
        operation: &'static str,
    },

    /// `init_manager` was called with an empty engine type.
    #[error("engine type not set")]
    EngineTypeNotSet,

    /// No constructor is registered for the engine type.
    #[error("no db manager for engine {engine}")]
    NoManagerForEngine { engine: String },

    /// The registry has not constructed a manager yet.
    #[error("no db manager")]
    NoManager,

    /// Missing or malformed configuration; fatal at construction.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Connection refused, timed out, reset. Retry belongs to the caller.
    #[error("transient I/O failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// The engine answered but the payload did not have the expected shape.
    #[error("unexpected response from {source_name}: {message}")]
    Decode {
        source_name: &'static str,
        message: String,
    },

    /// The engine rejected the command.
    #[error("engine error{}: {message}", .code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    Engine {
        code: Option<String>,
        message: String,
    },

    /// The caller's deadline (or the internal probe bound) elapsed.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    /// The caller cancelled the operation.
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    /// The counting-lock release loop ran out of budget before the engine
    /// reported zero outstanding locks.
    #[error("write lock still partially held: {remaining} outstanding after {rounds} unlock rounds")]
    LockPartiallyHeld { remaining: u64, rounds: u32 },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DbError {
    /// Shorthand for a [`DbError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        DbError::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a [`DbError::Decode`].
    pub fn decode(source_name: &'static str, message: impl Into<String>) -> Self {
        DbError::Decode {
            source_name,
            message: message.into(),
        }
    }

    /// Stable identifier for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::NotImplemented { .. } => "NotImplemented",
            DbError::NotSupported { .. } => "NotSupported",
            DbError::EngineTypeNotSet => "EngineTypeNotSet",
            DbError::NoManagerForEngine { .. } => "NoManagerForEngine",
            DbError::NoManager => "NoManager",
            DbError::Config { .. } => "ConfigError",
            DbError::Transient(_) => "TransientError",
            DbError::Decode { .. } => "DecodeError",
            DbError::Engine { .. } => "EngineError",
            DbError::DeadlineExceeded { .. } => "DeadlineExceeded",
            DbError::Cancelled { .. } => "Cancelled",
            DbError::LockPartiallyHeld { .. } => "LockPartiallyHeld",
            DbError::Internal(_) => "InternalError",
        }
    }

    /// True for the two "capability absent" variants.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            DbError::NotImplemented { .. } | DbError::NotSupported { .. }
        )
    }
}
