//! Engine error taxonomy
//!
//! Every fallible engine operation returns [`EngineResult`]. Native driver
//! errors are mapped at the adapter boundary and keep their message verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Operation blocked: read-only mode ({kind})")]
    ReadOnlyViolation { kind: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("{message}")]
    ExecutionError { message: String },

    #[error("Syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Session '{session_id}' already has a reserved connection")]
    SessionAlreadyReserved { session_id: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Driver not found: {driver}")]
    DriverNotFound { driver: String },

    #[error("Transaction error: {message}")]
    TransactionError { message: String },

    #[error("Change set partially applied ({applied} of {total} operations): {message}")]
    PartialFailure {
        applied: usize,
        total: usize,
        message: String,
    },

    #[error("Dangerous query blocked: {reason}")]
    DangerousQueryBlocked { reason: String },

    #[error("SSH tunnel error: {message}")]
    SshError { message: String },

    #[error("Credential error: {message}")]
    CredentialError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Serializable tag for an [`EngineError`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ReadOnlyViolation,
    NotSupported,
    ConnectionFailed,
    AuthFailed,
    ExecutionError,
    SyntaxError,
    Cancelled,
    Timeout,
    ConnectInProgress,
    NotConnected,
    SessionAlreadyReserved,
    SessionNotFound,
    ConnectionNotFound,
    DriverNotFound,
    TransactionError,
    PartialFailure,
    DangerousQueryBlocked,
    SshError,
    CredentialError,
    Internal,
}

impl EngineError {
    pub fn read_only(kind: impl Into<String>) -> Self {
        Self::ReadOnlyViolation { kind: kind.into() }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn session_already_reserved(session_id: impl Into<String>) -> Self {
        Self::SessionAlreadyReserved {
            session_id: session_id.into(),
        }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    pub fn credential_error(message: impl Into<String>) -> Self {
        Self::CredentialError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReadOnlyViolation { .. } => ErrorKind::ReadOnlyViolation,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::ExecutionError { .. } => ErrorKind::ExecutionError,
            Self::SyntaxError { .. } => ErrorKind::SyntaxError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectInProgress => ErrorKind::ConnectInProgress,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::SessionAlreadyReserved { .. } => ErrorKind::SessionAlreadyReserved,
            Self::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            Self::ConnectionNotFound { .. } => ErrorKind::ConnectionNotFound,
            Self::DriverNotFound { .. } => ErrorKind::DriverNotFound,
            Self::TransactionError { .. } => ErrorKind::TransactionError,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::DangerousQueryBlocked { .. } => ErrorKind::DangerousQueryBlocked,
            Self::SshError { .. } => ErrorKind::SshError,
            Self::CredentialError { .. } => ErrorKind::CredentialError,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Terminal errors that a caller should not retry as-is.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::ReadOnlyViolation { .. }
                | Self::NotSupported { .. }
                | Self::DangerousQueryBlocked { .. }
                | Self::SyntaxError { .. }
                | Self::AuthFailed { .. }
        )
    }

    /// Maps a native statement error, keeping its message verbatim.
    pub fn from_native(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains("syntax error") || message.contains("You have an error in your SQL syntax") {
            Self::SyntaxError { message }
        } else {
            Self::ExecutionError { message }
        }
    }

    /// Maps a native connect error into auth vs transport failures.
    pub fn from_connect(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("password authentication failed")
            || lowered.contains("access denied")
            || lowered.contains("authentication failed")
        {
            Self::AuthFailed { message }
        } else {
            Self::ConnectionFailed { message }
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Self::connection_failed(err.to_string())
            }
            other => Self::from_native(other.to_string()),
        }
    }
}

impl From<mongodb::error::Error> for EngineError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::execution_error(err.to_string())
    }
}
