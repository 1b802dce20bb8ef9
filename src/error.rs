//! Error types for rsmediadrm.
//!
//! [`Error`] is returned by the synchronous parts of the API (opening a
//! manager, loading configuration, store maintenance). Promise rejections
//! carry a [`Rejection`]: an [`ErrorCode`] from the caller-facing taxonomy and
//! a human-readable message.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::cdm::EngineError;
use crate::provisioning::ProvisioningState;
use crate::session::SessionToken;
use crate::store::StoreError;

/// Main error type for rsmediadrm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine does not support the requested crypto scheme.
    #[error("Unsupported crypto scheme {0}")]
    UnsupportedScheme(Uuid),

    /// No live session has the given token.
    #[error("Session {0} not found")]
    SessionNotFound(SessionToken),

    /// A session with the same token is already registered.
    #[error("Session {0} is already registered")]
    DuplicateSession(SessionToken),

    /// Provisioning was asked to move between incompatible states.
    #[error("Invalid provisioning transition: {from} -> {to}")]
    InvalidTransition {
        from: ProvisioningState,
        to: ProvisioningState,
    },

    /// The operation does not apply to the session in its current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The manager was released and accepts no further calls.
    #[error("Manager has been released")]
    Released,

    /// Engine call failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Persistent store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Configuration is missing or inconsistent.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// YAML error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify the error for a promise rejection.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Error::UnsupportedScheme(_) => ErrorCode::NotSupported,
            Error::Engine(e) => e.code(),
            Error::Storage(_) => ErrorCode::StorageError,
            Error::InvalidState(_) | Error::Released => ErrorCode::InvalidState,
            _ => ErrorCode::Fatal,
        }
    }
}

/// Result type alias for rsmediadrm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Recovered internally by provisioning; never used in a rejection.
    ProvisioningRequired,
    /// No usable key; the caller may request a new license.
    NoKey,
    /// The server refused the request; the session stays open.
    DeniedByServer,
    /// The engine rejected the response bytes; the session stays open.
    InvalidResponse,
    /// Persistence failed; in-memory state is unchanged.
    StorageError,
    /// No session with the given token.
    SessionNotFound,
    /// The session or manager cannot perform the operation right now.
    InvalidState,
    /// The operation is not implemented for this session.
    NotSupported,
    /// A queued operation was dropped because the manager was released.
    Aborted,
    /// Unrecoverable; the manager releases itself.
    Fatal,
}

impl ErrorCode {
    #[must_use]
    pub fn is_fatal(self) -> bool {
        self == ErrorCode::Fatal
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProvisioningRequired => "provisioning-required",
            ErrorCode::NoKey => "no-key",
            ErrorCode::DeniedByServer => "denied-by-server",
            ErrorCode::InvalidResponse => "invalid-response",
            ErrorCode::StorageError => "storage-error",
            ErrorCode::SessionNotFound => "session-not-found",
            ErrorCode::InvalidState => "invalid-state",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::Aborted => "aborted",
            ErrorCode::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a promise was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
