//! Key status reporting.
//!
//! Engines report per-key status as `(key id, status code)` pairs. Engines
//! that cannot do this get a single placeholder entry covering the whole
//! session.

use std::fmt;

/// Key id used for the placeholder status entry.
pub const PLACEHOLDER_KEY_ID: &[u8] = &[0];

/// Status of one key, using the engine's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStatusCode {
    Usable,
    Expired,
    OutputNotAllowed,
    Pending,
    InternalError,
    UsableInFuture,
    /// A code this crate does not know; passed through verbatim.
    Unknown(i32),
}

impl KeyStatusCode {
    #[must_use]
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => KeyStatusCode::Usable,
            1 => KeyStatusCode::Expired,
            2 => KeyStatusCode::OutputNotAllowed,
            3 => KeyStatusCode::Pending,
            4 => KeyStatusCode::InternalError,
            5 => KeyStatusCode::UsableInFuture,
            other => KeyStatusCode::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_raw(self) -> i32 {
        match self {
            KeyStatusCode::Usable => 0,
            KeyStatusCode::Expired => 1,
            KeyStatusCode::OutputNotAllowed => 2,
            KeyStatusCode::Pending => 3,
            KeyStatusCode::InternalError => 4,
            KeyStatusCode::UsableInFuture => 5,
            KeyStatusCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for KeyStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatusCode::Usable => f.write_str("usable"),
            KeyStatusCode::Expired => f.write_str("expired"),
            KeyStatusCode::OutputNotAllowed => f.write_str("output-not-allowed"),
            KeyStatusCode::Pending => f.write_str("pending"),
            KeyStatusCode::InternalError => f.write_str("internal-error"),
            KeyStatusCode::UsableInFuture => f.write_str("usable-in-future"),
            KeyStatusCode::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Status of a single key as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub key_id: Vec<u8>,
    pub status: KeyStatusCode,
}

impl KeyStatus {
    pub fn new(key_id: impl Into<Vec<u8>>, status: KeyStatusCode) -> Self {
        Self {
            key_id: key_id.into(),
            status,
        }
    }

    /// Single-entry status list for engines without per-key reporting.
    #[must_use]
    pub fn placeholder(status: KeyStatusCode) -> Vec<KeyStatus> {
        vec![Self::new(PLACEHOLDER_KEY_ID, status)]
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.key_id == PLACEHOLDER_KEY_ID
    }
}
