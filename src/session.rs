//! Session identity and metadata.
//!
//! A session is known to the caller only by its [`SessionToken`]. The
//! [`SessionId`] pairs that token with the engine-side handle (while the
//! session is open) and the persisted keyset id (once an offline license has
//! been stored).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cdm::{KeySetId, NativeHandle};
use crate::error::{Error, Result};

/// Caller-facing session identifier.
///
/// Tokens are random UUIDv4 values, stable across load/close cycles and never
/// reused. The nil UUID is reserved for the "no persisted license" result of
/// a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// Mint a fresh token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The token a load resolves with when no license is stored.
    #[must_use]
    pub const fn no_license() -> Self {
        Self(Uuid::nil())
    }

    #[must_use]
    pub fn is_no_license(&self) -> bool {
        self.0.is_nil()
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for SessionToken {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::Other(format!("Invalid session token '{}': {}", s, e)))
    }
}

/// License flavour requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Keys live only as long as the session.
    Streaming,
    /// Keys are persisted and can be restored with a later load.
    Offline,
    /// The persisted license is being revoked.
    Release,
}

impl KeyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Streaming => "streaming",
            KeyType::Offline => "offline",
            KeyType::Release => "release",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" | "temporary" => Ok(KeyType::Streaming),
            "offline" | "persistent" | "persistent-license" => Ok(KeyType::Offline),
            "release" => Ok(KeyType::Release),
            _ => Err(Error::Other(format!("Invalid key type '{}'", s))),
        }
    }
}

/// Identity of one session.
///
/// A session is usable while it has a native handle, a persisted keyset id,
/// or both. A loaded-but-not-yet-reopened offline session only has the
/// keyset id.
#[derive(Debug)]
pub struct SessionId {
    token: SessionToken,
    native_handle: Option<NativeHandle>,
    key_set_id: Option<KeySetId>,
}

impl SessionId {
    /// A session freshly opened in the engine.
    #[must_use]
    pub fn open(token: SessionToken, handle: NativeHandle) -> Self {
        Self {
            token,
            native_handle: Some(handle),
            key_set_id: None,
        }
    }

    /// An offline session known only from persistent storage.
    #[must_use]
    pub fn persisted(token: SessionToken, key_set_id: KeySetId) -> Self {
        Self {
            token,
            native_handle: None,
            key_set_id: Some(key_set_id),
        }
    }

    #[must_use]
    pub fn token(&self) -> SessionToken {
        self.token
    }

    #[must_use]
    pub fn native_handle(&self) -> Option<&NativeHandle> {
        self.native_handle.as_ref()
    }

    #[must_use]
    pub fn key_set_id(&self) -> Option<&KeySetId> {
        self.key_set_id.as_ref()
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.native_handle.is_some() || self.key_set_id.is_some()
    }

    pub(crate) fn attach_handle(&mut self, handle: NativeHandle) -> Option<NativeHandle> {
        self.native_handle.replace(handle)
    }

    pub(crate) fn set_key_set_id(&mut self, key_set_id: KeySetId) {
        self.key_set_id = Some(key_set_id);
    }

    pub(crate) fn clear_key_set_id(&mut self) -> Option<KeySetId> {
        self.key_set_id.take()
    }

    /// Give up the native handle so it can be closed.
    #[must_use]
    pub fn into_native_handle(self) -> Option<NativeHandle> {
        self.native_handle
    }
}

/// Metadata kept alongside each live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Container mime type of the init data the session was created with.
    pub mime_type: String,
    /// `Release` while an offline license is being revoked.
    pub key_type: KeyType,
    /// For `Release` sessions, the keyset of the offline license being revoked.
    pub revoking: Option<KeySetId>,
}

impl SessionInfo {
    #[must_use]
    pub fn new(mime_type: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            mime_type: mime_type.into(),
            key_type,
            revoking: None,
        }
    }
}
