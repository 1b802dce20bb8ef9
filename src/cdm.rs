//! Native CDM engine boundary.
//!
//! The engine performs all key unwrapping and decryption; the session manager
//! only drives it through [`CdmEngine`]. A device that still needs
//! provisioning is reported as the ordinary [`EngineError::NotProvisioned`]
//! result rather than as a failure.
//!
//! Engines may raise events while one of their calls is still running (for
//! example key status changes during [`CdmEngine::restore_keys`]). Such events
//! are buffered by the engine and handed out through
//! [`CdmEngine::poll_event`], which the manager drains after every call.
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::key::KeyStatus;
use crate::session::KeyType;
use crate::utils::to_hex;

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

/// Engine property holding the security level (Widevine).
pub const PROPERTY_SECURITY_LEVEL: &str = "securityLevel";
/// Engine property holding the service certificate (Widevine).
pub const PROPERTY_SERVER_CERTIFICATE: &str = "serviceCertificate";
/// Engine property isolating storage per security origin (Widevine).
pub const PROPERTY_ORIGIN: &str = "origin";
pub const PROPERTY_PRIVACY_MODE: &str = "privacyMode";
pub const PROPERTY_SESSION_SHARING: &str = "sessionSharing";
pub const PROPERTY_ENABLE: &str = "enable";

/// Extra key/value pairs passed through to the engine's key request.
pub type OptionalParameters = BTreeMap<String, String>;

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The device (or origin) must be provisioned before this call succeeds.
    #[error("Device is not provisioned")]
    NotProvisioned,

    /// The license or provisioning server refused the request.
    #[error("Denied by server: {0}")]
    DeniedByServer(String),

    /// Response bytes could not be parsed or did not match the request.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No usable key for the requested operation.
    #[error("No usable key: {0}")]
    NoKey(String),

    /// The engine refused the call in its current state.
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// The engine ran out of sessions or another resource.
    #[error("Engine resource busy: {0}")]
    ResourceBusy(String),

    /// The engine does not support the requested feature.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Unexpected engine failure.
    #[error("Engine failure: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map the engine failure onto the caller-facing error taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NotProvisioned => ErrorCode::ProvisioningRequired,
            EngineError::DeniedByServer(_) => ErrorCode::DeniedByServer,
            EngineError::InvalidResponse(_) => ErrorCode::InvalidResponse,
            EngineError::NoKey(_) => ErrorCode::NoKey,
            EngineError::InvalidState(_) => ErrorCode::InvalidState,
            EngineError::Unsupported(_) => ErrorCode::NotSupported,
            EngineError::ResourceBusy(_) | EngineError::Internal(_) => ErrorCode::Fatal,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

/// Engine-side session handle.
///
/// The handle is deliberately not `Clone`: it is owned by exactly one
/// registry entry and closing the session consumes it.
#[derive(PartialEq, Eq, Hash)]
pub struct NativeHandle(Vec<u8>);

impl NativeHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({})", to_hex(&self.0))
    }
}

/// Identifier of a persisted offline license inside the engine.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeySetId(Vec<u8>);

impl KeySetId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for KeySetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySetId({})", to_hex(&self.0))
    }
}

/// What a key request or key response applies to.
///
/// Release requests and responses are scoped to the persisted keyset, all
/// others to the open native session.
#[derive(Debug, Clone, Copy)]
pub enum KeyScope<'a> {
    Session(&'a NativeHandle),
    KeySet(&'a KeySetId),
}

/// Kind of license message carried by a key request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Initial,
    Renewal,
    Release,
    None,
    Update,
}

impl RequestType {
    #[must_use]
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(RequestType::Initial),
            1 => Some(RequestType::Renewal),
            2 => Some(RequestType::Release),
            3 => Some(RequestType::None),
            4 => Some(RequestType::Update),
            _ => None,
        }
    }
}

/// Key request produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub data: Vec<u8>,
    pub default_url: String,
    /// `None` on engines that do not report the request type.
    pub request_type: Option<RequestType>,
}

impl KeyRequest {
    /// Request type, guessed from the default URL when the engine does not
    /// report it: requests with a URL are renewals, all others initial.
    #[must_use]
    pub fn request_type(&self) -> RequestType {
        self.request_type.unwrap_or(if self.default_url.is_empty() {
            RequestType::Initial
        } else {
            RequestType::Renewal
        })
    }
}

/// Provisioning request produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub default_url: String,
    pub data: Vec<u8>,
}

/// Event raised by the engine for one of its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    KeyStatusChange {
        session: Vec<u8>,
        keys: Vec<KeyStatus>,
        has_new_usable_key: bool,
    },
    ExpirationUpdate {
        session: Vec<u8>,
        /// Milliseconds since the Unix epoch; 0 means no expiration.
        expiration_ms: i64,
    },
    /// The engine needs a new license exchange for the session.
    KeyRequired { session: Vec<u8>, data: Vec<u8> },
    KeyExpired { session: Vec<u8> },
    VendorDefined { session: Vec<u8>, code: i32 },
}

impl EngineEvent {
    /// Raw native handle the event refers to.
    #[must_use]
    pub fn session(&self) -> &[u8] {
        match self {
            EngineEvent::KeyStatusChange { session, .. }
            | EngineEvent::ExpirationUpdate { session, .. }
            | EngineEvent::KeyRequired { session, .. }
            | EngineEvent::KeyExpired { session }
            | EngineEvent::VendorDefined { session, .. } => session,
        }
    }
}

/// Capabilities the session manager needs from a native CDM.
pub trait CdmEngine {
    /// Whether `scheme` is supported, optionally for a container mime type
    /// (empty string means "any").
    fn is_crypto_scheme_supported(&self, scheme: Uuid, container_mime_type: &str) -> bool;

    fn open_session(&mut self) -> EngineResult<NativeHandle>;

    fn close_session(&mut self, handle: NativeHandle) -> EngineResult<()>;

    /// Drop keys loaded into a session. Not all engines implement this.
    fn remove_keys(&mut self, handle: &NativeHandle) -> EngineResult<()>;

    fn get_key_request(
        &mut self,
        scope: KeyScope<'_>,
        init_data: &[u8],
        mime_type: &str,
        key_type: KeyType,
        optional_parameters: &OptionalParameters,
    ) -> EngineResult<KeyRequest>;

    /// Install a license response. Offline licenses return their keyset id.
    fn provide_key_response(
        &mut self,
        scope: KeyScope<'_>,
        response: &[u8],
    ) -> EngineResult<Option<KeySetId>>;

    /// Reload a persisted offline license into an open session.
    fn restore_keys(&mut self, handle: &NativeHandle, key_set_id: &KeySetId) -> EngineResult<()>;

    fn get_provision_request(&mut self) -> EngineResult<ProvisionRequest>;

    fn provide_provision_response(&mut self, response: &[u8]) -> EngineResult<()>;

    /// Bind a decryption context to the internal key-exchange session.
    fn create_crypto_context(&mut self, scheme: Uuid, handle: &NativeHandle) -> EngineResult<()>;

    fn property_string(&self, name: &str) -> EngineResult<String>;

    fn set_property_string(&mut self, name: &str, value: &str) -> EngineResult<()>;

    fn set_property_bytes(&mut self, name: &str, value: &[u8]) -> EngineResult<()>;

    /// Whether the engine reports per-key status through
    /// [`EngineEvent::KeyStatusChange`].
    fn reports_key_status(&self) -> bool {
        true
    }

    /// Next event raised since the last call, in order.
    fn poll_event(&mut self) -> Option<EngineEvent> {
        None
    }

    /// Release all engine resources. No other call follows.
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{EngineError, KeyRequest, RequestType};
    use crate::error::ErrorCode;

    #[test]
    fn request_type_guess_without_engine_report() {
        let mut request = KeyRequest {
            data: b"req".to_vec(),
            default_url: String::new(),
            request_type: None,
        };
        assert_eq!(request.request_type(), RequestType::Initial);

        request.default_url = "https://license.example/renew".to_string();
        assert_eq!(request.request_type(), RequestType::Renewal);

        request.request_type = Some(RequestType::Release);
        assert_eq!(request.request_type(), RequestType::Release);
    }

    #[test]
    fn engine_errors_classify() {
        assert_eq!(EngineError::NotProvisioned.code(), ErrorCode::ProvisioningRequired);
        assert_eq!(
            EngineError::DeniedByServer("no".into()).code(),
            ErrorCode::DeniedByServer
        );
        assert!(!EngineError::InvalidState("busy".into()).is_fatal());
        assert!(EngineError::Internal("boom".into()).is_fatal());
        assert!(EngineError::ResourceBusy("full".into()).is_fatal());
    }
}
