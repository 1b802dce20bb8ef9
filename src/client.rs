//! Caller-facing notifications.
//!
//! Every promise resolution and every session event leaves the manager as a
//! [`ClientEvent`] handed to the host's [`Client`].

use std::fmt;
use std::sync::mpsc;

use crate::cdm::RequestType;
use crate::error::Rejection;
use crate::key::KeyStatus;
use crate::session::SessionToken;

/// Caller-chosen id of one pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

impl From<u64> for PromiseId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Whether a crypto context could be created. Reported once.
    CryptoContextReady { available: bool },
    /// Forward `request` to the provisioning server at `url`.
    StartProvisioning { url: String, request: Vec<u8> },
    PromiseResolved { promise_id: PromiseId },
    PromiseResolvedWithSession {
        promise_id: PromiseId,
        token: SessionToken,
    },
    PromiseRejected {
        promise_id: PromiseId,
        rejection: Rejection,
    },
    /// License request bytes to send to the license server.
    Message {
        token: SessionToken,
        request_type: RequestType,
        message: Vec<u8>,
    },
    KeysChange {
        token: SessionToken,
        keys: Vec<KeyStatus>,
        has_new_usable_key: bool,
        /// The session is revoking an offline license.
        is_release: bool,
    },
    ExpirationUpdate {
        token: SessionToken,
        /// Milliseconds since the Unix epoch; 0 means no expiration.
        expiration_ms: i64,
    },
    Closed { token: SessionToken },
    ResetDeviceCredentialsCompleted { success: bool },
    /// The manager tore itself down and accepts no further calls.
    ManagerReleased { fatal: bool, detail: String },
}

impl ClientEvent {
    /// Session the event concerns, if any.
    #[must_use]
    pub fn token(&self) -> Option<SessionToken> {
        match self {
            ClientEvent::PromiseResolvedWithSession { token, .. }
            | ClientEvent::Message { token, .. }
            | ClientEvent::KeysChange { token, .. }
            | ClientEvent::ExpirationUpdate { token, .. }
            | ClientEvent::Closed { token } => Some(*token),
            _ => None,
        }
    }

    /// Promise the event settles, if any.
    #[must_use]
    pub fn promise_id(&self) -> Option<PromiseId> {
        match self {
            ClientEvent::PromiseResolved { promise_id }
            | ClientEvent::PromiseResolvedWithSession { promise_id, .. }
            | ClientEvent::PromiseRejected { promise_id, .. } => Some(*promise_id),
            _ => None,
        }
    }
}

/// Sink for manager output.
pub trait Client {
    fn notify(&mut self, event: ClientEvent);
}

/// Collects events in order.
impl Client for Vec<ClientEvent> {
    fn notify(&mut self, event: ClientEvent) {
        self.push(event);
    }
}

/// Forwards events to another thread. Events are dropped once the receiver
/// is gone.
impl Client for mpsc::Sender<ClientEvent> {
    fn notify(&mut self, event: ClientEvent) {
        if self.send(event).is_err() {
            log!(warn, "Client event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::{Client, ClientEvent, PromiseId};
    use crate::session::SessionToken;

    #[test]
    fn vec_client_keeps_order() {
        let mut events: Vec<ClientEvent> = Vec::new();
        let token = SessionToken::generate();
        events.notify(ClientEvent::PromiseResolved {
            promise_id: PromiseId(1),
        });
        events.notify(ClientEvent::Closed { token });

        assert_eq!(events[0].promise_id(), Some(PromiseId(1)));
        assert_eq!(events[1].token(), Some(token));
        assert_eq!(events[1].promise_id(), None);
    }

    #[test]
    fn channel_client_forwards_and_tolerates_hangup() {
        let (mut tx, rx) = mpsc::channel();
        tx.notify(ClientEvent::CryptoContextReady { available: true });
        assert_eq!(
            rx.recv().expect("event"),
            ClientEvent::CryptoContextReady { available: true }
        );

        drop(rx);
        tx.notify(ClientEvent::CryptoContextReady { available: false });
    }

    #[test]
    fn promise_id_display() {
        assert_eq!(PromiseId::from(42).to_string(), "#42");
    }
}
