//! In-memory registry of live sessions.
//!
//! The registry is the single source of truth for which sessions exist. It
//! is keyed by [`SessionToken`] and keeps a secondary index from raw native
//! handle bytes so engine events can be routed back to their session. Every
//! mutation updates both maps in one step.

use std::collections::HashMap;

use crate::cdm::{KeyScope, KeySetId, NativeHandle};
use crate::error::{Error, Result};
use crate::session::{KeyType, SessionId, SessionInfo, SessionToken};

/// One live session.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: SessionId,
    pub info: SessionInfo,
}

impl SessionEntry {
    /// Scope for key requests/responses: the keyset for release sessions,
    /// the native session otherwise.
    #[must_use]
    pub fn key_scope(&self) -> Option<KeyScope<'_>> {
        if self.info.key_type == KeyType::Release {
            self.id.key_set_id().map(KeyScope::KeySet)
        } else {
            self.id.native_handle().map(KeyScope::Session)
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionToken, SessionEntry>,
    by_handle: HashMap<Vec<u8>, SessionToken>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn contains(&self, token: SessionToken) -> bool {
        self.sessions.contains_key(&token)
    }

    /// A token not used by any live session.
    #[must_use]
    pub fn fresh_token(&self) -> SessionToken {
        loop {
            let token = SessionToken::generate();
            if !self.sessions.contains_key(&token) {
                return token;
            }
        }
    }

    /// Register a session. Tokens and native handles must be unique.
    pub fn insert(&mut self, id: SessionId, info: SessionInfo) -> Result<()> {
        let token = id.token();
        if token.is_no_license() {
            return Err(Error::InvalidState(
                "The no-license token cannot name a session".to_string(),
            ));
        }
        if self.sessions.contains_key(&token) {
            return Err(Error::DuplicateSession(token));
        }
        if let Some(handle) = id.native_handle() {
            if self.by_handle.contains_key(handle.as_bytes()) {
                return Err(Error::InvalidState(format!(
                    "Native handle {:?} already belongs to a session",
                    handle
                )));
            }
            self.by_handle.insert(handle.as_bytes().to_vec(), token);
        }
        self.sessions.insert(token, SessionEntry { id, info });
        Ok(())
    }

    #[must_use]
    pub fn get(&self, token: SessionToken) -> Option<&SessionEntry> {
        self.sessions.get(&token)
    }

    #[must_use]
    pub fn get_by_handle(&self, handle: &[u8]) -> Option<&SessionEntry> {
        self.by_handle
            .get(handle)
            .and_then(|token| self.sessions.get(token))
    }

    /// Give a persisted-only session its freshly opened native handle.
    pub fn attach_handle(&mut self, token: SessionToken, handle: NativeHandle) -> Result<()> {
        if self.by_handle.contains_key(handle.as_bytes()) {
            return Err(Error::InvalidState(format!(
                "Native handle {:?} already belongs to a session",
                handle
            )));
        }
        let entry = self
            .sessions
            .get_mut(&token)
            .ok_or(Error::SessionNotFound(token))?;
        if entry.id.native_handle().is_some() {
            return Err(Error::InvalidState(format!(
                "Session {} is already open",
                token
            )));
        }
        self.by_handle.insert(handle.as_bytes().to_vec(), token);
        entry.id.attach_handle(handle);
        Ok(())
    }

    pub fn set_key_set_id(&mut self, token: SessionToken, key_set_id: KeySetId) -> Result<()> {
        let entry = self
            .sessions
            .get_mut(&token)
            .ok_or(Error::SessionNotFound(token))?;
        entry.id.set_key_set_id(key_set_id);
        Ok(())
    }

    pub fn clear_key_set_id(&mut self, token: SessionToken) -> Result<Option<KeySetId>> {
        let entry = self
            .sessions
            .get_mut(&token)
            .ok_or(Error::SessionNotFound(token))?;
        entry.info.revoking = None;
        Ok(entry.id.clear_key_set_id())
    }

    /// Switch an offline session to `Release`, returning the previous key
    /// type so a failed release request can be rolled back.
    pub fn mark_key_released(&mut self, token: SessionToken) -> Result<KeyType> {
        let entry = self
            .sessions
            .get_mut(&token)
            .ok_or(Error::SessionNotFound(token))?;
        let key_set_id = entry.id.key_set_id().cloned().ok_or_else(|| {
            Error::InvalidState(format!("Session {} has no persisted license", token))
        })?;
        let previous = entry.info.key_type;
        entry.info.key_type = KeyType::Release;
        entry.info.revoking = Some(key_set_id);
        Ok(previous)
    }

    pub fn set_key_type(&mut self, token: SessionToken, key_type: KeyType) -> Result<()> {
        let entry = self
            .sessions
            .get_mut(&token)
            .ok_or(Error::SessionNotFound(token))?;
        entry.info.key_type = key_type;
        if key_type != KeyType::Release {
            entry.info.revoking = None;
        }
        Ok(())
    }

    pub fn remove(&mut self, token: SessionToken) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&token)?;
        if let Some(handle) = entry.id.native_handle() {
            self.by_handle.remove(handle.as_bytes());
        }
        Some(entry)
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<SessionEntry> {
        self.by_handle.clear();
        self.sessions.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionRegistry;
    use crate::cdm::{KeyScope, KeySetId, NativeHandle};
    use crate::error::Error;
    use crate::session::{KeyType, SessionId, SessionInfo, SessionToken};

    fn open_session(registry: &mut SessionRegistry, handle: &[u8], key_type: KeyType) -> SessionToken {
        let token = registry.fresh_token();
        registry
            .insert(
                SessionId::open(token, NativeHandle::new(handle.to_vec())),
                SessionInfo::new("video/mp4", key_type),
            )
            .expect("insert session");
        token
    }

    #[test]
    fn lookup_by_token_and_handle() {
        let mut registry = SessionRegistry::new();
        let token = open_session(&mut registry, b"h1", KeyType::Streaming);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(token).expect("by token").id.token(), token);
        assert_eq!(
            registry.get_by_handle(b"h1").expect("by handle").id.token(),
            token
        );
        assert!(registry.get_by_handle(b"h2").is_none());
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let mut registry = SessionRegistry::new();
        let token = open_session(&mut registry, b"h1", KeyType::Streaming);

        let err = registry
            .insert(
                SessionId::open(token, NativeHandle::new(b"h2".to_vec())),
                SessionInfo::new("video/mp4", KeyType::Streaming),
            )
            .expect_err("duplicate token");
        assert!(matches!(err, Error::DuplicateSession(t) if t == token));
        assert!(registry.get_by_handle(b"h2").is_none());
    }

    #[test]
    fn duplicate_handle_is_rejected() {
        let mut registry = SessionRegistry::new();
        open_session(&mut registry, b"h1", KeyType::Streaming);
        let err = registry
            .insert(
                SessionId::open(SessionToken::generate(), NativeHandle::new(b"h1".to_vec())),
                SessionInfo::new("video/mp4", KeyType::Streaming),
            )
            .expect_err("duplicate handle");
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn sentinel_token_cannot_be_registered() {
        let mut registry = SessionRegistry::new();
        let result = registry.insert(
            SessionId::open(SessionToken::no_license(), NativeHandle::new(b"h".to_vec())),
            SessionInfo::new("video/mp4", KeyType::Streaming),
        );
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn persisted_session_gets_handle_attached() {
        let mut registry = SessionRegistry::new();
        let token = SessionToken::generate();
        registry
            .insert(
                SessionId::persisted(token, KeySetId::new(b"ks".to_vec())),
                SessionInfo::new("video/webm", KeyType::Offline),
            )
            .expect("insert persisted");
        assert!(registry.get_by_handle(b"h9").is_none());

        registry
            .attach_handle(token, NativeHandle::new(b"h9".to_vec()))
            .expect("attach");
        assert_eq!(registry.get_by_handle(b"h9").expect("indexed").id.token(), token);

        let again = registry.attach_handle(token, NativeHandle::new(b"h10".to_vec()));
        assert!(again.is_err());
    }

    #[test]
    fn release_marking_switches_scope_to_keyset() {
        let mut registry = SessionRegistry::new();
        let token = open_session(&mut registry, b"h1", KeyType::Offline);

        assert!(registry.mark_key_released(token).is_err());

        registry
            .set_key_set_id(token, KeySetId::new(b"ks-1".to_vec()))
            .expect("set keyset");
        let previous = registry.mark_key_released(token).expect("mark released");
        assert_eq!(previous, KeyType::Offline);

        let entry = registry.get(token).expect("entry");
        assert_eq!(entry.info.key_type, KeyType::Release);
        assert_eq!(entry.info.revoking, Some(KeySetId::new(b"ks-1".to_vec())));
        assert!(matches!(entry.key_scope(), Some(KeyScope::KeySet(k)) if k.as_bytes() == b"ks-1"));

        registry.set_key_type(token, previous).expect("roll back");
        let entry = registry.get(token).expect("entry");
        assert!(entry.info.revoking.is_none());
        assert!(matches!(entry.key_scope(), Some(KeyScope::Session(_))));
    }

    #[test]
    fn remove_drops_handle_index() {
        let mut registry = SessionRegistry::new();
        let token = open_session(&mut registry, b"h1", KeyType::Streaming);

        let entry = registry.remove(token).expect("removed");
        assert_eq!(entry.id.token(), token);
        assert!(registry.get_by_handle(b"h1").is_none());
        assert!(registry.remove(token).is_none());
    }

    #[test]
    fn drain_empties_everything() {
        let mut registry = SessionRegistry::new();
        open_session(&mut registry, b"h1", KeyType::Streaming);
        open_session(&mut registry, b"h2", KeyType::Offline);

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.get_by_handle(b"h1").is_none());
    }
}
