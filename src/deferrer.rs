//! Buffering of engine events for a session whose promise is unresolved.
//!
//! Restoring an offline license makes the engine report key status before the
//! load promise has resolved, so the caller would hear about a session it does
//! not know yet. While an [`EventDeferrer`] is bound to that session's native
//! handle, its events are held back and replayed in arrival order once the
//! promise has resolved.

use std::fmt;

use crate::cdm::NativeHandle;
use crate::utils::to_hex;

pub struct EventDeferrer<T> {
    session: Vec<u8>,
    buffered: Vec<T>,
}

impl<T> EventDeferrer<T> {
    /// Bind to one session's native handle.
    #[must_use]
    pub fn bind(handle: &NativeHandle) -> Self {
        Self {
            session: handle.as_bytes().to_vec(),
            buffered: Vec::new(),
        }
    }

    #[must_use]
    pub fn should_defer(&self, session: &[u8]) -> bool {
        self.session == session
    }

    pub fn defer(&mut self, event: T) {
        self.buffered.push(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Hand back buffered events in arrival order. Consumes the deferrer, so
    /// nothing can be buffered for this binding afterwards.
    pub fn release(self) -> impl Iterator<Item = T> {
        self.buffered.into_iter()
    }
}

impl<T> fmt::Debug for EventDeferrer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDeferrer")
            .field("session", &to_hex(&self.session))
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::EventDeferrer;
    use crate::cdm::NativeHandle;

    #[test]
    fn only_bound_session_is_deferred() {
        let deferrer: EventDeferrer<u32> = EventDeferrer::bind(&NativeHandle::new(b"s1".to_vec()));
        assert!(deferrer.should_defer(b"s1"));
        assert!(!deferrer.should_defer(b"s2"));
    }

    #[test]
    fn release_replays_in_arrival_order() {
        let mut deferrer = EventDeferrer::bind(&NativeHandle::new(b"s1".to_vec()));
        deferrer.defer("keys-change");
        deferrer.defer("expiration");
        deferrer.defer("keys-change-2");
        assert_eq!(deferrer.len(), 3);

        let replayed: Vec<_> = deferrer.release().collect();
        assert_eq!(replayed, vec!["keys-change", "expiration", "keys-change-2"]);
    }

    #[test]
    fn empty_release_yields_nothing() {
        let deferrer: EventDeferrer<()> = EventDeferrer::bind(&NativeHandle::new(b"s1".to_vec()));
        assert!(deferrer.is_empty());
        assert_eq!(deferrer.release().count(), 0);
    }
}
