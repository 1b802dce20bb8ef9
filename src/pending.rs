//! Create-session requests parked while provisioning is in flight.

use std::collections::VecDeque;

use crate::cdm::OptionalParameters;
use crate::client::PromiseId;
use crate::session::KeyType;

/// Arguments of a deferred create-session call, captured verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreateSessionData {
    pub init_data: Vec<u8>,
    pub mime_type: String,
    /// Only `Streaming` and `Offline` are accepted by create-session.
    pub key_type: KeyType,
    pub optional_parameters: OptionalParameters,
    pub promise_id: PromiseId,
}

/// Strict FIFO of deferred create-session calls.
///
/// Entries that have to be parked again while the queue is being drained go
/// back to the front so the original issue order is never changed.
#[derive(Debug, Default)]
pub struct PendingOperationQueue {
    queue: VecDeque<PendingCreateSessionData>,
}

impl PendingOperationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a new call behind everything already waiting.
    pub fn enqueue(&mut self, data: PendingCreateSessionData) {
        self.queue.push_back(data);
    }

    /// Put back an entry that was just taken with [`Self::next`].
    pub fn requeue_front(&mut self, data: PendingCreateSessionData) {
        self.queue.push_front(data);
    }

    pub fn next(&mut self) -> Option<PendingCreateSessionData> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Promise ids in queue order.
    pub fn promise_ids(&self) -> impl Iterator<Item = PromiseId> + '_ {
        self.queue.iter().map(|data| data.promise_id)
    }

    /// Take every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingCreateSessionData> + '_ {
        self.queue.drain(..)
    }
}
