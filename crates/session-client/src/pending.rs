//! Queue of remote tracks announced before the receive path was ready.
//!
//! Entries are drained exactly once, in arrival order, when the receive
//! transport becomes available. Duplicates are kept; consuming the same
//! producer twice is filtered by the negotiator.

use common::types::{ParticipantId, ProducerId};
use signaling_protocol::{MediaKind, PublicationInfo};
use std::collections::VecDeque;

/// A remote track waiting for the receive transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrack {
    pub producer_id: ProducerId,
    pub producer_owner_identity: ParticipantId,
    pub kind: MediaKind,
}

impl From<PublicationInfo> for PendingTrack {
    fn from(info: PublicationInfo) -> Self {
        Self {
            producer_id: info.producer_id,
            producer_owner_identity: info.producer_owner_identity,
            kind: info.kind,
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingTracks {
    queue: VecDeque<PendingTrack>,
}

impl PendingTracks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, track: PendingTrack) {
        self.queue.push_back(track);
    }

    /// Take every queued track, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<PendingTrack> {
        self.queue.drain(..).collect()
    }

    /// Drop queued entries for a producer that closed before it was consumed.
    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|t| &t.producer_id != producer_id);
        before - self.queue.len()
    }

    /// Drop queued entries owned by a participant that left.
    pub fn remove_owner(&mut self, owner: &ParticipantId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|t| &t.producer_owner_identity != owner);
        before - self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
