//! Buffers for negotiation input that arrives ahead of the session.
//!
//! Remote candidates may arrive before the remote description is applied,
//! and the caller's offer may arrive before the callee has a media session.
//! Both are held here and released exactly once.

use log::{debug, warn};

use crate::types::{IceCandidate, SessionDescription};

/// Remote candidates received before the remote description was applied.
#[derive(Debug, Default)]
pub struct PendingIceQueue {
    pending: Vec<IceCandidate>,
    flushed: bool,
}

impl PendingIceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate. After the queue has been flushed the candidate is
    /// handed back so the caller applies it immediately.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.flushed {
            return Some(candidate);
        }
        self.pending.push(candidate);
        debug!("Queued remote ICE candidate ({} pending)", self.pending.len());
        None
    }

    /// Take every queued candidate in receipt order. Only the first call
    /// returns anything; the queue stays flushed until `reset`.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything and start over for the next call.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.flushed = false;
    }
}

/// Single-slot buffer for a remote offer that arrived before the local
/// media session existed. A newer offer replaces an older one.
#[derive(Debug, Default)]
pub struct PendingOffer {
    slot: Option<SessionDescription>,
}

impl PendingOffer {
    pub fn store(&mut self, offer: SessionDescription) {
        if self.slot.replace(offer).is_some() {
            warn!("Replacing buffered remote offer with a newer one");
        }
    }

    pub fn take(&mut self) -> Option<SessionDescription> {
        self.slot.take()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 UDP 2130706431 10.0.0.{n} 9 typ host"))
    }

    #[test]
    fn test_flush_preserves_receipt_order() {
        let mut queue = PendingIceQueue::new();
        for n in 1..=4 {
            assert!(queue.push(candidate(n)).is_none());
        }
        assert_eq!(queue.len(), 4);

        let flushed = queue.flush();
        assert_eq!(flushed, (1..=4).map(candidate).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_happens_once() {
        let mut queue = PendingIceQueue::new();
        queue.push(candidate(1));
        assert_eq!(queue.flush().len(), 1);
        assert!(queue.flush().is_empty());

        // Late candidates bypass the queue.
        assert_eq!(queue.push(candidate(2)), Some(candidate(2)));
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_reset_rearms_queue() {
        let mut queue = PendingIceQueue::new();
        queue.push(candidate(1));
        queue.flush();
        queue.reset();
        assert!(!queue.is_flushed());
        assert!(queue.push(candidate(2)).is_none());
    }

    #[test]
    fn test_pending_offer_keeps_most_recent() {
        let mut offer = PendingOffer::default();
        offer.store(SessionDescription::offer("first"));
        offer.store(SessionDescription::offer("second"));
        assert_eq!(offer.take().unwrap().sdp, "second");
        assert!(offer.take().is_none());
    }
}
