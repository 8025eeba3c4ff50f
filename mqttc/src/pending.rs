//! Pending-acknowledgement queue.
//!
//! Correlates replies from the broker with the request that is waiting for
//! them, keyed by the expected packet type and packet identifier. Each entry
//! holds a continuation that fires at most once.

use std::collections::HashMap;

use crate::protocol::{Packet, PacketType};

/// Continuations keyed by (expected packet type, packet id).
pub struct PendingQueue<C> {
    entries: HashMap<(PacketType, u16), C>,
}

impl<C> Default for PendingQueue<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C> PendingQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a continuation for the reply `(kind, pkid)`.
    ///
    /// Returns the continuation it replaced, if any.
    pub fn expect(&mut self, kind: PacketType, pkid: u16, continuation: C) -> Option<C> {
        self.entries.insert((kind, pkid), continuation)
    }

    /// Removes the continuation waiting for `packet`.
    ///
    /// Types that are never queued (PINGRESP, DISCONNECT, PUBLISH, ...)
    /// always return `None`.
    pub fn take(&mut self, packet: &Packet) -> Option<C> {
        let kind = packet.packet_type();
        if !kind.requires_ack_match() {
            return None;
        }
        self.entries.remove(&(kind, packet.packet_id()))
    }

    /// Removes the continuation registered for `(kind, pkid)`.
    pub fn cancel(&mut self, kind: PacketType, pkid: u16) -> Option<C> {
        self.entries.remove(&(kind, pkid))
    }

    /// Drops every entry, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, ConnectReturnCode};

    #[test]
    fn test_take_missing() {
        let mut queue: PendingQueue<u32> = PendingQueue::new();
        assert!(queue.take(&Packet::PubAck(1)).is_none());

        queue.expect(PacketType::PubAck, 1, 7);
        assert!(queue.take(&Packet::PubAck(2)).is_none());
        assert!(queue.take(&Packet::PubComp(1)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_take_once() {
        let mut queue = PendingQueue::new();
        queue.expect(PacketType::SubAck, 3, "suback");

        let suback = Packet::SubAck(crate::protocol::SubAck {
            pkid: 3,
            code: crate::protocol::SubscribeReturnCode::Failure,
        });
        assert_eq!(queue.take(&suback), Some("suback"));
        assert_eq!(queue.take(&suback), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_connack_uses_id_zero() {
        let mut queue = PendingQueue::new();
        queue.expect(PacketType::ConnAck, 0, ());
        let connack = Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        });
        assert!(queue.take(&connack).is_some());
    }

    #[test]
    fn test_unqueued_types_never_match() {
        let mut queue = PendingQueue::new();
        queue.expect(PacketType::PingResp, 0, ());
        queue.expect(PacketType::Disconnect, 0, ());
        assert!(queue.take(&Packet::PingResp).is_none());
        assert!(queue.take(&Packet::Disconnect).is_none());
    }

    #[test]
    fn test_expect_replaces() {
        let mut queue = PendingQueue::new();
        assert_eq!(queue.expect(PacketType::PubRel, 5, 1), None);
        assert_eq!(queue.expect(PacketType::PubRel, 5, 2), Some(1));
        assert_eq!(queue.take(&Packet::PubRel(5)), Some(2));
    }

    #[test]
    fn test_clear_and_cancel() {
        let mut queue = PendingQueue::new();
        queue.expect(PacketType::PubAck, 1, ());
        queue.expect(PacketType::PubRec, 2, ());
        queue.expect(PacketType::UnsubAck, 3, ());

        assert!(queue.cancel(PacketType::PubRec, 2).is_some());
        assert!(queue.cancel(PacketType::PubRec, 2).is_none());
        assert_eq!(queue.clear(), 2);
        assert!(queue.take(&Packet::PubAck(1)).is_none());
    }
}
