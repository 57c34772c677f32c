//! Prioritized network output queue
//!
//! The network layer inserts packets by priority; the engine pulls them per
//! access category. Requeued packets keep their original timestamp, retry
//! count and sequence number so a transmit-opportunity rollback does not
//! reset their history.

use std::collections::VecDeque;

use crate::addr::NetworkAddress;
use crate::seq::SequenceNumber;
use crate::time::SimTime;
use crate::wire::FrameBuffer;

/// One queued packet together with its delivery metadata
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub payload: FrameBuffer,
    pub next_hop_address: NetworkAddress,
    pub ether_type: u16,
    pub queued_at: SimTime,
    pub retry_count: u32,
    pub sequence_number: SequenceNumber,
    pub is_a_requeue: bool,
}

impl QueuedPacket {
    /// Time the packet has spent queued
    pub fn age(&self, now: SimTime) -> SimTime {
        now.saturating_sub(self.queued_at)
    }
}

/// Result of an insert against the subqueue limits
#[derive(Debug)]
#[must_use]
pub enum EnqueueOutcome {
    Accepted,
    RejectedMaxPackets(FrameBuffer),
    RejectedMaxBytes(FrameBuffer),
}

impl EnqueueOutcome {
    pub fn was_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Default)]
struct Subqueue {
    packets: VecDeque<QueuedPacket>,
    current_bytes: u64,
}

/// FIFO output queue with one subqueue per packet priority
#[derive(Debug)]
pub struct NetworkOutputQueue {
    subqueues: Vec<Subqueue>,
    total_packets: usize,
    total_bytes: u64,
    max_packets_per_subqueue: usize,
    max_bytes_per_subqueue: u64,
}

impl NetworkOutputQueue {
    /// Queue covering priorities `0..=max_priority` with no size limits
    pub fn new(max_priority: u8) -> Self {
        Self {
            subqueues: (0..=max_priority).map(|_| Subqueue::default()).collect(),
            total_packets: 0,
            total_bytes: 0,
            max_packets_per_subqueue: 0,
            max_bytes_per_subqueue: 0,
        }
    }

    /// Apply per-subqueue limits; zero leaves a dimension unlimited
    pub fn with_limits(mut self, max_packets: usize, max_bytes: u64) -> Self {
        self.max_packets_per_subqueue = max_packets;
        self.max_bytes_per_subqueue = max_bytes;
        self
    }

    pub fn max_priority(&self) -> u8 {
        (self.subqueues.len() - 1) as u8
    }

    pub fn is_empty(&self) -> bool {
        self.total_packets == 0
    }

    pub fn number_packets(&self) -> usize {
        self.total_packets
    }

    pub fn number_packet_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn has_packet_with_priority(&self, priority: u8) -> bool {
        match self.subqueues.get(priority as usize) {
            Some(subqueue) => !subqueue.packets.is_empty(),
            None => false,
        }
    }

    pub fn number_packets_with_priority(&self, priority: u8) -> usize {
        match self.subqueues.get(priority as usize) {
            Some(subqueue) => subqueue.packets.len(),
            None => 0,
        }
    }

    /// Payload size of the next packet at this priority
    pub fn top_packet_size(&self, priority: u8) -> Option<usize> {
        self.subqueues
            .get(priority as usize)
            .and_then(|subqueue| subqueue.packets.front())
            .map(|packet| packet.payload.len())
    }

    /// Next hop of the next packet at this priority
    pub fn next_hop_for_top_packet(&self, priority: u8) -> Option<NetworkAddress> {
        self.subqueues
            .get(priority as usize)
            .and_then(|subqueue| subqueue.packets.front())
            .map(|packet| packet.next_hop_address)
    }

    /// Whether the next packet at this priority has been transmitted before
    pub fn next_packet_is_a_retry(&self, priority: u8) -> bool {
        self.subqueues
            .get(priority as usize)
            .and_then(|subqueue| subqueue.packets.front())
            .map_or(false, |packet| packet.retry_count > 0)
    }

    /// Insert a fresh packet from the network layer, subject to the
    /// subqueue limits.
    pub fn insert(
        &mut self,
        payload: FrameBuffer,
        next_hop_address: NetworkAddress,
        priority: u8,
        ether_type: u16,
        now: SimTime,
    ) -> EnqueueOutcome {
        debug_assert!((priority as usize) < self.subqueues.len());
        let max_packets = self.max_packets_per_subqueue;
        let max_bytes = self.max_bytes_per_subqueue;
        let subqueue = &mut self.subqueues[priority as usize];

        if max_packets != 0 && subqueue.packets.len() >= max_packets {
            return EnqueueOutcome::RejectedMaxPackets(payload);
        }
        if max_bytes != 0 && subqueue.current_bytes + payload.len() as u64 > max_bytes {
            return EnqueueOutcome::RejectedMaxBytes(payload);
        }

        let length = payload.len() as u64;
        subqueue.packets.push_back(QueuedPacket {
            payload,
            next_hop_address,
            ether_type,
            queued_at: now,
            retry_count: 0,
            sequence_number: 0,
            is_a_requeue: false,
        });
        subqueue.current_bytes += length;
        self.total_packets += 1;
        self.total_bytes += length;

        EnqueueOutcome::Accepted
    }

    /// Put a previously dequeued packet back at the front of its subqueue.
    /// Limits do not apply; the packet was already admitted once.
    pub fn requeue_at_front(&mut self, mut packet: QueuedPacket, priority: u8) {
        debug_assert!((priority as usize) < self.subqueues.len());
        packet.is_a_requeue = true;

        let length = packet.payload.len() as u64;
        let subqueue = &mut self.subqueues[priority as usize];
        subqueue.packets.push_front(packet);
        subqueue.current_bytes += length;
        self.total_packets += 1;
        self.total_bytes += length;
    }

    /// Remove and return the next packet at this priority
    pub fn dequeue_with_priority(&mut self, priority: u8) -> Option<QueuedPacket> {
        let subqueue = self.subqueues.get_mut(priority as usize)?;
        let packet = subqueue.packets.pop_front()?;

        let length = packet.payload.len() as u64;
        subqueue.current_bytes -= length;
        self.total_packets -= 1;
        self.total_bytes -= length;

        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(length: usize) -> FrameBuffer {
        FrameBuffer::from_payload(&vec![0xABu8; length])
    }

    #[test]
    fn test_fifo_order_within_priority() {
        let mut queue = NetworkOutputQueue::new(7);
        let hop = NetworkAddress::new(42);

        for length in [10usize, 20, 30] {
            let outcome = queue.insert(payload(length), hop, 3, 0x0800, 1000);
            assert!(outcome.was_accepted());
        }

        assert!(queue.has_packet_with_priority(3));
        assert!(!queue.has_packet_with_priority(2));
        assert_eq!(queue.number_packets(), 3);
        assert_eq!(queue.top_packet_size(3), Some(10));

        let first = queue.dequeue_with_priority(3).unwrap();
        assert_eq!(first.payload.len(), 10);
        assert_eq!(first.next_hop_address, hop);
        assert_eq!(first.ether_type, 0x0800);
        assert!(!first.is_a_requeue);
        assert_eq!(first.retry_count, 0);

        let second = queue.dequeue_with_priority(3).unwrap();
        assert_eq!(second.payload.len(), 20);

        assert_eq!(queue.number_packets(), 1);
        assert_eq!(queue.number_packet_bytes(), 30);
    }

    #[test]
    fn test_empty_priority_dequeues_nothing() {
        let mut queue = NetworkOutputQueue::new(7);
        assert!(queue.dequeue_with_priority(0).is_none());
        assert_eq!(queue.top_packet_size(0), None);
        assert_eq!(queue.next_hop_for_top_packet(0), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_max_packet_limit() {
        let mut queue = NetworkOutputQueue::new(1).with_limits(2, 0);
        let hop = NetworkAddress::new(1);

        assert!(queue.insert(payload(5), hop, 0, 0, 0).was_accepted());
        assert!(queue.insert(payload(5), hop, 0, 0, 0).was_accepted());

        match queue.insert(payload(5), hop, 0, 0, 0) {
            EnqueueOutcome::RejectedMaxPackets(dropped) => assert_eq!(dropped.len(), 5),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The other subqueue has its own budget.
        assert!(queue.insert(payload(5), hop, 1, 0, 0).was_accepted());
    }

    #[test]
    fn test_max_byte_limit() {
        let mut queue = NetworkOutputQueue::new(0).with_limits(0, 100);
        let hop = NetworkAddress::new(1);

        assert!(queue.insert(payload(60), hop, 0, 0, 0).was_accepted());

        match queue.insert(payload(50), hop, 0, 0, 0) {
            EnqueueOutcome::RejectedMaxBytes(dropped) => assert_eq!(dropped.len(), 50),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(queue.insert(payload(40), hop, 0, 0, 0).was_accepted());
        assert_eq!(queue.number_packet_bytes(), 100);
    }

    #[test]
    fn test_requeue_at_front_preserves_history() {
        let mut queue = NetworkOutputQueue::new(3);
        let hop = NetworkAddress::new(9);

        let outcome = queue.insert(payload(10), hop, 2, 0x0800, 500);
        assert!(outcome.was_accepted());
        let outcome = queue.insert(payload(20), hop, 2, 0x0800, 600);
        assert!(outcome.was_accepted());

        let mut packet = queue.dequeue_with_priority(2).unwrap();
        packet.retry_count = 3;
        packet.sequence_number = 77;
        queue.requeue_at_front(packet, 2);

        assert!(queue.next_packet_is_a_retry(2));
        assert_eq!(queue.top_packet_size(2), Some(10));

        let front = queue.dequeue_with_priority(2).unwrap();
        assert!(front.is_a_requeue);
        assert_eq!(front.retry_count, 3);
        assert_eq!(front.sequence_number, 77);
        assert_eq!(front.queued_at, 500);

        // The untouched packet still follows in order.
        let next = queue.dequeue_with_priority(2).unwrap();
        assert!(!next.is_a_requeue);
        assert_eq!(next.queued_at, 600);
    }

    #[test]
    fn test_requeue_ignores_limits() {
        let mut queue = NetworkOutputQueue::new(0).with_limits(1, 0);
        let hop = NetworkAddress::new(1);

        assert!(queue.insert(payload(5), hop, 0, 0, 0).was_accepted());
        let packet = queue.dequeue_with_priority(0).unwrap();
        assert!(queue.insert(payload(5), hop, 0, 0, 0).was_accepted());

        queue.requeue_at_front(packet, 0);
        assert_eq!(queue.number_packets_with_priority(0), 2);
    }

    #[test]
    fn test_packet_age() {
        let mut queue = NetworkOutputQueue::new(0);
        let outcome = queue.insert(payload(5), NetworkAddress::new(1), 0, 0, 1_000);
        assert!(outcome.was_accepted());

        let packet = queue.dequeue_with_priority(0).unwrap();
        assert_eq!(packet.age(1_500), 500);
        assert_eq!(packet.age(900), 0);
    }
}
