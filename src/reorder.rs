//! Incoming frame reorder buffer
//!
//! Receive-side state per (source, TID) link. Without a Block-Ack session
//! the buffer only deduplicates; with one it holds out-of-order frames in an
//! ordered map and releases them the moment the gap below them closes. The
//! first Block-Ack Request on a link doubles as session establishment, so
//! there is no separate ADDBA exchange.
//!
//! Internally each link tracks sequence numbers on a non-wrapping 64-bit
//! number line. Wire numbers are mapped onto it relative to the current
//! window, which keeps every comparison a plain integer comparison.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::addr::MacAddress;
use crate::frame::BLOCK_ACK_BITMAP_BITS;
use crate::seq::{
    circular_difference, to_non_wrapping_sequence_number, to_wire_sequence_number, SequenceNumber,
};
use crate::wire::FrameBuffer;

const WINDOW_BITS: u64 = BLOCK_ACK_BITMAP_BITS as u64;

/// A reordered data frame waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFrame {
    pub payload: FrameBuffer,
    pub ether_type: u16,
}

/// Outcome of feeding one data frame to the buffer.
///
/// `frames_to_deliver` is ascending and starts with the arriving frame when
/// it was in order. An out-of-order frame is held internally and the vector
/// stays empty until something closes the gap.
#[derive(Debug, Default)]
pub struct FrameArrival {
    pub is_in_order: bool,
    pub is_duplicate: bool,
    pub frames_to_deliver: Vec<BufferedFrame>,
}

/// Outcome of a sequence-bearing frame that carries no payload
#[derive(Debug, Default)]
pub struct NonDataArrival {
    pub is_duplicate: bool,
    pub frames_to_deliver: Vec<BufferedFrame>,
}

struct LinkState {
    session_is_active: bool,
    lowest_unreceived: u64,
    window_start: u64,
    bitmap: u64,
    buffered: BTreeMap<u64, BufferedFrame>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            session_is_active: false,
            lowest_unreceived: 1,
            window_start: 1,
            bitmap: 0,
            buffered: BTreeMap::new(),
        }
    }
}

fn shift_bitmap_down(bitmap: u64, count: u64) -> u64 {
    if count >= WINDOW_BITS {
        0
    } else {
        bitmap >> count
    }
}

/// Receive-side reorder and deduplication state for all links
#[derive(Default)]
pub struct IncomingFrameBuffer {
    links: HashMap<(MacAddress, u8), LinkState>,
}

impl IncomingFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a received data frame carrying a payload.
    pub fn process_incoming_frame(
        &mut self,
        source: MacAddress,
        traffic_id: u8,
        sequence_number: SequenceNumber,
        frame: BufferedFrame,
    ) -> FrameArrival {
        let link = self.links.entry((source, traffic_id)).or_default();

        if !link.session_is_active {
            // Plain ACK mode, nothing is buffered.
            let difference = circular_difference(
                sequence_number,
                to_wire_sequence_number(link.lowest_unreceived),
            );

            if difference < 0 {
                return FrameArrival {
                    is_duplicate: true,
                    ..FrameArrival::default()
                };
            }

            link.lowest_unreceived += 1 + difference as u64;
            return FrameArrival {
                is_in_order: true,
                frames_to_deliver: vec![frame],
                ..FrameArrival::default()
            };
        }

        Self::session_arrival(link, sequence_number, frame)
    }

    /// Feed one subframe extracted from an aggregate. Aggregates require a
    /// session; a sender always opens one with a Block-Ack Request first,
    /// but a lost BAR is survivable by opening the session here.
    pub fn process_incoming_subframe(
        &mut self,
        source: MacAddress,
        traffic_id: u8,
        sequence_number: SequenceNumber,
        frame: BufferedFrame,
    ) -> FrameArrival {
        let link = self.links.entry((source, traffic_id)).or_default();

        if !link.session_is_active {
            warn!(
                "Aggregate subframe from {} tid {} without a session, establishing one",
                source, traffic_id
            );
            link.session_is_active = true;
            link.window_start = link.lowest_unreceived;
        }

        Self::session_arrival(link, sequence_number, frame)
    }

    /// Feed a sequence-bearing frame with no payload to deliver (QoS-Null
    /// and sequenced management frames). Only duplicate detection and
    /// window bookkeeping happen; filling a gap can still release buffered
    /// data frames behind it.
    pub fn process_incoming_non_data_frame(
        &mut self,
        source: MacAddress,
        traffic_id: u8,
        sequence_number: SequenceNumber,
    ) -> NonDataArrival {
        let link = self.links.entry((source, traffic_id)).or_default();

        if !link.session_is_active {
            let difference = circular_difference(
                sequence_number,
                to_wire_sequence_number(link.lowest_unreceived),
            );

            if difference < 0 {
                return NonDataArrival {
                    is_duplicate: true,
                    ..NonDataArrival::default()
                };
            }

            link.lowest_unreceived += 1 + difference as u64;
            return NonDataArrival::default();
        }

        let logical = to_non_wrapping_sequence_number(
            link.window_start + WINDOW_BITS,
            sequence_number,
        );
        let (_, is_duplicate, frames_to_deliver) =
            Self::update_received_frame_bitmap(link, logical);

        NonDataArrival {
            is_duplicate,
            frames_to_deliver,
        }
    }

    /// Handle a Block-Ack Request. The first one on a link establishes the
    /// session with its starting sequence number as the window start. Later
    /// ones advance the window: buffered frames left below the new start are
    /// flushed upward (their predecessors are lost for good), then frames
    /// made consecutive by the jump follow.
    pub fn process_block_ack_request(
        &mut self,
        source: MacAddress,
        traffic_id: u8,
        starting_sequence_number: SequenceNumber,
    ) -> Vec<BufferedFrame> {
        let link = self.links.entry((source, traffic_id)).or_default();
        let mut released = Vec::new();

        let start = if !link.session_is_active {
            let start = u64::from(starting_sequence_number);
            link.session_is_active = true;
            link.window_start = start;
            link.lowest_unreceived = start;
            start
        } else {
            to_non_wrapping_sequence_number(
                link.window_start + WINDOW_BITS,
                starting_sequence_number,
            )
        };

        if link.window_start == start {
            return released;
        }
        if start < link.window_start {
            debug!(
                "Stale Block-Ack Request start {} behind window start {}",
                start, link.window_start
            );
            return released;
        }

        let shift_count = start - link.window_start;
        link.window_start = start;
        link.bitmap = shift_bitmap_down(link.bitmap, shift_count);

        if link.lowest_unreceived < start {
            // Flush frames stranded below the new start.
            while link.buffered.first_key_value().map_or(false, |(&s, _)| s < start) {
                if let Some((_, frame)) = link.buffered.pop_first() {
                    released.push(frame);
                }
            }
            link.lowest_unreceived = start;

            // The jump may have made buffered frames consecutive.
            let mut i = 0u64;
            while i < WINDOW_BITS && (link.bitmap >> i) & 1 != 0 {
                if let Some(frame) = link.buffered.remove(&link.lowest_unreceived) {
                    released.push(frame);
                }
                link.lowest_unreceived += 1;
                i += 1;
            }
        }

        released
    }

    /// Window start and bitmap for an outgoing Block-Ack response. `None`
    /// until the link has seen any traffic.
    pub fn block_ack_info(&self, source: MacAddress, traffic_id: u8) -> Option<(SequenceNumber, u64)> {
        let link = self.links.get(&(source, traffic_id))?;
        Some((to_wire_sequence_number(link.window_start), link.bitmap))
    }

    fn session_arrival(
        link: &mut LinkState,
        sequence_number: SequenceNumber,
        frame: BufferedFrame,
    ) -> FrameArrival {
        let logical = to_non_wrapping_sequence_number(
            link.window_start + WINDOW_BITS,
            sequence_number,
        );

        let (is_in_order, is_duplicate, released) =
            Self::update_received_frame_bitmap(link, logical);

        let mut arrival = FrameArrival {
            is_in_order,
            is_duplicate,
            frames_to_deliver: Vec::new(),
        };

        if is_in_order {
            arrival.frames_to_deliver.push(frame);
            arrival.frames_to_deliver.extend(released);
        } else if !is_duplicate {
            link.buffered.insert(logical, frame);
        }

        arrival
    }

    fn update_received_frame_bitmap(
        link: &mut LinkState,
        sequence_number: u64,
    ) -> (bool, bool, Vec<BufferedFrame>) {
        let mut released = Vec::new();

        if sequence_number < link.lowest_unreceived {
            return (false, true, released);
        }

        debug_assert!(link.window_start <= link.lowest_unreceived);

        if sequence_number >= link.window_start && sequence_number < link.window_start + WINDOW_BITS {
            let offset = sequence_number - link.window_start;

            if (link.bitmap >> offset) & 1 != 0 {
                return (false, true, released);
            }
            link.bitmap |= 1u64 << offset;

            if sequence_number == link.lowest_unreceived {
                link.lowest_unreceived += 1;
                let mut shift_by = 1u64;
                let mut i = offset + 1;
                while i < WINDOW_BITS && (link.bitmap >> i) & 1 != 0 {
                    // A set bit with nothing buffered was a null frame.
                    if let Some(frame) = link.buffered.remove(&link.lowest_unreceived) {
                        released.push(frame);
                    }
                    link.lowest_unreceived += 1;
                    shift_by += 1;
                    i += 1;
                }

                link.bitmap = shift_bitmap_down(link.bitmap, shift_by);
                link.window_start = link.lowest_unreceived;
                return (true, false, released);
            }

            (false, false, released)
        } else if sequence_number == link.lowest_unreceived
            && sequence_number == link.window_start + WINDOW_BITS
        {
            // Fully in-order stream running ahead of the window.
            debug_assert!(link.buffered.is_empty());
            link.lowest_unreceived += 1;
            link.window_start += 1;
            link.bitmap = u64::MAX;
            (true, false, released)
        } else {
            // Jump past the window end: slide the window up to cover it.
            let shift_count = sequence_number - (link.window_start + WINDOW_BITS - 1);
            link.bitmap = shift_bitmap_down(link.bitmap, shift_count);
            link.bitmap |= 1u64 << (WINDOW_BITS - 1);
            link.window_start += shift_count;
            debug_assert!(link.window_start <= link.lowest_unreceived);
            (false, false, released)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MacAddress {
        MacAddress::new([2, 0, 0, 0, 0, 1])
    }

    fn frame(tag: u8) -> BufferedFrame {
        BufferedFrame {
            payload: FrameBuffer::from_payload(&[tag; 4]),
            ether_type: 0x0800,
        }
    }

    fn deliver_tags(frames: &[BufferedFrame]) -> Vec<u8> {
        frames.iter().map(|f| f.payload.bytes()[0]).collect()
    }

    #[test]
    fn test_plain_ack_mode_dedupes_and_delivers() {
        let mut buffer = IncomingFrameBuffer::new();

        let arrival = buffer.process_incoming_frame(source(), 0, 1, frame(1));
        assert!(arrival.is_in_order);
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![1]);

        // Retransmission of 1 is a duplicate.
        let arrival = buffer.process_incoming_frame(source(), 0, 1, frame(1));
        assert!(arrival.is_duplicate);
        assert!(arrival.frames_to_deliver.is_empty());

        // A skip forward still delivers; the hole is not recoverable
        // without a session.
        let arrival = buffer.process_incoming_frame(source(), 0, 5, frame(5));
        assert!(arrival.is_in_order);
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![5]);

        // Late arrival of a skipped number is a duplicate now.
        let arrival = buffer.process_incoming_frame(source(), 0, 3, frame(3));
        assert!(arrival.is_duplicate);
    }

    #[test]
    fn test_session_in_order_sequence() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        for seq in 1..=3u16 {
            let arrival = buffer.process_incoming_frame(source(), 0, seq, frame(seq as u8));
            assert!(arrival.is_in_order, "seq {}", seq);
            assert_eq!(arrival.frames_to_deliver.len(), 1);
        }

        let (start, bitmap) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 4);
        assert_eq!(bitmap, 0);
    }

    #[test]
    fn test_session_gap_fill_releases_buffered() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        let arrival = buffer.process_incoming_frame(source(), 0, 1, frame(1));
        assert!(arrival.is_in_order);

        // 3 arrives before 2 and is held.
        let arrival = buffer.process_incoming_frame(source(), 0, 3, frame(3));
        assert!(!arrival.is_in_order);
        assert!(!arrival.is_duplicate);
        assert!(arrival.frames_to_deliver.is_empty());

        // 2 closes the gap; both come out in order.
        let arrival = buffer.process_incoming_frame(source(), 0, 2, frame(2));
        assert!(arrival.is_in_order);
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![2, 3]);

        let (start, bitmap) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 4);
        assert_eq!(bitmap, 0);
    }

    #[test]
    fn test_session_duplicate_of_buffered_frame() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        buffer.process_incoming_frame(source(), 0, 3, frame(3));
        let arrival = buffer.process_incoming_frame(source(), 0, 3, frame(3));
        assert!(arrival.is_duplicate);

        // Filling the gap still releases exactly one copy.
        buffer.process_incoming_frame(source(), 0, 1, frame(1));
        let arrival = buffer.process_incoming_frame(source(), 0, 2, frame(2));
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![2, 3]);
    }

    #[test]
    fn test_bitmap_reports_holes() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        buffer.process_incoming_frame(source(), 0, 1, frame(1));
        buffer.process_incoming_frame(source(), 0, 3, frame(3));
        buffer.process_incoming_frame(source(), 0, 5, frame(5));

        let (start, bitmap) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 2);
        // Offsets relative to window start 2: bit 1 (seq 3) and bit 3 (seq 5).
        assert_eq!(bitmap, 0b1010);
    }

    #[test]
    fn test_block_ack_request_resyncs_window() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        // 1 delivered; 2 lost forever; 3 and 4 buffered.
        buffer.process_incoming_frame(source(), 0, 1, frame(1));
        buffer.process_incoming_frame(source(), 0, 3, frame(3));
        buffer.process_incoming_frame(source(), 0, 4, frame(4));

        // Sender gave up on 2 and restarted its window at 3.
        let released = buffer.process_block_ack_request(source(), 0, 3);
        assert_eq!(deliver_tags(&released), vec![3, 4]);

        let (start, _) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 3);

        // 5 continues in order.
        let arrival = buffer.process_incoming_frame(source(), 0, 5, frame(5));
        assert!(arrival.is_in_order);

        // A late copy of 2 is recognized as already handled.
        let arrival = buffer.process_incoming_frame(source(), 0, 2, frame(2));
        assert!(arrival.is_duplicate);
    }

    #[test]
    fn test_block_ack_request_with_nothing_buffered() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);
        buffer.process_incoming_frame(source(), 0, 1, frame(1));

        // Same start again is a no-op.
        assert!(buffer.process_block_ack_request(source(), 0, 2).is_empty());

        // Jump with an empty buffer releases nothing but moves the window.
        assert!(buffer.process_block_ack_request(source(), 0, 10).is_empty());
        let (start, _) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 10);

        let arrival = buffer.process_incoming_frame(source(), 0, 10, frame(10));
        assert!(arrival.is_in_order);
    }

    #[test]
    fn test_stale_block_ack_request_is_ignored() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 8);
        buffer.process_incoming_frame(source(), 0, 8, frame(8));

        assert!(buffer.process_block_ack_request(source(), 0, 2).is_empty());
        let (start, _) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 9);
    }

    #[test]
    fn test_subframes_without_session_recover() {
        let mut buffer = IncomingFrameBuffer::new();

        // The establishing BAR was lost; the subframe itself opens the
        // session at the current lowest.
        let arrival = buffer.process_incoming_subframe(source(), 0, 1, frame(1));
        assert!(arrival.is_in_order);

        let arrival = buffer.process_incoming_subframe(source(), 0, 3, frame(3));
        assert!(!arrival.is_in_order);
        let arrival = buffer.process_incoming_subframe(source(), 0, 2, frame(2));
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![2, 3]);
    }

    #[test]
    fn test_null_frame_fills_gap() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 1);

        buffer.process_incoming_frame(source(), 0, 1, frame(1));
        buffer.process_incoming_frame(source(), 0, 3, frame(3));

        // Sequence 2 was a QoS-Null: no payload, but 3 becomes deliverable.
        let arrival = buffer.process_incoming_non_data_frame(source(), 0, 2);
        assert!(!arrival.is_duplicate);
        assert_eq!(deliver_tags(&arrival.frames_to_deliver), vec![3]);

        let arrival = buffer.process_incoming_non_data_frame(source(), 0, 2);
        assert!(arrival.is_duplicate);
    }

    #[test]
    fn test_non_data_dedupe_without_session() {
        let mut buffer = IncomingFrameBuffer::new();

        let arrival = buffer.process_incoming_non_data_frame(source(), 0, 1);
        assert!(!arrival.is_duplicate);
        let arrival = buffer.process_incoming_non_data_frame(source(), 0, 1);
        assert!(arrival.is_duplicate);
        let arrival = buffer.process_incoming_non_data_frame(source(), 0, 2);
        assert!(!arrival.is_duplicate);
    }

    #[test]
    fn test_sequence_wrap_across_window() {
        let mut buffer = IncomingFrameBuffer::new();
        buffer.process_block_ack_request(source(), 0, 4090);

        let mut seq = 4090u16;
        for step in 0..10 {
            let arrival = buffer.process_incoming_frame(source(), 0, seq, frame(step));
            assert!(arrival.is_in_order, "wire seq {}", seq);
            seq = crate::seq::next_sequence_number(seq);
        }

        // Window start has crossed the 12-bit wrap: 4090 + 10 = 4.
        let (start, _) = buffer.block_ack_info(source(), 0).unwrap();
        assert_eq!(start, 4);
    }

    #[test]
    fn test_links_are_independent() {
        let mut buffer = IncomingFrameBuffer::new();
        let other = MacAddress::new([2, 0, 0, 0, 0, 2]);

        buffer.process_block_ack_request(source(), 0, 1);
        buffer.process_incoming_frame(source(), 0, 1, frame(1));

        // Different TID and different source both start fresh.
        let arrival = buffer.process_incoming_frame(source(), 1, 1, frame(1));
        assert!(arrival.is_in_order);
        let arrival = buffer.process_incoming_frame(other, 0, 1, frame(1));
        assert!(arrival.is_in_order);

        assert!(buffer.block_ack_info(other, 1).is_none());
    }
}
