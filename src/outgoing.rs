//! Outgoing per-link sequence state
//!
//! Tracks, per (destination, TID), the last drawn sequence number, the
//! Block-Ack window start and the Block-Ack session flags. Session setup is
//! the Block-Ack-Request shortcut: the first aggregate-capable frame marks a
//! request as pending, and the request itself opens the receive session.

use std::collections::HashMap;

use log::debug;

use crate::addr::MacAddress;
use crate::frame::BLOCK_ACK_BITMAP_BITS;
use crate::seq::{circular_difference, next_sequence_number, SequenceNumber};

#[derive(Debug, Clone, Copy, Default)]
struct OutgoingLinkInfo {
    outgoing_sequence_number: SequenceNumber,
    window_start: SequenceNumber,
    // Frames at and before this number will not be resent.
    last_dropped_sequence_number: SequenceNumber,
    block_ack_session_is_enabled: bool,
    block_ack_request_needs_to_be_sent: bool,
}

/// Sender-side sequence and Block-Ack window state for all links
#[derive(Default)]
pub struct OutgoingLinks {
    links: HashMap<(MacAddress, u8), OutgoingLinkInfo>,
}

impl OutgoingLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next sequence number for a link. The first draw seeds the
    /// link at 1. A frame that will be acknowledged singly rather than by
    /// Block-Ack drags the window start along with it.
    pub fn new_sequence_number(
        &mut self,
        destination: MacAddress,
        traffic_id: u8,
        is_non_block_acked: bool,
    ) -> SequenceNumber {
        let link = self.links.entry((destination, traffic_id)).or_insert_with(|| {
            OutgoingLinkInfo {
                outgoing_sequence_number: 0,
                window_start: 1,
                ..OutgoingLinkInfo::default()
            }
        });

        link.outgoing_sequence_number = next_sequence_number(link.outgoing_sequence_number);
        let new_sequence_number = link.outgoing_sequence_number;

        if is_non_block_acked {
            link.window_start = new_sequence_number;
        }

        debug_assert!(
            circular_difference(new_sequence_number, link.window_start)
                < i32::from(BLOCK_ACK_BITMAP_BITS)
        );

        new_sequence_number
    }

    /// Sequence numbers still available before the Block-Ack window fills.
    pub fn frames_left_in_window(&self, destination: MacAddress, traffic_id: u8) -> u16 {
        let difference = match self.links.get(&(destination, traffic_id)) {
            Some(link) => circular_difference(link.outgoing_sequence_number, link.window_start),
            None => 0,
        };
        debug_assert!(difference >= 0 && difference <= i32::from(BLOCK_ACK_BITMAP_BITS));

        (BLOCK_ACK_BITMAP_BITS - 1).saturating_sub(difference as u16)
    }

    pub fn set_window_start(
        &mut self,
        destination: MacAddress,
        traffic_id: u8,
        sequence_number: SequenceNumber,
    ) {
        match self.links.get_mut(&(destination, traffic_id)) {
            Some(link) => link.window_start = sequence_number,
            None => debug!(
                "Window start for unknown link {} tid {} ignored",
                destination, traffic_id
            ),
        }
    }

    pub fn block_ack_session_is_enabled(&self, destination: MacAddress, traffic_id: u8) -> bool {
        self.links
            .get(&(destination, traffic_id))
            .map_or(false, |link| link.block_ack_session_is_enabled)
    }

    pub fn block_ack_request_is_pending(&self, destination: MacAddress, traffic_id: u8) -> bool {
        self.links
            .get(&(destination, traffic_id))
            .map_or(false, |link| link.block_ack_request_needs_to_be_sent)
    }

    /// Open a Block-Ack session on a link. The pending request, built from
    /// the current sequence number, announces the window start to the
    /// receiver before any aggregate flies.
    pub fn begin_block_ack_session(&mut self, destination: MacAddress, traffic_id: u8) {
        let link = self.links.entry((destination, traffic_id)).or_default();

        link.block_ack_request_needs_to_be_sent = true;
        link.block_ack_session_is_enabled = true;
        link.last_dropped_sequence_number = link.outgoing_sequence_number;
    }

    /// Record a frame abandoned after too many retries. With a session
    /// active the receiver has to be told to move past it, so a Block-Ack
    /// Request becomes pending.
    pub fn record_dropped_frame(
        &mut self,
        destination: MacAddress,
        traffic_id: u8,
        sequence_number: SequenceNumber,
    ) {
        let link = self.links.entry((destination, traffic_id)).or_default();

        link.last_dropped_sequence_number = sequence_number;
        if link.block_ack_session_is_enabled {
            link.block_ack_request_needs_to_be_sent = true;
        }
    }

    /// Starting sequence number for the pending Block-Ack Request: the
    /// first frame after the last dropped one.
    pub fn block_ack_request_start(&self, destination: MacAddress, traffic_id: u8) -> SequenceNumber {
        let last_dropped = self
            .links
            .get(&(destination, traffic_id))
            .map_or(0, |link| link.last_dropped_sequence_number);

        next_sequence_number(last_dropped)
    }

    /// Apply a received Block-Ack: the pending request (if any) is answered
    /// and the window start advances to the responder's start plus its run
    /// of leading acknowledged frames.
    pub fn process_block_ack(
        &mut self,
        destination: MacAddress,
        traffic_id: u8,
        starting_sequence_number: SequenceNumber,
        bitmap: u64,
    ) {
        let link = self.links.entry((destination, traffic_id)).or_default();

        link.block_ack_request_needs_to_be_sent = false;
        link.window_start = starting_sequence_number;

        for i in 0..u64::from(BLOCK_ACK_BITMAP_BITS) {
            if (bitmap >> i) & 1 == 0 {
                break;
            }
            link.window_start = next_sequence_number(link.window_start);
        }
    }
}
