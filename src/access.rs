//! EDCA access categories
//!
//! Each category contends independently with its own contention window,
//! AIFS and retry counters, and owns the frame it is currently trying to
//! get onto the air. Category order is lowest priority first; the engine
//! resolves simultaneous winners in favor of the highest index.

use rand::Rng;

use crate::addr::{MacAddress, NetworkAddress};
use crate::frame::FrameType;
use crate::seq::SequenceNumber;
use crate::time::{SimTime, INFINITE_TIME, ZERO_TIME};
use crate::wire::FrameBuffer;
use crate::{MacError, Result};

/// Categories in the standard EDCA arrangement
pub const NUMBER_EDCA_CATEGORIES: usize = 4;

/// Highest 802.11 user priority
pub const MAX_PACKET_PRIORITY: u8 = 7;

/// A dequeued data packet bound to a destination and sequence number
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub payload: FrameBuffer,
    pub ether_type: u16,
    pub next_hop_address: NetworkAddress,
    pub destination: MacAddress,
    pub traffic_id: u8,
    pub sequence_number: SequenceNumber,
    pub queued_at: SimTime,
}

/// A fully encoded management frame awaiting transmission
#[derive(Debug, Clone)]
pub struct ManagementFrame {
    pub destination: MacAddress,
    pub frame_type: FrameType,
    pub sequence_number: SequenceNumber,
    pub frame_bytes: FrameBuffer,
}

/// A single frame a category is carrying
#[derive(Debug, Clone)]
pub enum OutgoingFrame {
    Data(DataPacket),
    Management(ManagementFrame),
}

impl OutgoingFrame {
    pub fn destination(&self) -> MacAddress {
        match self {
            Self::Data(packet) => packet.destination,
            Self::Management(frame) => frame.destination,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        match self {
            Self::Data(packet) => packet.sequence_number,
            Self::Management(frame) => frame.sequence_number,
        }
    }

    pub fn is_management(&self) -> bool {
        matches!(self, Self::Management(_))
    }
}

/// An MPDU aggregate under construction or awaiting its Block-Ack
#[derive(Debug, Clone)]
pub struct AggregateFrame {
    pub destination: MacAddress,
    pub traffic_id: u8,
    pub subframes: Vec<DataPacket>,
}

/// What a category currently holds
#[derive(Debug, Clone, Default)]
pub enum InFlight {
    #[default]
    None,
    Single(OutgoingFrame),
    Aggregate(AggregateFrame),
    /// First subframe pulled out of an aggregate and sent alone so the
    /// link is confirmed before the rest of the aggregate goes out.
    /// `remainder.subframes` is never empty in this variant.
    LeadFrame {
        lead: DataPacket,
        remainder: AggregateFrame,
    },
}

impl InFlight {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn take(&mut self) -> InFlight {
        std::mem::take(self)
    }

    pub fn destination(&self) -> Option<MacAddress> {
        match self {
            Self::None => None,
            Self::Single(frame) => Some(frame.destination()),
            Self::Aggregate(aggregate) => Some(aggregate.destination),
            Self::LeadFrame { lead, .. } => Some(lead.destination),
        }
    }
}

/// One EDCA access category: parameters, contention state and the frame in
/// flight
#[derive(Debug)]
pub struct AccessCategory {
    // Parameters
    pub priorities: Vec<u8>,
    pub min_contention_window_slots: u32,
    pub max_contention_window_slots: u32,
    pub arbitration_interframe_space_slots: u32,
    pub transmit_opportunity_duration: SimTime,
    pub frame_lifetime: SimTime,

    // Contention state
    pub current_contention_window_slots: u32,
    pub current_num_backoff_slots: u32,
    pub current_nonextended_backoff_duration: SimTime,
    pub trying_to_jump_on_medium: bool,
    pub has_packet_to_send: bool,
    pub ifs_and_backoff_start_time: SimTime,

    // Backoff snapshot taken outside restricted access windows
    pub saved_non_raw_contention_window_slots: u32,
    pub saved_non_raw_backoff_slots: u32,

    // Retry counters for the frame in flight
    pub short_frame_retry_count: u32,
    pub long_frame_retry_count: u32,
    pub aggregate_frame_retry_count: u32,

    pub in_flight: InFlight,
}

impl AccessCategory {
    pub fn new(
        min_contention_window_slots: u32,
        max_contention_window_slots: u32,
        arbitration_interframe_space_slots: u32,
    ) -> Self {
        Self {
            priorities: Vec::new(),
            min_contention_window_slots,
            max_contention_window_slots,
            arbitration_interframe_space_slots,
            transmit_opportunity_duration: ZERO_TIME,
            frame_lifetime: INFINITE_TIME,
            current_contention_window_slots: min_contention_window_slots,
            current_num_backoff_slots: 0,
            current_nonextended_backoff_duration: INFINITE_TIME,
            trying_to_jump_on_medium: false,
            has_packet_to_send: false,
            ifs_and_backoff_start_time: INFINITE_TIME,
            saved_non_raw_contention_window_slots: 0,
            saved_non_raw_backoff_slots: 0,
            short_frame_retry_count: 0,
            long_frame_retry_count: 0,
            aggregate_frame_retry_count: 0,
            in_flight: InFlight::None,
        }
    }

    /// Successful delivery or giving up on a packet narrows the window back
    pub fn reset_contention_window(&mut self) {
        self.current_contention_window_slots = self.min_contention_window_slots;
    }

    /// Failed attempt: widen toward the maximum. The window sequence is
    /// `2^n - 1` so the update is `cw * 2 + 1`.
    pub fn double_contention_window(&mut self) {
        self.current_contention_window_slots = std::cmp::min(
            self.current_contention_window_slots * 2 + 1,
            self.max_contention_window_slots,
        );
    }

    /// Draw a fresh uniform backoff in `[0, cw]`
    pub fn draw_backoff_slots(&mut self, rng: &mut impl Rng) {
        self.current_num_backoff_slots =
            rng.gen_range(0..=self.current_contention_window_slots);
    }

    pub fn reset_retry_counts(&mut self) {
        self.short_frame_retry_count = 0;
        self.long_frame_retry_count = 0;
        self.aggregate_frame_retry_count = 0;
    }

    pub fn handles_priority(&self, priority: u8) -> bool {
        self.priorities.contains(&priority)
    }
}

/// The four standard EDCA categories for the given base contention window.
/// Lower categories see wider windows and longer AIFS; priorities 0 through
/// `max_packet_priority` are distributed evenly with the excess going to the
/// front.
pub fn edca_categories(
    contention_window_min_slots: u32,
    contention_window_max_slots: u32,
    max_packet_priority: u8,
) -> Vec<AccessCategory> {
    let cw_min = contention_window_min_slots;
    let cw_max = contention_window_max_slots;

    let mut categories = vec![
        AccessCategory::new(cw_min, cw_max, 9),
        AccessCategory::new((cw_min + 1) / 2 - 1, cw_max, 6),
        AccessCategory::new((cw_min + 1) / 4 - 1, (cw_min + 1) / 2 - 1, 3),
        AccessCategory::new((cw_min + 1) / 4 - 1, (cw_min + 1) / 2 - 1, 2),
    ];

    distribute_priorities(&mut categories, max_packet_priority);
    categories
}

/// Distributed-coordination fallback: one category with DIFS-style spacing
/// covering every priority.
pub fn dcf_categories(
    contention_window_min_slots: u32,
    contention_window_max_slots: u32,
) -> Vec<AccessCategory> {
    let mut category =
        AccessCategory::new(contention_window_min_slots, contention_window_max_slots, 2);
    category.priorities.push(0);
    vec![category]
}

fn distribute_priorities(categories: &mut [AccessCategory], max_packet_priority: u8) {
    let number_priorities = u32::from(max_packet_priority) + 1;
    let number_categories = categories.len() as u32;
    let min_per_category = number_priorities / number_categories;
    let excess = number_priorities % number_categories;

    let mut priority = 0u8;
    for (index, category) in categories.iter_mut().enumerate() {
        let mut count = min_per_category;
        if (index as u32) < excess {
            count += 1;
        }
        for _ in 0..count {
            category.priorities.push(priority);
            priority += 1;
        }
    }
}

/// Check that every priority up to the maximum maps to exactly one category
/// and nothing maps beyond the maximum.
pub fn validate_priority_mapping(
    categories: &[AccessCategory],
    max_packet_priority: u8,
) -> Result<()> {
    for category in categories {
        for &priority in &category.priorities {
            if priority > max_packet_priority {
                return Err(MacError::Config(format!(
                    "Priority {} mapped beyond maximum {}",
                    priority, max_packet_priority
                )));
            }
        }
    }

    for priority in 0..=max_packet_priority {
        let count = categories
            .iter()
            .filter(|category| category.handles_priority(priority))
            .count();

        if count == 0 {
            return Err(MacError::Config(format!(
                "No access category mapped for priority {}",
                priority
            )));
        }
        if count > 1 {
            return Err(MacError::Config(format!(
                "Duplicate access category mapping for priority {}",
                priority
            )));
        }
    }

    Ok(())
}

/// Index of the category serving a priority
pub fn category_index_for_priority(categories: &[AccessCategory], priority: u8) -> Option<usize> {
    categories
        .iter()
        .position(|category| category.handles_priority(priority))
}
