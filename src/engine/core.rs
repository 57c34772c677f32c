//! Channel access engine
//!
//! [`MacEngine`] owns the full link-layer state of one interface: the EDCA
//! access categories with their backoff machinery, the frames in flight,
//! RTS/CTS and ACK/Block-Ack exchanges, MPDU aggregation, the incoming
//! reorder buffer and the restricted access window overlay. It is driven
//! entirely by notifications (channel state, timer expirations, received
//! frames) and communicates outward through a queue of [`MacAction`]s, so
//! it never blocks and owns no clock of its own.

use std::collections::{HashSet, VecDeque};

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::access::{
    AccessCategory, AggregateFrame, DataPacket, InFlight, ManagementFrame, OutgoingFrame,
};
use crate::addr::{MacAddress, NetworkAddress};
use crate::engine::config::MacConfig;
use crate::engine::events::{
    MacAction, NextHopResolver, RateController, TransmitPowerController, TxParameters,
};
use crate::engine::queue::{EnqueueOutcome, NetworkOutputQueue, QueuedPacket};
use crate::frame::{
    peek_common_header, AckFrame, BeaconFrame, BlockAckFrame, BlockAckRequestFrame,
    CommonFrameHeader, CtsFrame, DataFrameHeader, FrameType, HtCapabilitiesElement,
    HtOperationElement, ManagementFrameHeader, MpduDelimiter, PsPollFrame, RtsFrame, SsidElement,
};
use crate::outgoing::OutgoingLinks;
use crate::reorder::{BufferedFrame, IncomingFrameBuffer};
use crate::time::{
    duration_field_from_time, time_from_duration_field, AssociationId, DurationField, SimTime,
    INFINITE_TIME, ZERO_TIME,
};
use crate::wire::{align_to_four, FrameBuffer};
use crate::{MacError, Result};

/// What kind of frame is waiting for a response from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentFrameKind {
    /// An RTS waiting for its CTS. Only used when reporting a failed
    /// exchange; the engine state for the wait itself is
    /// [`MacState::WaitingForCts`].
    Rts,
    Short,
    Long,
    Aggregate,
    BlockAckRequest,
}

/// Top-level state of the access state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    Idle,
    BusyMedium,
    /// Between two states while control decides where to go next.
    Transient,
    WaitingForNavExpiration,
    WaitingForIfsAndBackoff,
    WaitingForCts,
    WaitingForAck(SentFrameKind),
    CtsOrAckTransmission,
    ChangingChannels,
}

/// Result of trying to put a frame on the air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransmitOutcome {
    Sent,
    NothingToSend,
    TooLongForRestrictedAccessWindow,
}

/// Counters the engine maintains while running
#[derive(Debug, Clone, Default)]
pub struct MacStats {
    pub data_frames_sent: u64,
    pub data_bytes_sent: u64,
    pub management_frames_sent: u64,
    pub control_frames_sent: u64,
    pub aggregate_frames_sent: u64,
    pub aggregate_subframes_sent: u64,
    pub data_frames_received: u64,
    pub data_bytes_received: u64,
    pub management_frames_received: u64,
    pub control_frames_received: u64,
    pub aggregate_subframes_received: u64,
    pub duplicate_frames_received: u64,
    pub frame_retries: u64,
    pub subframes_acknowledged: u64,
    pub packets_delivered: u64,
    pub packets_dropped_retry_limit: u64,
    pub packets_dropped_lifetime: u64,
    pub packets_dropped_unresolvable: u64,
    pub packets_rejected_full_queue: u64,
    pub internal_collisions: u64,
    pub transmissions_aborted_for_raw: u64,
}

fn is_group_address(address: MacAddress) -> bool {
    address.is_broadcast() || address.is_multicast()
}

/// Rewrite the duration field and retry flag of an already serialized frame
/// in place. The power management flag is left untouched.
fn patch_common_header(bytes: &mut [u8], duration: DurationField, is_retry: bool) {
    debug_assert!(bytes.len() >= CommonFrameHeader::SIZE);
    if bytes.len() < CommonFrameHeader::SIZE {
        return;
    }
    if is_retry {
        bytes[1] |= 0x08;
    } else {
        bytes[1] &= !0x08;
    }
    bytes[2..4].copy_from_slice(&duration.to_le_bytes());
}

/// Serialize a fixed-size frame into a fresh buffer
fn build_frame<F>(size: usize, write: F) -> Result<FrameBuffer>
where
    F: FnOnce(&mut &mut [u8]) -> Result<()>,
{
    let mut buffer = FrameBuffer::with_headroom(size);
    {
        let mut cursor = buffer.push_front(size);
        write(&mut cursor)?;
    }
    Ok(buffer)
}

/// The channel access engine for one interface
pub struct MacEngine {
    mac_address: MacAddress,

    short_frame_retry_limit: u32,
    long_frame_retry_limit: u32,
    rts_threshold_size_bytes: u32,
    disable_jump_on_medium_without_backoff: bool,
    use_ndp_control_frames: bool,

    sifs_duration: SimTime,
    slot_duration: SimTime,
    rx_tx_turnaround_time: SimTime,
    phy_header_duration: SimTime,
    air_propagation_time: SimTime,
    delay_between_consecutive_frames: SimTime,
    cts_timeout_duration: SimTime,
    ack_timeout_duration: SimTime,
    extended_interframe_space_extra_duration: SimTime,

    max_aggregate_size_bytes: usize,
    protect_aggregates_with_single_acked_frame: bool,
    allow_aggregation_with_txop_zero: bool,

    state: MacState,
    categories: Vec<AccessCategory>,
    management_category_index: usize,

    medium_became_idle_time: SimTime,
    medium_reserved_until: SimTime,
    medium_is_busy: bool,
    last_frame_received_was_corrupt: bool,
    receiving_is_enabled: bool,
    transmission_in_progress: bool,

    wakeup_timer_is_armed: bool,
    wakeup_timer_expiration: SimTime,

    last_sent_category_index: usize,
    last_sent_destination: MacAddress,
    last_transmitted_frame_was_a_beacon: bool,

    transmit_opportunity_end_time: SimTime,
    transmit_opportunity_acked_frame_count: u32,

    restricted_access_window_end_time: SimTime,
    non_raw_backoff_info_is_saved: bool,

    subframes_received_from_current_aggregate: u32,
    current_incoming_aggregate_source: MacAddress,
    current_incoming_aggregate_traffic_id: u8,

    network_queue: NetworkOutputQueue,
    management_frame_queue: VecDeque<ManagementFrame>,
    outgoing_links: OutgoingLinks,
    incoming_buffer: IncomingFrameBuffer,
    aggregation_capable_neighbors: HashSet<MacAddress>,
    multicast_addresses: Vec<MacAddress>,
    switching_to_this_channel_list: Option<Vec<u8>>,

    rate_controller: Box<dyn RateController>,
    power_controller: Box<dyn TransmitPowerController>,
    next_hop_resolver: Box<dyn NextHopResolver>,
    rng: StdRng,

    actions: VecDeque<MacAction>,
    stats: MacStats,
}

impl MacEngine {
    pub fn new(
        config: &MacConfig,
        mut rate_controller: Box<dyn RateController>,
        power_controller: Box<dyn TransmitPowerController>,
        next_hop_resolver: Box<dyn NextHopResolver>,
    ) -> Result<Self> {
        let validation = config.validate();
        for warning in &validation.warnings {
            warn!("Configuration: {warning}");
        }
        if !validation.is_valid() {
            return Err(MacError::Config(validation.errors.join("; ")));
        }

        let timing = &config.timing;
        let response_timeout =
            timing.sifs_us + timing.slot_us + timing.phy_rx_start_delay_us;
        let acknowledgement_length = if config.use_ndp_control_frames {
            0
        } else {
            AckFrame::SIZE
        };
        let lowest_tx_parameters = rate_controller.lowest_tx_parameters();
        let extended_interframe_space_extra_duration = timing.sifs_us
            + timing.phy_header_duration_us
            + lowest_tx_parameters.frame_duration(acknowledgement_length);

        let categories = config.build_access_categories();
        let management_category_index = categories.len() - 1;
        let network_queue = NetworkOutputQueue::new(config.contention.max_packet_priority)
            .with_limits(
                config.queue.max_packets_per_priority,
                config.queue.max_bytes_per_priority,
            );
        let mac_address =
            MacAddress::from_node_id(config.node_id, config.interface_selector_byte);

        info!(
            "MAC {} up with {} access categories",
            mac_address,
            categories.len()
        );

        Ok(Self {
            mac_address,
            short_frame_retry_limit: config.contention.short_frame_retry_limit,
            long_frame_retry_limit: config.contention.long_frame_retry_limit,
            rts_threshold_size_bytes: config.contention.rts_threshold_size_bytes,
            disable_jump_on_medium_without_backoff: config
                .contention
                .disable_jump_on_medium_without_backoff,
            use_ndp_control_frames: config.use_ndp_control_frames,
            sifs_duration: timing.sifs_us,
            slot_duration: timing.slot_us,
            rx_tx_turnaround_time: timing.rx_tx_turnaround_us,
            phy_header_duration: timing.phy_header_duration_us,
            air_propagation_time: timing.air_propagation_us,
            delay_between_consecutive_frames: timing.delay_between_consecutive_frames_us,
            cts_timeout_duration: response_timeout,
            ack_timeout_duration: response_timeout,
            extended_interframe_space_extra_duration,
            max_aggregate_size_bytes: config.aggregation.max_aggregate_size_bytes,
            protect_aggregates_with_single_acked_frame: config
                .aggregation
                .protect_aggregates_with_single_acked_frame,
            allow_aggregation_with_txop_zero: config.aggregation.allow_aggregation_with_txop_zero,
            state: MacState::Idle,
            categories,
            management_category_index,
            medium_became_idle_time: ZERO_TIME,
            medium_reserved_until: ZERO_TIME,
            medium_is_busy: false,
            last_frame_received_was_corrupt: false,
            receiving_is_enabled: true,
            transmission_in_progress: false,
            wakeup_timer_is_armed: false,
            wakeup_timer_expiration: INFINITE_TIME,
            last_sent_category_index: 0,
            last_sent_destination: MacAddress::INVALID,
            last_transmitted_frame_was_a_beacon: false,
            transmit_opportunity_end_time: ZERO_TIME,
            transmit_opportunity_acked_frame_count: 0,
            restricted_access_window_end_time: INFINITE_TIME,
            non_raw_backoff_info_is_saved: false,
            subframes_received_from_current_aggregate: 0,
            current_incoming_aggregate_source: MacAddress::INVALID,
            current_incoming_aggregate_traffic_id: 0,
            network_queue,
            management_frame_queue: VecDeque::new(),
            outgoing_links: OutgoingLinks::new(),
            incoming_buffer: IncomingFrameBuffer::new(),
            aggregation_capable_neighbors: HashSet::new(),
            multicast_addresses: Vec::new(),
            switching_to_this_channel_list: None,
            rate_controller,
            power_controller,
            next_hop_resolver,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(u64::from(config.node_id))),
            actions: VecDeque::new(),
            stats: MacStats::default(),
        })
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    /// Take everything the engine wants the surrounding node to do
    pub fn drain_actions(&mut self) -> Vec<MacAction> {
        self.actions.drain(..).collect()
    }

    /// Accept unicast or group traffic for an additional link-layer address
    pub fn add_multicast_address(&mut self, address: MacAddress) {
        if !self.multicast_addresses.contains(&address) {
            self.multicast_addresses.push(address);
        }
    }

    /// Record whether a neighbor advertised A-MPDU support
    pub fn set_mpdu_aggregation_enabled_for(&mut self, neighbor: MacAddress, enabled: bool) {
        if enabled {
            self.aggregation_capable_neighbors.insert(neighbor);
        } else {
            self.aggregation_capable_neighbors.remove(&neighbor);
        }
    }

    // ------------------------------------------------------------------
    // Network layer side
    // ------------------------------------------------------------------

    /// Queue a packet from the network layer and kick contention if the
    /// owning access category is not already running
    pub fn enqueue_packet(
        &mut self,
        payload: FrameBuffer,
        next_hop_address: NetworkAddress,
        priority: u8,
        ether_type: u16,
        now: SimTime,
    ) {
        match self
            .network_queue
            .insert(payload, next_hop_address, priority, ether_type, now)
        {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::RejectedMaxPackets(payload)
            | EnqueueOutcome::RejectedMaxBytes(payload) => {
                self.stats.packets_rejected_full_queue += 1;
                debug!("Output queue full, rejecting packet for {next_hop_address}");
                self.emit(MacAction::PacketUndeliverable {
                    payload,
                    next_hop_address,
                });
                return;
            }
        }

        for index in (0..self.categories.len()).rev() {
            if !self.access_category_is_active(index) {
                self.start_packet_send_process_for_category(index, false, now);
            }
        }
    }

    /// Pull every buffered frame back into the network queue, preserving
    /// their sequence numbers. Used before a channel change or handover.
    pub fn requeue_buffered_frames(&mut self) {
        for index in 0..self.categories.len() {
            match self.categories[index].in_flight.take() {
                InFlight::None => {}
                InFlight::Single(OutgoingFrame::Data(packet)) => self.requeue_data_packet(packet),
                InFlight::Single(OutgoingFrame::Management(frame)) => {
                    debug!(
                        "Discarding undelivered {:?} management frame",
                        frame.frame_type
                    );
                }
                InFlight::Aggregate(aggregate) => self.requeue_aggregate(aggregate),
                InFlight::LeadFrame { lead, remainder } => {
                    self.requeue_aggregate(remainder);
                    self.requeue_data_packet(lead);
                }
            }
        }
    }

    fn requeue_data_packet(&mut self, packet: DataPacket) {
        let priority = packet.traffic_id;
        self.network_queue.requeue_at_front(
            QueuedPacket {
                payload: packet.payload,
                next_hop_address: packet.next_hop_address,
                ether_type: packet.ether_type,
                queued_at: packet.queued_at,
                retry_count: 0,
                sequence_number: packet.sequence_number,
                is_a_requeue: true,
            },
            priority,
        );
    }

    fn requeue_aggregate(&mut self, mut aggregate: AggregateFrame) {
        while let Some(packet) = aggregate.subframes.pop() {
            self.requeue_data_packet(packet);
        }
    }

    // ------------------------------------------------------------------
    // Management frame service
    // ------------------------------------------------------------------

    /// Queue a pre-built management frame on the highest access category
    pub fn send_management_frame(&mut self, frame: ManagementFrame, now: SimTime) {
        trace!(
            "Queueing {:?} management frame for {}",
            frame.frame_type,
            frame.destination
        );
        self.management_frame_queue.push_back(frame);
        let index = self.management_category_index;
        if !self.access_category_is_active(index) {
            self.start_packet_send_process_for_category(index, false, now);
        }
    }

    pub fn send_beacon_frame(
        &mut self,
        ssid: &str,
        bonded_channel_list: Vec<u8>,
        now: SimTime,
    ) -> Result<()> {
        let sequence_number = self.new_management_sequence_number(MacAddress::BROADCAST);
        let beacon = BeaconFrame::new(
            self.mac_address,
            sequence_number,
            SsidElement::new(ssid)?,
            self.ht_capabilities(),
            HtOperationElement::new(bonded_channel_list)?,
        );
        let mut bytes = Vec::with_capacity(BeaconFrame::SIZE);
        beacon.serialize(&mut bytes)?;
        self.send_management_frame(
            ManagementFrame {
                destination: MacAddress::BROADCAST,
                frame_type: FrameType::Beacon,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    pub fn send_association_request_frame(
        &mut self,
        access_point: MacAddress,
        ssid: &str,
        now: SimTime,
    ) -> Result<()> {
        self.send_association_management_frame(
            FrameType::AssociationRequest,
            access_point,
            ssid,
            now,
        )
    }

    pub fn send_reassociation_request_frame(
        &mut self,
        new_access_point: MacAddress,
        ssid: &str,
        now: SimTime,
    ) -> Result<()> {
        self.send_association_management_frame(
            FrameType::ReassociationRequest,
            new_access_point,
            ssid,
            now,
        )
    }

    fn send_association_management_frame(
        &mut self,
        frame_type: FrameType,
        destination: MacAddress,
        ssid: &str,
        now: SimTime,
    ) -> Result<()> {
        let sequence_number = self.new_management_sequence_number(destination);
        let header =
            ManagementFrameHeader::new(frame_type, destination, self.mac_address, sequence_number);
        let mut bytes = Vec::with_capacity(
            ManagementFrameHeader::SIZE + SsidElement::SIZE + HtCapabilitiesElement::SIZE,
        );
        header.serialize(&mut bytes)?;
        SsidElement::new(ssid)?.serialize(&mut bytes)?;
        self.ht_capabilities().serialize(&mut bytes)?;
        self.send_management_frame(
            ManagementFrame {
                destination,
                frame_type,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    pub fn send_association_response_frame(
        &mut self,
        station: MacAddress,
        association_id: AssociationId,
        now: SimTime,
    ) -> Result<()> {
        let sequence_number = self.new_management_sequence_number(station);
        let header = ManagementFrameHeader::new(
            FrameType::AssociationResponse,
            station,
            self.mac_address,
            sequence_number,
        );
        let mut bytes = Vec::with_capacity(
            ManagementFrameHeader::SIZE + 2 + HtCapabilitiesElement::SIZE,
        );
        header.serialize(&mut bytes)?;
        bytes.extend_from_slice(&association_id.to_le_bytes());
        self.ht_capabilities().serialize(&mut bytes)?;
        self.send_management_frame(
            ManagementFrame {
                destination: station,
                frame_type: FrameType::AssociationResponse,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    pub fn send_authentication_frame(&mut self, peer: MacAddress, now: SimTime) -> Result<()> {
        let sequence_number = self.new_management_sequence_number(peer);
        let header = ManagementFrameHeader::new(
            FrameType::Authentication,
            peer,
            self.mac_address,
            sequence_number,
        );
        let mut bytes = Vec::with_capacity(ManagementFrameHeader::SIZE + 6);
        header.serialize(&mut bytes)?;
        // Open system algorithm, transaction one, status success.
        bytes.extend_from_slice(&[0u8; 6]);
        self.send_management_frame(
            ManagementFrame {
                destination: peer,
                frame_type: FrameType::Authentication,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    pub fn send_disassociation_frame(&mut self, peer: MacAddress, now: SimTime) -> Result<()> {
        let sequence_number = self.new_management_sequence_number(peer);
        let header = ManagementFrameHeader::new(
            FrameType::Disassociation,
            peer,
            self.mac_address,
            sequence_number,
        );
        let mut bytes = Vec::with_capacity(ManagementFrameHeader::SIZE + 2);
        header.serialize(&mut bytes)?;
        bytes.extend_from_slice(&0u16.to_le_bytes());
        self.send_management_frame(
            ManagementFrame {
                destination: peer,
                frame_type: FrameType::Disassociation,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    /// Announce a power management transition with a QoS Null frame
    pub fn send_power_save_null_frame(
        &mut self,
        destination: MacAddress,
        entering_power_save: bool,
        now: SimTime,
    ) -> Result<()> {
        let traffic_id = self.network_queue.max_priority();
        let sequence_number =
            self.outgoing_links
                .new_sequence_number(destination, traffic_id, true);
        let mut header =
            DataFrameHeader::new_null(destination, self.mac_address, sequence_number, traffic_id);
        header.header.frame_control.power_management = entering_power_save;
        let mut bytes = Vec::with_capacity(DataFrameHeader::NULL_SIZE);
        header.serialize(&mut bytes)?;
        self.send_management_frame(
            ManagementFrame {
                destination,
                frame_type: FrameType::QosNull,
                sequence_number,
                frame_bytes: FrameBuffer::from_bytes(bytes),
            },
            now,
        );
        Ok(())
    }

    fn new_management_sequence_number(&mut self, destination: MacAddress) -> u16 {
        let traffic_id = self.network_queue.max_priority();
        self.outgoing_links
            .new_sequence_number(destination, traffic_id, true)
    }

    fn ht_capabilities(&self) -> HtCapabilitiesElement {
        HtCapabilitiesElement {
            aggregate_mpdus_are_enabled: self.max_aggregate_size_bytes > 0,
        }
    }

    // ------------------------------------------------------------------
    // Restricted access window and channel control
    // ------------------------------------------------------------------

    /// Enter a restricted access window slot that ends at `end_time`.
    /// Contention state outside the window is saved on first entry and
    /// every window starts from a minimal contention window.
    pub fn start_restricted_access_window_period(&mut self, end_time: SimTime, now: SimTime) {
        if !self.non_raw_backoff_info_is_saved {
            self.save_non_raw_backoff_info();
        }
        self.set_all_contention_windows_to_min_and_regenerate();
        self.set_restricted_access_window_end_and_restart(end_time, now);
    }

    /// Leave restricted access operation and restore saved contention state
    pub fn switch_to_normal_access_mode(&mut self, now: SimTime) {
        if self.non_raw_backoff_info_is_saved {
            self.restore_non_raw_backoff_info();
        }
        self.set_restricted_access_window_end_and_restart(INFINITE_TIME, now);
    }

    /// Keep the receiver on but do not contend for the medium
    pub fn switch_to_receive_only_mode(&mut self) {
        self.restricted_access_window_end_time = ZERO_TIME;
        if !self.receiving_is_enabled {
            self.receiving_is_enabled = true;
            self.emit(MacAction::StartReceiving);
        }
    }

    /// Power the receiver down outside our slots
    pub fn switch_to_sleep_mode(&mut self) {
        self.restricted_access_window_end_time = ZERO_TIME;
        if self.receiving_is_enabled {
            self.receiving_is_enabled = false;
            self.emit(MacAction::StopReceiving);
        }
    }

    fn set_restricted_access_window_end_and_restart(&mut self, end_time: SimTime, now: SimTime) {
        debug_assert!(
            self.restricted_access_window_end_time == INFINITE_TIME
                || self.restricted_access_window_end_time <= end_time
        );
        self.restricted_access_window_end_time = end_time;
        if !self.receiving_is_enabled {
            self.receiving_is_enabled = true;
            self.emit(MacAction::StartReceiving);
            if self.state == MacState::Idle && self.medium_is_busy {
                self.state = MacState::BusyMedium;
            }
        }
        if self.state == MacState::Idle {
            self.state = MacState::Transient;
            self.start_backoff_if_necessary(now);
        }
    }

    fn save_non_raw_backoff_info(&mut self) {
        debug_assert!(!self.non_raw_backoff_info_is_saved);
        for category in &mut self.categories {
            category.saved_non_raw_contention_window_slots = category.current_contention_window_slots;
            category.saved_non_raw_backoff_slots = category.current_num_backoff_slots;
        }
        self.non_raw_backoff_info_is_saved = true;
    }

    fn restore_non_raw_backoff_info(&mut self) {
        for index in 0..self.categories.len() {
            let saved_window = self.categories[index].saved_non_raw_contention_window_slots;
            let saved_slots = self.categories[index].saved_non_raw_backoff_slots;
            self.categories[index].current_contention_window_slots = saved_window;
            if self.categories[index].current_nonextended_backoff_duration != INFINITE_TIME {
                self.categories[index].current_num_backoff_slots = saved_slots;
                self.categories[index].current_nonextended_backoff_duration =
                    self.backoff_duration_for_slots(index, saved_slots);
            }
        }
        self.non_raw_backoff_info_is_saved = false;
    }

    fn set_all_contention_windows_to_min_and_regenerate(&mut self) {
        debug_assert!(self.non_raw_backoff_info_is_saved);
        for index in 0..self.categories.len() {
            self.categories[index].reset_contention_window();
            if self.categories[index].current_nonextended_backoff_duration != INFINITE_TIME {
                self.recalculate_random_backoff(index);
            }
        }
    }

    /// Move to a new channel list, after the current transmission if one
    /// is on the air
    pub fn switch_to_channels(&mut self, channels: Vec<u8>) {
        if self.transmission_in_progress {
            self.switching_to_this_channel_list = Some(channels);
            self.state = MacState::ChangingChannels;
        } else {
            self.emit(MacAction::SwitchToChannels { channels });
        }
    }

    // ------------------------------------------------------------------
    // Channel state notifications
    // ------------------------------------------------------------------

    pub fn on_channel_busy(&mut self, now: SimTime) {
        self.medium_is_busy = true;
        match self.state {
            MacState::WaitingForNavExpiration => {
                self.cancel_wakeup_timer();
                self.state = MacState::BusyMedium;
            }
            MacState::WaitingForIfsAndBackoff => {
                self.state = MacState::BusyMedium;
                for index in 0..self.categories.len() {
                    let start = self.categories[index].ifs_and_backoff_start_time;
                    if start == INFINITE_TIME {
                        continue;
                    }
                    self.pause_backoff_for_category(index, now.saturating_sub(start), now);
                }
                self.cancel_wakeup_timer();
            }
            MacState::Idle => self.state = MacState::BusyMedium,
            _ => {}
        }
    }

    pub fn on_channel_clear(&mut self, now: SimTime) {
        self.medium_is_busy = false;
        match self.state {
            MacState::WaitingForNavExpiration => return,
            MacState::WaitingForCts => {
                if self.wakeup_timer_is_armed {
                    return;
                }
                self.state = MacState::Transient;
                self.do_never_received_response_action(SentFrameKind::Rts);
            }
            MacState::WaitingForAck(kind) => {
                if self.wakeup_timer_is_armed {
                    return;
                }
                self.state = MacState::Transient;
                self.do_never_received_response_action(kind);
            }
            MacState::BusyMedium | MacState::Transient => {}
            _ => return,
        }

        if now < self.medium_reserved_until {
            self.go_into_wait_for_nav_expiration();
        } else {
            self.medium_became_idle_time = now;
            self.state = MacState::Transient;
            self.start_backoff_if_necessary(now);
        }
    }

    fn pause_backoff_for_category(&mut self, index: usize, elapsed: SimTime, now: SimTime) {
        if self.categories[index].trying_to_jump_on_medium {
            self.categories[index].trying_to_jump_on_medium = false;
            self.categories[index].current_nonextended_backoff_duration = INFINITE_TIME;
            self.start_packet_send_process_for_category(index, true, now);
        } else if self.categories[index].current_nonextended_backoff_duration != INFINITE_TIME {
            let used = self.number_backoff_slots_used(elapsed, index);
            let category = &mut self.categories[index];
            debug_assert!(used <= category.current_num_backoff_slots);
            category.current_num_backoff_slots =
                category.current_num_backoff_slots.saturating_sub(used);
            let slots = category.current_num_backoff_slots;
            self.categories[index].current_nonextended_backoff_duration =
                self.backoff_duration_for_slots(index, slots);
        }
    }

    fn go_into_wait_for_nav_expiration(&mut self) {
        debug_assert!(matches!(
            self.state,
            MacState::BusyMedium | MacState::Transient
        ));
        debug_assert!(!self.wakeup_timer_is_armed);
        self.state = MacState::WaitingForNavExpiration;
        self.schedule_wakeup(self.medium_reserved_until);
    }

    // ------------------------------------------------------------------
    // Timer handling
    // ------------------------------------------------------------------

    pub fn on_wakeup_timer(&mut self, now: SimTime) {
        if !self.wakeup_timer_is_armed {
            trace!("Stale wakeup at {now}");
            return;
        }
        self.wakeup_timer_is_armed = false;
        self.wakeup_timer_expiration = INFINITE_TIME;

        match self.state {
            MacState::WaitingForNavExpiration => self.process_nav_expiration(now),
            MacState::WaitingForIfsAndBackoff => {
                self.process_interframe_space_and_backoff_timeout(now)
            }
            MacState::WaitingForCts => self.process_response_timeout(SentFrameKind::Rts, now),
            MacState::WaitingForAck(kind) => self.process_response_timeout(kind, now),
            _ => debug!("Wakeup in state {:?} ignored", self.state),
        }
    }

    fn process_nav_expiration(&mut self, now: SimTime) {
        self.medium_became_idle_time = now;
        self.state = MacState::Transient;
        self.start_backoff_if_necessary(now);
    }

    fn process_response_timeout(&mut self, kind: SentFrameKind, now: SimTime) {
        if self.medium_is_busy {
            // A frame is still in the air; its end resolves the wait.
            return;
        }
        self.state = MacState::BusyMedium;
        self.do_never_received_response_action(kind);

        if now < self.medium_reserved_until {
            self.go_into_wait_for_nav_expiration();
        } else {
            self.medium_became_idle_time = now;
            self.state = MacState::Transient;
            self.start_backoff_if_necessary(now);
        }
    }

    fn process_interframe_space_and_backoff_timeout(&mut self, now: SimTime) {
        debug_assert!(self.state == MacState::WaitingForIfsAndBackoff);
        let mut frame_was_sent = false;

        for index in (0..self.categories.len()).rev() {
            if self.categories[index].current_nonextended_backoff_duration == INFINITE_TIME {
                continue;
            }
            let start = self.categories[index].ifs_and_backoff_start_time;
            let elapsed = now.saturating_sub(start);
            let used = self.number_backoff_slots_used(elapsed, index);
            let remaining = self.categories[index]
                .current_num_backoff_slots
                .saturating_sub(used);
            self.categories[index].current_num_backoff_slots = remaining;

            if remaining == 0 && !frame_was_sent {
                self.categories[index].current_nonextended_backoff_duration = INFINITE_TIME;
                self.categories[index].trying_to_jump_on_medium = false;
                let has_frame = !self.categories[index].in_flight.is_none()
                    || self.there_are_queued_packets_for_category(index);
                self.categories[index].has_packet_to_send = has_frame;
                if has_frame {
                    self.calculate_and_set_transmit_opportunity(index, now);
                    let outcome =
                        self.transmit_a_frame(index, false, self.rx_tx_turnaround_time, now);
                    frame_was_sent = outcome == TransmitOutcome::Sent;
                }
            } else if self.categories[index].trying_to_jump_on_medium {
                // Another category got the medium first.
                self.categories[index].trying_to_jump_on_medium = false;
                self.categories[index].current_nonextended_backoff_duration = INFINITE_TIME;
                self.start_packet_send_process_for_category(index, true, now);
            } else if remaining == 0 {
                self.perform_internal_collision_backoff(index);
            } else {
                self.categories[index].current_nonextended_backoff_duration =
                    self.backoff_duration_for_slots(index, remaining);
            }
        }

        if !frame_was_sent {
            self.state = MacState::Transient;
            self.start_backoff_if_necessary(now);
        }
    }

    fn perform_internal_collision_backoff(&mut self, index: usize) {
        debug!("Internal collision on access category {index}");
        self.categories[index].double_contention_window();
        self.recalculate_random_backoff(index);
        self.stats.internal_collisions += 1;
    }

    // ------------------------------------------------------------------
    // Transmission completion
    // ------------------------------------------------------------------

    pub fn on_transmission_complete(&mut self, now: SimTime) {
        self.transmission_in_progress = false;
        match self.state {
            MacState::WaitingForCts => self.schedule_wakeup(now + self.cts_timeout_duration),
            MacState::WaitingForAck(_) => self.schedule_wakeup(now + self.ack_timeout_duration),
            MacState::CtsOrAckTransmission => self.state = MacState::BusyMedium,
            MacState::ChangingChannels => {
                self.state = MacState::BusyMedium;
                self.start_packet_send_process_for_category(
                    self.last_sent_category_index,
                    false,
                    now,
                );
                if let Some(channels) = self.switching_to_this_channel_list.take() {
                    self.emit(MacAction::SwitchToChannels { channels });
                }
            }
            MacState::Idle => debug_assert!(!self.can_transmit_now(now)),
            _ => {
                self.state = MacState::BusyMedium;
                if self.last_transmitted_frame_was_a_beacon {
                    self.last_transmitted_frame_was_a_beacon = false;
                    self.emit(MacAction::BeaconTransmitted);
                }
                self.do_successful_transmission_post_processing(true, now);
            }
        }
    }

    fn do_successful_transmission_post_processing(&mut self, was_just_transmitted: bool, now: SimTime) {
        let index = self.last_sent_category_index;

        if now >= self.restricted_access_window_end_time {
            debug_assert!(self.state == MacState::BusyMedium);
            self.start_packet_send_process_for_category(index, true, now);
            return;
        }
        if self.transmit_opportunity_end_time == ZERO_TIME {
            self.start_packet_send_process_for_category(index, true, now);
            return;
        }
        let next_duration = self.calculate_next_frame_sequence_duration(index);
        if next_duration == ZERO_TIME || now + next_duration > self.transmit_opportunity_end_time {
            self.transmit_opportunity_end_time = ZERO_TIME;
            self.start_packet_send_process_for_category(index, true, now);
            return;
        }

        let delay = if was_just_transmitted {
            self.delay_between_consecutive_frames
        } else {
            self.sifs_duration
        };
        let outcome = self.transmit_a_frame(index, true, delay, now);
        debug_assert!(outcome == TransmitOutcome::Sent);
    }

    // ------------------------------------------------------------------
    // Backoff machinery
    // ------------------------------------------------------------------

    fn can_transmit_now(&self, now: SimTime) -> bool {
        now < self.restricted_access_window_end_time
    }

    fn access_category_is_active(&self, index: usize) -> bool {
        self.categories[index].current_nonextended_backoff_duration != INFINITE_TIME
            || self.categories[index].has_packet_to_send
    }

    fn there_are_queued_packets_for_category(&self, index: usize) -> bool {
        if index == self.management_category_index && !self.management_frame_queue.is_empty() {
            return true;
        }
        self.categories[index]
            .priorities
            .iter()
            .any(|&priority| self.network_queue.has_packet_with_priority(priority))
    }

    /// Start contention for one category after its queue went from empty
    /// to non-empty, or restart it after a transmission attempt
    fn start_packet_send_process_for_category(
        &mut self,
        index: usize,
        force_restart: bool,
        now: SimTime,
    ) {
        self.categories[index].trying_to_jump_on_medium = false;
        if self.categories[index].in_flight.is_none() {
            let queued = self.there_are_queued_packets_for_category(index);
            self.categories[index].has_packet_to_send = queued;
        }
        if !force_restart && !self.categories[index].has_packet_to_send {
            self.categories[index].current_nonextended_backoff_duration = INFINITE_TIME;
            return;
        }
        debug_assert!(
            self.categories[index].current_nonextended_backoff_duration == INFINITE_TIME
        );

        match self.state {
            MacState::Idle | MacState::WaitingForIfsAndBackoff => {
                if self.restricted_access_window_end_time == INFINITE_TIME {
                    if self.disable_jump_on_medium_without_backoff {
                        self.recalculate_random_backoff(index);
                    } else {
                        debug_assert!(!force_restart);
                        let jump_duration = self.jump_duration(index, now);
                        let category = &mut self.categories[index];
                        category.current_num_backoff_slots = 0;
                        category.current_nonextended_backoff_duration = jump_duration;
                        category.trying_to_jump_on_medium = true;
                    }
                    self.start_backoff_for_category(index, now);
                } else {
                    self.recalculate_random_backoff(index);
                    let duration = self.current_backoff_duration();
                    if now < self.restricted_access_window_end_time
                        && now.saturating_add(duration) < self.restricted_access_window_end_time
                    {
                        self.start_backoff_for_category(index, now);
                    }
                }
            }
            _ => self.recalculate_random_backoff(index),
        }
    }

    /// Arm backoff for every category holding a finite duration
    fn start_backoff_if_necessary(&mut self, now: SimTime) {
        debug_assert!(self.state == MacState::Transient);
        if !self.can_transmit_now(now) {
            self.state = MacState::Idle;
            return;
        }
        let duration = self.current_backoff_duration();
        if duration == INFINITE_TIME {
            self.state = MacState::Idle;
            return;
        }
        if now.saturating_add(duration) >= self.restricted_access_window_end_time {
            self.state = MacState::Idle;
            return;
        }

        self.state = MacState::WaitingForIfsAndBackoff;
        for category in &mut self.categories {
            category.ifs_and_backoff_start_time =
                if category.current_nonextended_backoff_duration != INFINITE_TIME {
                    now
                } else {
                    INFINITE_TIME
                };
        }
        self.schedule_wakeup(now + duration);
    }

    fn start_backoff_for_category(&mut self, index: usize, now: SimTime) {
        debug_assert!(matches!(
            self.state,
            MacState::Idle | MacState::WaitingForIfsAndBackoff
        ));
        self.state = MacState::WaitingForIfsAndBackoff;
        self.categories[index].ifs_and_backoff_start_time = now;
        let expiration = self.current_backoff_expiration_time();
        debug_assert!(expiration < self.restricted_access_window_end_time);
        if expiration != self.wakeup_timer_expiration {
            self.schedule_wakeup(expiration);
        }
    }

    /// Shortest pending backoff duration over all categories
    fn current_backoff_duration(&self) -> SimTime {
        let mut shortest = INFINITE_TIME;
        for category in self.categories.iter().rev() {
            if category.current_nonextended_backoff_duration < shortest {
                shortest = category.current_nonextended_backoff_duration;
            }
        }
        if shortest != INFINITE_TIME && self.last_frame_received_was_corrupt {
            shortest += self.extended_interframe_space_extra_duration;
        }
        shortest
    }

    /// Earliest absolute expiration over all running categories
    fn current_backoff_expiration_time(&self) -> SimTime {
        let mut earliest = INFINITE_TIME;
        for category in self.categories.iter().rev() {
            if category.ifs_and_backoff_start_time != INFINITE_TIME
                && category.current_nonextended_backoff_duration != INFINITE_TIME
            {
                let expiration = category.ifs_and_backoff_start_time
                    + category.current_nonextended_backoff_duration;
                if expiration < earliest {
                    earliest = expiration;
                }
            }
        }
        if earliest != INFINITE_TIME && self.last_frame_received_was_corrupt {
            earliest += self.extended_interframe_space_extra_duration;
        }
        earliest
    }

    fn recalculate_random_backoff(&mut self, index: usize) {
        let Self {
            categories, rng, ..
        } = self;
        categories[index].draw_backoff_slots(rng);
        let slots = self.categories[index].current_num_backoff_slots;
        self.categories[index].current_nonextended_backoff_duration =
            self.backoff_duration_for_slots(index, slots);
    }

    fn backoff_duration_for_slots(&self, index: usize, slots: u32) -> SimTime {
        let aifs_slots = u64::from(self.categories[index].arbitration_interframe_space_slots);
        (self.sifs_duration + self.slot_duration * (aifs_slots + u64::from(slots)))
            .saturating_sub(self.rx_tx_turnaround_time)
    }

    /// Time until the next slot boundary when grabbing an already idle
    /// medium without drawing a random backoff
    fn jump_duration(&self, index: usize, now: SimTime) -> SimTime {
        let aifs_slots = u64::from(self.categories[index].arbitration_interframe_space_slots);
        let interframe = (self.sifs_duration + self.slot_duration * aifs_slots)
            .saturating_sub(self.rx_tx_turnaround_time);
        let ready_time = self.medium_became_idle_time + interframe;
        if ready_time >= now {
            ready_time - now
        } else {
            self.slot_duration - ((now - ready_time) % self.slot_duration)
        }
    }

    fn number_backoff_slots_used(&self, elapsed: SimTime, index: usize) -> u32 {
        let aifs_slots = u64::from(self.categories[index].arbitration_interframe_space_slots);
        let mut interframe = self.sifs_duration + self.slot_duration * aifs_slots;
        if self.last_frame_received_was_corrupt {
            interframe += self.extended_interframe_space_extra_duration;
        }
        if elapsed <= interframe {
            return 0;
        }
        ((elapsed + self.rx_tx_turnaround_time - interframe) / self.slot_duration) as u32
    }

    // ------------------------------------------------------------------
    // Transmit pipeline
    // ------------------------------------------------------------------

    fn calculate_and_set_transmit_opportunity(&mut self, index: usize, now: SimTime) {
        self.transmit_opportunity_acked_frame_count = 0;
        let duration = self.categories[index].transmit_opportunity_duration;
        self.transmit_opportunity_end_time = if duration == ZERO_TIME {
            ZERO_TIME
        } else {
            std::cmp::min(now + duration, self.restricted_access_window_end_time)
        };
    }

    fn transmit_a_frame(
        &mut self,
        index: usize,
        do_not_request_to_send: bool,
        delay: SimTime,
        now: SimTime,
    ) -> TransmitOutcome {
        self.last_transmitted_frame_was_a_beacon = false;

        if self.categories[index].in_flight.is_none() {
            let management_frame = if index == self.management_category_index {
                self.management_frame_queue.pop_front()
            } else {
                None
            };
            match management_frame {
                Some(frame) => {
                    self.last_transmitted_frame_was_a_beacon =
                        frame.frame_type == FrameType::Beacon;
                    let category = &mut self.categories[index];
                    category.short_frame_retry_count = 0;
                    category.long_frame_retry_count = 0;
                    category.in_flight = InFlight::Single(OutgoingFrame::Management(frame));
                }
                None => {
                    if !self.retrieve_packet_from_network_layer(index, now) {
                        self.categories[index].has_packet_to_send = false;
                        return TransmitOutcome::NothingToSend;
                    }
                }
            }
        }

        let destination = match self.categories[index].in_flight.destination() {
            Some(address) => address,
            None => {
                self.categories[index].has_packet_to_send = false;
                return TransmitOutcome::NothingToSend;
            }
        };
        let is_management = matches!(
            self.categories[index].in_flight,
            InFlight::Single(OutgoingFrame::Management(_))
        );
        let tx_parameters = if is_management {
            self.rate_controller.management_tx_parameters(destination)
        } else {
            self.rate_controller.data_tx_parameters(destination)
        };
        let power_dbm = self.power_controller.current_transmit_power_dbm(destination);

        if matches!(self.categories[index].in_flight, InFlight::Aggregate(_)) {
            if self.protect_aggregates_with_single_acked_frame
                && self.transmit_opportunity_acked_frame_count == 0
            {
                // Pull the first subframe out and send it alone; the rest
                // of the aggregate follows once the link is confirmed.
                if let InFlight::Aggregate(mut aggregate) = self.categories[index].in_flight.take()
                {
                    let lead = aggregate.subframes.remove(0);
                    let wire_length = DataFrameHeader::DATA_SIZE + lead.payload.len();
                    let aggregate_retries = self.categories[index].aggregate_frame_retry_count;
                    let category = &mut self.categories[index];
                    if (wire_length as u32) < self.rts_threshold_size_bytes {
                        category.short_frame_retry_count = aggregate_retries;
                        category.long_frame_retry_count = 0;
                    } else {
                        category.short_frame_retry_count = 0;
                        category.long_frame_retry_count = aggregate_retries;
                    }
                    category.in_flight = if aggregate.subframes.is_empty() {
                        InFlight::Single(OutgoingFrame::Data(lead))
                    } else {
                        InFlight::LeadFrame {
                            lead,
                            remainder: aggregate,
                        }
                    };
                }
            } else {
                self.last_sent_destination = destination;
                return self.transmit_an_aggregate_frame(
                    index,
                    destination,
                    tx_parameters,
                    power_dbm,
                    delay,
                );
            }
        }

        let traffic_id = self.in_flight_traffic_id(index);
        if self
            .outgoing_links
            .block_ack_request_is_pending(destination, traffic_id)
        {
            self.last_sent_category_index = index;
            self.last_sent_destination = destination;
            return self.transmit_a_block_ack_request(index, destination, traffic_id, delay);
        }

        let frame_wire_length = match &self.categories[index].in_flight {
            InFlight::Single(OutgoingFrame::Data(packet)) => {
                DataFrameHeader::DATA_SIZE + packet.payload.len()
            }
            InFlight::LeadFrame { lead, .. } => DataFrameHeader::DATA_SIZE + lead.payload.len(),
            InFlight::Single(OutgoingFrame::Management(frame)) => frame.frame_bytes.len(),
            InFlight::Aggregate(_) | InFlight::None => {
                debug_assert!(false, "single frame transmit with nothing in flight");
                return TransmitOutcome::NothingToSend;
            }
        };
        let kind = if (frame_wire_length as u32) < self.rts_threshold_size_bytes {
            SentFrameKind::Short
        } else {
            SentFrameKind::Long
        };

        let frame_needs_to_be_acked;
        let duration;
        let is_retry;

        if is_group_address(destination) {
            self.categories[index].reset_contention_window();
            frame_needs_to_be_acked = false;
            duration = 0;
            is_retry = false;
            self.state = MacState::BusyMedium;
        } else if do_not_request_to_send
            || (frame_wire_length as u32) < self.rts_threshold_size_bytes
        {
            let category = &self.categories[index];
            is_retry = match kind {
                SentFrameKind::Short => category.short_frame_retry_count > 0,
                _ => category.long_frame_retry_count > 0,
            };
            duration = self.acked_data_nav_duration(&tx_parameters);
            frame_needs_to_be_acked = true;
            self.state = MacState::WaitingForAck(kind);
        } else {
            // Reserve the medium with an RTS before the frame itself.
            let mut request = RtsFrame::new(destination, self.mac_address);
            request.header.frame_control.is_retry =
                self.categories[index].short_frame_retry_count > 0;
            request.header.duration = self.request_to_send_nav_duration(
                destination,
                frame_wire_length,
                &tx_parameters,
            );
            let request_tx_parameters = self.rate_controller.management_tx_parameters(destination);
            let mut request_buffer =
                match build_frame(RtsFrame::SIZE, |cursor| request.serialize(cursor)) {
                    Ok(buffer) => buffer,
                    Err(error) => {
                        warn!("RTS serialization failed: {error}");
                        return TransmitOutcome::NothingToSend;
                    }
                };

            if self.transmit_opportunity_end_time != ZERO_TIME {
                let request_end_time = now
                    + delay
                    + self.frame_air_duration(&request_tx_parameters, RtsFrame::SIZE);
                self.add_extra_nav_to_frame(index, request_end_time, &mut request_buffer);
            }

            self.last_sent_category_index = index;
            self.last_sent_destination = destination;
            self.state = MacState::WaitingForCts;
            self.stats.control_frames_sent += 1;
            self.transmission_in_progress = true;
            self.emit(MacAction::TransmitFrame {
                frame: request_buffer,
                tx_parameters: request_tx_parameters,
                power_dbm,
                delay,
            });
            return TransmitOutcome::Sent;
        }

        let serialized = match &self.categories[index].in_flight {
            InFlight::Single(OutgoingFrame::Data(packet)) => {
                self.serialize_data_frame(packet, duration, is_retry)
            }
            InFlight::LeadFrame { lead, .. } => self.serialize_data_frame(lead, duration, is_retry),
            InFlight::Single(OutgoingFrame::Management(frame)) => {
                let mut buffer = frame.frame_bytes.clone();
                patch_common_header(buffer.bytes_mut(), duration, is_retry);
                Ok(buffer)
            }
            InFlight::Aggregate(_) | InFlight::None => {
                return TransmitOutcome::NothingToSend;
            }
        };
        let mut frame_buffer = match serialized {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!("Frame serialization failed: {error}");
                return TransmitOutcome::NothingToSend;
            }
        };

        if self.transmit_opportunity_end_time != ZERO_TIME
            || self.restricted_access_window_end_time != INFINITE_TIME
        {
            let mut sequence_end_time = now
                + delay
                + self.frame_air_duration(&tx_parameters, frame_buffer.len())
                + self.air_propagation_time;
            if frame_needs_to_be_acked {
                sequence_end_time += time_from_duration_field(duration) + self.air_propagation_time;
            }
            if sequence_end_time > self.restricted_access_window_end_time {
                self.do_transmission_too_long_for_window_action(index);
                return TransmitOutcome::TooLongForRestrictedAccessWindow;
            }
            if self.transmit_opportunity_end_time != ZERO_TIME {
                self.add_extra_nav_to_frame(index, sequence_end_time, &mut frame_buffer);
            }
        }

        self.last_sent_category_index = index;
        self.last_sent_destination = destination;
        if is_management {
            self.stats.management_frames_sent += 1;
        } else {
            self.stats.data_frames_sent += 1;
            self.stats.data_bytes_sent += frame_buffer.len() as u64;
        }
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitFrame {
            frame: frame_buffer,
            tx_parameters,
            power_dbm,
            delay,
        });
        if !frame_needs_to_be_acked {
            self.categories[index].in_flight = InFlight::None;
        }
        TransmitOutcome::Sent
    }

    fn transmit_an_aggregate_frame(
        &mut self,
        index: usize,
        destination: MacAddress,
        tx_parameters: TxParameters,
        power_dbm: f64,
        delay: SimTime,
    ) -> TransmitOutcome {
        let duration = self.acked_aggregate_nav_duration(&tx_parameters);
        let is_retry = self.categories[index].aggregate_frame_retry_count > 0;

        let subframe_buffers = {
            let aggregate = match &self.categories[index].in_flight {
                InFlight::Aggregate(aggregate) => aggregate,
                _ => {
                    debug_assert!(false, "aggregate transmit with no aggregate in flight");
                    return TransmitOutcome::NothingToSend;
                }
            };
            let count = aggregate.subframes.len();
            let mut buffers = Vec::with_capacity(count);
            for (position, subframe) in aggregate.subframes.iter().enumerate() {
                let mut buffer = match self.serialize_data_frame(subframe, duration, is_retry) {
                    Ok(buffer) => buffer,
                    Err(error) => {
                        warn!("Aggregate subframe serialization failed: {error}");
                        return TransmitOutcome::NothingToSend;
                    }
                };
                let delimiter = MpduDelimiter::new(buffer.len() as u16);
                {
                    let mut cursor = buffer.push_front(MpduDelimiter::SIZE);
                    if let Err(error) = delimiter.serialize(&mut cursor) {
                        warn!("Aggregate delimiter serialization failed: {error}");
                        return TransmitOutcome::NothingToSend;
                    }
                }
                if position + 1 < count {
                    let padded_length = align_to_four(buffer.len());
                    buffer.add_trailing_padding(padded_length - buffer.len());
                }
                buffers.push(buffer);
            }
            buffers
        };

        trace!(
            "Aggregate of {} subframes to {destination}",
            subframe_buffers.len()
        );
        self.last_sent_category_index = index;
        self.state = MacState::WaitingForAck(SentFrameKind::Aggregate);
        self.stats.aggregate_frames_sent += 1;
        self.stats.aggregate_subframes_sent += subframe_buffers.len() as u64;
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitAggregateFrame {
            subframes: subframe_buffers,
            tx_parameters,
            power_dbm,
            delay,
        });
        TransmitOutcome::Sent
    }

    fn transmit_a_block_ack_request(
        &mut self,
        index: usize,
        destination: MacAddress,
        traffic_id: u8,
        delay: SimTime,
    ) -> TransmitOutcome {
        let starting_sequence_number = self
            .outgoing_links
            .block_ack_request_start(destination, traffic_id);
        let tx_parameters = self.rate_controller.management_tx_parameters(destination);
        let power_dbm = self.power_controller.current_transmit_power_dbm(destination);

        let mut request = BlockAckRequestFrame::new(
            destination,
            self.mac_address,
            traffic_id,
            starting_sequence_number,
        );
        request.header.duration = self.acked_aggregate_nav_duration(&tx_parameters);
        request.header.frame_control.is_retry =
            self.categories[index].short_frame_retry_count > 0;

        let buffer = match build_frame(BlockAckRequestFrame::SIZE, |cursor| {
            request.serialize(cursor)
        }) {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!("Block-Ack Request serialization failed: {error}");
                return TransmitOutcome::NothingToSend;
            }
        };

        trace!(
            "Block-Ack Request to {destination} tid {traffic_id} starting at {starting_sequence_number}"
        );
        self.state = MacState::WaitingForAck(SentFrameKind::BlockAckRequest);
        self.stats.control_frames_sent += 1;
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitFrame {
            frame: buffer,
            tx_parameters,
            power_dbm,
            delay,
        });
        TransmitOutcome::Sent
    }

    /// Move the head of the network queue into the category, opening a
    /// Block-Ack session or building an aggregate when conditions allow
    fn retrieve_packet_from_network_layer(&mut self, index: usize, now: SimTime) -> bool {
        let priorities = self.categories[index].priorities.clone();
        let lifetime = self.categories[index].frame_lifetime;

        for priority in priorities {
            while let Some(packet) = self.network_queue.dequeue_with_priority(priority) {
                if packet.age(now) > lifetime {
                    self.stats.packets_dropped_lifetime += 1;
                    debug!("Frame exceeded its queueing lifetime, dropping");
                    self.emit(MacAction::PacketUndeliverable {
                        payload: packet.payload,
                        next_hop_address: packet.next_hop_address,
                    });
                    continue;
                }
                let destination = match self.next_hop_resolver.resolve(packet.next_hop_address) {
                    Some(address) => address,
                    None => {
                        self.stats.packets_dropped_unresolvable += 1;
                        debug!(
                            "No link-layer address for {}, dropping",
                            packet.next_hop_address
                        );
                        self.emit(MacAction::PacketUndeliverable {
                            payload: packet.payload,
                            next_hop_address: packet.next_hop_address,
                        });
                        continue;
                    }
                };

                let wire_length = (DataFrameHeader::DATA_SIZE + packet.payload.len()) as u32;
                {
                    let category = &mut self.categories[index];
                    if wire_length < self.rts_threshold_size_bytes {
                        category.short_frame_retry_count = packet.retry_count;
                        category.long_frame_retry_count = 0;
                    } else {
                        category.short_frame_retry_count = 0;
                        category.long_frame_retry_count = packet.retry_count;
                    }
                }

                let aggregation_wanted = !packet.is_a_requeue
                    && self.aggregation_is_enabled_for(destination)
                    && !self
                        .outgoing_links
                        .block_ack_request_is_pending(destination, priority)
                    && (self.allow_aggregation_with_txop_zero
                        || self.transmit_opportunity_end_time != ZERO_TIME)
                    && (!self.protect_aggregates_with_single_acked_frame
                        || self.transmit_opportunity_acked_frame_count > 0
                        || is_group_address(destination));

                // Session setup has to happen before this frame draws its
                // own number so the announced window starts at this frame.
                let session_is_new = aggregation_wanted
                    && !self
                        .outgoing_links
                        .block_ack_session_is_enabled(destination, priority);
                if session_is_new {
                    self.outgoing_links
                        .begin_block_ack_session(destination, priority);
                }

                let sequence_number = if packet.is_a_requeue {
                    packet.sequence_number
                } else {
                    self.outgoing_links
                        .new_sequence_number(destination, priority, true)
                };

                self.categories[index].in_flight =
                    InFlight::Single(OutgoingFrame::Data(DataPacket {
                        payload: packet.payload,
                        ether_type: packet.ether_type,
                        next_hop_address: packet.next_hop_address,
                        destination,
                        traffic_id: priority,
                        sequence_number,
                        queued_at: packet.queued_at,
                    }));

                if aggregation_wanted && !session_is_new {
                    self.build_aggregate_from_current(index, now);
                }
                return true;
            }
        }
        false
    }

    fn aggregation_is_enabled_for(&self, destination: MacAddress) -> bool {
        self.max_aggregate_size_bytes > 0
            && self.aggregation_capable_neighbors.contains(&destination)
    }

    fn build_aggregate_from_current(&mut self, index: usize, now: SimTime) {
        debug_assert!(
            self.allow_aggregation_with_txop_zero
                || self.transmit_opportunity_end_time != ZERO_TIME
        );

        let first = match self.categories[index].in_flight.take() {
            InFlight::Single(OutgoingFrame::Data(packet)) => packet,
            other => {
                self.categories[index].in_flight = other;
                return;
            }
        };
        {
            let category = &mut self.categories[index];
            category.short_frame_retry_count = 0;
            category.long_frame_retry_count = 0;
            category.aggregate_frame_retry_count = 0;
        }

        let destination = first.destination;
        let priority = first.traffic_id;
        let next_hop_address = first.next_hop_address;
        let tx_parameters = self.rate_controller.data_tx_parameters(destination);

        let first_wire_length =
            MpduDelimiter::SIZE + DataFrameHeader::DATA_SIZE + first.payload.len();
        let mut total_bytes = align_to_four(first_wire_length);
        let mut sequence_end_time = now
            + self.frame_air_duration(&tx_parameters, first_wire_length)
            + self.sifs_duration
            + self.frame_air_duration(&tx_parameters, BlockAckFrame::SIZE);

        let window_room = self
            .outgoing_links
            .frames_left_in_window(destination, priority);
        let max_subframes = usize::from(window_room) + 1;

        let mut subframes = vec![first];
        while subframes.len() < max_subframes {
            let opportunity_is_open = (self.allow_aggregation_with_txop_zero
                && self.transmit_opportunity_end_time == ZERO_TIME)
                || sequence_end_time < self.transmit_opportunity_end_time;
            if !opportunity_is_open {
                break;
            }
            if self.network_queue.next_hop_for_top_packet(priority) != Some(next_hop_address) {
                break;
            }
            if self.network_queue.next_packet_is_a_retry(priority) {
                break;
            }
            let payload_length = match self.network_queue.top_packet_size(priority) {
                Some(length) => length,
                None => break,
            };
            let candidate_wire_length =
                MpduDelimiter::SIZE + DataFrameHeader::DATA_SIZE + payload_length;
            if total_bytes + candidate_wire_length > self.max_aggregate_size_bytes {
                break;
            }
            sequence_end_time += tx_parameters.frame_duration(candidate_wire_length);
            if !self.allow_aggregation_with_txop_zero
                && sequence_end_time >= self.transmit_opportunity_end_time
            {
                break;
            }

            let packet = match self.network_queue.dequeue_with_priority(priority) {
                Some(packet) => packet,
                None => break,
            };
            let sequence_number =
                self.outgoing_links
                    .new_sequence_number(destination, priority, false);
            subframes.push(DataPacket {
                payload: packet.payload,
                ether_type: packet.ether_type,
                next_hop_address: packet.next_hop_address,
                destination,
                traffic_id: priority,
                sequence_number,
                queued_at: packet.queued_at,
            });
            total_bytes += align_to_four(candidate_wire_length);
        }

        if subframes.len() > 1 {
            self.categories[index].in_flight = InFlight::Aggregate(AggregateFrame {
                destination,
                traffic_id: priority,
                subframes,
            });
        } else if let Some(single) = subframes.pop() {
            self.categories[index].in_flight = InFlight::Single(OutgoingFrame::Data(single));
        }
    }

    fn in_flight_traffic_id(&self, index: usize) -> u8 {
        match &self.categories[index].in_flight {
            InFlight::Single(OutgoingFrame::Data(packet)) => packet.traffic_id,
            InFlight::LeadFrame { lead, .. } => lead.traffic_id,
            InFlight::Aggregate(aggregate) => aggregate.traffic_id,
            InFlight::Single(OutgoingFrame::Management(_)) | InFlight::None => {
                self.network_queue.max_priority()
            }
        }
    }

    fn serialize_data_frame(
        &self,
        packet: &DataPacket,
        duration: DurationField,
        is_retry: bool,
    ) -> Result<FrameBuffer> {
        let mut header = DataFrameHeader::new_data(
            packet.destination,
            self.mac_address,
            packet.sequence_number,
            packet.traffic_id,
            packet.ether_type,
        );
        header.header.duration = duration;
        header.header.frame_control.is_retry = is_retry;

        let mut buffer = packet.payload.clone();
        {
            let mut cursor = buffer.push_front(DataFrameHeader::DATA_SIZE);
            header.serialize(&mut cursor)?;
        }
        Ok(buffer)
    }

    /// Reservation carried by an acked data frame: SIFS plus the ACK
    fn acked_data_nav_duration(&self, tx_parameters: &TxParameters) -> DurationField {
        let acknowledgement_length = if self.use_ndp_control_frames {
            0
        } else {
            AckFrame::SIZE
        };
        duration_field_from_time(
            self.sifs_duration + self.frame_air_duration(tx_parameters, acknowledgement_length),
        )
    }

    /// Reservation carried by an aggregate or Block-Ack Request: SIFS plus
    /// the Block-Ack response
    fn acked_aggregate_nav_duration(&self, tx_parameters: &TxParameters) -> DurationField {
        duration_field_from_time(
            self.sifs_duration + self.frame_air_duration(tx_parameters, BlockAckFrame::SIZE),
        )
    }

    fn request_to_send_nav_duration(
        &mut self,
        destination: MacAddress,
        data_frame_length: usize,
        data_tx_parameters: &TxParameters,
    ) -> DurationField {
        let clear_to_send_length = if self.use_ndp_control_frames {
            0
        } else {
            CtsFrame::SIZE
        };
        let acknowledgement_length = if self.use_ndp_control_frames {
            0
        } else {
            AckFrame::SIZE
        };
        let management_tx_parameters = self.rate_controller.management_tx_parameters(destination);
        let response_tx_parameters = self.rate_controller.response_tx_parameters(data_tx_parameters);
        let total = self.sifs_duration
            + self.frame_air_duration(&management_tx_parameters, clear_to_send_length)
            + self.sifs_duration
            + self.frame_air_duration(data_tx_parameters, data_frame_length)
            + self.sifs_duration
            + self.frame_air_duration(&response_tx_parameters, acknowledgement_length);
        duration_field_from_time(total)
    }

    fn frame_air_duration(&self, tx_parameters: &TxParameters, length_bytes: usize) -> SimTime {
        self.phy_header_duration + tx_parameters.frame_duration(length_bytes)
    }

    /// Extend the duration field of an outgoing frame to cover the next
    /// frame exchange of this transmit opportunity
    fn add_extra_nav_to_frame(
        &mut self,
        index: usize,
        frame_end_time: SimTime,
        buffer: &mut FrameBuffer,
    ) {
        debug_assert!(self.transmit_opportunity_end_time != ZERO_TIME);
        let next_duration = self.calculate_next_frame_sequence_duration(index);
        if next_duration == ZERO_TIME {
            return;
        }

        let bytes = buffer.bytes_mut();
        if bytes.len() < CommonFrameHeader::SIZE {
            return;
        }
        let current = DurationField::from_le_bytes([bytes[2], bytes[3]]);
        let current_end = frame_end_time + time_from_duration_field(current);
        if current_end + next_duration > self.transmit_opportunity_end_time {
            return;
        }
        let updated =
            duration_field_from_time(time_from_duration_field(current) + next_duration);
        bytes[2..4].copy_from_slice(&updated.to_le_bytes());
    }

    /// Air time the next frame of this category would need, including its
    /// acknowledgement, or zero when nothing is pending
    fn calculate_next_frame_sequence_duration(&mut self, index: usize) -> SimTime {
        enum NextFrame {
            AtManagementRate {
                destination: MacAddress,
                length: usize,
            },
            Queued {
                next_hop_address: NetworkAddress,
                length: usize,
            },
            Nothing,
        }

        let next = {
            let category = &self.categories[index];
            match &category.in_flight {
                InFlight::Single(OutgoingFrame::Data(packet)) => NextFrame::AtManagementRate {
                    destination: packet.destination,
                    length: DataFrameHeader::DATA_SIZE + packet.payload.len(),
                },
                InFlight::LeadFrame { lead, .. } => NextFrame::AtManagementRate {
                    destination: lead.destination,
                    length: DataFrameHeader::DATA_SIZE + lead.payload.len(),
                },
                InFlight::Single(OutgoingFrame::Management(frame)) => {
                    NextFrame::AtManagementRate {
                        destination: frame.destination,
                        length: frame.frame_bytes.len(),
                    }
                }
                InFlight::Aggregate(aggregate) => NextFrame::AtManagementRate {
                    destination: aggregate.destination,
                    length: aggregate
                        .subframes
                        .iter()
                        .map(|subframe| {
                            align_to_four(
                                MpduDelimiter::SIZE
                                    + DataFrameHeader::DATA_SIZE
                                    + subframe.payload.len(),
                            )
                        })
                        .sum(),
                },
                InFlight::None => {
                    let management_head = if index == self.management_category_index {
                        self.management_frame_queue.front()
                    } else {
                        None
                    };
                    match management_head {
                        Some(frame) => NextFrame::AtManagementRate {
                            destination: frame.destination,
                            length: frame.frame_bytes.len(),
                        },
                        None => {
                            let mut queued = NextFrame::Nothing;
                            for &priority in &category.priorities {
                                let size = self.network_queue.top_packet_size(priority);
                                let next_hop =
                                    self.network_queue.next_hop_for_top_packet(priority);
                                if let (Some(size), Some(next_hop_address)) = (size, next_hop) {
                                    queued = NextFrame::Queued {
                                        next_hop_address,
                                        length: DataFrameHeader::DATA_SIZE + size,
                                    };
                                    break;
                                }
                            }
                            queued
                        }
                    }
                }
            }
        };

        let (tx_parameters, destination, length) = match next {
            NextFrame::Nothing => return ZERO_TIME,
            NextFrame::AtManagementRate {
                destination,
                length,
            } => (
                self.rate_controller.management_tx_parameters(destination),
                destination,
                length,
            ),
            NextFrame::Queued {
                next_hop_address,
                length,
            } => match self.next_hop_resolver.resolve(next_hop_address) {
                Some(destination) => (
                    self.rate_controller.data_tx_parameters(destination),
                    destination,
                    length,
                ),
                None => return ZERO_TIME,
            },
        };

        let mut total = self.frame_air_duration(&tx_parameters, length) + self.sifs_duration;
        if !is_group_address(destination) {
            total += time_from_duration_field(self.acked_data_nav_duration(&tx_parameters));
        }
        total
    }

    fn do_transmission_too_long_for_window_action(&mut self, index: usize) {
        debug!("Frame sequence does not fit in the access window, standing down");
        self.restricted_access_window_end_time = ZERO_TIME;
        self.state = MacState::Idle;
        self.recalculate_random_backoff(index);
        self.categories[index].trying_to_jump_on_medium = false;
        self.stats.transmissions_aborted_for_raw += 1;
    }

    // ------------------------------------------------------------------
    // Retry handling
    // ------------------------------------------------------------------

    /// Account for a response that never arrived. The caller has already
    /// left the waiting state and passes the kind of frame that failed.
    fn do_never_received_response_action(&mut self, kind: SentFrameKind) {
        debug_assert!(!matches!(
            self.state,
            MacState::WaitingForCts | MacState::WaitingForAck(_)
        ));
        if self.wakeup_timer_is_armed {
            self.cancel_wakeup_timer();
        }
        let index = self.last_sent_category_index;
        self.categories[index].double_contention_window();
        self.recalculate_random_backoff(index);

        let destination = self.categories[index]
            .in_flight
            .destination()
            .unwrap_or(self.last_sent_destination);
        self.rate_controller.notify_ack_failed(destination);

        match kind {
            SentFrameKind::Rts | SentFrameKind::Short => {
                self.categories[index].short_frame_retry_count += 1;
                if self.categories[index].short_frame_retry_count >= self.short_frame_retry_limit {
                    self.drop_current_packet(index);
                } else {
                    self.stats.frame_retries += 1;
                }
            }
            SentFrameKind::Long => {
                self.categories[index].long_frame_retry_count += 1;
                if self.categories[index].long_frame_retry_count >= self.long_frame_retry_limit {
                    self.drop_current_packet(index);
                } else {
                    self.stats.frame_retries += 1;
                }
            }
            SentFrameKind::Aggregate => {
                self.categories[index].aggregate_frame_retry_count += 1;
                if self.categories[index].aggregate_frame_retry_count
                    >= self.short_frame_retry_limit
                {
                    self.drop_current_aggregate(index);
                } else {
                    self.stats.frame_retries += 1;
                }
            }
            SentFrameKind::BlockAckRequest => {
                self.categories[index].short_frame_retry_count += 1;
                if self.categories[index].short_frame_retry_count >= self.short_frame_retry_limit {
                    match self.categories[index].in_flight {
                        InFlight::Aggregate(_) => self.drop_current_aggregate(index),
                        InFlight::None => {
                            self.categories[index].short_frame_retry_count = 0;
                            self.categories[index].reset_contention_window();
                        }
                        _ => self.drop_current_packet(index),
                    }
                } else {
                    self.stats.frame_retries += 1;
                }
            }
        }
    }

    fn fail_pending_response_wait(&mut self) {
        let kind = match self.state {
            MacState::WaitingForCts => SentFrameKind::Rts,
            MacState::WaitingForAck(kind) => kind,
            _ => return,
        };
        self.state = MacState::BusyMedium;
        self.do_never_received_response_action(kind);
    }

    fn drop_current_packet(&mut self, index: usize) {
        let taken = self.categories[index].in_flight.take();
        let (destination, traffic_id, sequence_number, undeliverable) = match taken {
            InFlight::Single(OutgoingFrame::Data(packet)) => (
                packet.destination,
                packet.traffic_id,
                packet.sequence_number,
                Some((packet.payload, packet.next_hop_address)),
            ),
            InFlight::Single(OutgoingFrame::Management(frame)) => {
                let traffic_id = self.network_queue.max_priority();
                (frame.destination, traffic_id, frame.sequence_number, None)
            }
            InFlight::LeadFrame { lead, remainder } => {
                let info = (
                    lead.destination,
                    lead.traffic_id,
                    lead.sequence_number,
                    Some((lead.payload, lead.next_hop_address)),
                );
                self.categories[index].in_flight = InFlight::Aggregate(remainder);
                info
            }
            other => {
                self.categories[index].in_flight = other;
                debug_assert!(false, "dropping a single frame with none in flight");
                return;
            }
        };

        debug!("Dropping frame {sequence_number} to {destination} after retry limit");
        self.outgoing_links
            .record_dropped_frame(destination, traffic_id, sequence_number);
        self.stats.packets_dropped_retry_limit += 1;
        if let Some((payload, next_hop_address)) = undeliverable {
            self.emit(MacAction::PacketUndeliverable {
                payload,
                next_hop_address,
            });
        }

        let category = &mut self.categories[index];
        category.short_frame_retry_count = 0;
        category.long_frame_retry_count = 0;
        category.reset_contention_window();
        self.recalculate_random_backoff(index);
        let has_frame = !self.categories[index].in_flight.is_none()
            || self.there_are_queued_packets_for_category(index);
        self.categories[index].has_packet_to_send = has_frame;
    }

    fn drop_current_aggregate(&mut self, index: usize) {
        let taken = self.categories[index].in_flight.take();
        let aggregate = match taken {
            InFlight::Aggregate(aggregate) => aggregate,
            other => {
                self.categories[index].in_flight = other;
                debug_assert!(false, "dropping an aggregate with none in flight");
                return;
            }
        };

        debug!(
            "Dropping aggregate of {} subframes to {} after retry limit",
            aggregate.subframes.len(),
            aggregate.destination
        );
        if let Some(last) = aggregate.subframes.last() {
            self.outgoing_links.record_dropped_frame(
                aggregate.destination,
                aggregate.traffic_id,
                last.sequence_number,
            );
        }
        self.stats.packets_dropped_retry_limit += aggregate.subframes.len() as u64;

        self.categories[index].aggregate_frame_retry_count = 0;
        self.categories[index].reset_contention_window();
        self.recalculate_random_backoff(index);
        let has_frame = !self.categories[index].in_flight.is_none()
            || self.there_are_queued_packets_for_category(index);
        self.categories[index].has_packet_to_send = has_frame;
    }

    // ------------------------------------------------------------------
    // Receive pipeline
    // ------------------------------------------------------------------

    pub fn on_frame_received(
        &mut self,
        frame_bytes: &[u8],
        received_tx_parameters: &TxParameters,
        now: SimTime,
    ) {
        self.last_frame_received_was_corrupt = false;

        let header = match peek_common_header(frame_bytes) {
            Ok(header) => header,
            Err(error) => {
                warn!("Undecodable frame header: {error}");
                return;
            }
        };

        if self.frame_is_for_this_node(&header) {
            self.dispatch_frame_for_this_node(&header, frame_bytes, received_tx_parameters, now);
            return;
        }

        // Someone else's exchange; honor the reservation it announces.
        let reservation_end = if header.frame_control.frame_type == FrameType::PowerSavePoll {
            // A PS-Poll carries an association id where the duration
            // field would be, so assume one response frame.
            now + time_from_duration_field(self.acked_data_nav_duration(received_tx_parameters))
        } else {
            now + time_from_duration_field(header.duration)
        };
        if reservation_end > self.medium_reserved_until {
            self.medium_reserved_until = reservation_end;
        }

        let failed = match self.state {
            MacState::WaitingForCts => Some(SentFrameKind::Rts),
            MacState::WaitingForAck(kind) => Some(kind),
            _ => None,
        };
        self.state = MacState::BusyMedium;
        if let Some(kind) = failed {
            self.do_never_received_response_action(kind);
        }
    }

    fn frame_is_for_this_node(&self, header: &CommonFrameHeader) -> bool {
        let receiver = header.receiver;
        receiver == self.mac_address
            || receiver.is_broadcast()
            || (receiver.is_multicast() && self.multicast_addresses.contains(&receiver))
    }

    fn dispatch_frame_for_this_node(
        &mut self,
        header: &CommonFrameHeader,
        frame_bytes: &[u8],
        received_tx_parameters: &TxParameters,
        now: SimTime,
    ) {
        let mut cursor: &[u8] = frame_bytes;
        match header.frame_control.frame_type {
            FrameType::Rts => match RtsFrame::parse(&mut cursor) {
                Ok(request) => {
                    self.process_request_to_send_frame(&request, received_tx_parameters, now)
                }
                Err(error) => warn!("Bad RTS frame: {error}"),
            },
            FrameType::Cts => {
                self.stats.control_frames_received += 1;
                self.process_clear_to_send_frame(now);
            }
            FrameType::Ack => {
                self.stats.control_frames_received += 1;
                self.process_acknowledgement_frame(now);
            }
            FrameType::BlockAck => match BlockAckFrame::parse(&mut cursor) {
                Ok(block_ack) => {
                    self.stats.control_frames_received += 1;
                    self.process_block_ack_frame(&block_ack, now);
                }
                Err(error) => warn!("Bad Block-Ack frame: {error}"),
            },
            FrameType::BlockAckRequest => match BlockAckRequestFrame::parse(&mut cursor) {
                Ok(request) => {
                    self.stats.control_frames_received += 1;
                    self.process_block_ack_request_frame(&request, received_tx_parameters);
                }
                Err(error) => warn!("Bad Block-Ack Request frame: {error}"),
            },
            FrameType::QosData => match DataFrameHeader::parse(&mut cursor) {
                Ok(data_header) => {
                    self.process_data_frame(&data_header, cursor, received_tx_parameters)
                }
                Err(error) => warn!("Bad data frame: {error}"),
            },
            FrameType::QosNull => match DataFrameHeader::parse(&mut cursor) {
                Ok(null_header) => self.process_null_frame(&null_header, received_tx_parameters),
                Err(error) => warn!("Bad null frame: {error}"),
            },
            FrameType::PowerSavePoll => match PsPollFrame::parse(&mut cursor) {
                Ok(poll) => self.process_power_save_poll_frame(&poll, received_tx_parameters),
                Err(error) => warn!("Bad PS-Poll frame: {error}"),
            },
            FrameType::ResourceAllocation => {
                // Window schedules are broadcast and handled a layer up.
                self.stats.management_frames_received += 1;
                self.emit(MacAction::ManagementFrameReceived {
                    frame: FrameBuffer::from_bytes(frame_bytes.to_vec()),
                });
            }
            frame_type if frame_type.is_management_class() => {
                match ManagementFrameHeader::parse(&mut cursor) {
                    Ok(management_header) => self.process_management_frame(
                        &management_header,
                        frame_bytes,
                        received_tx_parameters,
                    ),
                    Err(error) => warn!("Bad management frame: {error}"),
                }
            }
            frame_type => debug!("Ignoring {frame_type:?} frame"),
        }
    }

    fn process_request_to_send_frame(
        &mut self,
        request: &RtsFrame,
        received_tx_parameters: &TxParameters,
        now: SimTime,
    ) {
        self.fail_pending_response_wait();
        self.stats.control_frames_received += 1;

        if now < self.medium_reserved_until {
            trace!(
                "RTS from {} inside another reservation, not answering",
                request.transmitter
            );
            return;
        }

        let mut response = CtsFrame::new(request.transmitter);
        response.header.duration = self.cts_nav_duration(request);
        // Responding station gives up any opportunity of its own.
        self.transmit_opportunity_end_time = ZERO_TIME;

        let tx_parameters = self.rate_controller.response_tx_parameters(received_tx_parameters);
        let power_dbm = self
            .power_controller
            .current_transmit_power_dbm(request.transmitter);
        let buffer = match build_frame(CtsFrame::SIZE, |cursor| response.serialize(cursor)) {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!("CTS serialization failed: {error}");
                return;
            }
        };
        self.state = MacState::CtsOrAckTransmission;
        self.stats.control_frames_sent += 1;
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitFrame {
            frame: buffer,
            tx_parameters,
            power_dbm,
            delay: self.sifs_duration,
        });
    }

    fn cts_nav_duration(&mut self, request: &RtsFrame) -> DurationField {
        let clear_to_send_length = if self.use_ndp_control_frames {
            0
        } else {
            CtsFrame::SIZE
        };
        let tx_parameters = self
            .rate_controller
            .management_tx_parameters(request.transmitter);
        let response_time =
            self.sifs_duration + self.frame_air_duration(&tx_parameters, clear_to_send_length);
        duration_field_from_time(
            time_from_duration_field(request.header.duration).saturating_sub(response_time),
        )
    }

    fn process_clear_to_send_frame(&mut self, now: SimTime) {
        if self.state != MacState::WaitingForCts {
            trace!("CTS outside of an RTS exchange, ignored");
            return;
        }
        if self.wakeup_timer_is_armed {
            self.cancel_wakeup_timer();
        }
        let index = self.last_sent_category_index;
        self.categories[index].short_frame_retry_count = 0;
        let outcome = self.transmit_a_frame(index, true, self.sifs_duration, now);
        debug_assert!(outcome == TransmitOutcome::Sent);
    }

    fn process_acknowledgement_frame(&mut self, now: SimTime) {
        match self.state {
            MacState::WaitingForAck(SentFrameKind::Short)
            | MacState::WaitingForAck(SentFrameKind::Long) => {}
            MacState::WaitingForAck(_) => {
                trace!("Plain ACK while a Block-Ack is outstanding, ignored");
                return;
            }
            _ => return,
        }
        if self.wakeup_timer_is_armed {
            self.cancel_wakeup_timer();
        }
        self.state = MacState::BusyMedium;
        let index = self.last_sent_category_index;
        self.categories[index].reset_contention_window();

        match self.categories[index].in_flight.take() {
            InFlight::Single(_) => {}
            InFlight::LeadFrame { remainder, .. } => {
                // The lead made it; the rest of the aggregate is next.
                self.categories[index].in_flight = InFlight::Aggregate(remainder);
            }
            other => self.categories[index].in_flight = other,
        }
        self.rate_controller.notify_ack_received(self.last_sent_destination);
        self.transmit_opportunity_acked_frame_count += 1;
        self.do_successful_transmission_post_processing(false, now);
    }

    fn process_block_ack_frame(&mut self, block_ack: &BlockAckFrame, now: SimTime) {
        let kind = match self.state {
            MacState::WaitingForAck(kind @ SentFrameKind::Aggregate)
            | MacState::WaitingForAck(kind @ SentFrameKind::BlockAckRequest) => kind,
            _ => {
                trace!("Block-Ack in state {:?} ignored", self.state);
                return;
            }
        };
        if self.wakeup_timer_is_armed {
            self.cancel_wakeup_timer();
        }
        let index = self.last_sent_category_index;

        self.outgoing_links.process_block_ack(
            block_ack.transmitter,
            block_ack.traffic_id,
            block_ack.starting_sequence_number,
            block_ack.bitmap,
        );
        self.transmit_opportunity_acked_frame_count += 1;
        self.state = MacState::BusyMedium;

        match kind {
            SentFrameKind::BlockAckRequest => {
                self.categories[index].short_frame_retry_count = 0;
                self.categories[index].reset_contention_window();
                self.rate_controller.notify_ack_received(block_ack.transmitter);
                self.do_successful_transmission_post_processing(false, now);
            }
            _ => {
                let mut aggregate = match self.categories[index].in_flight.take() {
                    InFlight::Aggregate(aggregate) => aggregate,
                    other => {
                        self.categories[index].in_flight = other;
                        debug_assert!(false, "Block-Ack for an aggregate with none in flight");
                        return;
                    }
                };
                let destination = aggregate.destination;
                let mut survivors = Vec::with_capacity(aggregate.subframes.len());
                for subframe in aggregate.subframes.drain(..) {
                    if block_ack.is_acked(subframe.sequence_number) {
                        self.stats.subframes_acknowledged += 1;
                        self.rate_controller.notify_ack_received(destination);
                    } else {
                        self.rate_controller.notify_ack_failed(destination);
                        survivors.push(subframe);
                    }
                }

                if survivors.is_empty() {
                    self.categories[index].aggregate_frame_retry_count = 0;
                } else {
                    self.categories[index].aggregate_frame_retry_count += 1;
                    if self.categories[index].aggregate_frame_retry_count
                        >= self.short_frame_retry_limit
                    {
                        debug!(
                            "Aggregate to {destination} dropped after {} subframes kept failing",
                            survivors.len()
                        );
                        if let Some(last) = survivors.last() {
                            self.outgoing_links.record_dropped_frame(
                                destination,
                                aggregate.traffic_id,
                                last.sequence_number,
                            );
                        }
                        self.stats.packets_dropped_retry_limit += survivors.len() as u64;
                        self.categories[index].aggregate_frame_retry_count = 0;
                    } else {
                        self.stats.frame_retries += 1;
                        aggregate.subframes = survivors;
                        self.categories[index].in_flight = InFlight::Aggregate(aggregate);
                    }
                }
                self.categories[index].reset_contention_window();
                self.do_successful_transmission_post_processing(false, now);
            }
        }
    }

    fn process_block_ack_request_frame(
        &mut self,
        request: &BlockAckRequestFrame,
        received_tx_parameters: &TxParameters,
    ) {
        let flushed = self.incoming_buffer.process_block_ack_request(
            request.transmitter,
            request.traffic_id,
            request.starting_sequence_number,
        );
        for frame in flushed {
            self.stats.packets_delivered += 1;
            self.emit(MacAction::DeliverPacket {
                payload: frame.payload,
                source: request.transmitter,
                ether_type: frame.ether_type,
            });
        }
        self.send_block_acknowledgement_response(
            request.transmitter,
            request.traffic_id,
            received_tx_parameters,
        );
    }

    fn process_data_frame(
        &mut self,
        header: &DataFrameHeader,
        payload_bytes: &[u8],
        received_tx_parameters: &TxParameters,
    ) {
        self.fail_pending_response_wait();
        self.stats.data_frames_received += 1;
        self.stats.data_bytes_received += payload_bytes.len() as u64;

        if is_group_address(header.header.receiver) {
            self.stats.packets_delivered += 1;
            self.emit(MacAction::DeliverPacket {
                payload: FrameBuffer::from_payload(payload_bytes),
                source: header.transmitter,
                ether_type: header.ether_type.unwrap_or(0),
            });
            return;
        }

        let arrival = self.incoming_buffer.process_incoming_frame(
            header.transmitter,
            header.traffic_id,
            header.sequence_number,
            BufferedFrame {
                payload: FrameBuffer::from_payload(payload_bytes),
                ether_type: header.ether_type.unwrap_or(0),
            },
        );
        // Acked even when it is a duplicate; the first ACK may have been
        // lost on the way back.
        self.send_acknowledgement_response(header.transmitter, received_tx_parameters);
        if arrival.is_duplicate {
            self.stats.duplicate_frames_received += 1;
            trace!(
                "Duplicate frame {} from {}",
                header.sequence_number,
                header.transmitter
            );
        }
        for frame in arrival.frames_to_deliver {
            self.stats.packets_delivered += 1;
            self.emit(MacAction::DeliverPacket {
                payload: frame.payload,
                source: header.transmitter,
                ether_type: frame.ether_type,
            });
        }
    }

    fn process_null_frame(
        &mut self,
        header: &DataFrameHeader,
        received_tx_parameters: &TxParameters,
    ) {
        self.fail_pending_response_wait();
        if is_group_address(header.header.receiver) {
            return;
        }
        let arrival = self.incoming_buffer.process_incoming_non_data_frame(
            header.transmitter,
            header.traffic_id,
            header.sequence_number,
        );
        self.send_acknowledgement_response(header.transmitter, received_tx_parameters);
        for frame in arrival.frames_to_deliver {
            self.stats.packets_delivered += 1;
            self.emit(MacAction::DeliverPacket {
                payload: frame.payload,
                source: header.transmitter,
                ether_type: frame.ether_type,
            });
        }
        if arrival.is_duplicate {
            self.stats.duplicate_frames_received += 1;
            return;
        }
        self.emit(MacAction::PowerManagementChanged {
            from: header.transmitter,
            sleeping: header.header.frame_control.power_management,
        });
    }

    fn process_management_frame(
        &mut self,
        header: &ManagementFrameHeader,
        frame_bytes: &[u8],
        received_tx_parameters: &TxParameters,
    ) {
        self.fail_pending_response_wait();

        if !is_group_address(header.header.receiver) {
            let traffic_id = self.network_queue.max_priority();
            let arrival = self.incoming_buffer.process_incoming_non_data_frame(
                header.transmitter,
                traffic_id,
                header.sequence_number,
            );
            self.send_acknowledgement_response(header.transmitter, received_tx_parameters);
            for frame in arrival.frames_to_deliver {
                self.stats.packets_delivered += 1;
                self.emit(MacAction::DeliverPacket {
                    payload: frame.payload,
                    source: header.transmitter,
                    ether_type: frame.ether_type,
                });
            }
            if arrival.is_duplicate {
                self.stats.duplicate_frames_received += 1;
                return;
            }
        }

        self.stats.management_frames_received += 1;
        self.emit(MacAction::ManagementFrameReceived {
            frame: FrameBuffer::from_bytes(frame_bytes.to_vec()),
        });
    }

    fn process_power_save_poll_frame(
        &mut self,
        poll: &PsPollFrame,
        received_tx_parameters: &TxParameters,
    ) {
        self.fail_pending_response_wait();
        self.stats.control_frames_received += 1;
        self.send_acknowledgement_response(poll.transmitter, received_tx_parameters);
        self.emit(MacAction::PsPollReceived {
            from: poll.transmitter,
            association_id: poll.association_id(),
        });
    }

    pub fn on_aggregate_subframe_received(
        &mut self,
        subframe_bytes: &[u8],
        subframe_index: u32,
        number_of_subframes: u32,
        received_tx_parameters: &TxParameters,
    ) {
        self.fail_pending_response_wait();

        let mut cursor: &[u8] = subframe_bytes;
        let delimiter = match MpduDelimiter::parse(&mut cursor) {
            Ok(delimiter) => delimiter,
            Err(error) => {
                warn!("Bad aggregate delimiter: {error}");
                return;
            }
        };
        let header = match peek_common_header(cursor) {
            Ok(header) => header,
            Err(error) => {
                warn!("Undecodable aggregate subframe: {error}");
                return;
            }
        };
        if !self.frame_is_for_this_node(&header) {
            return;
        }

        self.last_frame_received_was_corrupt = false;
        if subframe_index == 0 {
            self.subframes_received_from_current_aggregate = 1;
        } else {
            self.subframes_received_from_current_aggregate += 1;
        }

        let data_length = usize::from(delimiter.length_bytes);
        if cursor.len() < data_length {
            warn!("Aggregate subframe shorter than its delimiter length");
            return;
        }
        let mut frame_cursor: &[u8] = &cursor[..data_length];
        let data_header = match DataFrameHeader::parse(&mut frame_cursor) {
            Ok(header) => header,
            Err(error) => {
                warn!("Bad aggregate subframe header: {error}");
                return;
            }
        };

        self.current_incoming_aggregate_source = data_header.transmitter;
        self.current_incoming_aggregate_traffic_id = data_header.traffic_id;
        self.stats.aggregate_subframes_received += 1;

        let arrival = self.incoming_buffer.process_incoming_subframe(
            data_header.transmitter,
            data_header.traffic_id,
            data_header.sequence_number,
            BufferedFrame {
                payload: FrameBuffer::from_payload(frame_cursor),
                ether_type: data_header.ether_type.unwrap_or(0),
            },
        );

        if subframe_index + 1 >= number_of_subframes {
            self.send_block_acknowledgement_response(
                data_header.transmitter,
                data_header.traffic_id,
                received_tx_parameters,
            );
        }
        if arrival.is_duplicate {
            self.stats.duplicate_frames_received += 1;
        }
        for frame in arrival.frames_to_deliver {
            self.stats.packets_delivered += 1;
            self.emit(MacAction::DeliverPacket {
                payload: frame.payload,
                source: data_header.transmitter,
                ether_type: frame.ether_type,
            });
        }
    }

    pub fn on_corrupt_frame_received(&mut self) {
        self.last_frame_received_was_corrupt = true;
        self.fail_pending_response_wait();
    }

    pub fn on_corrupt_aggregate_subframe_received(
        &mut self,
        subframe_index: u32,
        number_of_subframes: u32,
        received_tx_parameters: &TxParameters,
    ) {
        if subframe_index == 0 {
            self.fail_pending_response_wait();
            self.subframes_received_from_current_aggregate = 0;
            self.current_incoming_aggregate_source = MacAddress::INVALID;
        }

        if subframe_index + 1 >= number_of_subframes
            && self.subframes_received_from_current_aggregate > 0
        {
            // Enough of the aggregate survived to tell the sender which
            // pieces made it.
            let source = self.current_incoming_aggregate_source;
            let traffic_id = self.current_incoming_aggregate_traffic_id;
            self.send_block_acknowledgement_response(source, traffic_id, received_tx_parameters);
            self.last_frame_received_was_corrupt = false;
        } else {
            self.last_frame_received_was_corrupt = true;
        }
    }

    fn send_acknowledgement_response(
        &mut self,
        destination: MacAddress,
        received_tx_parameters: &TxParameters,
    ) {
        let acknowledgement = AckFrame::new(destination);
        let tx_parameters = self.rate_controller.response_tx_parameters(received_tx_parameters);
        let power_dbm = self.power_controller.current_transmit_power_dbm(destination);
        let buffer = match build_frame(AckFrame::SIZE, |cursor| acknowledgement.serialize(cursor))
        {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!("ACK serialization failed: {error}");
                return;
            }
        };
        self.state = MacState::CtsOrAckTransmission;
        self.stats.control_frames_sent += 1;
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitFrame {
            frame: buffer,
            tx_parameters,
            power_dbm,
            delay: self.sifs_duration,
        });
    }

    fn send_block_acknowledgement_response(
        &mut self,
        destination: MacAddress,
        traffic_id: u8,
        received_tx_parameters: &TxParameters,
    ) {
        let (starting_sequence_number, bitmap) =
            match self.incoming_buffer.block_ack_info(destination, traffic_id) {
                Some(info) => info,
                None => {
                    warn!("No receive state for a Block-Ack to {destination} tid {traffic_id}");
                    return;
                }
            };
        let block_ack = BlockAckFrame::new(
            destination,
            self.mac_address,
            traffic_id,
            starting_sequence_number,
            bitmap,
        );
        let tx_parameters = self.rate_controller.response_tx_parameters(received_tx_parameters);
        let power_dbm = self.power_controller.current_transmit_power_dbm(destination);
        let buffer = match build_frame(BlockAckFrame::SIZE, |cursor| block_ack.serialize(cursor)) {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!("Block-Ack serialization failed: {error}");
                return;
            }
        };
        self.state = MacState::CtsOrAckTransmission;
        self.stats.control_frames_sent += 1;
        self.transmission_in_progress = true;
        self.emit(MacAction::TransmitFrame {
            frame: buffer,
            tx_parameters,
            power_dbm,
            delay: self.sifs_duration,
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn schedule_wakeup(&mut self, expires: SimTime) {
        self.wakeup_timer_is_armed = true;
        self.wakeup_timer_expiration = expires;
        self.emit(MacAction::SetWakeupTimer { expires });
    }

    fn cancel_wakeup_timer(&mut self) {
        self.wakeup_timer_is_armed = false;
        self.wakeup_timer_expiration = INFINITE_TIME;
        self.emit(MacAction::CancelWakeupTimer);
    }

    fn emit(&mut self, action: MacAction) {
        self.actions.push_back(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::{FixedPowerController, FixedRateController, NodeIdResolver};
    use crate::frame::peek_frame_type;

    fn test_config(node_id: u32) -> MacConfig {
        let mut config = MacConfig::default();
        config.node_id = node_id;
        config.seed = 7;
        config
    }

    // 1 Mbps, so a frame takes 8 microseconds per byte plus the PHY header.
    fn test_engine(config: &MacConfig) -> MacEngine {
        MacEngine::new(
            config,
            Box::new(FixedRateController::new(TxParameters::new(1_000_000, 2))),
            Box::new(FixedPowerController::new(20.0)),
            Box::new(NodeIdResolver::new(0)),
        )
        .unwrap()
    }

    fn received_params() -> TxParameters {
        TxParameters::new(1_000_000, 2)
    }

    fn expires_opt(actions: &[MacAction]) -> Option<SimTime> {
        actions.iter().rev().find_map(|action| match action {
            MacAction::SetWakeupTimer { expires } => Some(*expires),
            _ => None,
        })
    }

    fn transmitted_frames(actions: &[MacAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                MacAction::TransmitFrame { frame, .. } => Some(frame.to_vec()),
                _ => None,
            })
            .collect()
    }

    fn delivered_payloads(actions: &[MacAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                MacAction::DeliverPacket { payload, .. } => Some(payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    fn aggregate_lengths(actions: &[MacAction]) -> Option<Vec<usize>> {
        actions.iter().find_map(|action| match action {
            MacAction::TransmitAggregateFrame { subframes, .. } => {
                Some(subframes.iter().map(|subframe| subframe.len()).collect())
            }
            _ => None,
        })
    }

    /// Fire wakeup timers until the engine hands a frame to the PHY.
    fn run_until_transmit(engine: &mut MacEngine, mut now: SimTime) -> (Vec<u8>, SimTime) {
        for _ in 0..16 {
            let actions = engine.drain_actions();
            if let Some(frame) = transmitted_frames(&actions).into_iter().next() {
                return (frame, now);
            }
            match expires_opt(&actions) {
                Some(expires) => {
                    now = expires;
                    engine.on_wakeup_timer(now);
                }
                None => break,
            }
        }
        panic!("no frame was transmitted");
    }

    fn run_until_aggregate(engine: &mut MacEngine, mut now: SimTime) -> (Vec<usize>, SimTime) {
        for _ in 0..16 {
            let actions = engine.drain_actions();
            if let Some(lengths) = aggregate_lengths(&actions) {
                return (lengths, now);
            }
            match expires_opt(&actions) {
                Some(expires) => {
                    now = expires;
                    engine.on_wakeup_timer(now);
                }
                None => break,
            }
        }
        panic!("no aggregate was transmitted");
    }

    fn run_until_idle(engine: &mut MacEngine, mut now: SimTime) {
        for _ in 0..16 {
            match expires_opt(&engine.drain_actions()) {
                Some(expires) => {
                    now = expires;
                    engine.on_wakeup_timer(now);
                }
                None => return,
            }
        }
    }

    fn data_frame_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: u16,
        duration: DurationField,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut header = DataFrameHeader::new_data(receiver, transmitter, sequence_number, 0, 0x0800);
        header.header.duration = duration;
        let mut bytes = Vec::new();
        header.serialize(&mut bytes).unwrap();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn ack_bytes(receiver: MacAddress) -> Vec<u8> {
        let mut bytes = Vec::new();
        AckFrame::new(receiver).serialize(&mut bytes).unwrap();
        bytes
    }

    fn cts_bytes(receiver: MacAddress) -> Vec<u8> {
        let mut bytes = Vec::new();
        CtsFrame::new(receiver).serialize(&mut bytes).unwrap();
        bytes
    }

    fn bar_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        traffic_id: u8,
        starting_sequence_number: u16,
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        BlockAckRequestFrame::new(receiver, transmitter, traffic_id, starting_sequence_number)
            .serialize(&mut bytes)
            .unwrap();
        bytes
    }

    fn block_ack_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        traffic_id: u8,
        starting_sequence_number: u16,
        bitmap: u64,
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        BlockAckFrame::new(
            receiver,
            transmitter,
            traffic_id,
            starting_sequence_number,
            bitmap,
        )
        .serialize(&mut bytes)
        .unwrap();
        bytes
    }

    fn ps_poll_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        association_id: AssociationId,
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        PsPollFrame::new(receiver, transmitter, association_id)
            .serialize(&mut bytes)
            .unwrap();
        bytes
    }

    fn null_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: u16,
        power_management: bool,
    ) -> Vec<u8> {
        let mut header = DataFrameHeader::new_null(receiver, transmitter, sequence_number, 0);
        header.header.frame_control.power_management = power_management;
        let mut bytes = Vec::new();
        header.serialize(&mut bytes).unwrap();
        bytes
    }

    fn subframe_bytes(
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: u16,
        payload: &[u8],
        pad: bool,
    ) -> Vec<u8> {
        let inner = data_frame_bytes(receiver, transmitter, sequence_number, 0, payload);
        let mut bytes = Vec::new();
        MpduDelimiter::new(inner.len() as u16)
            .serialize(&mut bytes)
            .unwrap();
        bytes.extend_from_slice(&inner);
        if pad {
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
        }
        bytes
    }

    #[test]
    fn fresh_engine_starts_idle() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        assert_eq!(engine.state, MacState::Idle);
        assert!(engine.drain_actions().is_empty());
        assert_eq!(engine.mac_address(), MacAddress::from_node_id(1, 0));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = test_config(1);
        config.contention.contention_window_min_slots = 1;
        let result = MacEngine::new(
            &config,
            Box::new(FixedRateController::new(TxParameters::new(1_000_000, 2))),
            Box::new(FixedPowerController::new(20.0)),
            Box::new(NodeIdResolver::new(0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn broadcast_frame_is_sent_after_interframe_space() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[0u8; 64]),
            NetworkAddress::BROADCAST,
            0,
            0x0800,
            0,
        );
        // Priority zero carries an AIFS of nine slots.
        let actions = engine.drain_actions();
        assert_eq!(expires_opt(&actions), Some(623));

        engine.on_wakeup_timer(623);
        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::QosData);
        assert_eq!(&frames[0][4..10], [0xFFu8; 6]);
        assert_eq!(engine.stats().data_frames_sent, 1);
        assert!(engine.categories[0].in_flight.is_none());

        engine.on_transmission_complete(1500);
        engine.on_channel_clear(1500);
        run_until_idle(&mut engine, 1500);
        assert_eq!(engine.state, MacState::Idle);
    }

    #[test]
    fn unicast_frame_waits_for_acknowledgement() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[7u8; 64]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        let (frame, _) = run_until_transmit(&mut engine, 0);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::QosData);
        // SIFS plus a full-rate ACK on the air.
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 512);
        assert_eq!(frame[1] & 0x08, 0);
        assert_eq!(engine.state, MacState::WaitingForAck(SentFrameKind::Short));

        engine.on_transmission_complete(2000);
        let actions = engine.drain_actions();
        assert_eq!(expires_opt(&actions), Some(2452));

        engine.on_frame_received(&ack_bytes(engine.mac_address()), &received_params(), 2100);
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::CancelWakeupTimer)));
        assert!(engine.categories[0].in_flight.is_none());
        assert_eq!(engine.stats().data_frames_sent, 1);

        engine.on_channel_clear(2200);
        run_until_idle(&mut engine, 2200);
        assert_eq!(engine.state, MacState::Idle);
    }

    #[test]
    fn missing_acknowledgements_exhaust_the_retry_limit() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[3u8; 32]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );

        let mut now: SimTime = 0;
        let mut transmit_count = 0u32;
        let mut dropped = false;
        for _ in 0..64 {
            let actions = engine.drain_actions();
            if actions
                .iter()
                .any(|action| matches!(action, MacAction::PacketUndeliverable { .. }))
            {
                dropped = true;
                break;
            }
            if let Some(frame) = transmitted_frames(&actions).first() {
                transmit_count += 1;
                if transmit_count > 1 {
                    assert_ne!(frame[1] & 0x08, 0);
                }
                now += 1000;
                engine.on_transmission_complete(now);
                let expires = expires_opt(&engine.drain_actions()).unwrap();
                now = expires;
                engine.on_wakeup_timer(now);
                continue;
            }
            match expires_opt(&actions) {
                Some(expires) => {
                    now = expires;
                    engine.on_wakeup_timer(now);
                }
                None => break,
            }
        }

        assert!(dropped);
        assert_eq!(transmit_count, 7);
        assert_eq!(engine.stats().frame_retries, 6);
        assert_eq!(engine.stats().packets_dropped_retry_limit, 1);
        assert!(engine.categories[0].in_flight.is_none());
    }

    #[test]
    fn long_frames_are_protected_with_rts() {
        let mut config = test_config(1);
        config.contention.rts_threshold_size_bytes = 50;
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[1u8; 64]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        let (request, _) = run_until_transmit(&mut engine, 0);
        assert_eq!(peek_frame_type(&request).unwrap(), FrameType::Rts);
        // CTS, the 102 byte data frame, and the ACK, with a SIFS before each.
        assert_eq!(u16::from_le_bytes([request[2], request[3]]), 2240);
        assert_eq!(engine.state, MacState::WaitingForCts);

        engine.on_transmission_complete(1000);
        engine.drain_actions();
        engine.on_frame_received(&cts_bytes(engine.mac_address()), &received_params(), 1100);
        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::QosData);
        assert_eq!(u16::from_le_bytes([frames[0][2], frames[0][3]]), 512);
        assert_eq!(engine.state, MacState::WaitingForAck(SentFrameKind::Long));
    }

    #[test]
    fn foreign_reservation_defers_transmission() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let other_receiver = MacAddress::from_node_id(3, 0);
        let other_transmitter = MacAddress::from_node_id(2, 0);

        engine.on_channel_busy(100);
        engine.on_frame_received(
            &data_frame_bytes(other_receiver, other_transmitter, 1, 3000, &[0u8; 16]),
            &received_params(),
            200,
        );
        assert_eq!(engine.state, MacState::BusyMedium);

        engine.enqueue_packet(
            FrameBuffer::from_payload(&[2u8; 32]),
            NetworkAddress::new(2),
            0,
            0x0800,
            250,
        );
        engine.on_channel_clear(300);
        assert_eq!(engine.state, MacState::WaitingForNavExpiration);
        let actions = engine.drain_actions();
        assert_eq!(expires_opt(&actions), Some(3200));

        engine.on_wakeup_timer(3200);
        let (frame, _) = run_until_transmit(&mut engine, 3200);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::QosData);
    }

    #[test]
    fn busy_medium_pauses_and_resumes_backoff() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[4u8; 32]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        engine.drain_actions();

        engine.on_channel_busy(300);
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::CancelWakeupTimer)));
        assert!(!engine.categories[0].trying_to_jump_on_medium);
        assert_ne!(
            engine.categories[0].current_nonextended_backoff_duration,
            INFINITE_TIME
        );

        engine.on_channel_clear(800);
        let (frame, sent_at) = run_until_transmit(&mut engine, 800);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::QosData);
        // AIFS of nine slots from the clear, then whole backoff slots.
        assert!(sent_at >= 1423);
        assert_eq!((sent_at - 1423) % 52, 0);
    }

    #[test]
    fn corrupt_frame_extends_the_interframe_space() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.on_corrupt_frame_received();
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[5u8; 32]),
            NetworkAddress::new(2),
            0,
            0x0800,
            10,
        );
        let actions = engine.drain_actions();
        assert_eq!(expires_opt(&actions), Some(1135));

        engine.on_wakeup_timer(1135);
        let frames = transmitted_frames(&engine.drain_actions());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn received_data_is_acked_and_delivered() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();

        engine.on_frame_received(
            &data_frame_bytes(me, peer, 1, 0, b"hello"),
            &received_params(),
            500,
        );
        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::Ack);
        assert_eq!(&frames[0][4..10], peer.bytes().as_slice());
        assert_eq!(delivered_payloads(&actions), vec![b"hello".to_vec()]);
        assert_eq!(engine.stats().packets_delivered, 1);

        engine.on_transmission_complete(700);
        assert_eq!(engine.state, MacState::BusyMedium);
    }

    #[test]
    fn duplicate_data_is_acked_but_not_redelivered() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();
        let frame = data_frame_bytes(me, peer, 1, 0, b"once");

        engine.on_frame_received(&frame, &received_params(), 500);
        engine.on_transmission_complete(700);
        engine.drain_actions();

        engine.on_frame_received(&frame, &received_params(), 900);
        let actions = engine.drain_actions();
        assert_eq!(transmitted_frames(&actions).len(), 1);
        assert!(delivered_payloads(&actions).is_empty());
        assert_eq!(engine.stats().duplicate_frames_received, 1);
        assert_eq!(engine.stats().packets_delivered, 1);
    }

    #[test]
    fn block_ack_session_reorders_out_of_order_frames() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();

        engine.on_frame_received(&bar_bytes(me, peer, 0, 1), &received_params(), 100);
        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::BlockAck);
        engine.on_transmission_complete(200);

        engine.on_frame_received(&data_frame_bytes(me, peer, 1, 0, b"one"), &received_params(), 300);
        let actions = engine.drain_actions();
        assert_eq!(delivered_payloads(&actions), vec![b"one".to_vec()]);
        engine.on_transmission_complete(400);

        engine.on_frame_received(
            &data_frame_bytes(me, peer, 3, 0, b"three"),
            &received_params(),
            600,
        );
        let actions = engine.drain_actions();
        assert!(delivered_payloads(&actions).is_empty());
        engine.on_transmission_complete(700);

        engine.on_frame_received(&data_frame_bytes(me, peer, 2, 0, b"two"), &received_params(), 900);
        let actions = engine.drain_actions();
        assert_eq!(
            delivered_payloads(&actions),
            vec![b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(engine.stats().packets_delivered, 3);
    }

    #[test]
    fn power_save_poll_is_acked_and_surfaced() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();

        engine.on_frame_received(&ps_poll_bytes(me, peer, 77), &received_params(), 500);
        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::Ack);
        assert!(actions.iter().any(|action| matches!(
            action,
            MacAction::PsPollReceived { from, association_id } if *from == peer && *association_id == 77
        )));
    }

    #[test]
    fn null_frame_reports_power_management_change() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();

        engine.on_frame_received(&null_bytes(me, peer, 5, true), &received_params(), 500);
        let actions = engine.drain_actions();
        assert_eq!(transmitted_frames(&actions).len(), 1);
        assert!(actions.iter().any(|action| matches!(
            action,
            MacAction::PowerManagementChanged { from, sleeping } if *from == peer && *sleeping
        )));
    }

    #[test]
    fn corrupt_aggregate_tail_still_gets_a_block_ack() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();

        engine.on_aggregate_subframe_received(
            &subframe_bytes(me, peer, 1, b"agg", true),
            0,
            2,
            &received_params(),
        );
        engine.on_corrupt_aggregate_subframe_received(1, 2, &received_params());

        let actions = engine.drain_actions();
        let frames = transmitted_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::BlockAck);
        assert!(!engine.last_frame_received_was_corrupt);
        assert_eq!(engine.stats().aggregate_subframes_received, 1);
        assert_eq!(engine.stats().packets_delivered, 1);
    }

    #[test]
    fn aggregation_builds_and_block_ack_releases() {
        let mut config = test_config(1);
        config.aggregation.protect_aggregates_with_single_acked_frame = false;
        config.aggregation.allow_aggregation_with_txop_zero = true;
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();
        engine.set_mpdu_aggregation_enabled_for(peer, true);

        for _ in 0..3 {
            engine.enqueue_packet(
                FrameBuffer::from_payload(&[0x55u8; 100]),
                NetworkAddress::new(2),
                0,
                0x0800,
                0,
            );
        }

        // A fresh link announces the Block-Ack window first.
        let (frame, now) = run_until_transmit(&mut engine, 0);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::BlockAckRequest);
        assert_eq!(
            engine.state,
            MacState::WaitingForAck(SentFrameKind::BlockAckRequest)
        );
        let now = now + 1000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(&block_ack_bytes(me, peer, 0, 1, 0), &received_params(), now + 100);
        engine.on_channel_clear(now + 200);

        // The frame that opened the session goes out alone.
        let (frame, now) = run_until_transmit(&mut engine, now + 200);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::QosData);
        let now = now + 2000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(&ack_bytes(me), &received_params(), now + 100);
        engine.on_channel_clear(now + 200);

        // The remaining two ride in one aggregate, padded except the last.
        let (lengths, now) = run_until_aggregate(&mut engine, now + 200);
        assert_eq!(lengths, vec![144, 142]);
        assert_eq!(engine.state, MacState::WaitingForAck(SentFrameKind::Aggregate));
        assert_eq!(engine.stats().aggregate_frames_sent, 1);
        assert_eq!(engine.stats().aggregate_subframes_sent, 2);

        let now = now + 3000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(
            &block_ack_bytes(me, peer, 0, 2, 0b11),
            &received_params(),
            now + 100,
        );
        assert_eq!(engine.stats().subframes_acknowledged, 2);
        assert!(engine.categories[0].in_flight.is_none());
    }

    #[test]
    fn partially_acked_aggregate_retransmits_the_rest() {
        let mut config = test_config(1);
        config.aggregation.protect_aggregates_with_single_acked_frame = false;
        config.aggregation.allow_aggregation_with_txop_zero = true;
        let mut engine = test_engine(&config);
        let peer = MacAddress::from_node_id(2, 0);
        let me = engine.mac_address();
        engine.set_mpdu_aggregation_enabled_for(peer, true);

        for _ in 0..3 {
            engine.enqueue_packet(
                FrameBuffer::from_payload(&[0x66u8; 100]),
                NetworkAddress::new(2),
                0,
                0x0800,
                0,
            );
        }

        let (_, now) = run_until_transmit(&mut engine, 0);
        let now = now + 1000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(&block_ack_bytes(me, peer, 0, 1, 0), &received_params(), now + 100);
        engine.on_channel_clear(now + 200);

        let (_, now) = run_until_transmit(&mut engine, now + 200);
        let now = now + 2000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(&ack_bytes(me), &received_params(), now + 100);
        engine.on_channel_clear(now + 200);

        let (_, now) = run_until_aggregate(&mut engine, now + 200);
        let now = now + 3000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        // Only the first of the two subframes makes it.
        engine.on_frame_received(
            &block_ack_bytes(me, peer, 0, 2, 0b01),
            &received_params(),
            now + 100,
        );
        assert_eq!(engine.stats().subframes_acknowledged, 1);
        assert_eq!(engine.stats().frame_retries, 1);
        engine.on_channel_clear(now + 200);

        let (lengths, now) = run_until_aggregate(&mut engine, now + 200);
        assert_eq!(lengths, vec![142]);
        let now = now + 2000;
        engine.on_transmission_complete(now);
        engine.drain_actions();
        engine.on_frame_received(
            &block_ack_bytes(me, peer, 0, 3, 0b1),
            &received_params(),
            now + 100,
        );
        assert_eq!(engine.stats().subframes_acknowledged, 2);
        assert!(engine.categories[0].in_flight.is_none());
    }

    #[test]
    fn internal_collision_doubles_the_contention_window() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        let before = engine.categories[0].current_contention_window_slots;
        engine.perform_internal_collision_backoff(0);
        assert_eq!(
            engine.categories[0].current_contention_window_slots,
            before * 2 + 1
        );
        assert_eq!(engine.stats().internal_collisions, 1);
        assert_ne!(
            engine.categories[0].current_nonextended_backoff_duration,
            INFINITE_TIME
        );
    }

    #[test]
    fn full_queue_rejects_new_packets() {
        let mut config = test_config(1);
        config.queue.max_packets_per_priority = 1;
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[1u8; 8]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        engine.drain_actions();
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[2u8; 8]),
            NetworkAddress::new(2),
            0,
            0x0800,
            10,
        );
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::PacketUndeliverable { .. })));
        assert_eq!(engine.stats().packets_rejected_full_queue, 1);
    }

    #[test]
    fn expired_packets_are_dropped_before_transmission() {
        let mut config = test_config(1);
        config.contention.frame_lifetime_us = Some(100);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[6u8; 32]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        let expires = expires_opt(&engine.drain_actions()).unwrap();
        engine.on_wakeup_timer(expires);
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::PacketUndeliverable { .. })));
        assert!(transmitted_frames(&actions).is_empty());
        assert_eq!(engine.stats().packets_dropped_lifetime, 1);
    }

    #[test]
    fn channel_switch_waits_for_the_current_transmission() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[8u8; 16]),
            NetworkAddress::BROADCAST,
            0,
            0x0800,
            0,
        );
        let (_, now) = run_until_transmit(&mut engine, 0);

        engine.switch_to_channels(vec![5, 6]);
        let actions = engine.drain_actions();
        assert!(!actions
            .iter()
            .any(|action| matches!(action, MacAction::SwitchToChannels { .. })));
        assert_eq!(engine.state, MacState::ChangingChannels);

        engine.on_transmission_complete(now + 1000);
        let actions = engine.drain_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            MacAction::SwitchToChannels { channels } if channels.as_slice() == [5, 6]
        )));
    }

    #[test]
    fn beacon_reports_completion() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.send_beacon_frame("mesh-0", vec![36], 0).unwrap();
        // The management category contends with an AIFS of two slots.
        let actions = engine.drain_actions();
        assert_eq!(expires_opt(&actions), Some(259));

        engine.on_wakeup_timer(259);
        let frames = transmitted_frames(&engine.drain_actions());
        assert_eq!(frames.len(), 1);
        assert_eq!(peek_frame_type(&frames[0]).unwrap(), FrameType::Beacon);
        assert_eq!(&frames[0][4..10], [0xFFu8; 6]);
        assert_eq!(engine.stats().management_frames_sent, 1);

        engine.on_transmission_complete(2000);
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::BeaconTransmitted)));
    }

    #[test]
    fn frame_too_long_for_the_window_is_held_back() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.start_restricted_access_window_period(2000, 0);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[0u8; 1000]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        let expires = expires_opt(&engine.drain_actions()).unwrap();
        assert!(expires < 2000);
        engine.on_wakeup_timer(expires);
        assert_eq!(engine.stats().transmissions_aborted_for_raw, 1);
        assert_eq!(engine.state, MacState::Idle);
        assert!(!engine.categories[0].in_flight.is_none());
        assert!(transmitted_frames(&engine.drain_actions()).is_empty());

        engine.switch_to_normal_access_mode(3000);
        let (frame, sent_at) = run_until_transmit(&mut engine, 3000);
        assert_eq!(peek_frame_type(&frame).unwrap(), FrameType::QosData);
        assert_eq!(sent_at, 3623);
    }

    #[test]
    fn requeued_frames_keep_their_sequence_numbers() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.enqueue_packet(
            FrameBuffer::from_payload(&[9u8; 40]),
            NetworkAddress::new(2),
            0,
            0x0800,
            0,
        );
        let (first, now) = run_until_transmit(&mut engine, 0);
        let now = now + 1000;
        engine.on_transmission_complete(now);
        let expires = expires_opt(&engine.drain_actions()).unwrap();
        // The acknowledgement never arrives.
        engine.on_wakeup_timer(expires);

        engine.requeue_buffered_frames();
        assert!(engine.categories[0].in_flight.is_none());
        let (second, _) = run_until_transmit(&mut engine, expires);
        assert_eq!(first, second);
    }

    #[test]
    fn sleep_and_receive_only_modes_toggle_the_radio() {
        let config = test_config(1);
        let mut engine = test_engine(&config);
        engine.switch_to_sleep_mode();
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::StopReceiving)));

        engine.switch_to_receive_only_mode();
        let actions = engine.drain_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, MacAction::StartReceiving)));
    }
}
