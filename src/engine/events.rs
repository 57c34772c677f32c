//! Engine actions and collaborator traits
//!
//! The engine never calls the outside world directly. Every externally
//! visible effect is queued as a [`MacAction`] for the host to drain, and
//! every policy decision it cannot make alone goes through an injected
//! collaborator trait.

use crate::addr::{MacAddress, NetworkAddress};
use crate::time::{AssociationId, SimTime};
use crate::wire::FrameBuffer;

/// Physical-layer parameters attached to a transmission or reception
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxParameters {
    pub data_rate_bits_per_second: u64,
    pub channel_bandwidth_mhz: u32,
}

impl TxParameters {
    pub fn new(data_rate_bits_per_second: u64, channel_bandwidth_mhz: u32) -> Self {
        Self {
            data_rate_bits_per_second,
            channel_bandwidth_mhz,
        }
    }

    /// Air time for a payload at this rate, excluding the PHY header
    pub fn frame_duration(&self, length_bytes: usize) -> SimTime {
        let bits = (length_bytes as u64) * 8;
        let rate = self.data_rate_bits_per_second.max(1);
        // Microseconds, rounded up so the medium is never under-reserved.
        (bits * 1_000_000).div_ceil(rate)
    }
}

impl Default for TxParameters {
    fn default() -> Self {
        Self {
            data_rate_bits_per_second: 650_000,
            channel_bandwidth_mhz: 2,
        }
    }
}

/// Externally visible effect requested by the engine
#[derive(Debug, Clone)]
pub enum MacAction {
    /// Arm the single wakeup timer, replacing any pending expiration
    SetWakeupTimer { expires: SimTime },
    /// Disarm the wakeup timer
    CancelWakeupTimer,
    /// Hand one frame to the physical layer after `delay`
    TransmitFrame {
        frame: FrameBuffer,
        tx_parameters: TxParameters,
        power_dbm: f64,
        delay: SimTime,
    },
    /// Hand an MPDU aggregate to the physical layer after `delay`
    TransmitAggregateFrame {
        subframes: Vec<FrameBuffer>,
        tx_parameters: TxParameters,
        power_dbm: f64,
        delay: SimTime,
    },
    /// Retune the radio to a new bonded channel set
    SwitchToChannels { channels: Vec<u8> },
    /// Leave sleep and listen to the medium again
    StartReceiving,
    /// Stop listening to the medium
    StopReceiving,
    /// Pass a received payload up to the network layer
    DeliverPacket {
        payload: FrameBuffer,
        source: MacAddress,
        ether_type: u16,
    },
    /// Return a packet the engine could not deliver
    PacketUndeliverable {
        payload: FrameBuffer,
        next_hop_address: NetworkAddress,
    },
    /// Surface a received management frame to the management plane
    ManagementFrameReceived { frame: FrameBuffer },
    /// A beacon the management plane handed us has finished transmitting
    BeaconTransmitted,
    /// A station polled for buffered traffic
    PsPollReceived {
        from: MacAddress,
        association_id: AssociationId,
    },
    /// A peer toggled its power-management bit
    PowerManagementChanged { from: MacAddress, sleeping: bool },
}

/// Chooses transmit parameters per destination and reacts to delivery
/// feedback.
pub trait RateController {
    /// Parameters for a unicast data frame to `destination`
    fn data_tx_parameters(&mut self, destination: MacAddress) -> TxParameters;

    /// Parameters for a management frame to `destination`
    fn management_tx_parameters(&mut self, destination: MacAddress) -> TxParameters;

    /// Parameters for a control response matching a received transmission
    fn response_tx_parameters(&mut self, received: &TxParameters) -> TxParameters;

    /// The most robust rate the station supports
    fn lowest_tx_parameters(&mut self) -> TxParameters;

    fn notify_ack_received(&mut self, destination: MacAddress);

    fn notify_ack_failed(&mut self, destination: MacAddress);
}

/// Chooses transmit power per destination
pub trait TransmitPowerController {
    fn current_transmit_power_dbm(&mut self, destination: MacAddress) -> f64;
}

/// Maps network-layer next hops onto link-layer addresses
pub trait NextHopResolver {
    fn resolve(&mut self, next_hop_address: NetworkAddress) -> Option<MacAddress>;
}

/// Rate controller that always answers with one fixed rate
#[derive(Debug, Clone)]
pub struct FixedRateController {
    pub tx_parameters: TxParameters,
}

impl FixedRateController {
    pub fn new(tx_parameters: TxParameters) -> Self {
        Self { tx_parameters }
    }
}

impl Default for FixedRateController {
    fn default() -> Self {
        Self {
            tx_parameters: TxParameters::default(),
        }
    }
}

impl RateController for FixedRateController {
    fn data_tx_parameters(&mut self, _destination: MacAddress) -> TxParameters {
        self.tx_parameters
    }

    fn management_tx_parameters(&mut self, _destination: MacAddress) -> TxParameters {
        self.tx_parameters
    }

    fn response_tx_parameters(&mut self, received: &TxParameters) -> TxParameters {
        *received
    }

    fn lowest_tx_parameters(&mut self) -> TxParameters {
        self.tx_parameters
    }

    fn notify_ack_received(&mut self, _destination: MacAddress) {}

    fn notify_ack_failed(&mut self, _destination: MacAddress) {}
}

/// Power controller that always answers with one fixed level
#[derive(Debug, Clone)]
pub struct FixedPowerController {
    pub power_dbm: f64,
}

impl FixedPowerController {
    pub fn new(power_dbm: f64) -> Self {
        Self { power_dbm }
    }
}

impl Default for FixedPowerController {
    fn default() -> Self {
        Self { power_dbm: 0.0 }
    }
}

impl TransmitPowerController for FixedPowerController {
    fn current_transmit_power_dbm(&mut self, _destination: MacAddress) -> f64 {
        self.power_dbm
    }
}

/// Resolver for flat simulated networks where the network address is the
/// node id.
#[derive(Debug, Clone)]
pub struct NodeIdResolver {
    pub selector_byte: u8,
}

impl NodeIdResolver {
    pub fn new(selector_byte: u8) -> Self {
        Self { selector_byte }
    }
}

impl Default for NodeIdResolver {
    fn default() -> Self {
        Self { selector_byte: 0 }
    }
}

impl NextHopResolver for NodeIdResolver {
    fn resolve(&mut self, next_hop_address: NetworkAddress) -> Option<MacAddress> {
        if next_hop_address.is_broadcast() {
            Some(MacAddress::BROADCAST)
        } else {
            Some(MacAddress::from_node_id(next_hop_address.0, self.selector_byte))
        }
    }
}
