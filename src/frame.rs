//! 802.11 frame headers and parsing
//!
//! This module contains the wire layouts of every frame the engine sends or
//! receives and their explicit codecs. Multi-byte fields are little-endian
//! except the EtherType, which rides big-endian inside the LLC header.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::addr::MacAddress;
use crate::seq::{circular_difference, SequenceNumber};
use crate::time::{AssociationId, DurationField};
use crate::{MacError, Result};

/// EtherType placeholder when the network layer did not specify one
pub const ETHERTYPE_NOT_SPECIFIED: u16 = 0x0000;

/// Number of bits in a Block-Ack bitmap
pub const BLOCK_ACK_BITMAP_BITS: u16 = 64;

/// Longest SSID name carried by a beacon
pub const SSID_LENGTH: usize = 32;

/// Channels a bonded-channel list can name
pub const MAX_BONDED_CHANNELS: usize = 8;

/// 6-bit frame type and subtype codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    AssociationRequest,
    AssociationResponse,
    ReassociationRequest,
    ReassociationResponse,
    Beacon,
    Disassociation,
    Authentication,
    ResourceAllocation,
    BlockAckRequest,
    BlockAck,
    PowerSavePoll,
    Rts,
    Cts,
    Ack,
    QosNull,
    QosData,
    Unknown(u8),
}

impl FrameType {
    /// The 6-bit code carried on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::AssociationRequest => 0x00,
            Self::AssociationResponse => 0x01,
            Self::ReassociationRequest => 0x02,
            Self::ReassociationResponse => 0x03,
            Self::Beacon => 0x08,
            Self::Disassociation => 0x0A,
            Self::Authentication => 0x0B,
            Self::ResourceAllocation => 0x10,
            Self::BlockAckRequest => 0x18,
            Self::BlockAck => 0x19,
            Self::PowerSavePoll => 0x1A,
            Self::Rts => 0x1B,
            Self::Cts => 0x1C,
            Self::Ack => 0x1D,
            Self::QosNull => 0x24,
            Self::QosData => 0x28,
            Self::Unknown(code) => *code & 0x3F,
        }
    }

    /// Management class test: the top two bits of the code are clear.
    /// Resource Allocation (0x10) deliberately fails this test; it is a
    /// short beacon dispatched on its own.
    pub fn is_management_class(&self) -> bool {
        (self.code() & 0x30) == 0
    }
}

impl From<u8> for FrameType {
    fn from(code: u8) -> Self {
        match code & 0x3F {
            0x00 => Self::AssociationRequest,
            0x01 => Self::AssociationResponse,
            0x02 => Self::ReassociationRequest,
            0x03 => Self::ReassociationResponse,
            0x08 => Self::Beacon,
            0x0A => Self::Disassociation,
            0x0B => Self::Authentication,
            0x10 => Self::ResourceAllocation,
            0x18 => Self::BlockAckRequest,
            0x19 => Self::BlockAck,
            0x1A => Self::PowerSavePoll,
            0x1B => Self::Rts,
            0x1C => Self::Cts,
            0x1D => Self::Ack,
            0x24 => Self::QosNull,
            0x28 => Self::QosData,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        frame_type.code()
    }
}

/// 16-bit Frame Control field.
///
/// Byte 0 carries two reserved bits and the type code; byte 1 carries the
/// ToDS/FromDS pair, the retry flag and the power-management flag. Reserved
/// bits round-trip as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub wireless_distribution: bool,
    pub is_retry: bool,
    pub power_management: bool,
}

impl FrameControl {
    pub const SIZE: usize = 2;

    /// Create a frame control field for a type, all flags clear
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            wireless_distribution: false,
            is_retry: false,
            power_management: false,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for frame control".to_string()));
        }

        let byte0 = buf.get_u8();
        let byte1 = buf.get_u8();

        Ok(Self {
            frame_type: FrameType::from((byte0 >> 2) & 0x3F),
            wireless_distribution: (byte1 & 0x03) == 0x03,
            is_retry: (byte1 & 0x08) != 0,
            power_management: (byte1 & 0x10) != 0,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8((self.frame_type.code() & 0x3F) << 2);

        let mut byte1 = 0u8;
        if self.wireless_distribution {
            byte1 |= 0x03;
        }
        if self.is_retry {
            byte1 |= 0x08;
        }
        if self.power_management {
            byte1 |= 0x10;
        }
        buf.put_u8(byte1);
        Ok(())
    }
}

/// Header prefix shared by every frame: frame control, duration, receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonFrameHeader {
    pub frame_control: FrameControl,
    pub duration: DurationField,
    pub receiver: MacAddress,
}

impl CommonFrameHeader {
    pub const SIZE: usize = FrameControl::SIZE + 2 + MacAddress::LENGTH;

    pub fn new(frame_type: FrameType, receiver: MacAddress) -> Self {
        Self {
            frame_control: FrameControl::new(frame_type),
            duration: 0,
            receiver,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for common frame header".to_string()));
        }

        let frame_control = FrameControl::parse(buf)?;
        let duration = buf.get_u16_le();
        let receiver = get_mac_address(buf);

        Ok(Self {
            frame_control,
            duration,
            receiver,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.frame_control.serialize(buf)?;
        buf.put_u16_le(self.duration);
        buf.put_slice(self.receiver.bytes());
        Ok(())
    }
}

fn get_mac_address(buf: &mut impl Buf) -> MacAddress {
    let mut bytes = [0u8; 6];
    buf.copy_to_slice(&mut bytes);
    MacAddress::new(bytes)
}

fn put_sequence_control(buf: &mut impl BufMut, sequence_number: SequenceNumber) {
    buf.put_u16_le(sequence_number & 0x0FFF);
}

fn get_sequence_control(buf: &mut impl Buf) -> SequenceNumber {
    buf.get_u16_le() & 0x0FFF
}

/// Request To Send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsFrame {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
}

impl RtsFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH + 4;

    pub fn new(receiver: MacAddress, transmitter: MacAddress) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::Rts, receiver),
            transmitter,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for RTS frame".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        buf.advance(4); // FCS

        Ok(Self { header, transmitter })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        buf.put_bytes(0, 4);
        Ok(())
    }
}

/// Clear To Send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtsFrame {
    pub header: CommonFrameHeader,
}

impl CtsFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + 4;

    pub fn new(receiver: MacAddress) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::Cts, receiver),
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for CTS frame".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        buf.advance(4); // FCS

        Ok(Self { header })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_bytes(0, 4);
        Ok(())
    }
}

/// Acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub header: CommonFrameHeader,
}

impl AckFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + 4;

    pub fn new(receiver: MacAddress) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::Ack, receiver),
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for ACK frame".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        buf.advance(4); // FCS

        Ok(Self { header })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_bytes(0, 4);
        Ok(())
    }
}

/// Power-Save Poll. The duration field is overlaid with the association id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsPollFrame {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
}

impl PsPollFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH + 4;

    pub fn new(receiver: MacAddress, transmitter: MacAddress, association_id: AssociationId) -> Self {
        let mut header = CommonFrameHeader::new(FrameType::PowerSavePoll, receiver);
        header.duration = association_id;
        Self { header, transmitter }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for PS-Poll frame".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        buf.advance(4); // FCS

        Ok(Self { header, transmitter })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        buf.put_bytes(0, 4);
        Ok(())
    }

    /// The association id carried in place of a duration
    pub fn association_id(&self) -> AssociationId {
        self.header.duration
    }
}

/// 802.2 LLC header carrying the payload EtherType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlcHeader {
    pub ether_type: u16,
}

impl LlcHeader {
    pub const SIZE: usize = 8;

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for LLC header".to_string()));
        }

        buf.advance(6); // reserved and VLAN tag bytes
        let ether_type = buf.get_u16();

        Ok(Self { ether_type })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_bytes(0, 6);
        buf.put_u16(self.ether_type);
        Ok(())
    }
}

/// QoS-Data / QoS-Null header.
///
/// Both share a 30-byte prefix; QoS-Data appends the LLC header for its
/// payload. The `ether_type` tag selects the variant and must agree with
/// the frame control type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrameHeader {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
    pub sequence_number: SequenceNumber,
    pub traffic_id: u8,
    pub ether_type: Option<u16>,
}

impl DataFrameHeader {
    pub const NULL_SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH * 2 + 2 + 2 + 4;
    pub const DATA_SIZE: usize = Self::NULL_SIZE + LlcHeader::SIZE;

    /// Create a QoS-Data header
    pub fn new_data(
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: SequenceNumber,
        traffic_id: u8,
        ether_type: u16,
    ) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::QosData, receiver),
            transmitter,
            sequence_number,
            traffic_id,
            ether_type: Some(ether_type),
        }
    }

    /// Create a QoS-Null header
    pub fn new_null(
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: SequenceNumber,
        traffic_id: u8,
    ) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::QosNull, receiver),
            transmitter,
            sequence_number,
            traffic_id,
            ether_type: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ether_type.is_none()
    }

    pub fn size(&self) -> usize {
        if self.is_null() {
            Self::NULL_SIZE
        } else {
            Self::DATA_SIZE
        }
    }

    /// Parse from buffer, dispatching on the frame control type code
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::NULL_SIZE {
            return Err(MacError::Parse("Insufficient data for data frame header".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        buf.advance(6); // address 3
        let sequence_number = get_sequence_control(buf);
        let traffic_id = (buf.get_u16_le() & 0x0F) as u8;
        buf.advance(4); // FCS

        let ether_type = match header.frame_control.frame_type {
            FrameType::QosData => Some(LlcHeader::parse(buf)?.ether_type),
            FrameType::QosNull => None,
            other => {
                return Err(MacError::Parse(format!(
                    "Frame type code {:#04x} is not a data frame",
                    other.code()
                )));
            }
        };

        Ok(Self {
            header,
            transmitter,
            sequence_number,
            traffic_id,
            ether_type,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        buf.put_bytes(0, 6); // address 3
        put_sequence_control(buf, self.sequence_number);
        buf.put_u8(self.traffic_id & 0x0F);
        buf.put_u8(0);
        buf.put_bytes(0, 4); // FCS

        if let Some(ether_type) = self.ether_type {
            LlcHeader { ether_type }.serialize(buf)?;
        }
        Ok(())
    }
}

/// Block-Ack response with a 64-bit receive bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAckFrame {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
    pub traffic_id: u8,
    pub starting_sequence_number: SequenceNumber,
    pub bitmap: u64,
}

impl BlockAckFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH + 2 + 2 + 4 + 8;

    pub fn new(
        receiver: MacAddress,
        transmitter: MacAddress,
        traffic_id: u8,
        starting_sequence_number: SequenceNumber,
        bitmap: u64,
    ) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::BlockAck, receiver),
            transmitter,
            traffic_id,
            starting_sequence_number,
            bitmap,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for Block-Ack frame".to_string()));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        let (traffic_id, starting_sequence_number) = parse_block_ack_control(buf);
        buf.advance(4); // FCS
        let bitmap = buf.get_u64_le();

        Ok(Self {
            header,
            transmitter,
            traffic_id,
            starting_sequence_number,
            bitmap,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        serialize_block_ack_control(buf, self.traffic_id, self.starting_sequence_number);
        buf.put_bytes(0, 4); // FCS
        buf.put_u64_le(self.bitmap);
        Ok(())
    }

    /// Test whether a sequence number is acknowledged by this Block-Ack.
    /// Numbers outside the 64-frame window are not acknowledged.
    pub fn is_acked(&self, sequence_number: SequenceNumber) -> bool {
        let offset = circular_difference(sequence_number, self.starting_sequence_number);
        if offset < 0 || offset >= BLOCK_ACK_BITMAP_BITS as i32 {
            return false;
        }
        (self.bitmap >> offset) & 1 != 0
    }
}

/// Block-Ack Request. Also doubles as session establishment: the first BAR
/// on a link starts the receiver's reorder window at its starting sequence
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAckRequestFrame {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
    pub traffic_id: u8,
    pub starting_sequence_number: SequenceNumber,
}

impl BlockAckRequestFrame {
    pub const SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH + 2 + 2 + 4;

    pub fn new(
        receiver: MacAddress,
        transmitter: MacAddress,
        traffic_id: u8,
        starting_sequence_number: SequenceNumber,
    ) -> Self {
        Self {
            header: CommonFrameHeader::new(FrameType::BlockAckRequest, receiver),
            transmitter,
            traffic_id,
            starting_sequence_number,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse(
                "Insufficient data for Block-Ack Request frame".to_string(),
            ));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        let (traffic_id, starting_sequence_number) = parse_block_ack_control(buf);
        buf.advance(4); // FCS

        Ok(Self {
            header,
            transmitter,
            traffic_id,
            starting_sequence_number,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        serialize_block_ack_control(buf, self.traffic_id, self.starting_sequence_number);
        buf.put_bytes(0, 4); // FCS
        Ok(())
    }
}

// BA control (2 bytes, TID in the high nibble of the second) followed by the
// starting sequence control (sequence in the high 12 bits, unlike the data
// frame sequence control).
fn serialize_block_ack_control(
    buf: &mut impl BufMut,
    traffic_id: u8,
    starting_sequence_number: SequenceNumber,
) {
    buf.put_u8(0);
    buf.put_u8((traffic_id & 0x0F) << 4);
    buf.put_u16_le((starting_sequence_number & 0x0FFF) << 4);
}

fn parse_block_ack_control(buf: &mut impl Buf) -> (u8, SequenceNumber) {
    buf.advance(1);
    let traffic_id = buf.get_u8() >> 4;
    let starting_sequence_number = buf.get_u16_le() >> 4;
    (traffic_id, starting_sequence_number)
}

/// Header shared by management frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementFrameHeader {
    pub header: CommonFrameHeader,
    pub transmitter: MacAddress,
    pub sequence_number: SequenceNumber,
    pub fcs_random_bits: u16,
}

impl ManagementFrameHeader {
    pub const SIZE: usize = CommonFrameHeader::SIZE + MacAddress::LENGTH * 2 + 2 + 2 + 2;

    pub fn new(
        frame_type: FrameType,
        receiver: MacAddress,
        transmitter: MacAddress,
        sequence_number: SequenceNumber,
    ) -> Self {
        Self {
            header: CommonFrameHeader::new(frame_type, receiver),
            transmitter,
            sequence_number,
            fcs_random_bits: 0,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse(
                "Insufficient data for management frame header".to_string(),
            ));
        }

        let header = CommonFrameHeader::parse(buf)?;
        let transmitter = get_mac_address(buf);
        buf.advance(6); // address 3
        let sequence_number = get_sequence_control(buf);
        buf.advance(2); // shortened FCS
        let fcs_random_bits = buf.get_u16();

        Ok(Self {
            header,
            transmitter,
            sequence_number,
            fcs_random_bits,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.header.serialize(buf)?;
        buf.put_slice(self.transmitter.bytes());
        buf.put_bytes(0, 6); // address 3
        put_sequence_control(buf, self.sequence_number);
        buf.put_bytes(0, 2); // shortened FCS
        buf.put_u16(self.fcs_random_bits);
        Ok(())
    }
}

/// SSID information element, fixed 34 bytes on this wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsidElement {
    pub ssid: String,
}

impl SsidElement {
    pub const SIZE: usize = 2 + SSID_LENGTH;
    pub const ELEMENT_ID: u8 = 0;

    pub fn new(ssid: &str) -> Result<Self> {
        if ssid.len() > SSID_LENGTH {
            return Err(MacError::Config(format!(
                "SSID '{}' exceeds {} bytes",
                ssid, SSID_LENGTH
            )));
        }
        Ok(Self { ssid: ssid.to_string() })
    }

    /// Empty SSID matching any network
    pub fn is_wildcard(&self) -> bool {
        self.ssid.is_empty()
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for SSID element".to_string()));
        }

        buf.advance(1); // element id
        let length = buf.get_u8() as usize;
        if length > SSID_LENGTH {
            return Err(MacError::Parse(format!("SSID length {} exceeds maximum", length)));
        }

        let mut name = [0u8; SSID_LENGTH];
        buf.copy_to_slice(&mut name);
        let ssid = std::str::from_utf8(&name[..length])
            .map_err(|e| MacError::Parse(format!("Invalid UTF-8 in SSID: {}", e)))?
            .to_string();

        Ok(Self { ssid })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(Self::ELEMENT_ID);
        buf.put_u8(self.ssid.len() as u8);
        buf.put_slice(self.ssid.as_bytes());
        buf.put_bytes(0, SSID_LENGTH - self.ssid.len());
        Ok(())
    }
}

/// HT capabilities element; only the aggregation flag is meaningful here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HtCapabilitiesElement {
    pub aggregate_mpdus_are_enabled: bool,
}

impl HtCapabilitiesElement {
    pub const SIZE: usize = 28;

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse(
                "Insufficient data for HT capabilities element".to_string(),
            ));
        }

        let aggregate_mpdus_are_enabled = buf.get_u8() != 0;
        buf.advance(Self::SIZE - 1);

        Ok(Self { aggregate_mpdus_are_enabled })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(self.aggregate_mpdus_are_enabled as u8);
        buf.put_bytes(0, Self::SIZE - 1);
        Ok(())
    }
}

/// HT operation element; carries the bonded channel list, 0xFF terminated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HtOperationElement {
    pub bonded_channel_list: Vec<u8>,
}

impl HtOperationElement {
    pub const SIZE: usize = 24;

    pub fn new(bonded_channel_list: Vec<u8>) -> Result<Self> {
        if bonded_channel_list.len() > MAX_BONDED_CHANNELS {
            return Err(MacError::Config(format!(
                "Bonded channel list of {} exceeds {} channels",
                bonded_channel_list.len(),
                MAX_BONDED_CHANNELS
            )));
        }
        if bonded_channel_list.contains(&0xFF) {
            return Err(MacError::Config("Channel number 0xFF is reserved".to_string()));
        }
        Ok(Self { bonded_channel_list })
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse(
                "Insufficient data for HT operation element".to_string(),
            ));
        }

        buf.advance(Self::SIZE - MAX_BONDED_CHANNELS);
        let mut channels = [0u8; MAX_BONDED_CHANNELS];
        buf.copy_to_slice(&mut channels);

        let count = channels.iter().position(|&c| c == 0xFF).unwrap_or(MAX_BONDED_CHANNELS);
        Ok(Self {
            bonded_channel_list: channels[..count].to_vec(),
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_bytes(0, Self::SIZE - MAX_BONDED_CHANNELS);
        buf.put_slice(&self.bonded_channel_list);
        buf.put_bytes(0xFF, MAX_BONDED_CHANNELS - self.bonded_channel_list.len());
        Ok(())
    }
}

/// Beacon frame with SSID and HT elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconFrame {
    pub management_header: ManagementFrameHeader,
    pub ssid: SsidElement,
    pub ht_capabilities: HtCapabilitiesElement,
    pub ht_operation: HtOperationElement,
}

impl BeaconFrame {
    pub const SIZE: usize = ManagementFrameHeader::SIZE
        + 8 // timestamp
        + 2 // beacon interval
        + 2 // capability information
        + SsidElement::SIZE
        + 10 // supported rates element
        + HtCapabilitiesElement::SIZE
        + HtOperationElement::SIZE;

    pub fn new(
        transmitter: MacAddress,
        sequence_number: SequenceNumber,
        ssid: SsidElement,
        ht_capabilities: HtCapabilitiesElement,
        ht_operation: HtOperationElement,
    ) -> Self {
        Self {
            management_header: ManagementFrameHeader::new(
                FrameType::Beacon,
                MacAddress::BROADCAST,
                transmitter,
                sequence_number,
            ),
            ssid,
            ht_capabilities,
            ht_operation,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for beacon frame".to_string()));
        }

        let management_header = ManagementFrameHeader::parse(buf)?;
        buf.advance(12); // timestamp, interval, capability
        let ssid = SsidElement::parse(buf)?;
        buf.advance(10); // supported rates
        let ht_capabilities = HtCapabilitiesElement::parse(buf)?;
        let ht_operation = HtOperationElement::parse(buf)?;

        Ok(Self {
            management_header,
            ssid,
            ht_capabilities,
            ht_operation,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        self.management_header.serialize(buf)?;
        buf.put_bytes(0, 12); // timestamp, interval, capability
        self.ssid.serialize(buf)?;
        buf.put_bytes(0, 10); // supported rates
        self.ht_capabilities.serialize(buf)?;
        self.ht_operation.serialize(buf)?;
        Ok(())
    }
}

/// Delimiter prefixed to each subframe of an MPDU aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpduDelimiter {
    pub length_bytes: u16,
    pub end_of_frame: bool,
}

impl MpduDelimiter {
    pub const SIZE: usize = 4;

    pub fn new(length_bytes: u16) -> Self {
        Self {
            length_bytes,
            end_of_frame: false,
        }
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for MPDU delimiter".to_string()));
        }

        let raw = buf.get_u16_le();
        buf.advance(2); // CRC and signature

        Ok(Self {
            length_bytes: raw >> 2,
            end_of_frame: (raw & 0x01) != 0,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        let raw = (self.length_bytes << 2) | (self.end_of_frame as u16);
        buf.put_u16_le(raw);
        buf.put_bytes(0, 2); // CRC and signature
        Ok(())
    }
}

/// Read the frame type code out of the first byte of a frame.
pub fn peek_frame_type(frame_bytes: &[u8]) -> Result<FrameType> {
    if frame_bytes.is_empty() {
        return Err(MacError::Parse("Empty frame".to_string()));
    }
    Ok(FrameType::from((frame_bytes[0] >> 2) & 0x3F))
}

/// Parse just the common header off the front of a frame.
pub fn peek_common_header(frame_bytes: &[u8]) -> Result<CommonFrameHeader> {
    let mut buf = frame_bytes;
    CommonFrameHeader::parse(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_frame_type_codes() {
        assert_eq!(FrameType::QosData.code(), 0x28);
        assert_eq!(FrameType::Ack.code(), 0x1D);
        assert_eq!(FrameType::from(0x28), FrameType::QosData);
        assert_eq!(FrameType::from(0x3F), FrameType::Unknown(0x3F));
        assert!(FrameType::Beacon.is_management_class());
        assert!(FrameType::Authentication.is_management_class());
        assert!(!FrameType::QosData.is_management_class());
        assert!(!FrameType::Ack.is_management_class());
        assert!(!FrameType::ResourceAllocation.is_management_class());
    }

    #[test]
    fn test_frame_control_round_trip() {
        let mut control = FrameControl::new(FrameType::QosData);
        control.is_retry = true;
        control.power_management = true;

        let mut bytes = Vec::new();
        control.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), FrameControl::SIZE);

        let parsed = FrameControl::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, control);
    }

    #[test]
    fn test_rts_frame_round_trip() {
        let mut rts = RtsFrame::new(addr(1), addr(2));
        rts.header.duration = 412;

        let mut bytes = Vec::new();
        rts.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), RtsFrame::SIZE);

        let parsed = RtsFrame::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, rts);
        assert_eq!(peek_frame_type(&bytes).unwrap(), FrameType::Rts);
    }

    #[test]
    fn test_cts_and_ack_sizes() {
        let mut bytes = Vec::new();
        CtsFrame::new(addr(1)).serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 14);

        bytes.clear();
        AckFrame::new(addr(1)).serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn test_ps_poll_association_id() {
        let poll = PsPollFrame::new(addr(1), addr(2), 77);
        let mut bytes = Vec::new();
        poll.serialize(&mut bytes).unwrap();

        let parsed = PsPollFrame::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.association_id(), 77);
    }

    #[test]
    fn test_data_header_round_trip() {
        let data = DataFrameHeader::new_data(addr(1), addr(2), 1234, 3, 0x0800);
        assert_eq!(data.size(), 38);

        let mut bytes = Vec::new();
        data.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), DataFrameHeader::DATA_SIZE);

        let parsed = DataFrameHeader::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, data);
        assert_eq!(parsed.ether_type, Some(0x0800));
    }

    #[test]
    fn test_null_header_round_trip() {
        let null = DataFrameHeader::new_null(addr(1), addr(2), 0, 0);
        assert_eq!(null.size(), 30);

        let mut bytes = Vec::new();
        null.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), DataFrameHeader::NULL_SIZE);

        let parsed = DataFrameHeader::parse(&mut bytes.as_slice()).unwrap();
        assert!(parsed.is_null());
        assert_eq!(parsed, null);
    }

    #[test]
    fn test_data_header_rejects_wrong_type() {
        let mut bytes = Vec::new();
        AckFrame::new(addr(1)).serialize(&mut bytes).unwrap();
        bytes.resize(DataFrameHeader::NULL_SIZE, 0);
        assert!(DataFrameHeader::parse(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_block_ack_round_trip_and_bitmap() {
        let ba = BlockAckFrame::new(addr(1), addr(2), 5, 100, 0b1011);
        let mut bytes = Vec::new();
        ba.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 32);

        let parsed = BlockAckFrame::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, ba);

        assert!(parsed.is_acked(100));
        assert!(parsed.is_acked(101));
        assert!(!parsed.is_acked(102));
        assert!(parsed.is_acked(103));
        // Outside the 64-frame window.
        assert!(!parsed.is_acked(164));
        assert!(!parsed.is_acked(99));
    }

    #[test]
    fn test_block_ack_bitmap_wraps_sequence_space() {
        let ba = BlockAckFrame::new(addr(1), addr(2), 0, 4090, u64::MAX);
        // 4090 + 10 wraps to 4.
        assert!(ba.is_acked(4));
        assert!(!ba.is_acked(4089));
    }

    #[test]
    fn test_block_ack_request_round_trip() {
        let bar = BlockAckRequestFrame::new(addr(1), addr(2), 7, 4095);
        let mut bytes = Vec::new();
        bar.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 24);

        let parsed = BlockAckRequestFrame::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, bar);
    }

    #[test]
    fn test_management_header_round_trip() {
        let header = ManagementFrameHeader::new(FrameType::Authentication, addr(1), addr(2), 9);
        let mut bytes = Vec::new();
        header.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 28);

        let parsed = ManagementFrameHeader::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_ssid_element() {
        let ssid = SsidElement::new("halow-test").unwrap();
        let mut bytes = Vec::new();
        ssid.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 34);

        let parsed = SsidElement::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.ssid, "halow-test");
        assert!(!parsed.is_wildcard());

        assert!(SsidElement::new("ssid-name-that-is-far-too-long-to-fit").is_err());
    }

    #[test]
    fn test_beacon_round_trip() {
        let beacon = BeaconFrame::new(
            addr(9),
            42,
            SsidElement::new("grid").unwrap(),
            HtCapabilitiesElement { aggregate_mpdus_are_enabled: true },
            HtOperationElement::new(vec![36, 40]).unwrap(),
        );

        let mut bytes = Vec::new();
        beacon.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), BeaconFrame::SIZE);

        let parsed = BeaconFrame::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, beacon);
        assert!(parsed.ht_capabilities.aggregate_mpdus_are_enabled);
        assert_eq!(parsed.ht_operation.bonded_channel_list, vec![36, 40]);
    }

    #[test]
    fn test_mpdu_delimiter_round_trip() {
        let delimiter = MpduDelimiter::new(1400);
        let mut bytes = Vec::new();
        delimiter.serialize(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 4);

        let parsed = MpduDelimiter::parse(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.length_bytes, 1400);
        assert!(!parsed.end_of_frame);
    }

    #[test]
    fn test_truncated_parses_fail() {
        let mut bytes = Vec::new();
        RtsFrame::new(addr(1), addr(2)).serialize(&mut bytes).unwrap();
        assert!(RtsFrame::parse(&mut &bytes[..10]).is_err());
        assert!(CommonFrameHeader::parse(&mut &bytes[..4]).is_err());
        assert!(peek_frame_type(&[]).is_err());
    }
}
