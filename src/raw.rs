//! 802.11ah Restricted Access Window fields
//!
//! Codecs for the RAW assignment element carried in beacons and for the
//! Resource Allocation frame that hands out per-station slots. Group
//! membership is an association-id range packed into three bytes; slot
//! timing is quantized in 120 microsecond steps above a 500 microsecond
//! floor.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::addr::MacAddress;
use crate::frame::FrameType;
use crate::time::{AssociationId, SimTime, MICRO_SECOND, TIME_UNIT};
use crate::{MacError, Result};

/// Shortest representable slot duration
pub const MIN_SLOT_DURATION: SimTime = 500 * MICRO_SECOND;

/// Slot duration step per count above the minimum
pub const SLOT_DURATION_PER_COUNT: SimTime = 120 * MICRO_SECOND;

/// Longest representable slot duration
pub const MAX_SLOT_DURATION: SimTime = MIN_SLOT_DURATION + SLOT_DURATION_PER_COUNT * 255;

/// Slot count limit imposed by the 6-bit field
pub const MAX_SLOTS_PER_WINDOW: u8 = 63;

/// Association ids per page index
const ASSOCIATION_IDS_PER_PAGE: AssociationId = 2048;

/// RAW group field naming a contiguous association-id range.
///
/// Three bytes: a 2-bit page index shared by both endpoints, the start id
/// split 6/5 bits and the end id split 3/8 bits within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGroupField {
    pub start_association_id: AssociationId,
    pub end_association_id: AssociationId,
}

impl RawGroupField {
    pub const SIZE: usize = 3;

    pub fn new(start_association_id: AssociationId, end_association_id: AssociationId) -> Result<Self> {
        if start_association_id > end_association_id {
            return Err(MacError::Config(format!(
                "RAW group start {} is after end {}",
                start_association_id, end_association_id
            )));
        }
        if end_association_id >= 4 * ASSOCIATION_IDS_PER_PAGE {
            return Err(MacError::Config(format!(
                "RAW group end {} does not fit a 2-bit page",
                end_association_id
            )));
        }
        if start_association_id / ASSOCIATION_IDS_PER_PAGE
            != end_association_id / ASSOCIATION_IDS_PER_PAGE
        {
            return Err(MacError::Config(format!(
                "RAW group {}..={} spans a page boundary",
                start_association_id, end_association_id
            )));
        }
        Ok(Self {
            start_association_id,
            end_association_id,
        })
    }

    /// Group membership test
    pub fn contains(&self, association_id: AssociationId) -> bool {
        association_id >= self.start_association_id && association_id <= self.end_association_id
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for RAW group field".to_string()));
        }

        let byte0 = buf.get_u8();
        let byte1 = buf.get_u8();
        let byte2 = buf.get_u8();

        let page = (byte0 & 0x03) as AssociationId;
        let start_high = ((byte0 >> 2) & 0x3F) as AssociationId;
        let start_low = (byte1 & 0x1F) as AssociationId;
        let end_high = ((byte1 >> 5) & 0x07) as AssociationId;
        let end_low = byte2 as AssociationId;

        Ok(Self {
            start_association_id: page * ASSOCIATION_IDS_PER_PAGE + start_high * 32 + start_low,
            end_association_id: page * ASSOCIATION_IDS_PER_PAGE + end_high * 256 + end_low,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        let page = (self.start_association_id / ASSOCIATION_IDS_PER_PAGE) as u8;
        let start_in_page = self.start_association_id % ASSOCIATION_IDS_PER_PAGE;
        let end_in_page = self.end_association_id % ASSOCIATION_IDS_PER_PAGE;

        buf.put_u8((page & 0x03) | (((start_in_page / 32) as u8 & 0x3F) << 2));
        buf.put_u8(((start_in_page % 32) as u8) | (((end_in_page / 256) as u8 & 0x07) << 5));
        buf.put_u8((end_in_page % 256) as u8);
        Ok(())
    }
}

/// RAW slot definition: slot count and quantized slot duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSlotDefinition {
    pub number_of_slots: u8,
    pub slot_duration_count: u8,
}

impl RawSlotDefinition {
    pub const SIZE: usize = 2;

    pub fn new(number_of_slots: u8, slot_duration: SimTime) -> Result<Self> {
        if number_of_slots == 0 || number_of_slots > MAX_SLOTS_PER_WINDOW {
            return Err(MacError::Config(format!(
                "RAW slot count {} is outside 1..={}",
                number_of_slots, MAX_SLOTS_PER_WINDOW
            )));
        }
        if slot_duration < MIN_SLOT_DURATION || slot_duration > MAX_SLOT_DURATION {
            return Err(MacError::Config(format!(
                "RAW slot duration {}us is outside {}us..={}us",
                slot_duration, MIN_SLOT_DURATION, MAX_SLOT_DURATION
            )));
        }
        Ok(Self {
            number_of_slots,
            slot_duration_count: ((slot_duration - MIN_SLOT_DURATION) / SLOT_DURATION_PER_COUNT) as u8,
        })
    }

    /// Duration of one slot
    pub fn slot_duration(&self) -> SimTime {
        MIN_SLOT_DURATION + SimTime::from(self.slot_duration_count) * SLOT_DURATION_PER_COUNT
    }

    /// Duration of the whole window
    pub fn window_duration(&self) -> SimTime {
        self.slot_duration() * SimTime::from(self.number_of_slots)
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse(
                "Insufficient data for RAW slot definition".to_string(),
            ));
        }

        let byte0 = buf.get_u8();
        let slot_duration_count = buf.get_u8();

        Ok(Self {
            number_of_slots: (byte0 >> 2) & 0x3F,
            slot_duration_count,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8((self.number_of_slots & 0x3F) << 2);
        buf.put_u8(self.slot_duration_count);
        Ok(())
    }
}

/// One RAW assignment inside a beacon RPS element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAssignment {
    pub uses_resource_allocation_frames: bool,
    pub slot_definition: RawSlotDefinition,
    pub group: RawGroupField,
}

impl RawAssignment {
    pub const SIZE: usize = 1 + RawSlotDefinition::SIZE + RawGroupField::SIZE;

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for RAW assignment".to_string()));
        }

        let uses_resource_allocation_frames = (buf.get_u8() & 0x01) != 0;
        let slot_definition = RawSlotDefinition::parse(buf)?;
        let group = RawGroupField::parse(buf)?;

        Ok(Self {
            uses_resource_allocation_frames,
            slot_definition,
            group,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(self.uses_resource_allocation_frames as u8);
        self.slot_definition.serialize(buf)?;
        self.group.serialize(buf)?;
        Ok(())
    }
}

/// Per-station slot grant inside a Resource Allocation frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub is_uplink: bool,
    pub association_id: AssociationId,
    pub slot_start_offset: u16,
}

impl SlotAssignment {
    pub const SIZE: usize = 4;

    pub fn new(is_uplink: bool, association_id: AssociationId, slot_start_offset: u16) -> Self {
        Self {
            is_uplink,
            association_id,
            slot_start_offset,
        }
    }

    /// Wall-clock slot start, offset counted in time units from the frame
    pub fn slot_start_time(&self, now: SimTime) -> SimTime {
        now + SimTime::from(self.slot_start_offset) * TIME_UNIT
    }

    /// Parse from buffer
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(MacError::Parse("Insufficient data for slot assignment".to_string()));
        }

        let packed = buf.get_u16_le();
        let slot_start_offset = buf.get_u16_le();

        Ok(Self {
            is_uplink: (packed & 0x0001) != 0,
            association_id: (packed >> 1) & 0x1FFF,
            slot_start_offset,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        let packed = (self.is_uplink as u16) | ((self.association_id & 0x1FFF) << 1);
        buf.put_u16_le(packed);
        buf.put_u16_le(self.slot_start_offset);
        Ok(())
    }
}

/// Resource Allocation frame: fixed header plus a run of slot assignments.
///
/// The duration field counts time units and covers the window the slot
/// assignments divide up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocationFrame {
    pub bssid: MacAddress,
    pub group: RawGroupField,
    pub raw_duration: u16,
    pub slot_assignments: Vec<SlotAssignment>,
}

impl ResourceAllocationFrame {
    pub const HEADER_SIZE: usize = 2 + MacAddress::LENGTH + RawGroupField::SIZE + 1 + 2 + 4;

    pub fn new(bssid: MacAddress, group: RawGroupField, raw_duration: u16) -> Self {
        Self {
            bssid,
            group,
            raw_duration,
            slot_assignments: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.slot_assignments.len() * SlotAssignment::SIZE
    }

    /// Parse from buffer, consuming slot assignments to the end of the frame
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(MacError::Parse(
                "Insufficient data for resource allocation frame".to_string(),
            ));
        }

        let type_code = (buf.get_u8() >> 2) & 0x3F;
        if FrameType::from(type_code) != FrameType::ResourceAllocation {
            return Err(MacError::Parse(format!(
                "Frame type code {:#04x} is not a resource allocation frame",
                type_code
            )));
        }
        buf.advance(1); // remaining frame control flags

        let mut bssid_bytes = [0u8; 6];
        buf.copy_to_slice(&mut bssid_bytes);
        let bssid = MacAddress::new(bssid_bytes);

        let group = RawGroupField::parse(buf)?;
        buf.advance(1); // reserved
        let raw_duration = buf.get_u16_le();
        buf.advance(4); // FCS

        let mut slot_assignments = Vec::new();
        while buf.remaining() >= SlotAssignment::SIZE {
            slot_assignments.push(SlotAssignment::parse(buf)?);
        }

        Ok(Self {
            bssid,
            group,
            raw_duration,
            slot_assignments,
        })
    }

    /// Serialize to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8((FrameType::ResourceAllocation.code() & 0x3F) << 2);
        buf.put_u8(0);
        buf.put_slice(self.bssid.bytes());
        self.group.serialize(buf)?;
        buf.put_u8(0); // reserved
        buf.put_u16_le(self.raw_duration);
        buf.put_bytes(0, 4); // FCS

        for assignment in &self.slot_assignments {
            assignment.serialize(buf)?;
        }
        Ok(())
    }

    /// Slot assignments granted to one station
    pub fn assignments_for(
        &self,
        association_id: AssociationId,
    ) -> impl Iterator<Item = &SlotAssignment> {
        self.slot_assignments
            .iter()
            .filter(move |assignment| assignment.association_id == association_id)
    }
}
