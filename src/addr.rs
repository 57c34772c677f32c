//! MAC and network addressing
//!
//! This module contains the 48-bit MAC address type used throughout the
//! engine and the simulator-level network address it is resolved from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 48-bit IEEE 802 MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const LENGTH: usize = 6;

    /// All-ones broadcast address
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// All-zero placeholder address
    pub const INVALID: MacAddress = MacAddress([0; 6]);

    /// Create an address from raw bytes
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Derive an address from a simulator node id and an interface selector byte
    pub fn from_node_id(node_id: u32, selector_byte: u8) -> Self {
        let id = node_id.to_be_bytes();
        Self([0x00, selector_byte, id[0], id[1], id[2], id[3]])
    }

    /// Raw address bytes
    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit test; true for broadcast and multicast addresses
    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// Next-hop address handed down by the network layer, resolved to a
/// [`MacAddress`] before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress(pub u32);

impl NetworkAddress {
    /// Network-level broadcast
    pub const BROADCAST: NetworkAddress = NetworkAddress(u32::MAX);

    pub fn new(address: u32) -> Self {
        Self(address)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
