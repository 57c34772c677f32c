//! Wire buffer handling
//!
//! This module contains the frame byte buffer used on the transmit and
//! receive paths. MAC headers are pushed in front of a payload and popped
//! off again without moving the payload bytes, so a buffer keeps headroom
//! ahead of its first valid byte.

use crate::{MacError, Result};

/// Headroom reserved in front of a fresh payload. Enough for the deepest
/// header stack the engine builds (MPDU delimiter plus a QoS data header).
pub const DEFAULT_HEADROOM: usize = 64;

/// Align a subframe length up to the 4-byte aggregation boundary.
pub fn align_to_four(size: usize) -> usize {
    (size + 3) & !3
}

/// Owned frame bytes with front headroom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Vec<u8>,
    front: usize,
}

impl FrameBuffer {
    /// Create an empty buffer with the given headroom
    pub fn with_headroom(headroom: usize) -> Self {
        Self {
            data: vec![0; headroom],
            front: headroom,
        }
    }

    /// Create a buffer holding a payload, with default headroom in front
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut data = vec![0; DEFAULT_HEADROOM + payload.len()];
        data[DEFAULT_HEADROOM..].copy_from_slice(payload);
        Self {
            data,
            front: DEFAULT_HEADROOM,
        }
    }

    /// Create a buffer from received bytes (no headroom)
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, front: 0 }
    }

    /// Valid frame bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.front..]
    }

    /// Mutable view of the valid frame bytes, for patching header fields
    /// (duration, retry bit) into an already serialized frame.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.front..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.front
    }

    pub fn is_empty(&self) -> bool {
        self.front >= self.data.len()
    }

    /// Make room for a header in front of the current bytes and return the
    /// slice to fill. Reallocates when the headroom is exhausted.
    pub fn push_front(&mut self, length: usize) -> &mut [u8] {
        if self.front < length {
            let extra = DEFAULT_HEADROOM + length;
            let mut grown = vec![0; extra + self.data.len()];
            grown[extra..].copy_from_slice(&self.data);
            self.data = grown;
            self.front += extra;
        }
        self.front -= length;
        &mut self.data[self.front..self.front + length]
    }

    /// Drop a header off the front of the buffer
    pub fn pop_front(&mut self, length: usize) -> Result<()> {
        if self.len() < length {
            return Err(MacError::Parse(format!(
                "Cannot remove {} byte header from {} byte frame",
                length,
                self.len()
            )));
        }
        self.front += length;
        Ok(())
    }

    /// Append zero padding at the tail
    pub fn add_trailing_padding(&mut self, length: usize) {
        self.data.resize(self.data.len() + length, 0);
    }

    /// Remove padding from the tail
    pub fn remove_trailing_padding(&mut self, length: usize) -> Result<()> {
        if self.len() < length {
            return Err(MacError::Parse(format!(
                "Cannot remove {} padding bytes from {} byte frame",
                length,
                self.len()
            )));
        }
        self.data.truncate(self.data.len() - length);
        Ok(())
    }

    /// Copy out the valid bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// Consume the buffer, returning the valid bytes
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.drain(..self.front);
        self.data
    }
}
