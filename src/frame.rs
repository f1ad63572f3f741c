/*!
 * Raw CAN frame as exchanged with the transport layer
 */

use std::fmt;

use crate::error::FrameError;

/// Largest payload of a classic CAN frame.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Highest 11-bit (standard) identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit (extended) identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// One classic CAN transmission unit: identifier plus up to 8 data bytes.
///
/// Fields are private so a frame can only exist with a valid ID and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    id: u32,
    is_extended: bool,
    len: u8,
    data: [u8; MAX_PAYLOAD_LEN],
}

impl Frame {
    /// Build a frame, rejecting IDs wider than the ID format and payloads over 8 bytes.
    pub fn new(id: u32, is_extended: bool, payload: &[u8]) -> Result<Self, FrameError> {
        let max_id = if is_extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if id > max_id {
            return Err(FrameError::IdOutOfRange { id, is_extended });
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong { len: payload.len() });
        }
        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Frame {
            id,
            is_extended,
            len: payload.len() as u8,
            data,
        })
    }

    /// Standard (11-bit) frame.
    pub fn standard(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::new(id, false, payload)
    }

    /// Extended (29-bit) frame.
    pub fn extended(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::new(id, true, payload)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    /// Data length code.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// candump-style `ID#DATA`, with 3 hex digits for standard and 8 for extended IDs.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}#", self.id)?;
        } else {
            write!(f, "{:03X}#", self.id)?;
        }
        for byte in self.payload() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
