//! ACL and ISO data packet headers

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::HciError;
use crate::hci::constants::{HCI_ACL_HDR_SIZE, HCI_ISO_HDR_SIZE};

/// Packet boundary flag of an ACL data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-automatically-flushable fragment (host to controller)
    FirstNonFlushable = 0x00,
    /// Continuing fragment
    Continuation = 0x01,
    /// First automatically-flushable fragment
    First = 0x02,
    /// Complete L2CAP PDU
    Complete = 0x03,
}

impl PacketBoundary {
    /// Convert from raw 2-bit value
    pub fn from_bits(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::FirstNonFlushable,
            0x01 => Self::Continuation,
            0x02 => Self::First,
            _ => Self::Complete,
        }
    }

    pub fn is_start(self) -> bool {
        self != Self::Continuation
    }
}

/// HCI ACL data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    pub handle: u16,
    pub boundary: PacketBoundary,
    pub broadcast: u8,
    pub length: u16,
}

impl AclHeader {
    pub fn new(handle: u16, boundary: PacketBoundary, length: u16) -> Self {
        Self {
            handle,
            boundary,
            broadcast: 0,
            length,
        }
    }

    /// Parse an ACL header from the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, HciError> {
        if data.len() < HCI_ACL_HDR_SIZE {
            return Err(HciError::InvalidPacketFormat);
        }

        let mut cursor = Cursor::new(data);
        let handle_flags = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| HciError::InvalidPacketFormat)?;
        let length = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| HciError::InvalidPacketFormat)?;

        Ok(Self {
            handle: handle_flags & 0x0FFF,
            boundary: PacketBoundary::from_bits((handle_flags >> 12) as u8),
            broadcast: ((handle_flags >> 14) & 0x03) as u8,
            length,
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; HCI_ACL_HDR_SIZE] {
        let handle_flags = (self.handle & 0x0FFF)
            | ((self.boundary as u16) << 12)
            | ((self.broadcast as u16 & 0x03) << 14);
        let mut out = [0u8; HCI_ACL_HDR_SIZE];
        out[..2].copy_from_slice(&handle_flags.to_le_bytes());
        out[2..].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// HCI ISO data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoHeader {
    pub handle: u16,
    pub boundary: u8,
    /// The data load header of this packet carries a time stamp
    pub timestamp: bool,
    /// Data total length, load header included
    pub length: u16,
}

impl IsoHeader {
    pub const FIRST: u8 = 0x00;
    pub const CONTINUATION: u8 = 0x01;
    pub const COMPLETE: u8 = 0x02;
    pub const LAST: u8 = 0x03;

    /// Boundary flag of a fragment given where it sits in the SDU
    pub fn boundary_for(first: bool, last: bool) -> u8 {
        match (first, last) {
            (true, true) => Self::COMPLETE,
            (true, false) => Self::FIRST,
            (false, false) => Self::CONTINUATION,
            (false, true) => Self::LAST,
        }
    }

    pub fn to_bytes(&self) -> [u8; HCI_ISO_HDR_SIZE] {
        let handle_flags = (self.handle & 0x0FFF)
            | ((self.boundary as u16 & 0x03) << 12)
            | ((self.timestamp as u16) << 14);
        let mut out = [0u8; HCI_ISO_HDR_SIZE];
        out[..2].copy_from_slice(&handle_flags.to_le_bytes());
        out[2..].copy_from_slice(&(self.length & 0x3FFF).to_le_bytes());
        out
    }
}

/// ISO data load header, sent in front of the first fragment of an SDU.
///
/// The packet status bits of the SDU length word only apply from the
/// controller and are left zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDataLoad {
    pub timestamp: Option<u32>,
    pub sequence: u16,
    pub sdu_length: u16,
}

impl IsoDataLoad {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        if let Some(timestamp) = self.timestamp {
            out.extend_from_slice(&timestamp.to_le_bytes());
        }
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&(self.sdu_length & 0x0FFF).to_le_bytes());
        out
    }
}
