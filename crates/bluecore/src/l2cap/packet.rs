//! L2CAP Packet handling
//!
//! Basic frames, credit based K-frames and the signalling command header.

use super::constants::*;
use super::types::*;
use byteorder::{ByteOrder, LittleEndian};

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        Some(Self {
            length: LittleEndian::read_u16(&data[0..2]),
            channel_id: LittleEndian::read_u16(&data[2..4]),
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut result[0..2], self.length);
        LittleEndian::write_u16(&mut result[2..4], self.channel_id);
        result
    }
}

/// Split a complete basic frame into its header and payload.
///
/// The payload must match the header length exactly.
pub fn split_pdu(data: &[u8]) -> L2capResult<(L2capHeader, &[u8])> {
    let header = L2capHeader::parse(data)
        .ok_or_else(|| L2capError::InvalidParameter("PDU shorter than basic header".into()))?;
    let payload = &data[L2CAP_BASIC_HEADER_SIZE..];
    if payload.len() != header.length as usize {
        return Err(L2capError::InvalidParameter(format!(
            "PDU length {} does not match header length {}",
            payload.len(),
            header.length
        )));
    }
    Ok((header, payload))
}

/// Build a basic frame carrying `payload` on `channel_id`.
pub fn encode_pdu(channel_id: u16, payload: &[u8]) -> Vec<u8> {
    encode_kframe(channel_id, None, payload)
}

/// Build a K-frame. The first K-frame of an SDU carries the total SDU length.
pub fn encode_kframe(channel_id: u16, sdu_len: Option<u16>, payload: &[u8]) -> Vec<u8> {
    let sdu_header = if sdu_len.is_some() { L2CAP_SDU_HEADER_SIZE } else { 0 };
    let length = (payload.len() + sdu_header) as u16;

    let mut pdu = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length as usize);
    pdu.extend_from_slice(&L2capHeader::new(length, channel_id).to_bytes());
    if let Some(sdu_len) = sdu_len {
        pdu.extend_from_slice(&sdu_len.to_le_bytes());
    }
    pdu.extend_from_slice(payload);
    pdu
}

/// L2CAP signalling command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Transaction identifier, never zero
    pub identifier: u8,
    /// Length of the command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_SIGNALING_HEADER_SIZE {
            return None;
        }

        Some(Self {
            code: data[0],
            identifier: data[1],
            length: LittleEndian::read_u16(&data[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_SIGNALING_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_SIGNALING_HEADER_SIZE];
        result[0] = self.code;
        result[1] = self.identifier;
        LittleEndian::write_u16(&mut result[2..4], self.length);
        result
    }
}
