//! L2CAP Signaling channel implementation
//!
//! Codec for the commands carried on the BR/EDR (0x0001) and LE (0x0005)
//! signalling channels. Each command starts with a one byte code, a one byte
//! identifier and a two byte parameter length.

use super::constants::*;
use super::packet::*;
use super::types::*;
use crate::conn::ConnParams;
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::io::{Cursor, Read};

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request (BR/EDR)
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    /// Connection Response (BR/EDR)
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request (BR/EDR). Only the MTU option is interpreted.
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        mtu: Option<u16>,
    },

    /// Configuration Response (BR/EDR)
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        mtu: Option<u16>,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Echo Request (BR/EDR)
    EchoRequest { identifier: SignalId, data: Vec<u8> },

    /// Echo Response (BR/EDR)
    EchoResponse { identifier: SignalId, data: Vec<u8> },

    /// Information Request (BR/EDR)
    InformationRequest { identifier: SignalId, info_type: u16 },

    /// Information Response (BR/EDR)
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    /// Connection Parameter Update Request (LE only)
    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnParams,
    },

    /// Connection Parameter Update Response (LE only)
    ConnectionParameterUpdateResponse { identifier: SignalId, result: u16 },

    /// LE Credit Based Connection Request
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    /// LE Credit Based Connection Response
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    /// Flow Control Credit Indication
    FlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },

    /// Enhanced Credit Based Connection Request
    EcredConnectionRequest {
        identifier: SignalId,
        psm: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        source_cids: Vec<u16>,
    },

    /// Enhanced Credit Based Connection Response
    EcredConnectionResponse {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
        destination_cids: Vec<u16>,
    },

    /// Enhanced Credit Based Reconfigure Request
    EcredReconfigureRequest {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        destination_cids: Vec<u16>,
    },

    /// Enhanced Credit Based Reconfigure Response
    EcredReconfigureResponse { identifier: SignalId, result: u16 },

    /// Command with a code this host does not implement
    Unknown { identifier: SignalId, code: u8 },
}

fn short(what: &str) -> L2capError {
    L2capError::InvalidParameter(format!("{} too short", what))
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<u16> {
    cursor.read_u16::<LittleEndian>().map_err(|_| short(what))
}

fn put(value: u16, params: &mut Vec<u8>) {
    params.extend_from_slice(&value.to_le_bytes());
}

fn read_rest(cursor: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut rest = Vec::new();
    // Reading from an in-memory cursor cannot fail.
    let _ = cursor.read_to_end(&mut rest);
    rest
}

fn read_cids(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<Vec<u16>> {
    let rest = read_rest(cursor);
    if rest.len() % 2 != 0 {
        return Err(L2capError::InvalidParameter(format!(
            "{} has an odd CID list length",
            what
        )));
    }
    let cids: Vec<u16> = rest
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    if cids.is_empty() || cids.len() > L2CAP_ECRED_CHAN_MAX {
        return Err(L2capError::InvalidParameter(format!(
            "{} carries {} CIDs",
            what,
            cids.len()
        )));
    }
    Ok(cids)
}

impl SignalingMessage {
    /// Get the message identifier
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::FlowControlCredit { identifier, .. }
            | Self::EcredConnectionRequest { identifier, .. }
            | Self::EcredConnectionResponse { identifier, .. }
            | Self::EcredReconfigureRequest { identifier, .. }
            | Self::EcredReconfigureResponse { identifier, .. }
            | Self::Unknown { identifier, .. } => *identifier,
        }
    }

    /// Get the command code for this message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST
            }
            Self::ConnectionParameterUpdateResponse { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE
            }
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => {
                L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE
            }
            Self::FlowControlCredit { .. } => L2CAP_FLOW_CONTROL_CREDIT,
            Self::EcredConnectionRequest { .. } => L2CAP_ECRED_CONNECTION_REQUEST,
            Self::EcredConnectionResponse { .. } => L2CAP_ECRED_CONNECTION_RESPONSE,
            Self::EcredReconfigureRequest { .. } => L2CAP_ECRED_RECONFIGURE_REQUEST,
            Self::EcredReconfigureResponse { .. } => L2CAP_ECRED_RECONFIGURE_RESPONSE,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// Whether this command answers a request we sent
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::CommandReject { .. }
                | Self::ConnectionResponse { .. }
                | Self::ConfigureResponse { .. }
                | Self::DisconnectionResponse { .. }
                | Self::EchoResponse { .. }
                | Self::InformationResponse { .. }
                | Self::ConnectionParameterUpdateResponse { .. }
                | Self::LeCreditBasedConnectionResponse { .. }
                | Self::EcredConnectionResponse { .. }
                | Self::EcredReconfigureResponse { .. }
        )
    }

    fn parse_mtu_option(options: &[u8]) -> L2capResult<Option<u16>> {
        let mut mtu = None;
        let mut rest = options;
        while rest.len() >= 2 {
            let kind = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(short("Configuration option"));
            }
            let value = &rest[2..2 + len];
            match kind & !L2CAP_CONF_OPT_HINT {
                L2CAP_CONF_OPT_MTU if len == 2 => {
                    mtu = Some(u16::from_le_bytes([value[0], value[1]]));
                }
                other => debug!("Ignoring configuration option 0x{:02x}", other),
            }
            rest = &rest[2 + len..];
        }
        Ok(mtu)
    }

    fn serialize_mtu_option(params: &mut Vec<u8>, mtu: Option<u16>) {
        if let Some(mtu) = mtu {
            params.push(L2CAP_CONF_OPT_MTU);
            params.push(2);
            params.extend_from_slice(&mtu.to_le_bytes());
        }
    }

    /// Parse a single signaling command.
    ///
    /// `data` starts at the command header. Returns the message and the
    /// number of bytes it occupied, so BR/EDR C-frames carrying several
    /// commands can be walked.
    pub fn parse(data: &[u8]) -> L2capResult<(Self, usize)> {
        let header = L2capCommandHeader::parse(data).ok_or_else(|| short("Signaling data"))?;
        let end = L2CAP_SIGNALING_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(short("Command parameters"));
        }
        let params = &data[L2CAP_SIGNALING_HEADER_SIZE..end];
        let identifier = header.identifier;
        if identifier == 0 {
            return Err(L2capError::InvalidParameter(
                "Signaling identifier 0 is reserved".into(),
            ));
        }
        let mut cursor = Cursor::new(params);
        let c = &mut cursor;

        let message = match header.code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: read_u16(c, "Command reject")?,
                data: read_rest(c),
            },

            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: read_u16(c, "Connection request")?,
                source_cid: read_u16(c, "Connection request")?,
            },

            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: read_u16(c, "Connection response")?,
                source_cid: read_u16(c, "Connection response")?,
                result: read_u16(c, "Connection response")?,
                status: read_u16(c, "Connection response")?,
            },

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = read_u16(c, "Configure request")?;
                let flags = read_u16(c, "Configure request")?;
                let mtu = Self::parse_mtu_option(&read_rest(c))?;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    mtu,
                }
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = read_u16(c, "Configure response")?;
                let flags = read_u16(c, "Configure response")?;
                let result = read_u16(c, "Configure response")?;
                let mtu = Self::parse_mtu_option(&read_rest(c))?;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    mtu,
                }
            }

            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: read_u16(c, "Disconnection request")?,
                source_cid: read_u16(c, "Disconnection request")?,
            },

            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: read_u16(c, "Disconnection response")?,
                source_cid: read_u16(c, "Disconnection response")?,
            },

            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: read_rest(c),
            },

            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: read_rest(c),
            },

            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: read_u16(c, "Information request")?,
            },

            L2CAP_INFORMATION_RESPONSE => Self::InformationResponse {
                identifier,
                info_type: read_u16(c, "Information response")?,
                result: read_u16(c, "Information response")?,
                data: read_rest(c),
            },

            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => {
                if params.len() != 8 {
                    return Err(L2capError::InvalidParameter(
                        "Connection parameter update request must be 8 bytes".into(),
                    ));
                }
                Self::ConnectionParameterUpdateRequest {
                    identifier,
                    params: ConnParams {
                        interval_min: read_u16(c, "Connection parameter update")?,
                        interval_max: read_u16(c, "Connection parameter update")?,
                        latency: read_u16(c, "Connection parameter update")?,
                        timeout: read_u16(c, "Connection parameter update")?,
                    },
                }
            }

            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => Self::ConnectionParameterUpdateResponse {
                identifier,
                result: read_u16(c, "Connection parameter update response")?,
            },

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: read_u16(c, "LE credit based connection request")?,
                source_cid: read_u16(c, "LE credit based connection request")?,
                mtu: read_u16(c, "LE credit based connection request")?,
                mps: read_u16(c, "LE credit based connection request")?,
                initial_credits: read_u16(c, "LE credit based connection request")?,
            },

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: read_u16(c, "LE credit based connection response")?,
                mtu: read_u16(c, "LE credit based connection response")?,
                mps: read_u16(c, "LE credit based connection response")?,
                initial_credits: read_u16(c, "LE credit based connection response")?,
                result: read_u16(c, "LE credit based connection response")?,
            },

            L2CAP_FLOW_CONTROL_CREDIT => Self::FlowControlCredit {
                identifier,
                cid: read_u16(c, "Flow control credit")?,
                credits: read_u16(c, "Flow control credit")?,
            },

            L2CAP_ECRED_CONNECTION_REQUEST => {
                let psm = read_u16(c, "Enhanced connection request")?;
                let mtu = read_u16(c, "Enhanced connection request")?;
                let mps = read_u16(c, "Enhanced connection request")?;
                let initial_credits = read_u16(c, "Enhanced connection request")?;
                Self::EcredConnectionRequest {
                    identifier,
                    psm,
                    mtu,
                    mps,
                    initial_credits,
                    source_cids: read_cids(c, "Enhanced connection request")?,
                }
            }

            L2CAP_ECRED_CONNECTION_RESPONSE => {
                let mtu = read_u16(c, "Enhanced connection response")?;
                let mps = read_u16(c, "Enhanced connection response")?;
                let initial_credits = read_u16(c, "Enhanced connection response")?;
                let result = read_u16(c, "Enhanced connection response")?;
                Self::EcredConnectionResponse {
                    identifier,
                    mtu,
                    mps,
                    initial_credits,
                    result,
                    destination_cids: read_cids(c, "Enhanced connection response")?,
                }
            }

            L2CAP_ECRED_RECONFIGURE_REQUEST => {
                let mtu = read_u16(c, "Reconfigure request")?;
                let mps = read_u16(c, "Reconfigure request")?;
                Self::EcredReconfigureRequest {
                    identifier,
                    mtu,
                    mps,
                    destination_cids: read_cids(c, "Reconfigure request")?,
                }
            }

            L2CAP_ECRED_RECONFIGURE_RESPONSE => Self::EcredReconfigureResponse {
                identifier,
                result: read_u16(c, "Reconfigure response")?,
            },

            code => Self::Unknown { identifier, code },
        };

        Ok((message, end))
    }

    /// Serialize the signaling message, command header included
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();
        match self {
            Self::CommandReject { reason, data, .. } => {
                put(*reason, &mut params);
                params.extend_from_slice(data);
            }
            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                put(*psm, &mut params);
                put(*source_cid, &mut params);
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                put(*destination_cid, &mut params);
                put(*source_cid, &mut params);
                put(*result, &mut params);
                put(*status, &mut params);
            }
            Self::ConfigureRequest {
                destination_cid,
                flags,
                mtu,
                ..
            } => {
                put(*destination_cid, &mut params);
                put(*flags, &mut params);
                Self::serialize_mtu_option(&mut params, *mtu);
            }
            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                mtu,
                ..
            } => {
                put(*source_cid, &mut params);
                put(*flags, &mut params);
                put(*result, &mut params);
                Self::serialize_mtu_option(&mut params, *mtu);
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                put(*destination_cid, &mut params);
                put(*source_cid, &mut params);
            }
            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => {
                params.extend_from_slice(data);
            }
            Self::InformationRequest { info_type, .. } => put(*info_type, &mut params),
            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                put(*info_type, &mut params);
                put(*result, &mut params);
                params.extend_from_slice(data);
            }
            Self::ConnectionParameterUpdateRequest { params: p, .. } => {
                put(p.interval_min, &mut params);
                put(p.interval_max, &mut params);
                put(p.latency, &mut params);
                put(p.timeout, &mut params);
            }
            Self::ConnectionParameterUpdateResponse { result, .. }
            | Self::EcredReconfigureResponse { result, .. } => put(*result, &mut params),
            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                put(*le_psm, &mut params);
                put(*source_cid, &mut params);
                put(*mtu, &mut params);
                put(*mps, &mut params);
                put(*initial_credits, &mut params);
            }
            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                put(*destination_cid, &mut params);
                put(*mtu, &mut params);
                put(*mps, &mut params);
                put(*initial_credits, &mut params);
                put(*result, &mut params);
            }
            Self::FlowControlCredit { cid, credits, .. } => {
                put(*cid, &mut params);
                put(*credits, &mut params);
            }
            Self::EcredConnectionRequest {
                psm,
                mtu,
                mps,
                initial_credits,
                source_cids,
                ..
            } => {
                put(*psm, &mut params);
                put(*mtu, &mut params);
                put(*mps, &mut params);
                put(*initial_credits, &mut params);
                for cid in source_cids {
                    put(*cid, &mut params);
                }
            }
            Self::EcredConnectionResponse {
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
                ..
            } => {
                put(*mtu, &mut params);
                put(*mps, &mut params);
                put(*initial_credits, &mut params);
                put(*result, &mut params);
                for cid in destination_cids {
                    put(*cid, &mut params);
                }
            }
            Self::EcredReconfigureRequest {
                mtu,
                mps,
                destination_cids,
                ..
            } => {
                put(*mtu, &mut params);
                put(*mps, &mut params);
                for cid in destination_cids {
                    put(*cid, &mut params);
                }
            }
            Self::Unknown { .. } => {}
        }

        let header =
            L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);
        let mut result = Vec::with_capacity(L2CAP_SIGNALING_HEADER_SIZE + params.len());
        result.extend_from_slice(&header.to_bytes());
        result.extend_from_slice(&params);
        result
    }
}
