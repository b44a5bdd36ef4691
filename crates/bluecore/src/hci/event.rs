//! HCI event decoding
//!
//! Events are decoded into a tagged enum in a single fallible step. Every
//! minimum-length requirement is enforced here, so handlers never see a
//! truncated parameter block.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::HciError;
use crate::gap::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;

type Reader<'a> = Cursor<&'a [u8]>;

fn short(_: std::io::Error) -> HciError {
    HciError::InvalidPacketFormat
}

fn read_u8(cur: &mut Reader<'_>) -> Result<u8, HciError> {
    cur.read_u8().map_err(short)
}

fn read_u16(cur: &mut Reader<'_>) -> Result<u16, HciError> {
    cur.read_u16::<LittleEndian>().map_err(short)
}

fn read_addr(cur: &mut Reader<'_>) -> Result<BdAddr, HciError> {
    let mut bytes = [0u8; 6];
    cur.read_exact(&mut bytes).map_err(short)?;
    Ok(BdAddr::new(bytes))
}

fn read_le_addr(cur: &mut Reader<'_>) -> Result<LeAddr, HciError> {
    let kind = AddressType::from(read_u8(cur)?);
    let addr = read_addr(cur)?;
    Ok(LeAddr::new(kind, addr))
}

fn read_bytes(cur: &mut Reader<'_>, len: usize) -> Result<Vec<u8>, HciError> {
    let mut data = vec![0u8; len];
    cur.read_exact(&mut data).map_err(short)?;
    Ok(data)
}

fn non_zero(addr: BdAddr) -> Option<BdAddr> {
    if addr.is_any() {
        None
    } else {
        Some(addr)
    }
}

/// Completion state of an extended or periodic advertising report fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Complete,
    Incomplete,
    Truncated,
}

impl From<u8> for DataStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DataStatus::Complete,
            0x01 => DataStatus::Incomplete,
            _ => DataStatus::Truncated,
        }
    }
}

/// One report of a legacy LE Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub event_type: u8,
    pub addr: LeAddr,
    pub data: Vec<u8>,
    pub rssi: i8,
}

/// One report of an LE Extended Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAdvReport {
    pub event_type: u16,
    pub addr: LeAddr,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_interval: u16,
    pub data: Vec<u8>,
}

impl ExtAdvReport {
    pub fn data_status(&self) -> DataStatus {
        DataStatus::from(
            ((self.event_type & EXT_ADV_EVT_DATA_STATUS_MASK) >> EXT_ADV_EVT_DATA_STATUS_SHIFT) as u8,
        )
    }

    pub fn is_connectable(&self) -> bool {
        self.event_type & EXT_ADV_EVT_CONNECTABLE != 0
    }

    pub fn is_legacy(&self) -> bool {
        self.event_type & EXT_ADV_EVT_LEGACY != 0
    }
}

/// Parameters of any flavour of LE Connection Complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub role: u8,
    pub peer: LeAddr,
    pub local_rpa: Option<BdAddr>,
    pub peer_rpa: Option<BdAddr>,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    /// Advertising set that produced the connection (v2 event only)
    pub adv_handle: Option<u8>,
}

/// LE Periodic Advertising Sync Established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEstablished {
    pub status: u8,
    pub sync_handle: u16,
    pub sid: u8,
    pub addr: LeAddr,
    pub phy: u8,
    pub interval: u16,
}

/// LE Periodic Advertising Sync Transfer Received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PastReceived {
    pub status: u8,
    pub conn_handle: u16,
    pub service_data: u16,
    pub sync_handle: u16,
    pub sid: u8,
    pub addr: LeAddr,
    pub phy: u8,
    pub interval: u16,
}

/// LE Meta sub-events understood by the host core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeEvent {
    ConnectionComplete(LeConnectionComplete),
    AdvertisingReport(Vec<AdvReport>),
    ConnectionUpdateComplete {
        status: u8,
        handle: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    },
    RemoteFeaturesComplete {
        status: u8,
        handle: u16,
        features: u64,
    },
    RemoteConnParamRequest {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    DataLengthChange {
        handle: u16,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
    PhyUpdateComplete {
        status: u8,
        handle: u16,
        tx_phy: u8,
        rx_phy: u8,
    },
    ExtAdvertisingReport(Vec<ExtAdvReport>),
    PeriodicSyncEstablished(SyncEstablished),
    PeriodicAdvertisingReport {
        sync_handle: u16,
        tx_power: i8,
        rssi: i8,
        data_status: DataStatus,
        data: Vec<u8>,
    },
    PeriodicSyncLost {
        sync_handle: u16,
    },
    ScanTimeout,
    AdvSetTerminated {
        status: u8,
        adv_handle: u8,
        conn_handle: u16,
        num_events: u8,
    },
    PastReceived(PastReceived),
    Unknown {
        subevent: u8,
        params: Vec<u8>,
    },
}

/// HCI events understood by the host core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
    },
    ConnectionRequest {
        bd_addr: BdAddr,
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_params: Vec<u8>,
    },
    CommandStatus {
        status: u8,
        num_packets: u8,
        opcode: u16,
    },
    HardwareError {
        code: u8,
    },
    NumberOfCompletedPackets(Vec<(u16, u16)>),
    DataBufferOverflow {
        link_type: u8,
    },
    Le(LeEvent),
    Unknown {
        code: u8,
        params: Vec<u8>,
    },
}

impl Event {
    /// Decode an event packet (without the H4 type byte)
    pub fn decode(data: &[u8]) -> Result<Self, HciError> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return Err(HciError::InvalidPacketFormat);
        }

        let code = data[0];
        let len = data[1] as usize;
        if data.len() < HCI_EVENT_HDR_SIZE + len {
            return Err(HciError::InvalidParamLength(data.len()));
        }

        let params = &data[HCI_EVENT_HDR_SIZE..HCI_EVENT_HDR_SIZE + len];
        let mut cur = Cursor::new(params);

        let event = match code {
            EVT_CONN_COMPLETE => Event::ConnectionComplete {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                bd_addr: read_addr(&mut cur)?,
                link_type: read_u8(&mut cur)?,
            },
            EVT_CONN_REQUEST => {
                let bd_addr = read_addr(&mut cur)?;
                // Class of device
                read_bytes(&mut cur, 3)?;
                Event::ConnectionRequest {
                    bd_addr,
                    link_type: read_u8(&mut cur)?,
                }
            }
            EVT_DISCONN_COMPLETE => Event::DisconnectionComplete {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                reason: read_u8(&mut cur)?,
            },
            EVT_ENCRYPTION_CHANGE => Event::EncryptionChange {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                enabled: read_u8(&mut cur)? != 0,
            },
            EVT_CMD_COMPLETE => {
                let num_packets = read_u8(&mut cur)?;
                let opcode = read_u16(&mut cur)?;
                Event::CommandComplete {
                    num_packets,
                    opcode,
                    return_params: params[3..].to_vec(),
                }
            }
            EVT_CMD_STATUS => Event::CommandStatus {
                status: read_u8(&mut cur)?,
                num_packets: read_u8(&mut cur)?,
                opcode: read_u16(&mut cur)?,
            },
            EVT_HARDWARE_ERROR => Event::HardwareError {
                code: read_u8(&mut cur)?,
            },
            EVT_NUM_COMPLETED_PACKETS => {
                let num_handles = read_u8(&mut cur)? as usize;
                let mut completed = Vec::with_capacity(num_handles);
                for _ in 0..num_handles {
                    let handle = read_u16(&mut cur)? & 0x0FFF;
                    let count = read_u16(&mut cur)?;
                    completed.push((handle, count));
                }
                Event::NumberOfCompletedPackets(completed)
            }
            EVT_DATA_BUFFER_OVERFLOW => Event::DataBufferOverflow {
                link_type: read_u8(&mut cur)?,
            },
            EVT_LE_META_EVENT => Event::Le(LeEvent::decode(params)?),
            _ => Event::Unknown {
                code,
                params: params.to_vec(),
            },
        };

        Ok(event)
    }

    /// Events that must be handled as soon as they arrive, ahead of any
    /// queued RX processing.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Event::CommandComplete { .. }
                | Event::CommandStatus { .. }
                | Event::DisconnectionComplete { .. }
                | Event::NumberOfCompletedPackets(_)
        )
    }
}

impl LeEvent {
    /// Decode the parameter block of an LE Meta event
    pub fn decode(params: &[u8]) -> Result<Self, HciError> {
        let mut cur = Cursor::new(params);
        let subevent = read_u8(&mut cur)?;

        let event = match subevent {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENH_CONN_COMPLETE | EVT_LE_ENH_CONN_COMPLETE_V2 => {
                let status = read_u8(&mut cur)?;
                let handle = read_u16(&mut cur)? & 0x0FFF;
                let role = read_u8(&mut cur)?;
                let peer = read_le_addr(&mut cur)?;
                let (local_rpa, peer_rpa) = if subevent == EVT_LE_CONN_COMPLETE {
                    (None, None)
                } else {
                    (non_zero(read_addr(&mut cur)?), non_zero(read_addr(&mut cur)?))
                };
                let interval = read_u16(&mut cur)?;
                let latency = read_u16(&mut cur)?;
                let timeout = read_u16(&mut cur)?;
                // Central clock accuracy
                read_u8(&mut cur)?;
                let adv_handle = if subevent == EVT_LE_ENH_CONN_COMPLETE_V2 {
                    let adv_handle = read_u8(&mut cur)?;
                    // Periodic sync handle
                    read_u16(&mut cur)?;
                    Some(adv_handle)
                } else {
                    None
                };
                LeEvent::ConnectionComplete(LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer,
                    local_rpa,
                    peer_rpa,
                    interval,
                    latency,
                    timeout,
                    adv_handle,
                })
            }
            EVT_LE_ADVERTISING_REPORT => {
                let num_reports = read_u8(&mut cur)?;
                let mut reports = Vec::with_capacity(num_reports as usize);
                for _ in 0..num_reports {
                    let event_type = read_u8(&mut cur)?;
                    let addr = read_le_addr(&mut cur)?;
                    let len = read_u8(&mut cur)? as usize;
                    let data = read_bytes(&mut cur, len)?;
                    let rssi = read_u8(&mut cur)? as i8;
                    reports.push(AdvReport {
                        event_type,
                        addr,
                        data,
                        rssi,
                    });
                }
                LeEvent::AdvertisingReport(reports)
            }
            EVT_LE_CONN_UPDATE_COMPLETE => LeEvent::ConnectionUpdateComplete {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                interval: read_u16(&mut cur)?,
                latency: read_u16(&mut cur)?,
                timeout: read_u16(&mut cur)?,
            },
            EVT_LE_REMOTE_FEATURES_COMPLETE => LeEvent::RemoteFeaturesComplete {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                features: cur.read_u64::<LittleEndian>().map_err(short)?,
            },
            EVT_LE_REMOTE_CONN_PARAM_REQ => LeEvent::RemoteConnParamRequest {
                handle: read_u16(&mut cur)? & 0x0FFF,
                interval_min: read_u16(&mut cur)?,
                interval_max: read_u16(&mut cur)?,
                latency: read_u16(&mut cur)?,
                timeout: read_u16(&mut cur)?,
            },
            EVT_LE_DATA_LEN_CHANGE => LeEvent::DataLengthChange {
                handle: read_u16(&mut cur)? & 0x0FFF,
                max_tx_octets: read_u16(&mut cur)?,
                max_tx_time: read_u16(&mut cur)?,
                max_rx_octets: read_u16(&mut cur)?,
                max_rx_time: read_u16(&mut cur)?,
            },
            EVT_LE_PHY_UPDATE_COMPLETE => LeEvent::PhyUpdateComplete {
                status: read_u8(&mut cur)?,
                handle: read_u16(&mut cur)? & 0x0FFF,
                tx_phy: read_u8(&mut cur)?,
                rx_phy: read_u8(&mut cur)?,
            },
            EVT_LE_EXT_ADVERTISING_REPORT => {
                let num_reports = read_u8(&mut cur)?;
                let mut reports = Vec::with_capacity(num_reports as usize);
                for _ in 0..num_reports {
                    let event_type = read_u16(&mut cur)?;
                    let addr = read_le_addr(&mut cur)?;
                    let primary_phy = read_u8(&mut cur)?;
                    let secondary_phy = read_u8(&mut cur)?;
                    let sid = read_u8(&mut cur)?;
                    let tx_power = read_u8(&mut cur)? as i8;
                    let rssi = read_u8(&mut cur)? as i8;
                    let periodic_interval = read_u16(&mut cur)?;
                    // Direct address type and address
                    read_le_addr(&mut cur)?;
                    let len = read_u8(&mut cur)? as usize;
                    let data = read_bytes(&mut cur, len)?;
                    reports.push(ExtAdvReport {
                        event_type,
                        addr,
                        primary_phy,
                        secondary_phy,
                        sid,
                        tx_power,
                        rssi,
                        periodic_interval,
                        data,
                    });
                }
                LeEvent::ExtAdvertisingReport(reports)
            }
            EVT_LE_PER_ADV_SYNC_ESTABLISHED => {
                let status = read_u8(&mut cur)?;
                let sync_handle = read_u16(&mut cur)? & 0x0FFF;
                let sid = read_u8(&mut cur)?;
                let addr = read_le_addr(&mut cur)?;
                let phy = read_u8(&mut cur)?;
                let interval = read_u16(&mut cur)?;
                LeEvent::PeriodicSyncEstablished(SyncEstablished {
                    status,
                    sync_handle,
                    sid,
                    addr,
                    phy,
                    interval,
                })
            }
            EVT_LE_PER_ADVERTISING_REPORT => {
                let sync_handle = read_u16(&mut cur)? & 0x0FFF;
                let tx_power = read_u8(&mut cur)? as i8;
                let rssi = read_u8(&mut cur)? as i8;
                // CTE type
                read_u8(&mut cur)?;
                let data_status = DataStatus::from(read_u8(&mut cur)?);
                let len = read_u8(&mut cur)? as usize;
                let data = read_bytes(&mut cur, len)?;
                LeEvent::PeriodicAdvertisingReport {
                    sync_handle,
                    tx_power,
                    rssi,
                    data_status,
                    data,
                }
            }
            EVT_LE_PER_ADV_SYNC_LOST => LeEvent::PeriodicSyncLost {
                sync_handle: read_u16(&mut cur)? & 0x0FFF,
            },
            EVT_LE_SCAN_TIMEOUT => LeEvent::ScanTimeout,
            EVT_LE_ADV_SET_TERMINATED => LeEvent::AdvSetTerminated {
                status: read_u8(&mut cur)?,
                adv_handle: read_u8(&mut cur)?,
                conn_handle: read_u16(&mut cur)? & 0x0FFF,
                num_events: read_u8(&mut cur)?,
            },
            EVT_LE_PAST_RECEIVED => {
                let status = read_u8(&mut cur)?;
                let conn_handle = read_u16(&mut cur)? & 0x0FFF;
                let service_data = read_u16(&mut cur)?;
                let sync_handle = read_u16(&mut cur)? & 0x0FFF;
                let sid = read_u8(&mut cur)?;
                let addr = read_le_addr(&mut cur)?;
                let phy = read_u8(&mut cur)?;
                let interval = read_u16(&mut cur)?;
                LeEvent::PastReceived(PastReceived {
                    status,
                    conn_handle,
                    service_data,
                    sync_handle,
                    sid,
                    addr,
                    phy,
                    interval,
                })
            }
            _ => LeEvent::Unknown {
                subevent,
                params: params[1..].to_vec(),
            },
        };

        Ok(event)
    }
}
