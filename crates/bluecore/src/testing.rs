//! Scripted controller for unit tests

use std::collections::{HashMap, VecDeque};

use crate::config::HostConfig;
use crate::error::HciError;
use crate::gap::{BdAddr, LeAddr};
use crate::hci::acl::{AclHeader, IsoHeader, PacketBoundary};
use crate::hci::constants::*;
use crate::hci::{CommandComplete, HciCommand, HciDriver};
use crate::host::{Host, LeFeatures};

pub(crate) const LOCAL_ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x00];

/// Controller double that records everything the host sends
#[derive(Debug)]
pub(crate) struct MockController {
    pub(crate) bd_addr: BdAddr,
    pub(crate) le_features: LeFeatures,
    pub(crate) le_acl_mtu: u16,
    pub(crate) le_acl_pkts: u8,
    pub(crate) br_acl_mtu: u16,
    pub(crate) br_acl_pkts: u16,
    pub(crate) max_adv_data_len: u16,
    pub(crate) num_adv_sets: u8,
    pub(crate) resolving_list_size: u8,
    pub(crate) commands: Vec<HciCommand>,
    pub(crate) unacked: Vec<HciCommand>,
    pub(crate) acl: Vec<(AclHeader, Vec<u8>)>,
    pub(crate) iso: Vec<(IsoHeader, Vec<u8>)>,
    /// Statuses returned, in order, for the next commands with an opcode
    pub(crate) statuses: HashMap<u16, VecDeque<u8>>,
    /// Number of upcoming ACL sends that fail
    pub(crate) acl_failures: usize,
}

impl Default for MockController {
    fn default() -> Self {
        Self {
            bd_addr: BdAddr::new(LOCAL_ADDR),
            le_features: LeFeatures::ENCRYPTION | LeFeatures::DATA_LENGTH,
            le_acl_mtu: 27,
            le_acl_pkts: 4,
            br_acl_mtu: 1021,
            br_acl_pkts: 8,
            max_adv_data_len: 1650,
            num_adv_sets: 4,
            resolving_list_size: 2,
            commands: Vec::new(),
            unacked: Vec::new(),
            acl: Vec::new(),
            iso: Vec::new(),
            statuses: HashMap::new(),
            acl_failures: 0,
        }
    }
}

impl MockController {
    pub(crate) fn with_features(le_features: LeFeatures) -> Self {
        Self {
            le_features,
            ..Self::default()
        }
    }

    /// Fail the next command with `opcode` with `status`
    pub(crate) fn fail_next(&mut self, opcode: u16, status: u8) {
        self.statuses.entry(opcode).or_default().push_back(status);
    }

    pub(crate) fn take_commands(&mut self) -> Vec<HciCommand> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn take_acl(&mut self) -> Vec<(AclHeader, Vec<u8>)> {
        std::mem::take(&mut self.acl)
    }

    /// Commands sent so far that match `pred`
    pub(crate) fn sent(&self, pred: impl Fn(&HciCommand) -> bool) -> Vec<&HciCommand> {
        self.commands.iter().filter(|c| pred(c)).collect()
    }

    fn return_params(&self, command: &HciCommand) -> Vec<u8> {
        match command {
            HciCommand::ReadLocalSupportedFeatures => vec![0; 8],
            HciCommand::ReadBdAddr => self.bd_addr.bytes.to_vec(),
            HciCommand::LeReadLocalSupportedFeatures => self.le_features.bits().to_le_bytes().to_vec(),
            HciCommand::LeReadBufferSize => {
                let mut rp = self.le_acl_mtu.to_le_bytes().to_vec();
                rp.push(self.le_acl_pkts);
                rp
            }
            HciCommand::LeReadBufferSizeV2 => {
                let mut rp = self.le_acl_mtu.to_le_bytes().to_vec();
                rp.push(self.le_acl_pkts);
                rp.extend_from_slice(&251u16.to_le_bytes());
                rp.push(4);
                rp
            }
            HciCommand::ReadBufferSize => {
                let mut rp = self.br_acl_mtu.to_le_bytes().to_vec();
                rp.push(64);
                rp.extend_from_slice(&self.br_acl_pkts.to_le_bytes());
                rp.extend_from_slice(&0u16.to_le_bytes());
                rp
            }
            HciCommand::LeReadMaxAdvDataLen => self.max_adv_data_len.to_le_bytes().to_vec(),
            HciCommand::LeReadNumAdvSets => vec![self.num_adv_sets],
            HciCommand::LeReadResolvingListSize => vec![self.resolving_list_size],
            // XOR stands in for AES: deterministic and keyed.
            HciCommand::LeEncrypt { key, plaintext } => {
                key.iter().zip(plaintext).map(|(k, p)| k ^ p).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl HciDriver for MockController {
    fn send_command(&mut self, command: &HciCommand) -> Result<CommandComplete, HciError> {
        let opcode = command.opcode();
        self.commands.push(command.clone());
        let status = self
            .statuses
            .get_mut(&opcode)
            .and_then(VecDeque::pop_front)
            .unwrap_or(HCI_SUCCESS);
        let params = if status == HCI_SUCCESS {
            self.return_params(command)
        } else {
            Vec::new()
        };
        Ok(CommandComplete {
            opcode,
            status,
            params,
        })
    }

    fn send_unacked(&mut self, command: &HciCommand) -> Result<(), HciError> {
        self.unacked.push(command.clone());
        Ok(())
    }

    fn send_acl(&mut self, header: AclHeader, data: &[u8]) -> Result<(), HciError> {
        if self.acl_failures > 0 {
            self.acl_failures -= 1;
            return Err(HciError::SendError(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        self.acl.push((header, data.to_vec()));
        Ok(())
    }

    fn send_iso(&mut self, header: IsoHeader, data: &[u8]) -> Result<(), HciError> {
        self.iso.push((header, data.to_vec()));
        Ok(())
    }
}

/// Host on a mock controller, initialised
pub(crate) fn host_with(controller: MockController, config: HostConfig) -> Host<MockController> {
    let mut host = Host::new(controller, config).unwrap();
    host.init().unwrap();
    host.driver_mut().take_commands();
    host
}

pub(crate) fn host() -> Host<MockController> {
    host_with(MockController::default(), HostConfig::default())
}

pub(crate) fn event(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![HCI_EVENT_PKT, code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

pub(crate) fn le_event(subevent: u8, params: &[u8]) -> Vec<u8> {
    let mut body = vec![subevent];
    body.extend_from_slice(params);
    event(EVT_LE_META_EVENT, &body)
}

/// LE Connection Complete for a successful link
pub(crate) fn le_conn_complete(handle: u16, role: u8, peer: &LeAddr) -> Vec<u8> {
    le_conn_complete_status(HCI_SUCCESS, handle, role, peer)
}

pub(crate) fn le_conn_complete_status(status: u8, handle: u16, role: u8, peer: &LeAddr) -> Vec<u8> {
    let mut p = vec![status];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(role);
    p.push(u8::from(peer.kind));
    p.extend_from_slice(&peer.addr.bytes);
    p.extend_from_slice(&0x0028u16.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&0x01F4u16.to_le_bytes());
    p.push(0);
    le_event(EVT_LE_CONN_COMPLETE, &p)
}

pub(crate) fn disconn_complete(handle: u16, reason: u8) -> Vec<u8> {
    let mut p = vec![HCI_SUCCESS];
    p.extend_from_slice(&handle.to_le_bytes());
    p.push(reason);
    event(EVT_DISCONN_COMPLETE, &p)
}

pub(crate) fn num_completed(handle: u16, count: u16) -> Vec<u8> {
    let mut p = vec![1];
    p.extend_from_slice(&handle.to_le_bytes());
    p.extend_from_slice(&count.to_le_bytes());
    event(EVT_NUM_COMPLETED_PACKETS, &p)
}

/// ACL packet carrying `data` as one fragment
pub(crate) fn acl(handle: u16, boundary: PacketBoundary, data: &[u8]) -> Vec<u8> {
    let header = AclHeader::new(handle, boundary, data.len() as u16);
    let mut packet = vec![HCI_ACL_PKT];
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Complete L2CAP PDU on `cid`
pub(crate) fn l2cap_pdu(cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut pdu = (payload.len() as u16).to_le_bytes().to_vec();
    pdu.extend_from_slice(&cid.to_le_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

pub(crate) fn adv_report(event_type: u8, addr: &LeAddr, data: &[u8], rssi: i8) -> Vec<u8> {
    let mut p = vec![1, event_type, u8::from(addr.kind)];
    p.extend_from_slice(&addr.addr.bytes);
    p.push(data.len() as u8);
    p.extend_from_slice(data);
    p.push(rssi as u8);
    le_event(EVT_LE_ADVERTISING_REPORT, &p)
}

pub(crate) fn ext_adv_report(event_type: u16, addr: &LeAddr, sid: u8, data: &[u8]) -> Vec<u8> {
    let mut p = vec![1];
    p.extend_from_slice(&event_type.to_le_bytes());
    p.push(u8::from(addr.kind));
    p.extend_from_slice(&addr.addr.bytes);
    p.extend_from_slice(&[PHY_1M, PHY_2M, sid, 0x7F, (-60i8) as u8]);
    p.extend_from_slice(&0u16.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&[0; 6]);
    p.push(data.len() as u8);
    p.extend_from_slice(data);
    le_event(EVT_LE_EXT_ADVERTISING_REPORT, &p)
}

/// Extended report event type with a data status
pub(crate) fn ext_evt(props: u16, status: u8) -> u16 {
    props | ((status as u16) << EXT_ADV_EVT_DATA_STATUS_SHIFT)
}

pub(crate) fn sync_established(status: u8, sync_handle: u16, sid: u8, addr: &LeAddr) -> Vec<u8> {
    let mut p = vec![status];
    p.extend_from_slice(&sync_handle.to_le_bytes());
    p.push(sid);
    p.push(u8::from(addr.kind));
    p.extend_from_slice(&addr.addr.bytes);
    p.push(PHY_1M);
    p.extend_from_slice(&0x0050u16.to_le_bytes());
    p.push(0);
    le_event(EVT_LE_PER_ADV_SYNC_ESTABLISHED, &p)
}

pub(crate) fn periodic_report(sync_handle: u16, status: u8, data: &[u8]) -> Vec<u8> {
    let mut p = sync_handle.to_le_bytes().to_vec();
    p.extend_from_slice(&[0x7F, (-50i8) as u8, 0xFF, status, data.len() as u8]);
    p.extend_from_slice(data);
    le_event(EVT_LE_PER_ADVERTISING_REPORT, &p)
}

pub(crate) fn adv_set_terminated(status: u8, adv_handle: u8, conn_handle: u16) -> Vec<u8> {
    let mut p = vec![status, adv_handle];
    p.extend_from_slice(&conn_handle.to_le_bytes());
    p.push(0);
    le_event(EVT_LE_ADV_SET_TERMINATED, &p)
}

/// Feed packets to the host and process them
pub(crate) fn deliver(host: &mut Host<MockController>, packets: &[Vec<u8>]) {
    for packet in packets {
        host.recv(packet).unwrap();
    }
    host.process();
}
