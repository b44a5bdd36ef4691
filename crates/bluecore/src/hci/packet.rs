//! HCI command packets
//!
//! This module contains the command set the host core issues and the code
//! that serializes each command into its parameter block.

use crate::gap::BdAddr;
use crate::hci::constants::*;

/// One entry of an LE Set Extended Advertising Enable command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAdvEnableSet {
    pub handle: u8,
    /// Duration in 10 ms units, 0 means no limit
    pub duration: u16,
    /// Maximum number of extended advertising events, 0 means no limit
    pub max_events: u8,
}

/// Per-PHY parameters of an LE Set Extended Scan Parameters command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtScanPhy {
    pub phy: u8,
    pub scan_type: u8,
    pub interval: u16,
    pub window: u16,
}

/// Per-PHY parameters of an LE Extended Create Connection command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtConnPhy {
    pub phy: u8,
    pub scan_interval: u16,
    pub scan_window: u16,
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

/// HCI commands issued by the host core
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },
    AcceptConnectionRequest { bd_addr: BdAddr, role: u8 },
    RejectConnectionRequest { bd_addr: BdAddr, reason: u8 },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },
    SetEventMaskPage2 { event_mask: u64 },
    SetControllerToHostFlowControl { enable: bool },
    HostBufferSize {
        acl_mtu: u16,
        sco_mtu: u8,
        acl_pkts: u16,
        sco_pkts: u16,
    },
    HostNumberOfCompletedPackets { completed: Vec<(u16, u16)> },

    // Informational Parameters (OGF: 0x04)
    ReadLocalSupportedFeatures,
    ReadBufferSize,
    ReadBdAddr,

    // LE Commands (OGF: 0x08)
    LeSetEventMask { event_mask: u64 },
    LeReadBufferSize,
    LeReadBufferSizeV2,
    LeReadLocalSupportedFeatures,
    LeSetRandomAddress { addr: BdAddr },
    LeSetAdvertisingParameters {
        interval_min: u16,
        interval_max: u16,
        adv_type: u8,
        own_addr_type: u8,
        peer_addr_type: u8,
        peer_addr: BdAddr,
        channel_map: u8,
        filter_policy: u8,
    },
    LeSetAdvertisingData { data: Vec<u8> },
    LeSetScanResponseData { data: Vec<u8> },
    LeSetAdvertisingEnable { enable: bool },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable { enable: bool, filter_duplicates: bool },
    LeCreateConnection {
        scan_interval: u16,
        scan_window: u16,
        filter_policy: u8,
        peer_addr_type: u8,
        peer_addr: BdAddr,
        own_addr_type: u8,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    LeCreateConnectionCancel,
    LeClearFilterAcceptList,
    LeAddDeviceToFilterAcceptList { addr_type: u8, addr: BdAddr },
    LeConnectionUpdate {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    LeReadRemoteFeatures { handle: u16 },
    LeEncrypt { key: [u8; 16], plaintext: [u8; 16] },
    LeRemoteConnParamReqReply {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },
    LeRemoteConnParamReqNegReply { handle: u16, reason: u8 },
    LeSetDataLength { handle: u16, tx_octets: u16, tx_time: u16 },
    LeAddDeviceToResolvingList {
        peer_addr_type: u8,
        peer_addr: BdAddr,
        peer_irk: [u8; 16],
        local_irk: [u8; 16],
    },
    LeClearResolvingList,
    LeReadResolvingListSize,
    LeSetAddressResolutionEnable { enable: bool },
    LeSetRpaTimeout { timeout: u16 },
    LeSetAdvSetRandomAddress { handle: u8, addr: BdAddr },
    LeSetExtAdvParameters {
        handle: u8,
        properties: u16,
        interval_min: u32,
        interval_max: u32,
        channel_map: u8,
        own_addr_type: u8,
        peer_addr_type: u8,
        peer_addr: BdAddr,
        filter_policy: u8,
        tx_power: i8,
        primary_phy: u8,
        secondary_max_skip: u8,
        secondary_phy: u8,
        sid: u8,
        scan_req_notify: bool,
    },
    LeSetExtAdvData {
        handle: u8,
        operation: u8,
        frag_pref: u8,
        data: Vec<u8>,
    },
    LeSetExtScanRspData {
        handle: u8,
        operation: u8,
        frag_pref: u8,
        data: Vec<u8>,
    },
    LeSetExtAdvEnable { enable: bool, sets: Vec<ExtAdvEnableSet> },
    LeReadMaxAdvDataLen,
    LeReadNumAdvSets,
    LeRemoveAdvSet { handle: u8 },
    LeSetExtScanParameters {
        own_addr_type: u8,
        filter_policy: u8,
        phys: Vec<ExtScanPhy>,
    },
    LeSetExtScanEnable {
        enable: bool,
        filter_duplicates: bool,
        duration: u16,
        period: u16,
    },
    LeExtCreateConnection {
        filter_policy: u8,
        own_addr_type: u8,
        peer_addr_type: u8,
        peer_addr: BdAddr,
        phys: Vec<ExtConnPhy>,
    },
    LePeriodicAdvCreateSync {
        options: u8,
        sid: u8,
        addr_type: u8,
        addr: BdAddr,
        skip: u16,
        sync_timeout: u16,
    },
    LePeriodicAdvCreateSyncCancel,
    LePeriodicAdvTerminateSync { handle: u16 },

    /// Any other command, given as raw parameters
    Raw { ogf: u8, ocf: u16, params: Vec<u8> },
}

fn phy_bit(phy: u8) -> u8 {
    match phy {
        PHY_2M => 0x02,
        PHY_CODED => 0x04,
        _ => 0x01,
    }
}

impl HciCommand {
    /// Build a raw command from its opcode parts and parameter block
    pub fn new(ogf: u8, ocf: u16, params: Vec<u8>) -> Self {
        Self::Raw { ogf, ocf, params }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONN_REQ),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONN_REQ),

            // Host Controller Commands
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::SetEventMaskPage2 { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK_PAGE_2),
            Self::SetControllerToHostFlowControl { .. } => (OGF_HOST_CTL, OCF_SET_CTL_TO_HOST_FLOW),
            Self::HostBufferSize { .. } => (OGF_HOST_CTL, OCF_HOST_BUFFER_SIZE),
            Self::HostNumberOfCompletedPackets { .. } => {
                (OGF_HOST_CTL, OCF_HOST_NUM_COMPLETED_PACKETS)
            }

            // Informational Parameters
            Self::ReadLocalSupportedFeatures => (OGF_INFO_PARAM, OCF_READ_LOCAL_FEATURES),
            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),

            // LE Commands
            Self::LeSetEventMask { .. } => (OGF_LE, OCF_LE_SET_EVENT_MASK),
            Self::LeReadBufferSize => (OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Self::LeReadBufferSizeV2 => (OGF_LE, OCF_LE_READ_BUFFER_SIZE_V2),
            Self::LeReadLocalSupportedFeatures => (OGF_LE, OCF_LE_READ_LOCAL_FEATURES),
            Self::LeSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            Self::LeSetAdvertisingParameters { .. } => (OGF_LE, OCF_LE_SET_ADV_PARAMETERS),
            Self::LeSetAdvertisingData { .. } => (OGF_LE, OCF_LE_SET_ADV_DATA),
            Self::LeSetScanResponseData { .. } => (OGF_LE, OCF_LE_SET_SCAN_RSP_DATA),
            Self::LeSetAdvertisingEnable { .. } => (OGF_LE, OCF_LE_SET_ADV_ENABLE),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONN),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONN_CANCEL),
            Self::LeClearFilterAcceptList => (OGF_LE, OCF_LE_CLEAR_FILTER_ACCEPT_LIST),
            Self::LeAddDeviceToFilterAcceptList { .. } => (OGF_LE, OCF_LE_ADD_TO_FILTER_ACCEPT_LIST),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONN_UPDATE),
            Self::LeReadRemoteFeatures { .. } => (OGF_LE, OCF_LE_READ_REMOTE_FEATURES),
            Self::LeEncrypt { .. } => (OGF_LE, OCF_LE_ENCRYPT),
            Self::LeRemoteConnParamReqReply { .. } => (OGF_LE, OCF_LE_REMOTE_CONN_PARAM_REQ_REPLY),
            Self::LeRemoteConnParamReqNegReply { .. } => {
                (OGF_LE, OCF_LE_REMOTE_CONN_PARAM_REQ_NEG_REPLY)
            }
            Self::LeSetDataLength { .. } => (OGF_LE, OCF_LE_SET_DATA_LENGTH),
            Self::LeAddDeviceToResolvingList { .. } => (OGF_LE, OCF_LE_ADD_TO_RESOLVING_LIST),
            Self::LeClearResolvingList => (OGF_LE, OCF_LE_CLEAR_RESOLVING_LIST),
            Self::LeReadResolvingListSize => (OGF_LE, OCF_LE_READ_RESOLVING_LIST_SIZE),
            Self::LeSetAddressResolutionEnable { .. } => (OGF_LE, OCF_LE_SET_ADDR_RESOLUTION_ENABLE),
            Self::LeSetRpaTimeout { .. } => (OGF_LE, OCF_LE_SET_RPA_TIMEOUT),
            Self::LeSetAdvSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_ADV_SET_RANDOM_ADDR),
            Self::LeSetExtAdvParameters { .. } => (OGF_LE, OCF_LE_SET_EXT_ADV_PARAMETERS),
            Self::LeSetExtAdvData { .. } => (OGF_LE, OCF_LE_SET_EXT_ADV_DATA),
            Self::LeSetExtScanRspData { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_RSP_DATA),
            Self::LeSetExtAdvEnable { .. } => (OGF_LE, OCF_LE_SET_EXT_ADV_ENABLE),
            Self::LeReadMaxAdvDataLen => (OGF_LE, OCF_LE_READ_MAX_ADV_DATA_LEN),
            Self::LeReadNumAdvSets => (OGF_LE, OCF_LE_READ_NUM_ADV_SETS),
            Self::LeRemoveAdvSet { .. } => (OGF_LE, OCF_LE_REMOVE_ADV_SET),
            Self::LeSetExtScanParameters { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_PARAMETERS),
            Self::LeSetExtScanEnable { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_ENABLE),
            Self::LeExtCreateConnection { .. } => (OGF_LE, OCF_LE_EXT_CREATE_CONN),
            Self::LePeriodicAdvCreateSync { .. } => (OGF_LE, OCF_LE_PER_ADV_CREATE_SYNC),
            Self::LePeriodicAdvCreateSyncCancel => (OGF_LE, OCF_LE_PER_ADV_CREATE_SYNC_CANCEL),
            Self::LePeriodicAdvTerminateSync { .. } => (OGF_LE, OCF_LE_PER_ADV_TERMINATE_SYNC),

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// Get the 16-bit opcode for this command
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    pub fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset
            | Self::ReadLocalSupportedFeatures
            | Self::ReadBufferSize
            | Self::ReadBdAddr
            | Self::LeReadBufferSize
            | Self::LeReadBufferSizeV2
            | Self::LeReadLocalSupportedFeatures
            | Self::LeCreateConnectionCancel
            | Self::LeClearFilterAcceptList
            | Self::LeClearResolvingList
            | Self::LeReadResolvingListSize
            | Self::LeReadMaxAdvDataLen
            | Self::LeReadNumAdvSets
            | Self::LePeriodicAdvCreateSyncCancel => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::AcceptConnectionRequest { bd_addr, role } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*role);
                params
            }

            Self::RejectConnectionRequest { bd_addr, reason } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*reason);
                params
            }

            Self::SetEventMask { event_mask }
            | Self::SetEventMaskPage2 { event_mask }
            | Self::LeSetEventMask { event_mask } => event_mask.to_le_bytes().to_vec(),

            Self::SetControllerToHostFlowControl { enable } => vec![*enable as u8],

            Self::HostBufferSize {
                acl_mtu,
                sco_mtu,
                acl_pkts,
                sco_pkts,
            } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(&acl_mtu.to_le_bytes());
                params.push(*sco_mtu);
                params.extend_from_slice(&acl_pkts.to_le_bytes());
                params.extend_from_slice(&sco_pkts.to_le_bytes());
                params
            }

            Self::HostNumberOfCompletedPackets { completed } => {
                let mut params = Vec::with_capacity(1 + completed.len() * 4);
                params.push(completed.len() as u8);
                for (handle, count) in completed {
                    params.extend_from_slice(&handle.to_le_bytes());
                    params.extend_from_slice(&count.to_le_bytes());
                }
                params
            }

            Self::LeSetRandomAddress { addr } => addr.as_slice().to_vec(),

            Self::LeSetAdvertisingParameters {
                interval_min,
                interval_max,
                adv_type,
                own_addr_type,
                peer_addr_type,
                peer_addr,
                channel_map,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(15);
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.push(*adv_type);
                params.push(*own_addr_type);
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.push(*channel_map);
                params.push(*filter_policy);
                params
            }

            // Legacy data commands always carry a 31 byte significant part
            Self::LeSetAdvertisingData { data } | Self::LeSetScanResponseData { data } => {
                let mut params = vec![0u8; 1 + LEGACY_ADV_DATA_MAX];
                let len = data.len().min(LEGACY_ADV_DATA_MAX);
                params[0] = len as u8;
                params[1..1 + len].copy_from_slice(&data[..len]);
                params
            }

            Self::LeSetAdvertisingEnable { enable } => vec![*enable as u8],

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*own_address_type);
                params.push(*filter_policy);
                params
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::LeCreateConnection {
                scan_interval,
                scan_window,
                filter_policy,
                peer_addr_type,
                peer_addr,
                own_addr_type,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => {
                let mut params = Vec::with_capacity(25);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*filter_policy);
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.push(*own_addr_type);
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.extend_from_slice(&latency.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                // Min/max CE length
                params.extend_from_slice(&[0, 0, 0, 0]);
                params
            }

            Self::LeAddDeviceToFilterAcceptList { addr_type, addr } => {
                let mut params = Vec::with_capacity(7);
                params.push(*addr_type);
                params.extend_from_slice(addr.as_slice());
                params
            }

            Self::LeConnectionUpdate {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            }
            | Self::LeRemoteConnParamReqReply {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => {
                let mut params = Vec::with_capacity(14);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.extend_from_slice(&latency.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params.extend_from_slice(&[0, 0, 0, 0]);
                params
            }

            Self::LeReadRemoteFeatures { handle } => handle.to_le_bytes().to_vec(),

            Self::LeEncrypt { key, plaintext } => {
                let mut params = Vec::with_capacity(32);
                params.extend_from_slice(key);
                params.extend_from_slice(plaintext);
                params
            }

            Self::LeRemoteConnParamReqNegReply { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::LeSetDataLength {
                handle,
                tx_octets,
                tx_time,
            } => {
                let mut params = Vec::with_capacity(6);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&tx_octets.to_le_bytes());
                params.extend_from_slice(&tx_time.to_le_bytes());
                params
            }

            Self::LeAddDeviceToResolvingList {
                peer_addr_type,
                peer_addr,
                peer_irk,
                local_irk,
            } => {
                let mut params = Vec::with_capacity(39);
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.extend_from_slice(peer_irk);
                params.extend_from_slice(local_irk);
                params
            }

            Self::LeSetAddressResolutionEnable { enable } => vec![*enable as u8],

            Self::LeSetRpaTimeout { timeout } => timeout.to_le_bytes().to_vec(),

            Self::LeSetAdvSetRandomAddress { handle, addr } => {
                let mut params = Vec::with_capacity(7);
                params.push(*handle);
                params.extend_from_slice(addr.as_slice());
                params
            }

            Self::LeSetExtAdvParameters {
                handle,
                properties,
                interval_min,
                interval_max,
                channel_map,
                own_addr_type,
                peer_addr_type,
                peer_addr,
                filter_policy,
                tx_power,
                primary_phy,
                secondary_max_skip,
                secondary_phy,
                sid,
                scan_req_notify,
            } => {
                let mut params = Vec::with_capacity(25);
                params.push(*handle);
                params.extend_from_slice(&properties.to_le_bytes());
                params.extend_from_slice(&interval_min.to_le_bytes()[..3]);
                params.extend_from_slice(&interval_max.to_le_bytes()[..3]);
                params.push(*channel_map);
                params.push(*own_addr_type);
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.push(*filter_policy);
                params.push(*tx_power as u8);
                params.push(*primary_phy);
                params.push(*secondary_max_skip);
                params.push(*secondary_phy);
                params.push(*sid);
                params.push(*scan_req_notify as u8);
                params
            }

            Self::LeSetExtAdvData {
                handle,
                operation,
                frag_pref,
                data,
            }
            | Self::LeSetExtScanRspData {
                handle,
                operation,
                frag_pref,
                data,
            } => {
                let mut params = Vec::with_capacity(4 + data.len());
                params.push(*handle);
                params.push(*operation);
                params.push(*frag_pref);
                params.push(data.len() as u8);
                params.extend_from_slice(data);
                params
            }

            Self::LeSetExtAdvEnable { enable, sets } => {
                let mut params = Vec::with_capacity(2 + sets.len() * 4);
                params.push(*enable as u8);
                params.push(sets.len() as u8);
                for set in sets {
                    params.push(set.handle);
                    params.extend_from_slice(&set.duration.to_le_bytes());
                    params.push(set.max_events);
                }
                params
            }

            Self::LeRemoveAdvSet { handle } => vec![*handle],

            Self::LeSetExtScanParameters {
                own_addr_type,
                filter_policy,
                phys,
            } => {
                let mut params = Vec::with_capacity(3 + phys.len() * 5);
                params.push(*own_addr_type);
                params.push(*filter_policy);
                params.push(phys.iter().fold(0, |acc, p| acc | phy_bit(p.phy)));
                for phy in phys {
                    params.push(phy.scan_type);
                    params.extend_from_slice(&phy.interval.to_le_bytes());
                    params.extend_from_slice(&phy.window.to_le_bytes());
                }
                params
            }

            Self::LeSetExtScanEnable {
                enable,
                filter_duplicates,
                duration,
                period,
            } => {
                let mut params = Vec::with_capacity(6);
                params.push(*enable as u8);
                params.push(*filter_duplicates as u8);
                params.extend_from_slice(&duration.to_le_bytes());
                params.extend_from_slice(&period.to_le_bytes());
                params
            }

            Self::LeExtCreateConnection {
                filter_policy,
                own_addr_type,
                peer_addr_type,
                peer_addr,
                phys,
            } => {
                let mut params = Vec::with_capacity(10 + phys.len() * 16);
                params.push(*filter_policy);
                params.push(*own_addr_type);
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.push(phys.iter().fold(0, |acc, p| acc | phy_bit(p.phy)));
                for phy in phys {
                    params.extend_from_slice(&phy.scan_interval.to_le_bytes());
                    params.extend_from_slice(&phy.scan_window.to_le_bytes());
                    params.extend_from_slice(&phy.interval_min.to_le_bytes());
                    params.extend_from_slice(&phy.interval_max.to_le_bytes());
                    params.extend_from_slice(&phy.latency.to_le_bytes());
                    params.extend_from_slice(&phy.timeout.to_le_bytes());
                    params.extend_from_slice(&[0, 0, 0, 0]);
                }
                params
            }

            Self::LePeriodicAdvCreateSync {
                options,
                sid,
                addr_type,
                addr,
                skip,
                sync_timeout,
            } => {
                let mut params = Vec::with_capacity(14);
                params.push(*options);
                params.push(*sid);
                params.push(*addr_type);
                params.extend_from_slice(addr.as_slice());
                params.extend_from_slice(&skip.to_le_bytes());
                params.extend_from_slice(&sync_timeout.to_le_bytes());
                // No constant tone extension filtering
                params.push(0);
                params
            }

            Self::LePeriodicAdvTerminateSync { handle } => handle.to_le_bytes().to_vec(),

            Self::Raw { params, .. } => params.clone(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let opcode = self.opcode();
        let params = self.parameters();

        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}
