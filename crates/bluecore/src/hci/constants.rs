//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_ISO_PKT: u8 = 0x05;

// Maximum size of HCI command parameters

// Packet header sizes
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_ISO_HDR_SIZE: usize = 4;
pub const HCI_EVENT_HDR_SIZE: usize = 2;

// OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_STATUS_PARAM: u8 = 0x05;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_ACCEPT_CONN_REQ: u16 = 0x0009;
pub const OCF_REJECT_CONN_REQ: u16 = 0x000A;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_SET_CTL_TO_HOST_FLOW: u16 = 0x0031;
pub const OCF_HOST_BUFFER_SIZE: u16 = 0x0033;
pub const OCF_HOST_NUM_COMPLETED_PACKETS: u16 = 0x0035;
pub const OCF_SET_EVENT_MASK_PAGE_2: u16 = 0x0063;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_LOCAL_FEATURES: u16 = 0x0003;
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// LE Controller Commands (OGF: 0x08)
pub const OCF_LE_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;
pub const OCF_LE_READ_LOCAL_FEATURES: u16 = 0x0003;
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_SET_ADV_PARAMETERS: u16 = 0x0006;
pub const OCF_LE_SET_ADV_DATA: u16 = 0x0008;
pub const OCF_LE_SET_SCAN_RSP_DATA: u16 = 0x0009;
pub const OCF_LE_SET_ADV_ENABLE: u16 = 0x000A;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
pub const OCF_LE_CREATE_CONN: u16 = 0x000D;
pub const OCF_LE_CREATE_CONN_CANCEL: u16 = 0x000E;
pub const OCF_LE_CLEAR_FILTER_ACCEPT_LIST: u16 = 0x0010;
pub const OCF_LE_ADD_TO_FILTER_ACCEPT_LIST: u16 = 0x0011;
pub const OCF_LE_CONN_UPDATE: u16 = 0x0013;
pub const OCF_LE_READ_REMOTE_FEATURES: u16 = 0x0016;
pub const OCF_LE_ENCRYPT: u16 = 0x0017;
pub const OCF_LE_REMOTE_CONN_PARAM_REQ_REPLY: u16 = 0x0020;
pub const OCF_LE_REMOTE_CONN_PARAM_REQ_NEG_REPLY: u16 = 0x0021;
pub const OCF_LE_SET_DATA_LENGTH: u16 = 0x0022;
pub const OCF_LE_ADD_TO_RESOLVING_LIST: u16 = 0x0027;
pub const OCF_LE_CLEAR_RESOLVING_LIST: u16 = 0x0029;
pub const OCF_LE_READ_RESOLVING_LIST_SIZE: u16 = 0x002A;
pub const OCF_LE_SET_ADDR_RESOLUTION_ENABLE: u16 = 0x002D;
pub const OCF_LE_SET_RPA_TIMEOUT: u16 = 0x002E;
pub const OCF_LE_SET_ADV_SET_RANDOM_ADDR: u16 = 0x0035;
pub const OCF_LE_SET_EXT_ADV_PARAMETERS: u16 = 0x0036;
pub const OCF_LE_SET_EXT_ADV_DATA: u16 = 0x0037;
pub const OCF_LE_SET_EXT_SCAN_RSP_DATA: u16 = 0x0038;
pub const OCF_LE_SET_EXT_ADV_ENABLE: u16 = 0x0039;
pub const OCF_LE_READ_MAX_ADV_DATA_LEN: u16 = 0x003A;
pub const OCF_LE_READ_NUM_ADV_SETS: u16 = 0x003B;
pub const OCF_LE_REMOVE_ADV_SET: u16 = 0x003C;
pub const OCF_LE_SET_EXT_SCAN_PARAMETERS: u16 = 0x0041;
pub const OCF_LE_SET_EXT_SCAN_ENABLE: u16 = 0x0042;
pub const OCF_LE_EXT_CREATE_CONN: u16 = 0x0043;
pub const OCF_LE_PER_ADV_CREATE_SYNC: u16 = 0x0044;
pub const OCF_LE_PER_ADV_CREATE_SYNC_CANCEL: u16 = 0x0045;
pub const OCF_LE_PER_ADV_TERMINATE_SYNC: u16 = 0x0046;
pub const OCF_LE_READ_BUFFER_SIZE_V2: u16 = 0x0060;

// HCI Events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
pub const EVT_DATA_BUFFER_OVERFLOW: u8 = 0x1A;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_REMOTE_FEATURES_COMPLETE: u8 = 0x04;
pub const EVT_LE_REMOTE_CONN_PARAM_REQ: u8 = 0x06;
pub const EVT_LE_DATA_LEN_CHANGE: u8 = 0x07;
pub const EVT_LE_ENH_CONN_COMPLETE: u8 = 0x0A;
pub const EVT_LE_PHY_UPDATE_COMPLETE: u8 = 0x0C;
pub const EVT_LE_EXT_ADVERTISING_REPORT: u8 = 0x0D;
pub const EVT_LE_PER_ADV_SYNC_ESTABLISHED: u8 = 0x0E;
pub const EVT_LE_PER_ADVERTISING_REPORT: u8 = 0x0F;
pub const EVT_LE_PER_ADV_SYNC_LOST: u8 = 0x10;
pub const EVT_LE_SCAN_TIMEOUT: u8 = 0x11;
pub const EVT_LE_ADV_SET_TERMINATED: u8 = 0x12;
pub const EVT_LE_PAST_RECEIVED: u8 = 0x18;
pub const EVT_LE_ENH_CONN_COMPLETE_V2: u8 = 0x29;

// Status / reason codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_UNKNOWN_CONN_ID: u8 = 0x02;
pub const HCI_ERR_AUTH_FAIL: u8 = 0x05;
pub const HCI_ERR_CONN_TIMEOUT: u8 = 0x08;
pub const HCI_ERR_INSUFFICIENT_RESOURCES: u8 = 0x0D;
pub const HCI_ERR_UNSUPP_FEATURE_PARAM_VAL: u8 = 0x11;
pub const HCI_ERR_INVALID_PARAM: u8 = 0x12;
pub const HCI_ERR_REMOTE_USER_TERM_CONN: u8 = 0x13;
pub const HCI_ERR_REMOTE_LOW_RESOURCES: u8 = 0x14;
pub const HCI_ERR_LOCALHOST_TERM_CONN: u8 = 0x16;
pub const HCI_ERR_UNSUPP_REMOTE_FEATURE: u8 = 0x1A;
pub const HCI_ERR_INVALID_LL_PARAM: u8 = 0x1E;
pub const HCI_ERR_UNSPECIFIED: u8 = 0x1F;
pub const HCI_ERR_UNSUPP_LL_PARAM_VAL: u8 = 0x20;
pub const HCI_ERR_UNKNOWN_ADV_ID: u8 = 0x42;
pub const HCI_ERR_ADV_TIMEOUT: u8 = 0x3C;
pub const HCI_ERR_ADV_LIMIT_REACHED: u8 = 0x43;
pub const HCI_ERR_OP_CANCELLED_BY_HOST: u8 = 0x44;

// Link types in BR/EDR connection events
pub const HCI_LINK_SCO: u8 = 0x00;
pub const HCI_LINK_ACL: u8 = 0x01;

// Advertising report event types (legacy)
pub const ADV_IND: u8 = 0x00;
pub const ADV_DIRECT_IND: u8 = 0x01;
pub const ADV_SCAN_IND: u8 = 0x02;
pub const ADV_NONCONN_IND: u8 = 0x03;
pub const ADV_SCAN_RSP: u8 = 0x04;

// Extended advertising report event type bits
pub const EXT_ADV_EVT_CONNECTABLE: u16 = 0x0001;
pub const EXT_ADV_EVT_SCANNABLE: u16 = 0x0002;
pub const EXT_ADV_EVT_DIRECTED: u16 = 0x0004;
pub const EXT_ADV_EVT_SCAN_RSP: u16 = 0x0008;
pub const EXT_ADV_EVT_LEGACY: u16 = 0x0010;
pub const EXT_ADV_EVT_DATA_STATUS_SHIFT: u16 = 5;
pub const EXT_ADV_EVT_DATA_STATUS_MASK: u16 = 0x0060;

// Extended advertising properties
pub const EXT_ADV_PROP_CONNECTABLE: u16 = 0x0001;
pub const EXT_ADV_PROP_SCANNABLE: u16 = 0x0002;
pub const EXT_ADV_PROP_DIRECTED: u16 = 0x0004;
pub const EXT_ADV_PROP_HI_DC_CONN: u16 = 0x0008;
pub const EXT_ADV_PROP_LEGACY: u16 = 0x0010;
pub const EXT_ADV_PROP_ANON: u16 = 0x0020;
pub const EXT_ADV_PROP_TX_POWER: u16 = 0x0040;

// Legacy advertising types for LE Set Advertising Parameters
pub const ADV_TYPE_IND: u8 = 0x00;
pub const ADV_TYPE_DIRECT_IND_HIGH_DUTY: u8 = 0x01;
pub const ADV_TYPE_SCAN_IND: u8 = 0x02;
pub const ADV_TYPE_NONCONN_IND: u8 = 0x03;
pub const ADV_TYPE_DIRECT_IND_LOW_DUTY: u8 = 0x04;

// Extended advertising data operations
pub const ADV_DATA_OP_INTERMEDIATE: u8 = 0x00;
pub const ADV_DATA_OP_FIRST: u8 = 0x01;
pub const ADV_DATA_OP_LAST: u8 = 0x02;
pub const ADV_DATA_OP_COMPLETE: u8 = 0x03;
pub const ADV_DATA_OP_UNCHANGED: u8 = 0x04;

// Data fragmentation preference
pub const ADV_DATA_FRAG_ALLOWED: u8 = 0x00;
pub const ADV_DATA_FRAG_NOT_PREFERRED: u8 = 0x01;

// Advertising channel map (37, 38, 39)
pub const ADV_CHAN_MAP_ALL: u8 = 0x07;

// PHYs
pub const PHY_1M: u8 = 0x01;
pub const PHY_2M: u8 = 0x02;
pub const PHY_CODED: u8 = 0x03;

// Scan types
pub const LE_SCAN_PASSIVE: u8 = 0x00;
pub const LE_SCAN_ACTIVE: u8 = 0x01;

// Filter policies
pub const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
pub const FILTER_POLICY_FILTER_ACCEPT_LIST: u8 = 0x01;

// Own address types
pub const OWN_ADDR_PUBLIC: u8 = 0x00;
pub const OWN_ADDR_RANDOM: u8 = 0x01;

// Connection roles reported in LE Connection Complete
pub const ROLE_CENTRAL: u8 = 0x00;
pub const ROLE_PERIPHERAL: u8 = 0x01;

// Event masks enabled at init
pub const EVENT_MASK_DEFAULT: u64 = 0x2000_8000_0000_1C9F;
pub const LE_EVENT_MASK_DEFAULT: u64 = 0x0000_0000_00FF_FFFF;

// Advertising interval bounds (0.625 ms units)
pub const ADV_INTERVAL_MIN: u32 = 0x0020;
pub const ADV_INTERVAL_MAX: u32 = 0x4000;
pub const EXT_ADV_INTERVAL_MAX: u32 = 0x00FF_FFFF;

// Scan interval/window bounds (0.625 ms units)
pub const SCAN_INTERVAL_MIN: u16 = 0x0004;
pub const SCAN_INTERVAL_MAX: u16 = 0x4000;

// Connection parameter bounds
pub const CONN_INTERVAL_MIN: u16 = 0x0006;
pub const CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const CONN_LATENCY_MAX: u16 = 0x01F3;
pub const CONN_TIMEOUT_MIN: u16 = 0x000A;
pub const CONN_TIMEOUT_MAX: u16 = 0x0C80;

// Legacy / extended advertising data limits
pub const LEGACY_ADV_DATA_MAX: usize = 31;
pub const EXT_ADV_DATA_FRAG_MAX: usize = 251;

// Periodic sync bounds
pub const PER_ADV_SID_MAX: u8 = 0x0F;
pub const PER_ADV_SKIP_MAX: u16 = 0x01F3;
pub const PER_ADV_TIMEOUT_MIN: u16 = 0x000A;
pub const PER_ADV_TIMEOUT_MAX: u16 = 0x4000;

/// Compose an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03ff)
}
