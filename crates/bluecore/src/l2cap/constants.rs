//! L2CAP protocol constants

// Header sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_SIGNALING_HEADER_SIZE: usize = 4;
pub const L2CAP_SDU_HEADER_SIZE: usize = 2;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_ATT_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SMP_CID: u16 = 0x0006;
pub const L2CAP_BR_SMP_CID: u16 = 0x0007;

// Dynamic channel identifier ranges
pub const L2CAP_LE_DYN_CID_START: u16 = 0x0040;
pub const L2CAP_LE_DYN_CID_END: u16 = 0x007F;
pub const L2CAP_BR_DYN_CID_START: u16 = 0x0040;
pub const L2CAP_BR_DYN_CID_END: u16 = 0xFFFF;

// Signalling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_FLOW_CONTROL_CREDIT: u8 = 0x16;
pub const L2CAP_ECRED_CONNECTION_REQUEST: u8 = 0x17;
pub const L2CAP_ECRED_CONNECTION_RESPONSE: u8 = 0x18;
pub const L2CAP_ECRED_RECONFIGURE_REQUEST: u8 = 0x19;
pub const L2CAP_ECRED_RECONFIGURE_RESPONSE: u8 = 0x1A;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// BR/EDR connection response results
pub const L2CAP_BR_SUCCESS: u16 = 0x0000;
pub const L2CAP_BR_PENDING: u16 = 0x0001;
pub const L2CAP_BR_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_BR_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_BR_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_BR_INVALID_SCID: u16 = 0x0006;
pub const L2CAP_BR_SCID_IN_USE: u16 = 0x0007;

// Configuration
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPT: u16 = 0x0001;
pub const L2CAP_CONF_REJECT: u16 = 0x0002;
pub const L2CAP_CONF_OPT_MTU: u8 = 0x01;
pub const L2CAP_CONF_OPT_HINT: u8 = 0x80;

// Information request types and results
pub const L2CAP_INFO_FEAT_MASK: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHAN: u16 = 0x0003;
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;
pub const L2CAP_FEAT_FIXED_CHAN_MASK: u32 = 0x0000_0080;

// Connection parameter update results
pub const L2CAP_CONN_PARAM_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONN_PARAM_REJECTED: u16 = 0x0001;

// Credit based channel limits
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_LE_MIN_MPS: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
pub const L2CAP_ECRED_MIN_MTU: u16 = 64;
pub const L2CAP_ECRED_MIN_MPS: u16 = 64;
pub const L2CAP_ECRED_CHAN_MAX: usize = 5;

// BR/EDR basic mode
pub const L2CAP_BR_MIN_MTU: u16 = 48;
pub const L2CAP_BR_DEFAULT_MTU: u16 = 672;

// Fixed channel MTU on LE (ATT default)
pub const L2CAP_LE_FIXED_MTU: u16 = 23;
