//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! Fixed channels, LE credit based channels, enhanced credit based channels
//! and BR/EDR basic mode channels multiplexed over one ACL link each.
//!
//! The channel layer is driven by the host: inbound PDUs arrive through
//! [`L2capManager::recv`] after ACL reassembly, outbound PDUs are pulled
//! one at a time by the connection TX processor.

pub mod channel;
pub mod constants;
pub mod core;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;

pub use self::channel::{ChanRef, ChannelOps, Endpoint, L2capChannel, L2capChannelType, OutPdu, RecvMode};
pub use self::core::{AcceptFn, FixedChannelFn, L2capAction, L2capManager, L2capServer};
pub use self::psm::PSM;
pub use self::signaling::SignalingMessage;
pub use self::types::*;
