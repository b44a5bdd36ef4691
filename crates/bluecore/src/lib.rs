//! bluecore - the connection oriented core of a Bluetooth LE host
//!
//! This library drives a Bluetooth controller over HCI and keeps the host
//! side state of the link: connection objects and their transmit
//! scheduling, L2CAP channels with credit based flow control, advertising
//! sets, scanning and periodic syncs, and local identities with address
//! privacy.
//!
//! Everything hangs off a [`Host`], which owns an [`hci::HciDriver`] and is
//! driven by feeding it controller packets and polling its timers.

pub mod adv;
pub mod config;
pub mod conn;
pub mod error;
pub mod gap;
pub mod hci;
pub mod host;
pub mod id;
pub mod l2cap;
pub mod scan;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use adv::{AdData, AdvEvent, AdvHandle, AdvOptions, AdvParams, AdvStartParams};
pub use config::{HostConfig, HostFlowControl, L2capConfig};
pub use conn::{ConnEvent, ConnId, ConnParams, ConnRef, ConnState, ConnType, CreateParams, Role};
pub use error::{Error, HciError, Result};
pub use gap::{AddressType, BdAddr, LeAddr};
pub use hci::{HciDriver, HciSocket};
pub use host::{ControllerInfo, Host, LeFeatures};
pub use id::Identity;
pub use l2cap::{ChannelOps, L2capError, L2capManager, L2capServer, SecurityLevel};
pub use scan::{ScanEvent, ScanParams, ScanReport, ScanType, SyncEvent, SyncId, SyncParams};
