//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the command encoder, event decoder, data packet
//! headers and the controller driver boundary.

pub mod acl;
pub mod constants;
pub mod driver;
pub mod event;
pub mod packet;
pub mod socket;

#[cfg(test)]
mod tests;

pub use acl::{AclHeader, IsoDataLoad, IsoHeader, PacketBoundary};
pub use driver::{CommandComplete, HciDriver};
pub use event::{AdvReport, DataStatus, Event, ExtAdvReport, LeConnectionComplete, LeEvent};
pub use packet::{ExtAdvEnableSet, ExtConnPhy, ExtScanPhy, HciCommand};
pub use socket::HciSocket;
