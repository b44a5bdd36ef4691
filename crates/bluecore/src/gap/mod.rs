//! Generic Access Profile types shared by the host core
//!
//! Device addresses, address kinds and the advertising data type codes.

pub mod constants;
pub mod types;

pub use types::{AddressType, BdAddr, LeAddr};
