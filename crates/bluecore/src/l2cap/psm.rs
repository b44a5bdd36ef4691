//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! LE credit based channels use the 8-bit SPSM space, BR/EDR channels the
//! odd 16-bit PSM space.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

/// First dynamically assigned LE SPSM
pub const LE_PSM_DYN_START: u16 = 0x0080;
/// Last LE SPSM
pub const LE_PSM_DYN_END: u16 = 0x00FF;

/// Protocol/Service Multiplexer values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PSM {
    /// Service Discovery Protocol (BR/EDR)
    SDP,
    /// RFCOMM (BR/EDR)
    RFCOMM,
    /// Internet Protocol Support Profile
    IPSP,
    /// Object Transfer Service
    OTS,
    /// Enhanced ATT bearer
    EATT,
    /// Any other value
    Dynamic(u16),
}

impl PSM {
    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            PSM::SDP => 0x0001,
            PSM::RFCOMM => 0x0003,
            PSM::IPSP => 0x0023,
            PSM::OTS => 0x0025,
            PSM::EATT => 0x0027,
            PSM::Dynamic(value) => *value,
        }
    }

    /// Get the PSM for a raw value
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0001 => PSM::SDP,
            0x0003 => PSM::RFCOMM,
            0x0023 => PSM::IPSP,
            0x0025 => PSM::OTS,
            0x0027 => PSM::EATT,
            other => PSM::Dynamic(other),
        }
    }

    /// Valid SPSM for an LE credit based channel
    pub fn is_valid_le(&self) -> bool {
        (0x0001..=LE_PSM_DYN_END).contains(&self.value())
    }

    /// Valid PSM for a BR/EDR channel: odd, with the low bit of the most
    /// significant byte cleared
    pub fn is_valid_br(&self) -> bool {
        let value = self.value();
        value & 0x0001 == 0x0001 && value & 0x0100 == 0
    }

    /// Whether the value lies in the dynamically assigned LE range
    pub fn is_dynamic_le(&self) -> bool {
        (LE_PSM_DYN_START..=LE_PSM_DYN_END).contains(&self.value())
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.value())
    }
}

// Next LE dynamic SPSM to hand out
static NEXT_DYNAMIC_PSM: AtomicU16 = AtomicU16::new(LE_PSM_DYN_START);

/// Obtain a candidate dynamic LE SPSM.
///
/// The counter wraps within the dynamic range, so the caller must still check
/// the value against its registered servers.
pub fn obtain_dynamic_psm() -> PSM {
    let value = NEXT_DYNAMIC_PSM
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(if current >= LE_PSM_DYN_END {
                LE_PSM_DYN_START
            } else {
                current + 1
            })
        })
        .unwrap_or(LE_PSM_DYN_START);
    PSM::Dynamic(value)
}
