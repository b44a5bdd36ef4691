use crate::gap::constants::*;
use std::fmt;

/// Kind of LE device address as carried in HCI commands and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl AddressType {
    /// Identity kinds are reported by the controller after resolving an RPA.
    /// For host side comparisons they are equivalent to the base kind.
    pub fn base(self) -> Self {
        match self {
            AddressType::PublicIdentity => AddressType::Public,
            AddressType::RandomIdentity => AddressType::Random,
            other => other,
        }
    }
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// 48-bit device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0x00; 6] };
    pub const NONE: BdAddr = BdAddr { bytes: [0xFF; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Two most significant bits, which tag the random address sub-type.
    fn sub_type(&self) -> u8 {
        self.bytes[5] & RANDOM_ADDR_TYPE_MASK
    }

    pub fn is_rpa(&self) -> bool {
        self.sub_type() == RANDOM_ADDR_RPA
    }

    pub fn is_nrpa(&self) -> bool {
        self.sub_type() == RANDOM_ADDR_NRPA
    }

    pub fn is_static(&self) -> bool {
        self.sub_type() == RANDOM_ADDR_STATIC
    }

    /// Generate a non-resolvable private address.
    ///
    /// The random part may be neither all zeros nor all ones.
    pub fn new_nrpa() -> Self {
        loop {
            let mut bytes: [u8; 6] = rand::random();
            bytes[5] &= !RANDOM_ADDR_TYPE_MASK;
            let random_bits_zero = bytes[..5].iter().all(|b| *b == 0) && bytes[5] == 0;
            let random_bits_ones = bytes[..5].iter().all(|b| *b == 0xFF) && bytes[5] == 0x3F;
            if !random_bits_zero && !random_bits_ones {
                return Self { bytes };
            }
        }
    }

    /// Generate a static random address.
    pub fn new_static() -> Self {
        loop {
            let mut bytes: [u8; 6] = rand::random();
            bytes[5] |= RANDOM_ADDR_STATIC;
            let random_bits_ones = bytes[..5].iter().all(|b| *b == 0xFF) && bytes[5] == 0xFF;
            let random_bits_zero = bytes[..5].iter().all(|b| *b == 0) && bytes[5] == RANDOM_ADDR_STATIC;
            if !random_bits_ones && !random_bits_zero {
                return Self { bytes };
            }
        }
    }

    /// Assemble a resolvable private address from its hash and prand parts.
    pub fn from_rpa_parts(hash: [u8; 3], prand: [u8; 3]) -> Self {
        let mut bytes = [0u8; 6];
        bytes[..3].copy_from_slice(&hash);
        bytes[3..].copy_from_slice(&prand);
        bytes[5] = (bytes[5] & !RANDOM_ADDR_TYPE_MASK) | RANDOM_ADDR_RPA;
        Self { bytes }
    }

    /// Hash and prand halves of a resolvable private address.
    pub fn rpa_parts(&self) -> ([u8; 3], [u8; 3]) {
        let mut hash = [0u8; 3];
        let mut prand = [0u8; 3];
        hash.copy_from_slice(&self.bytes[..3]);
        prand.copy_from_slice(&self.bytes[3..]);
        (hash, prand)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// LE address together with its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeAddr {
    pub kind: AddressType,
    pub addr: BdAddr,
}

impl LeAddr {
    /// Wildcard peer used by undirected connectable advertising.
    pub const ANY: LeAddr = LeAddr {
        kind: AddressType::Public,
        addr: BdAddr::ANY,
    };

    /// Placeholder for "no address".
    pub const NONE: LeAddr = LeAddr {
        kind: AddressType::Random,
        addr: BdAddr::NONE,
    };

    pub fn new(kind: AddressType, addr: BdAddr) -> Self {
        Self { kind, addr }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Public, BdAddr::new(bytes))
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Random, BdAddr::new(bytes))
    }

    pub fn is_random(&self) -> bool {
        self.kind.base() == AddressType::Random
    }

    pub fn is_rpa(&self) -> bool {
        self.is_random() && self.addr.is_rpa()
    }

    /// Equality that ignores the identity flavour of the address kind.
    pub fn same_device(&self, other: &LeAddr) -> bool {
        self.addr == other.addr && self.kind.base() == other.kind.base()
    }
}

impl fmt::Display for LeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AddressType::Public => "public",
            AddressType::Random => "random",
            AddressType::PublicIdentity => "public-id",
            AddressType::RandomIdentity => "random-id",
        };
        write!(f, "{} ({})", self.addr, kind)
    }
}
