//! Advertising data encoding
//!
//! Advertising and scan response data are lists of AD structures, each
//! encoded as `length, type, data`. Extended advertising data larger than
//! one HCI command is streamed out through [`AdStream`] without building
//! the whole block first.

use crate::error::{Error, Result};
use crate::gap::constants::{ADV_TYPE_COMPLETE_LOCAL_NAME, ADV_TYPE_SHORT_LOCAL_NAME};

/// One AD structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdData {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl AdData {
    pub fn new(kind: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Encoded size, length and type octets included
    pub fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }
}

/// Most data one AD structure carries; its length octet also counts the type
pub const AD_DATA_MAX: usize = 254;

/// Refuse AD structures whose length does not fit the length octet
pub fn validate(ad: &[AdData]) -> Result<()> {
    match ad.iter().find(|item| item.data.len() > AD_DATA_MAX) {
        Some(item) => Err(Error::InvalidParameter(format!(
            "AD type 0x{:02x} carries {} octets, at most {} fit",
            item.kind,
            item.data.len(),
            AD_DATA_MAX
        ))),
        None => Ok(()),
    }
}

/// Encoded size of a list of AD structures
pub fn encoded_len(ad: &[AdData]) -> usize {
    ad.iter().map(AdData::encoded_len).sum()
}

pub fn encode(ad: &[AdData]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(ad));
    for item in ad {
        out.push((item.data.len() + 1) as u8);
        out.push(item.kind);
        out.extend_from_slice(&item.data);
    }
    out
}

/// Encode AD structures into at most `max` octets.
///
/// A complete local name that does not fit is shortened and sent as a
/// shortened local name. Nothing else is ever truncated.
pub fn fit_legacy(ad: &[AdData], max: usize) -> Result<Vec<u8>> {
    let total = encoded_len(ad);
    if total <= max {
        return Ok(encode(ad));
    }

    let excess = total - max;
    let name = ad
        .iter()
        .position(|item| item.kind == ADV_TYPE_COMPLETE_LOCAL_NAME)
        .filter(|&i| ad[i].data.len() > excess)
        .ok_or_else(|| {
            Error::InvalidParameter(format!("{} octets of advertising data exceed {}", total, max))
        })?;

    let mut fitted = ad.to_vec();
    let item = &mut fitted[name];
    item.kind = ADV_TYPE_SHORT_LOCAL_NAME;
    item.data.truncate(item.data.len() - excess);
    Ok(encode(&fitted))
}

/// Cursor over the encoded form of several lists of AD structures
pub struct AdStream<'a> {
    groups: &'a [&'a [AdData]],
    group: usize,
    item: usize,
    /// Offset inside the encoded current item
    offset: usize,
    remaining: usize,
}

impl<'a> AdStream<'a> {
    pub fn new(groups: &'a [&'a [AdData]]) -> Self {
        let remaining = groups.iter().map(|ad| encoded_len(ad)).sum();
        Self {
            groups,
            group: 0,
            item: 0,
            offset: 0,
            remaining,
        }
    }

    /// Octets not yet produced
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    fn current(&mut self) -> Option<&'a AdData> {
        loop {
            let group = self.groups.get(self.group)?;
            if let Some(item) = group.get(self.item) {
                return Some(item);
            }
            self.group += 1;
            self.item = 0;
        }
    }

    /// Produce up to `max` further octets
    pub fn next_chunk(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(self.remaining));
        while out.len() < max {
            let Some(item) = self.current() else {
                break;
            };
            match self.offset {
                0 => out.push((item.data.len() + 1) as u8),
                1 => out.push(item.kind),
                _ => {
                    let start = self.offset - 2;
                    let take = (item.data.len() - start).min(max - out.len());
                    out.extend_from_slice(&item.data[start..start + take]);
                    self.offset += take - 1;
                }
            }
            self.offset += 1;
            if self.offset == item.encoded_len() {
                self.item += 1;
                self.offset = 0;
            }
        }
        self.remaining -= out.len();
        out
    }
}
