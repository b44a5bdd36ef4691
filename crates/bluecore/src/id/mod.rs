//! Local identities and private addresses
//!
//! Identity 0 is created at init from the controller's public address, or
//! from a fresh static random address when the controller has none. With
//! privacy enabled every identity carries an IRK and exposes resolvable
//! private addresses that rotate on a single host timer.


use log::{debug, info, warn};

use crate::error::{Error, HciError, Result};
use crate::gap::constants::{RANDOM_ADDR_RPA, RANDOM_ADDR_TYPE_MASK};
use crate::gap::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::{HciCommand, HciDriver};
use crate::host::{Host, LeFeatures};
use crate::timer::Timer;

/// A local identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Public or static random identity address
    pub addr: LeAddr,
    /// Identity resolving key, present when privacy is enabled
    pub irk: Option<[u8; 16]>,
    /// Keep the current RPA across RPA timeouts
    pub keep_rpa: bool,
    pub(crate) rpa: Option<BdAddr>,
    pub(crate) rpa_valid: bool,
}

#[derive(Debug, Clone, Copy)]
struct ResolvingEntry {
    peer: LeAddr,
    irk: [u8; 16],
}

#[derive(Debug)]
pub(crate) struct IdState {
    ids: Vec<Option<Identity>>,
    /// Random address currently programmed in the controller
    pub(crate) random_addr: Option<BdAddr>,
    pub(crate) rpa_timer: Timer,
    resolving: Vec<ResolvingEntry>,
    /// Resolving list overflowed: peers are resolved by the host
    pub(crate) host_resolution: bool,
}

impl IdState {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            ids: vec![None; max],
            random_addr: None,
            rpa_timer: Timer::new(),
            resolving: Vec::new(),
            host_resolution: false,
        }
    }

    pub(crate) fn get(&self, id: u8) -> Option<&Identity> {
        self.ids.get(id as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: u8) -> Option<&mut Identity> {
        self.ids.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn contains_addr(&self, addr: &LeAddr) -> bool {
        self.ids.iter().flatten().any(|identity| identity.addr.same_device(addr))
    }
}

impl<D: HciDriver> Host<D> {
    /// Set up identity 0
    pub(crate) fn id_init(&mut self) -> Result<()> {
        if self.ids.get(0).is_some() {
            return Ok(());
        }

        let public = self.info.bd_addr;
        let addr = if public.is_any() || public == BdAddr::NONE {
            let addr = BdAddr::new_static();
            self.set_random_address(addr)?;
            LeAddr::new(AddressType::Random, addr)
        } else {
            LeAddr::new(AddressType::Public, public)
        };
        let irk = self.config.privacy.then(rand::random::<[u8; 16]>);

        self.ids.ids[0] = Some(Identity {
            addr,
            irk,
            keep_rpa: false,
            rpa: None,
            rpa_valid: false,
        });
        info!("Identity 0 is {}", addr);

        if self.config.privacy {
            self.ids.rpa_timer.arm(self.config.rpa_timeout);
        }
        Ok(())
    }

    /// Add a local identity.
    ///
    /// Without `addr` a static random address is generated. Without `irk`
    /// one is generated when privacy is enabled.
    pub fn id_create(&mut self, addr: Option<LeAddr>, irk: Option<[u8; 16]>) -> Result<u8> {
        if let Some(addr) = &addr {
            if addr.is_random() && !addr.addr.is_static() {
                return Err(Error::InvalidParameter(format!(
                    "{} is not an identity address",
                    addr
                )));
            }
            if self.ids.contains_addr(addr) {
                return Err(Error::InvalidParameter(format!("Identity {} exists", addr)));
            }
        }
        let slot = self
            .ids
            .ids
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted("identity"))?;

        let addr = addr.unwrap_or_else(|| LeAddr::new(AddressType::Random, BdAddr::new_static()));
        let irk = if self.config.privacy {
            Some(irk.unwrap_or_else(rand::random))
        } else {
            None
        };
        self.ids.ids[slot] = Some(Identity {
            addr,
            irk,
            keep_rpa: false,
            rpa: None,
            rpa_valid: false,
        });
        debug!("Identity {} is {}", slot, addr);
        Ok(slot as u8)
    }

    /// Every identity as `(id, address)`
    pub fn id_get(&self) -> Vec<(u8, LeAddr)> {
        self.ids
            .ids
            .iter()
            .enumerate()
            .filter_map(|(id, identity)| identity.as_ref().map(|i| (id as u8, i.addr)))
            .collect()
    }

    pub fn identity(&self, id: u8) -> Option<&Identity> {
        self.ids.get(id)
    }

    /// Keep the RPA of `id` across RPA timeouts
    pub fn id_keep_rpa(&mut self, id: u8, keep: bool) -> Result<()> {
        let identity = self
            .ids
            .get_mut(id)
            .ok_or_else(|| Error::InvalidParameter(format!("No identity {}", id)))?;
        identity.keep_rpa = keep;
        Ok(())
    }

    /// Remove an identity. Identity 0 cannot be removed.
    pub fn id_delete(&mut self, id: u8) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidParameter("Identity 0 cannot be deleted".into()));
        }
        if self.ids.get(id).is_none() {
            return Err(Error::InvalidParameter(format!("No identity {}", id)));
        }
        if self.adv_uses_id(id) {
            return Err(Error::Busy);
        }
        self.ids.ids[id as usize] = None;
        Ok(())
    }

    /// Program `addr` as the controller random address
    pub(crate) fn set_random_address(&mut self, addr: BdAddr) -> Result<()> {
        if self.ids.random_addr == Some(addr) {
            return Ok(());
        }
        self.send_cmd(&HciCommand::LeSetRandomAddress { addr })?;
        self.ids.random_addr = Some(addr);
        Ok(())
    }

    /// Private address for identity `id`: its current RPA when privacy is
    /// enabled, otherwise a fresh NRPA
    pub(crate) fn private_addr(&mut self, id: u8) -> Result<BdAddr> {
        let privacy = self.config.privacy;
        let identity = self
            .ids
            .get(id)
            .ok_or_else(|| Error::Config(format!("No identity {}", id)))?;

        match identity.irk {
            Some(irk) if privacy => {
                if let (true, Some(rpa)) = (identity.rpa_valid, identity.rpa) {
                    return Ok(rpa);
                }
                let rpa = self.rpa_create(&irk)?;
                if let Some(identity) = self.ids.get_mut(id) {
                    identity.rpa = Some(rpa);
                    identity.rpa_valid = true;
                }
                Ok(rpa)
            }
            _ => Ok(BdAddr::new_nrpa()),
        }
    }

    /// Program a private address for `id` in the controller
    pub fn set_private_address(&mut self, id: u8) -> Result<()> {
        let was_valid = self.ids.get(id).is_some_and(|identity| identity.rpa_valid);
        let addr = self.private_addr(id)?;
        let result = self.set_random_address(addr);
        if self.config.privacy && !was_valid {
            // Restarted even when the controller refused the address.
            self.ids.rpa_timer.arm(self.config.rpa_timeout);
        }
        result
    }

    /// Own address type for initiating or scanning, programming the random
    /// address it refers to
    pub(crate) fn id_own_addr_type(&mut self, id: u8) -> Result<u8> {
        if self.config.privacy {
            self.set_private_address(id)?;
            return Ok(OWN_ADDR_RANDOM);
        }
        let identity = self
            .ids
            .get(id)
            .ok_or_else(|| Error::Config(format!("No identity {}", id)))?;
        let addr = identity.addr;
        if addr.is_random() {
            self.set_random_address(addr.addr)?;
            Ok(OWN_ADDR_RANDOM)
        } else {
            Ok(OWN_ADDR_PUBLIC)
        }
    }

    /// Random address hash function `ah`, computed by the controller
    pub(crate) fn ah(&mut self, irk: &[u8; 16], prand: [u8; 3]) -> Result<[u8; 3]> {
        let mut plaintext = [0u8; 16];
        plaintext[..3].copy_from_slice(&prand);
        let enc = self.send_cmd(&HciCommand::LeEncrypt {
            key: *irk,
            plaintext,
        })?;
        if enc.len() < 16 {
            return Err(HciError::InvalidParamLength(enc.len()).into());
        }
        Ok([enc[0], enc[1], enc[2]])
    }

    /// Generate a resolvable private address from `irk`
    pub fn rpa_create(&mut self, irk: &[u8; 16]) -> Result<BdAddr> {
        let mut prand: [u8; 3] = rand::random();
        prand[2] = (prand[2] & !RANDOM_ADDR_TYPE_MASK) | RANDOM_ADDR_RPA;
        let hash = self.ah(irk, prand)?;
        Ok(BdAddr::from_rpa_parts(hash, prand))
    }

    /// Whether `addr` was generated from `irk`
    pub fn rpa_resolve(&mut self, irk: &[u8; 16], addr: &BdAddr) -> Result<bool> {
        if !addr.is_rpa() {
            return Ok(false);
        }
        let (hash, prand) = addr.rpa_parts();
        Ok(self.ah(irk, prand)? == hash)
    }

    /// Identity of a peer using an RPA, when the host does the resolving
    pub(crate) fn resolve_peer(&mut self, addr: &LeAddr) -> LeAddr {
        if !self.ids.host_resolution || !addr.is_rpa() {
            return *addr;
        }
        let entries = self.ids.resolving.clone();
        for entry in entries {
            match self.rpa_resolve(&entry.irk, &addr.addr) {
                Ok(true) => return entry.peer,
                Ok(false) => {}
                Err(e) => {
                    warn!("Resolving {} failed: {}", addr, e);
                    break;
                }
            }
        }
        *addr
    }

    /// Add a bonded peer to the resolving list.
    ///
    /// When the controller list is full the host takes over resolution.
    pub fn add_resolving_list(&mut self, peer: LeAddr, peer_irk: [u8; 16]) -> Result<()> {
        if !self.config.privacy {
            return Err(Error::NotSupported);
        }
        self.ids.resolving.retain(|entry| !entry.peer.same_device(&peer));
        self.ids.resolving.push(ResolvingEntry {
            peer,
            irk: peer_irk,
        });

        let controller_capable = self.info.le_features.contains(LeFeatures::PRIVACY);
        if self.ids.host_resolution || !controller_capable {
            self.ids.host_resolution = true;
            return Ok(());
        }
        if self.ids.resolving.len() > self.info.resolving_list_size as usize {
            return self.resolving_list_overflow();
        }

        let local_irk = self.ids.get(0).and_then(|identity| identity.irk).unwrap_or_default();
        self.send_cmd(&HciCommand::LeSetAddressResolutionEnable { enable: false })?;
        let added = self.send_cmd(&HciCommand::LeAddDeviceToResolvingList {
            peer_addr_type: u8::from(peer.kind.base()),
            peer_addr: peer.addr,
            peer_irk,
            local_irk,
        });
        match added {
            Ok(_) => {
                self.send_cmd(&HciCommand::LeSetAddressResolutionEnable { enable: true })?;
                Ok(())
            }
            Err(Error::Controller { status, .. }) => {
                debug!("Resolving list add failed with 0x{:02x}", status);
                self.resolving_list_overflow()
            }
            Err(e) => Err(e),
        }
    }

    fn resolving_list_overflow(&mut self) -> Result<()> {
        warn!("Resolving list full, resolving peers on the host");
        self.ids.host_resolution = true;
        if let Err(e) = self.send_cmd(&HciCommand::LeSetAddressResolutionEnable { enable: false }) {
            warn!("Disabling controller address resolution failed: {}", e);
        }
        Ok(())
    }

    /// Force a new RPA for identity 0 the next time one is needed
    pub(crate) fn rpa_invalidate(&mut self) {
        if let Some(identity) = self.ids.get_mut(0) {
            identity.rpa_valid = false;
        }
    }

    /// Rotate private addresses
    pub(crate) fn rpa_timeout(&mut self) {
        debug!("RPA timeout");
        for identity in self.ids.ids.iter_mut().flatten() {
            if !identity.keep_rpa {
                identity.rpa_valid = false;
            }
        }

        self.adv_rpa_expired();
        self.scan_rpa_expired();

        self.ids.rpa_timer.arm(self.config.rpa_timeout);
    }
}
