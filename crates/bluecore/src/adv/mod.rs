//! Advertising sets
//!
//! Each set moves through [`AdvState`]: created, parameters written, data
//! written, enabled. Controllers without extended advertising get a single
//! set driven by the legacy commands; otherwise every set uses the extended
//! commands, with legacy PDUs unless [`AdvOptions::EXT_ADV`] is requested.
//!
//! A connectable set provisions a connection object before it is enabled so
//! an incoming connection always finds one.

pub mod data;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, warn};

pub use self::data::{AdData, AdStream};

use crate::conn::{ConnId, ConnRef, ConnState, ConnType, Role};
use crate::error::{Error, Result};
use crate::gap::constants::ADV_TYPE_COMPLETE_LOCAL_NAME;
use crate::gap::{BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::{ExtAdvEnableSet, HciCommand, HciDriver};
use crate::host::{Host, LeFeatures};
use crate::timer::{earliest, Timer};

bitflags! {
    /// Advertising options chosen at creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdvOptions: u32 {
        const CONNECTABLE = 1 << 0;
        const SCANNABLE = 1 << 1;
        /// Advertise with the identity address even when privacy is enabled
        const USE_IDENTITY = 1 << 2;
        /// Extended advertising PDUs
        const EXT_ADV = 1 << 3;
        /// Do not resume after a connection
        const ONE_TIME = 1 << 4;
        /// Low duty cycle directed advertising
        const DIR_LOW_DUTY = 1 << 5;
        /// Put the device name in the advertising or scan response data
        const USE_NAME = 1 << 6;
        const CODED = 1 << 7;
        const ANONYMOUS = 1 << 8;
        const USE_TX_POWER = 1 << 9;
        /// Secondary advertising on the 1M PHY
        const NO_2M = 1 << 10;
    }
}

bitflags! {
    /// Runtime state of a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdvFlags: u8 {
        /// The private address of the set is current
        const RPA_VALID = 1 << 0;
        /// A host timer bounds the advertising duration
        const LIMITED = 1 << 1;
        /// Advertising should continue after a connection
        const PERSIST = 1 << 2;
        /// `random_addr` still has to be written to the controller
        const RANDOM_ADDR_PENDING = 1 << 3;
    }
}

/// Lifecycle of a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdvState {
    Created,
    ParamsSet,
    DataSet,
    Enabled,
}

/// Parameters of a new set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    /// Local identity to advertise
    pub id: u8,
    /// Advertising SID of an extended set
    pub sid: u8,
    pub secondary_max_skip: u8,
    pub options: AdvOptions,
    /// Minimum interval (0.625 ms units)
    pub interval_min: u32,
    /// Maximum interval (0.625 ms units)
    pub interval_max: u32,
    /// Peer of directed advertising
    pub peer: Option<LeAddr>,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            id: 0,
            sid: 0,
            secondary_max_skip: 0,
            options: AdvOptions::empty(),
            interval_min: 0x00A0,
            interval_max: 0x00F0,
            peer: None,
        }
    }
}

impl AdvParams {
    fn is_high_duty_directed(&self) -> bool {
        self.peer.is_some() && !self.options.contains(AdvOptions::DIR_LOW_DUTY)
    }

    fn validate(&self) -> Result<()> {
        let opts = self.options;
        let ext = opts.contains(AdvOptions::EXT_ADV);

        if !self.is_high_duty_directed() {
            let max = if ext { EXT_ADV_INTERVAL_MAX } else { ADV_INTERVAL_MAX };
            if self.interval_min > self.interval_max {
                return Err(Error::InvalidParameter("Advertising interval min above max".into()));
            }
            if self.interval_min < ADV_INTERVAL_MIN || self.interval_max > max {
                return Err(Error::InvalidParameter(format!(
                    "Advertising interval 0x{:x}..0x{:x} out of range",
                    self.interval_min, self.interval_max
                )));
            }
        }
        if self.peer.is_some() && !opts.contains(AdvOptions::CONNECTABLE) {
            return Err(Error::InvalidParameter("Directed advertising must be connectable".into()));
        }
        if ext {
            if self.is_high_duty_directed() {
                return Err(Error::InvalidParameter(
                    "High duty directed advertising needs legacy PDUs".into(),
                ));
            }
            if opts.contains(AdvOptions::CONNECTABLE | AdvOptions::SCANNABLE) {
                return Err(Error::InvalidParameter(
                    "Extended advertising cannot be connectable and scannable".into(),
                ));
            }
            if self.sid > PER_ADV_SID_MAX {
                return Err(Error::InvalidParameter(format!("SID {} out of range", self.sid)));
            }
        } else {
            if opts.contains(AdvOptions::CONNECTABLE)
                && self.peer.is_none()
                && !opts.contains(AdvOptions::SCANNABLE)
            {
                return Err(Error::InvalidParameter(
                    "Legacy undirected connectable advertising is always scannable".into(),
                ));
            }
            if opts.contains(AdvOptions::SCANNABLE) && self.peer.is_some() {
                return Err(Error::InvalidParameter(
                    "Legacy directed advertising cannot be scannable".into(),
                ));
            }
            if opts.intersects(AdvOptions::ANONYMOUS | AdvOptions::CODED) {
                return Err(Error::InvalidParameter(
                    "Anonymous and coded advertising need extended PDUs".into(),
                ));
            }
        }
        Ok(())
    }

    /// Legacy PDU type
    fn legacy_type(&self) -> u8 {
        let opts = self.options;
        if self.peer.is_some() {
            if opts.contains(AdvOptions::DIR_LOW_DUTY) {
                ADV_TYPE_DIRECT_IND_LOW_DUTY
            } else {
                ADV_TYPE_DIRECT_IND_HIGH_DUTY
            }
        } else if opts.contains(AdvOptions::CONNECTABLE) {
            ADV_TYPE_IND
        } else if opts.contains(AdvOptions::SCANNABLE) {
            ADV_TYPE_SCAN_IND
        } else {
            ADV_TYPE_NONCONN_IND
        }
    }

    /// Advertising event properties of the extended parameters command
    fn properties(&self) -> u16 {
        let opts = self.options;
        let mut props = 0;
        if opts.contains(AdvOptions::CONNECTABLE) {
            props |= EXT_ADV_PROP_CONNECTABLE;
        }
        if opts.contains(AdvOptions::SCANNABLE) {
            props |= EXT_ADV_PROP_SCANNABLE;
        }
        if self.peer.is_some() {
            props |= EXT_ADV_PROP_DIRECTED;
        }
        if opts.contains(AdvOptions::EXT_ADV) {
            if opts.contains(AdvOptions::ANONYMOUS) {
                props |= EXT_ADV_PROP_ANON;
            }
            if opts.contains(AdvOptions::USE_TX_POWER) {
                props |= EXT_ADV_PROP_TX_POWER;
            }
        } else {
            props |= EXT_ADV_PROP_LEGACY;
            if self.is_high_duty_directed() {
                props |= EXT_ADV_PROP_HI_DC_CONN;
            }
            // Legacy undirected connectable PDUs are scannable.
            if opts.contains(AdvOptions::CONNECTABLE) && self.peer.is_none() {
                props |= EXT_ADV_PROP_SCANNABLE;
            }
        }
        props
    }
}

/// Limits of one enable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvStartParams {
    /// Advertising duration in 10 ms units, 0 for no limit
    pub timeout: u16,
    /// Maximum extended advertising events, 0 for no limit
    pub num_events: u8,
}

/// Generational handle of an advertising set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvHandle {
    pub index: u8,
    pub generation: u32,
}

/// Notifications about advertising sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvEvent {
    /// Advertising stopped on its own, `reason` is an HCI status
    Terminated { set: AdvHandle, reason: u8 },
    /// A connection was made through the set
    Connected { set: AdvHandle, conn: ConnId },
}

pub type AdvEventCallback = Box<dyn FnMut(&AdvEvent) + Send + 'static>;

/// An advertising set
#[derive(Debug)]
pub struct AdvSet {
    generation: u32,
    params: AdvParams,
    state: AdvState,
    flags: AdvFlags,
    own_addr_type: u8,
    random_addr: Option<BdAddr>,
    /// Uses a private address that rotates
    private: bool,
    ad: Vec<AdData>,
    sd: Vec<AdData>,
    start: AdvStartParams,
    limited_timer: Timer,
    /// Connection object provisioned for this set
    conn: Option<ConnId>,
}

impl AdvSet {
    pub fn params(&self) -> &AdvParams {
        &self.params
    }

    pub fn state(&self) -> AdvState {
        self.state
    }

    pub fn flags(&self) -> AdvFlags {
        self.flags
    }

    pub fn random_addr(&self) -> Option<BdAddr> {
        self.random_addr
    }
}

/// Every advertising set of the host
#[derive(Debug)]
pub(crate) struct AdvSets {
    sets: Vec<Option<AdvSet>>,
    generations: Vec<u32>,
    /// Set used by [`Host::adv_start`]
    legacy: Option<AdvHandle>,
}

impl AdvSets {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            sets: (0..max).map(|_| None).collect(),
            generations: vec![0; max],
            legacy: None,
        }
    }

    fn get(&self, handle: AdvHandle) -> Option<&AdvSet> {
        self.sets
            .get(handle.index as usize)?
            .as_ref()
            .filter(|set| set.generation == handle.generation)
    }

    fn get_mut(&mut self, handle: AdvHandle) -> Option<&mut AdvSet> {
        self.sets
            .get_mut(handle.index as usize)?
            .as_mut()
            .filter(|set| set.generation == handle.generation)
    }

    fn handles(&self) -> Vec<AdvHandle> {
        self.sets
            .iter()
            .enumerate()
            .filter_map(|(index, set)| {
                set.as_ref().map(|set| AdvHandle {
                    index: index as u8,
                    generation: set.generation,
                })
            })
            .collect()
    }

    fn by_index(&self, index: u8) -> Option<AdvHandle> {
        let set = self.sets.get(index as usize)?.as_ref()?;
        Some(AdvHandle {
            index,
            generation: set.generation,
        })
    }

    fn by_conn(&self, conn: ConnId) -> Option<AdvHandle> {
        self.handles()
            .into_iter()
            .find(|h| self.get(*h).is_some_and(|set| set.conn == Some(conn)))
    }

    fn free(&mut self, handle: AdvHandle) {
        if let Some(slot) = self.sets.get_mut(handle.index as usize) {
            *slot = None;
            self.generations[handle.index as usize] = handle.generation.wrapping_add(1);
        }
        if self.legacy == Some(handle) {
            self.legacy = None;
        }
    }
}

fn stale() -> Error {
    Error::InvalidParameter("Unknown advertising set".into())
}

impl<D: HciDriver> Host<D> {
    pub fn register_adv_callback(&mut self, callback: AdvEventCallback) {
        self.adv_callbacks.push(callback);
    }

    fn adv_notify(&mut self, event: AdvEvent) {
        debug!("Advertising event {:?}", event);
        for callback in self.adv_callbacks.iter_mut() {
            callback(&event);
        }
    }

    /// Controller has the extended advertising command set
    fn adv_ext(&self) -> bool {
        self.info.le_features.contains(LeFeatures::EXT_ADV)
    }

    pub fn adv_set(&self, handle: AdvHandle) -> Option<&AdvSet> {
        self.adv.get(handle)
    }

    /// Create a set and write its parameters
    pub fn adv_create(&mut self, params: AdvParams) -> Result<AdvHandle> {
        params.validate()?;
        if self.ids.get(params.id).is_none() {
            return Err(Error::InvalidParameter(format!("No identity {}", params.id)));
        }
        let ext = self.adv_ext();
        if params.options.contains(AdvOptions::EXT_ADV) && !ext {
            return Err(Error::NotSupported);
        }

        let limit = if ext {
            self.adv.sets.len().min(self.info.num_adv_sets.max(1) as usize)
        } else {
            1
        };
        let index = self.adv.sets[..limit.min(self.adv.sets.len())]
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted("advertising set"))?;

        let (own_addr_type, random_addr, private) = self.adv_own_addr(&params)?;
        let generation = self.adv.generations[index];
        let mut set = AdvSet {
            generation,
            params,
            state: AdvState::Created,
            flags: AdvFlags::empty(),
            own_addr_type,
            random_addr,
            private,
            ad: Vec::new(),
            sd: Vec::new(),
            start: AdvStartParams::default(),
            limited_timer: Timer::new(),
            conn: None,
        };
        if random_addr.is_some() {
            set.flags.insert(AdvFlags::RANDOM_ADDR_PENDING);
        }
        if private {
            set.flags.insert(AdvFlags::RPA_VALID);
        }

        self.adv_write_params(index as u8, &set)?;
        set.state = AdvState::ParamsSet;
        self.adv.sets[index] = Some(set);

        let handle = AdvHandle {
            index: index as u8,
            generation,
        };
        debug!("Advertising set {} created", index);
        Ok(handle)
    }

    /// Own address type and random address a set advertises with
    fn adv_own_addr(&mut self, params: &AdvParams) -> Result<(u8, Option<BdAddr>, bool)> {
        let identity = self
            .ids
            .get(params.id)
            .map(|identity| identity.addr)
            .ok_or_else(|| Error::InvalidParameter(format!("No identity {}", params.id)))?;
        let connectable = params.options.contains(AdvOptions::CONNECTABLE);

        if params.options.contains(AdvOptions::USE_IDENTITY) || (connectable && !self.config.privacy) {
            return Ok(if identity.is_random() {
                (OWN_ADDR_RANDOM, Some(identity.addr), false)
            } else {
                (OWN_ADDR_PUBLIC, None, false)
            });
        }
        let addr = self.private_addr(params.id)?;
        Ok((OWN_ADDR_RANDOM, Some(addr), true))
    }

    fn adv_write_params(&mut self, index: u8, set: &AdvSet) -> Result<()> {
        let params = &set.params;
        let (peer_addr_type, peer_addr) = match params.peer {
            Some(peer) => (u8::from(peer.kind.base()), peer.addr),
            None => (0, BdAddr::ANY),
        };

        let command = if self.adv_ext() {
            let coded = params.options.contains(AdvOptions::CODED);
            let secondary_phy = if coded {
                PHY_CODED
            } else if params.options.contains(AdvOptions::NO_2M)
                || !self.info.le_features.contains(LeFeatures::PHY_2M)
            {
                PHY_1M
            } else {
                PHY_2M
            };
            HciCommand::LeSetExtAdvParameters {
                handle: index,
                properties: params.properties(),
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                channel_map: ADV_CHAN_MAP_ALL,
                own_addr_type: set.own_addr_type,
                peer_addr_type,
                peer_addr,
                filter_policy: FILTER_POLICY_ACCEPT_ALL,
                tx_power: 0x7F,
                primary_phy: if coded { PHY_CODED } else { PHY_1M },
                secondary_max_skip: params.secondary_max_skip,
                secondary_phy,
                sid: params.sid,
                scan_req_notify: false,
            }
        } else {
            HciCommand::LeSetAdvertisingParameters {
                interval_min: params.interval_min as u16,
                interval_max: params.interval_max as u16,
                adv_type: params.legacy_type(),
                own_addr_type: set.own_addr_type,
                peer_addr_type,
                peer_addr,
                channel_map: ADV_CHAN_MAP_ALL,
                filter_policy: FILTER_POLICY_ACCEPT_ALL,
            }
        };
        self.send_cmd(&command)?;
        Ok(())
    }

    /// Write advertising and scan response data
    pub fn adv_set_data(&mut self, handle: AdvHandle, ad: &[AdData], sd: &[AdData]) -> Result<()> {
        let set = self.adv.get(handle).ok_or_else(stale)?;
        let options = set.params.options;
        let enabled = set.state == AdvState::Enabled;

        let mut ad = ad.to_vec();
        let mut sd = sd.to_vec();
        if options.contains(AdvOptions::USE_NAME) {
            let name = AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, self.config.device_name.as_bytes());
            if options.contains(AdvOptions::SCANNABLE) {
                sd.push(name);
            } else {
                ad.push(name);
            }
        }

        data::validate(&ad)?;
        data::validate(&sd)?;

        if options.contains(AdvOptions::EXT_ADV) {
            let max = self.config.ext_adv_max_data_len.min(self.info.max_adv_data_len as usize);
            for (list, what) in [(&ad, "advertising"), (&sd, "scan response")] {
                let len = data::encoded_len(list);
                if len > max {
                    return Err(Error::InvalidParameter(format!(
                        "{} octets of {} data exceed {}",
                        len, what, max
                    )));
                }
                if len > EXT_ADV_DATA_FRAG_MAX && enabled {
                    return Err(Error::RetryLater);
                }
            }
            self.adv_write_ext_data(handle.index, &ad, false)?;
            if options.contains(AdvOptions::SCANNABLE) || !sd.is_empty() {
                self.adv_write_ext_data(handle.index, &sd, true)?;
            }
        } else {
            let ad_bytes = data::fit_legacy(&ad, LEGACY_ADV_DATA_MAX)?;
            let sd_bytes = data::fit_legacy(&sd, LEGACY_ADV_DATA_MAX)?;
            if self.adv_ext() {
                for (data, scan_rsp) in [(ad_bytes, false), (sd_bytes, true)] {
                    self.adv_send_ext_op(handle.index, ADV_DATA_OP_COMPLETE, data, scan_rsp)?;
                }
            } else {
                self.send_cmd(&HciCommand::LeSetAdvertisingData { data: ad_bytes })?;
                self.send_cmd(&HciCommand::LeSetScanResponseData { data: sd_bytes })?;
            }
        }

        if let Some(set) = self.adv.get_mut(handle) {
            set.ad = ad;
            set.sd = sd;
            if set.state < AdvState::DataSet {
                set.state = AdvState::DataSet;
            }
        }
        Ok(())
    }

    fn adv_send_ext_op(&mut self, index: u8, operation: u8, data: Vec<u8>, scan_rsp: bool) -> Result<()> {
        let command = if scan_rsp {
            HciCommand::LeSetExtScanRspData {
                handle: index,
                operation,
                frag_pref: ADV_DATA_FRAG_NOT_PREFERRED,
                data,
            }
        } else {
            HciCommand::LeSetExtAdvData {
                handle: index,
                operation,
                frag_pref: ADV_DATA_FRAG_NOT_PREFERRED,
                data,
            }
        };
        self.send_cmd(&command)?;
        Ok(())
    }

    /// Write extended data in as many operations as needed
    fn adv_write_ext_data(&mut self, index: u8, list: &[AdData], scan_rsp: bool) -> Result<()> {
        let groups = [list];
        let mut stream = AdStream::new(&groups);
        if stream.remaining() <= EXT_ADV_DATA_FRAG_MAX {
            let chunk = stream.next_chunk(EXT_ADV_DATA_FRAG_MAX);
            return self.adv_send_ext_op(index, ADV_DATA_OP_COMPLETE, chunk, scan_rsp);
        }

        let mut first = true;
        while !stream.is_done() {
            let chunk = stream.next_chunk(EXT_ADV_DATA_FRAG_MAX);
            let operation = match (first, stream.is_done()) {
                (true, _) => ADV_DATA_OP_FIRST,
                (false, true) => ADV_DATA_OP_LAST,
                (false, false) => ADV_DATA_OP_INTERMEDIATE,
            };
            self.adv_send_ext_op(index, operation, chunk, scan_rsp)?;
            first = false;
        }
        Ok(())
    }

    /// Start advertising
    pub fn adv_enable(&mut self, handle: AdvHandle, start: AdvStartParams) -> Result<()> {
        let set = self.adv.get(handle).ok_or_else(stale)?;
        if set.state == AdvState::Enabled {
            return Err(Error::Already);
        }
        let params = set.params.clone();

        let conn = if params.options.contains(AdvOptions::CONNECTABLE) {
            self.adv_provision_conn(handle, &params)?
        } else {
            None
        };

        if let Err(e) = self.adv_enable_controller(handle, start) {
            if let Some(conn) = conn {
                self.adv_release_conn(&conn, 0);
            }
            return Err(e);
        }

        let legacy_timeout = !self.adv_ext() && start.timeout > 0;
        if let Some(set) = self.adv.get_mut(handle) {
            set.state = AdvState::Enabled;
            set.start = start;
            set.conn = conn.as_ref().map(ConnRef::id);
            if !params.options.contains(AdvOptions::ONE_TIME) {
                set.flags.insert(AdvFlags::PERSIST);
            }
            if legacy_timeout {
                set.flags.insert(AdvFlags::LIMITED);
                set.limited_timer
                    .arm(Duration::from_millis(start.timeout as u64 * 10));
            }
        }
        info!("Advertising set {} enabled", handle.index);
        Ok(())
    }

    /// Connection object an incoming connection through this set will use
    fn adv_provision_conn(&mut self, handle: AdvHandle, params: &AdvParams) -> Result<Option<ConnRef>> {
        let (state, peer) = match params.peer {
            Some(peer) => {
                if self.conn_by_peer(&peer).is_some() {
                    return Err(Error::InvalidParameter(format!("Connection to {} exists", peer)));
                }
                (ConnState::AdvDirConnectable, peer)
            }
            None => (ConnState::AdvConnectable, LeAddr::ANY),
        };

        let conn = match self.conns.allocate() {
            Ok(conn) => conn,
            Err(e) if state == ConnState::AdvDirConnectable => return Err(e),
            Err(e) => {
                warn!("Advertising without a connection object: {}", e);
                return Ok(None);
            }
        };
        {
            let mut c = conn.lock();
            c.kind = ConnType::Le;
            c.role = Role::Peripheral;
            c.peer = peer;
            c.id = params.id;
            c.adv_handle = Some(handle.index);
        }
        self.set_state(&conn, state)?;
        Ok(Some(conn))
    }

    /// Drop a provisioned connection object; a non-zero `err` is reported
    /// as a failed connection
    fn adv_release_conn(&mut self, conn: &ConnRef, err: u8) {
        let pending = {
            let mut c = conn.lock();
            c.err = err;
            c.state.is_pending()
        };
        if pending {
            self.set_state_logged(conn, ConnState::Disconnected);
        }
    }

    fn adv_enable_controller(&mut self, handle: AdvHandle, start: AdvStartParams) -> Result<()> {
        self.adv_refresh_addr(handle)?;
        if self.adv_ext() {
            self.send_cmd(&HciCommand::LeSetExtAdvEnable {
                enable: true,
                sets: vec![ExtAdvEnableSet {
                    handle: handle.index,
                    duration: start.timeout,
                    max_events: start.num_events,
                }],
            })?;
        } else {
            self.send_cmd(&HciCommand::LeSetAdvertisingEnable { enable: true })?;
        }
        Ok(())
    }

    /// Write the random address of a set, renewing an expired private one
    fn adv_refresh_addr(&mut self, handle: AdvHandle) -> Result<()> {
        let set = self.adv.get(handle).ok_or_else(stale)?;
        let (id, private, flags) = (set.params.id, set.private, set.flags);

        if private && !flags.contains(AdvFlags::RPA_VALID) {
            let addr = self.private_addr(id)?;
            if let Some(set) = self.adv.get_mut(handle) {
                set.random_addr = Some(addr);
                set.flags.insert(AdvFlags::RPA_VALID | AdvFlags::RANDOM_ADDR_PENDING);
            }
        }

        let set = self.adv.get(handle).ok_or_else(stale)?;
        let Some(addr) = set.random_addr.filter(|_| set.flags.contains(AdvFlags::RANDOM_ADDR_PENDING))
        else {
            return Ok(());
        };
        if self.adv_ext() {
            self.send_cmd(&HciCommand::LeSetAdvSetRandomAddress {
                handle: handle.index,
                addr,
            })?;
        } else {
            self.set_random_address(addr)?;
        }
        if let Some(set) = self.adv.get_mut(handle) {
            set.flags.remove(AdvFlags::RANDOM_ADDR_PENDING);
        }
        Ok(())
    }

    fn adv_disable_controller(&mut self, index: u8) -> Result<()> {
        if self.adv_ext() {
            self.send_cmd(&HciCommand::LeSetExtAdvEnable {
                enable: false,
                sets: vec![ExtAdvEnableSet {
                    handle: index,
                    duration: 0,
                    max_events: 0,
                }],
            })?;
        } else {
            self.send_cmd(&HciCommand::LeSetAdvertisingEnable { enable: false })?;
        }
        Ok(())
    }

    /// Stop advertising and release the provisioned connection object
    pub fn adv_disable(&mut self, handle: AdvHandle) -> Result<()> {
        let set = self.adv.get(handle).ok_or_else(stale)?;
        if set.state != AdvState::Enabled {
            return Ok(());
        }

        self.adv_disable_controller(handle.index)?;

        let conn = self.adv.get_mut(handle).and_then(|set| {
            set.limited_timer.cancel();
            set.flags.remove(AdvFlags::LIMITED | AdvFlags::PERSIST);
            set.state = AdvState::DataSet;
            set.conn.take()
        });
        if let Some(conn) = conn.and_then(|id| self.conns.get(id)) {
            self.adv_release_conn(&conn, 0);
        }
        debug!("Advertising set {} disabled", handle.index);
        Ok(())
    }

    /// Remove a disabled set
    pub fn adv_delete(&mut self, handle: AdvHandle) -> Result<()> {
        let set = self.adv.get(handle).ok_or_else(stale)?;
        if set.state == AdvState::Enabled {
            return Err(Error::Busy);
        }
        if self.adv_ext() {
            self.send_cmd(&HciCommand::LeRemoveAdvSet {
                handle: handle.index,
            })?;
        }
        self.adv.free(handle);
        Ok(())
    }

    /// Advertise with a single implicit set
    pub fn adv_start(&mut self, params: AdvParams, ad: &[AdData], sd: &[AdData]) -> Result<AdvHandle> {
        if let Some(handle) = self.adv.legacy {
            if self.adv.get(handle).is_some_and(|set| set.state == AdvState::Enabled) {
                return Err(Error::Already);
            }
            self.adv_delete(handle)?;
        }

        let handle = self.adv_create(params)?;
        let started = self
            .adv_set_data(handle, ad, sd)
            .and_then(|_| self.adv_enable(handle, AdvStartParams::default()));
        if let Err(e) = started {
            if let Err(e) = self.adv_delete(handle) {
                warn!("Removing failed advertising set: {}", e);
            }
            return Err(e);
        }
        self.adv.legacy = Some(handle);
        Ok(handle)
    }

    /// Stop advertising started by [`Host::adv_start`]
    pub fn adv_stop(&mut self) -> Result<()> {
        let Some(handle) = self.adv.legacy else {
            return Ok(());
        };
        self.adv_disable(handle)?;
        self.adv_delete(handle)
    }

    /// Legacy advertising runs with the controller random address
    pub(crate) fn adv_shares_random_addr(&self) -> bool {
        !self.adv_ext()
            && self
                .adv
                .sets
                .iter()
                .flatten()
                .any(|set| set.state == AdvState::Enabled && set.random_addr.is_some())
    }

    pub(crate) fn adv_uses_id(&self, id: u8) -> bool {
        self.adv
            .sets
            .iter()
            .flatten()
            .any(|set| set.state == AdvState::Enabled && set.params.id == id)
    }

    /// A peripheral link came up
    pub(crate) fn adv_conn_established(&mut self, conn: &ConnRef, adv_handle: Option<u8>) {
        let id = conn.id();
        let handle = self
            .adv
            .by_conn(id)
            .or_else(|| adv_handle.and_then(|index| self.adv.by_index(index)));
        let Some(handle) = handle else {
            return;
        };
        if let Some(set) = self.adv.get_mut(handle) {
            if set.conn == Some(id) {
                set.conn = None;
            }
        }
        // Extended sets report through Advertising Set Terminated.
        if !self.adv_ext() {
            if let Some(set) = self.adv.get_mut(handle) {
                set.state = AdvState::DataSet;
                set.limited_timer.cancel();
                set.flags.remove(AdvFlags::LIMITED);
            }
            self.adv_notify(AdvEvent::Connected { set: handle, conn: id });
        }
    }

    /// High duty directed advertising ran out without a connection
    pub(crate) fn adv_dir_timeout(&mut self, conn: &ConnRef) {
        let Some(handle) = self.adv.by_conn(conn.id()) else {
            return;
        };
        if let Some(set) = self.adv.get_mut(handle) {
            set.state = AdvState::DataSet;
            set.conn = None;
            set.flags.remove(AdvFlags::PERSIST);
        }
        self.adv_notify(AdvEvent::Terminated {
            set: handle,
            reason: HCI_ERR_ADV_TIMEOUT,
        });
    }

    /// Stop the directed advertising that provisioned `conn`
    pub(crate) fn adv_stop_for_conn(&mut self, conn: &ConnRef) -> Result<()> {
        let Some(handle) = self.adv.by_conn(conn.id()) else {
            return Ok(());
        };
        self.adv_disable_controller(handle.index)?;
        if let Some(set) = self.adv.get_mut(handle) {
            set.state = AdvState::DataSet;
            set.conn = None;
            set.limited_timer.cancel();
            set.flags.remove(AdvFlags::LIMITED | AdvFlags::PERSIST);
        }
        Ok(())
    }

    pub(crate) fn handle_adv_set_terminated(&mut self, status: u8, index: u8, conn_handle: u16, num_events: u8) {
        let Some(handle) = self.adv.by_index(index) else {
            warn!("Termination of unknown advertising set {}", index);
            return;
        };
        let provisioned = self.adv.get_mut(handle).and_then(|set| {
            set.state = AdvState::DataSet;
            set.conn.take()
        });

        if status == HCI_SUCCESS {
            debug!("Advertising set {} connected after {} events", index, num_events);
            let conn = self.conn_by_handle(conn_handle);
            if let Some(id) = provisioned.filter(|id| conn.as_ref().map(ConnRef::id) != Some(*id)) {
                if let Some(unused) = self.conns.get(id) {
                    self.adv_release_conn(&unused, 0);
                }
            }
            if let Some(conn) = conn {
                self.adv_notify(AdvEvent::Connected {
                    set: handle,
                    conn: conn.id(),
                });
            }
            return;
        }

        debug!("Advertising set {} stopped: 0x{:02x}", index, status);
        if let Some(conn) = provisioned.and_then(|id| self.conns.get(id)) {
            let directed = conn.lock().state == ConnState::AdvDirConnectable;
            self.adv_release_conn(&conn, if directed { status } else { 0 });
        }
        if let Some(set) = self.adv.get_mut(handle) {
            set.flags.remove(AdvFlags::PERSIST);
        }
        self.adv_notify(AdvEvent::Terminated { set: handle, reason: status });
    }

    pub(crate) fn adv_process_timeouts(&mut self, now: Instant) {
        for handle in self.adv.handles() {
            let expired = self
                .adv
                .get_mut(handle)
                .is_some_and(|set| set.limited_timer.fire(now));
            if !expired {
                continue;
            }
            debug!("Advertising set {} timed out", handle.index);
            if let Err(e) = self.adv_disable(handle) {
                warn!("Stopping timed out advertising failed: {}", e);
            }
            self.adv_notify(AdvEvent::Terminated {
                set: handle,
                reason: HCI_ERR_ADV_TIMEOUT,
            });
        }
    }

    pub(crate) fn adv_next_deadline(&self) -> Option<Instant> {
        self.adv
            .sets
            .iter()
            .flatten()
            .fold(None, |acc, set| earliest(acc, set.limited_timer.deadline()))
    }

    /// Private addresses expired: move enabled sets to fresh ones, the others
    /// pick one up when next enabled
    pub(crate) fn adv_rpa_expired(&mut self) {
        for handle in self.adv.handles() {
            let Some(set) = self.adv.get_mut(handle) else {
                continue;
            };
            if !set.private {
                continue;
            }
            let keep = set.flags.contains(AdvFlags::RPA_VALID)
                && self.ids.get(set.params.id).is_some_and(|identity| identity.keep_rpa);
            if keep {
                continue;
            }
            set.flags.remove(AdvFlags::RPA_VALID);
            if set.state != AdvState::Enabled {
                continue;
            }
            let start = set.start;

            let renewed = self
                .adv_disable_controller(handle.index)
                .and_then(|_| self.adv_enable_controller(handle, start));
            if let Err(e) = renewed {
                warn!("Renewing address of advertising set {} failed: {}", handle.index, e);
            }
        }
    }

    /// Restart persistent legacy advertising once a connection slot is free
    pub(crate) fn adv_auto_resume(&mut self) {
        let Some(handle) = self.adv.legacy else {
            return;
        };
        let Some(set) = self.adv.get(handle) else {
            return;
        };
        if set.state == AdvState::Enabled || !set.flags.contains(AdvFlags::PERSIST) {
            return;
        }
        if set.params.options.contains(AdvOptions::CONNECTABLE) && self.conns.in_use() >= self.conns.capacity() {
            return;
        }
        let start = set.start;
        if let Err(e) = self.adv_enable(handle, start) {
            warn!("Resuming advertising failed: {}", e);
        }
    }

    /// Forget every set; the controller is about to be reset
    pub(crate) fn adv_shutdown(&mut self) {
        for handle in self.adv.handles() {
            self.adv.free(handle);
        }
    }
}
