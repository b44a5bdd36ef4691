//! Connection management
//!
//! Connection objects live in a fixed [`ConnPool`] and move through the
//! [`ConnState`] machine. Every object outside `Disconnected` is kept alive by
//! a lifetime reference held by the host; users hold their own [`ConnRef`]s.
//! The slot is recycled when the last reference goes away.

pub mod pool;
pub mod rx;
pub mod state;
pub mod tx;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, warn};

pub use self::pool::{ConnId, ConnPool, ConnRef};
pub use self::state::ConnState;
pub use self::tx::PacketCredits;

use self::tx::{TxPdu, TxRecord};
use crate::error::{Error, Result};
use crate::gap::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::{ExtConnPhy, HciCommand, HciDriver, IsoDataLoad, LeConnectionComplete};
use crate::host::{Host, LeFeatures};
use crate::l2cap::{L2capAction, LinkKind, SecurityLevel};
use crate::timer::Timer;

/// Link type of a connection object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnType {
    #[default]
    Le,
    BrEdr,
    Sco,
    Iso,
}

/// Local role on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Central,
    Peripheral,
}

/// LE connection parameters, in controller units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    /// Minimum connection interval (1.25 ms units)
    pub interval_min: u16,
    /// Maximum connection interval (1.25 ms units)
    pub interval_max: u16,
    /// Peripheral latency in connection events
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub timeout: u16,
}

impl ConnParams {
    pub const DEFAULT: ConnParams = ConnParams {
        interval_min: 0x0018,
        interval_max: 0x0028,
        latency: 0,
        timeout: 400,
    };

    pub fn validate(&self) -> Result<()> {
        if self.interval_min > self.interval_max {
            return Err(Error::InvalidParameter(format!(
                "Connection interval min 0x{:04x} above max 0x{:04x}",
                self.interval_min, self.interval_max
            )));
        }
        if self.interval_min < CONN_INTERVAL_MIN || self.interval_max > CONN_INTERVAL_MAX {
            return Err(Error::InvalidParameter("Connection interval out of range".into()));
        }
        if self.latency > CONN_LATENCY_MAX {
            return Err(Error::InvalidParameter(format!("Latency {} too large", self.latency)));
        }
        if self.timeout < CONN_TIMEOUT_MIN || self.timeout > CONN_TIMEOUT_MAX {
            return Err(Error::InvalidParameter("Supervision timeout out of range".into()));
        }
        // The supervision timeout must cover two effective intervals.
        if (self.timeout as u32) * 4 <= (1 + self.latency as u32) * self.interval_max as u32 {
            return Err(Error::InvalidParameter(
                "Supervision timeout too short for interval and latency".into(),
            ));
        }
        Ok(())
    }

    /// Whether a link running `interval`/`latency`/`timeout` already satisfies these
    pub fn matches(&self, interval: u16, latency: u16, timeout: u16) -> bool {
        (self.interval_min..=self.interval_max).contains(&interval)
            && self.latency == latency
            && self.timeout == timeout
    }
}

impl Default for ConnParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How the initiator looks for the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateParams {
    pub scan_interval: u16,
    pub scan_window: u16,
    /// Also initiate on the Coded PHY
    pub coded: bool,
    /// Give up after this long, [`crate::HostConfig::create_conn_timeout`] when `None`
    pub timeout: Option<Duration>,
    /// Scan for the peer first and only initiate once it has been seen
    pub scan_before_initiating: bool,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            scan_interval: 0x0060,
            scan_window: 0x0060,
            coded: false,
            timeout: None,
            scan_before_initiating: false,
        }
    }
}

impl CreateParams {
    fn validate(&self) -> Result<()> {
        let range = SCAN_INTERVAL_MIN..=SCAN_INTERVAL_MAX;
        if !range.contains(&self.scan_interval) || !range.contains(&self.scan_window) {
            return Err(Error::InvalidParameter("Scan interval or window out of range".into()));
        }
        if self.scan_window > self.scan_interval {
            return Err(Error::InvalidParameter("Scan window larger than interval".into()));
        }
        Ok(())
    }
}

/// Data length in use on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLen {
    pub tx_octets: u16,
    pub tx_time: u16,
    pub rx_octets: u16,
    pub rx_time: u16,
}

impl Default for DataLen {
    fn default() -> Self {
        Self {
            tx_octets: 27,
            tx_time: 328,
            rx_octets: 27,
            rx_time: 328,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u16 {
        /// Reached `Connected` at least once
        const ESTABLISHED = 1 << 0;
        /// HCI connection update in progress
        const PARAM_UPDATE_PENDING = 1 << 1;
        /// Parameter request sent over L2CAP signalling
        const PARAM_L2CAP = 1 << 2;
        /// LE Create Connection Cancel sent
        const CANCEL_PENDING = 1 << 3;
        const FEATURES_READ = 1 << 4;
    }
}

/// A connection object
pub struct Connection {
    pub kind: ConnType,
    pub role: Role,
    pub state: ConnState,
    /// Controller handle, valid while connected or disconnecting
    pub handle: Option<u16>,
    /// Local identity used on the link
    pub id: u8,
    pub peer: LeAddr,
    pub peer_rpa: Option<BdAddr>,
    pub local_rpa: Option<BdAddr>,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub tx_phy: u8,
    pub rx_phy: u8,
    pub data_len: DataLen,
    pub security: SecurityLevel,
    pub encrypted: bool,
    /// HCI status or reason explaining the last failure or disconnection
    pub err: u8,
    pub flags: ConnFlags,
    pub remote_features: u64,

    /// Fragments handed to the controller and not yet completed, oldest first
    pub(crate) tx_pending: VecDeque<TxRecord>,
    /// Channels whose SDU completed, reported before the next RX
    pub(crate) tx_notify: VecDeque<u16>,
    pub(crate) tx_current: Option<TxPdu>,
    /// Membership of the host TX ready list
    pub(crate) tx_ready: bool,
    pub(crate) rx_buf: Vec<u8>,
    /// ISO SDUs with their data load header in front
    pub(crate) iso_queue: VecDeque<Vec<u8>>,
    /// Packet sequence number of the next ISO SDU
    pub(crate) iso_seq: u16,

    pub(crate) update_timer: Timer,
    pub(crate) create_timer: Timer,
    /// Advertising set that provisioned this object
    pub(crate) adv_handle: Option<u8>,
    pub(crate) pending_params: Option<ConnParams>,
    pub(crate) create: CreateParams,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            kind: ConnType::Le,
            role: Role::Central,
            state: ConnState::Disconnected,
            handle: None,
            id: 0,
            peer: LeAddr::ANY,
            peer_rpa: None,
            local_rpa: None,
            interval: 0,
            latency: 0,
            timeout: 0,
            tx_phy: PHY_1M,
            rx_phy: PHY_1M,
            data_len: DataLen::default(),
            security: SecurityLevel::None,
            encrypted: false,
            err: 0,
            flags: ConnFlags::empty(),
            remote_features: 0,
            tx_pending: VecDeque::new(),
            tx_notify: VecDeque::new(),
            tx_current: None,
            tx_ready: false,
            rx_buf: Vec::new(),
            iso_queue: VecDeque::new(),
            iso_seq: 0,
            update_timer: Timer::new(),
            create_timer: Timer::new(),
            adv_handle: None,
            pending_params: None,
            create: CreateParams::default(),
        }
    }
}

impl Connection {
    pub fn is_central(&self) -> bool {
        self.role == Role::Central
    }

    /// Packets handed to the controller and not yet completed
    pub fn in_flight(&self) -> usize {
        self.tx_pending.len()
    }

    /// Current parameters as a [`ConnParams`] with min = max
    pub fn params(&self) -> ConnParams {
        ConnParams {
            interval_min: self.interval,
            interval_max: self.interval,
            latency: self.latency,
            timeout: self.timeout,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("err", &self.err)
            .finish()
    }
}

/// Notifications about connection objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Connection attempt finished; `status` 0 means connected
    Connected { conn: ConnId, status: u8 },
    Disconnected { conn: ConnId, reason: u8 },
    ParamUpdated {
        conn: ConnId,
        interval: u16,
        latency: u16,
        timeout: u16,
    },
    SecurityChanged { conn: ConnId, level: SecurityLevel },
    /// An L2CAP channel waits for the link to reach `level`
    SecurityRequired { conn: ConnId, level: SecurityLevel },
    DataLenChanged { conn: ConnId, data_len: DataLen },
    PhyUpdated { conn: ConnId, tx_phy: u8, rx_phy: u8 },
    RemoteFeatures { conn: ConnId, features: u64 },
    /// The slot has been returned to the pool
    Recycled { conn: ConnId },
}

pub type ConnEventCallback = Box<dyn FnMut(&ConnEvent) + Send + 'static>;

/// Decides whether parameters requested by the peer are acceptable
pub type ParamRequestFn = Box<dyn FnMut(ConnId, &ConnParams) -> bool + Send + 'static>;

/// Bit of the remote LE feature mask for the connection parameters request procedure
const REMOTE_CONN_PARAM_REQ: u64 = 1 << 1;

impl<D: HciDriver> Host<D> {
    pub fn register_conn_callback(&mut self, callback: ConnEventCallback) {
        self.conn_callbacks.push(callback);
    }

    /// Install a filter for connection parameters requested by peers
    pub fn set_param_request_filter(&mut self, filter: ParamRequestFn) {
        self.param_filter = Some(filter);
    }

    pub(crate) fn notify(&mut self, event: ConnEvent) {
        debug!("Connection event {:?}", event);
        for callback in self.conn_callbacks.iter_mut() {
            callback(&event);
        }
    }

    /// Resolve a connection handle
    pub fn conn_get(&self, id: ConnId) -> Option<ConnRef> {
        self.conns.get(id)
    }

    /// Live connection using controller handle `handle`
    pub fn conn_by_handle(&self, handle: u16) -> Option<ConnRef> {
        self.conns
            .find(|c| c.handle == Some(handle) && c.state.has_handle())
    }

    /// Pending or established LE connection to `peer`
    pub fn conn_by_peer(&self, peer: &LeAddr) -> Option<ConnRef> {
        self.conns.find(|c| {
            c.kind == ConnType::Le && c.state != ConnState::Disconnected && c.peer.same_device(peer)
        })
    }

    /// [`Host::set_state`] for callers with no error path; a refused
    /// transition is logged and reported as `false`
    pub(crate) fn set_state_logged(&mut self, conn: &ConnRef, new: ConnState) -> bool {
        match self.set_state(conn, new) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: cannot enter {}: {}", conn.id(), new, e);
                false
            }
        }
    }

    /// Move a connection object to `new`, running the side effects of the
    /// transition
    pub(crate) fn set_state(&mut self, conn: &ConnRef, new: ConnState) -> Result<()> {
        let id = conn.id();
        let (old, kind, role) = {
            let c = conn.lock();
            (c.state, c.kind, c.role)
        };
        if old == new {
            warn!("{} already in state {}", id, new);
            return Ok(());
        }
        if !old.can_transition(new) {
            warn!("{}: refusing transition {} -> {}", id, old, new);
            return Err(Error::InvalidState);
        }
        conn.lock().state = new;
        debug!("{}: {} -> {}", id, old, new);

        if old == ConnState::Disconnected {
            self.conn_lifetime.insert(id, conn.clone());
        }

        match new {
            ConnState::Connected => {
                {
                    let mut c = conn.lock();
                    c.create_timer.cancel();
                    c.flags.insert(ConnFlags::ESTABLISHED);
                    if kind == ConnType::Le && role == Role::Peripheral {
                        c.update_timer.arm(self.config.conn_param_update_timeout);
                    }
                }
                match kind {
                    ConnType::Le => self.l2cap.add_conn(id, LinkKind::LE, role == Role::Central),
                    ConnType::BrEdr => {
                        self.l2cap.add_conn(id, LinkKind::Classic, role == Role::Central)
                    }
                    ConnType::Sco | ConnType::Iso => {}
                }
                self.notify(ConnEvent::Connected { conn: id, status: 0 });
            }
            ConnState::Initiating if kind == ConnType::Le && role == Role::Central => {
                let mut c = conn.lock();
                let timeout = c.create.timeout.unwrap_or(self.config.create_conn_timeout);
                c.create_timer.arm(timeout);
            }
            ConnState::DisconnectComplete => self.conn_teardown(conn),
            ConnState::Disconnected => {
                let (err, established) = {
                    let mut c = conn.lock();
                    c.update_timer.cancel();
                    c.create_timer.cancel();
                    c.handle = None;
                    (c.err, c.flags.contains(ConnFlags::ESTABLISHED))
                };
                if old == ConnState::DisconnectComplete || (old == ConnState::Disconnecting && established) {
                    self.notify(ConnEvent::Disconnected {
                        conn: id,
                        reason: err,
                    });
                } else if err != 0 {
                    self.notify(ConnEvent::Connected {
                        conn: id,
                        status: err,
                    });
                }
                // No lock is held here: this may be the last reference.
                self.conn_lifetime.remove(&id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop everything queued on a link the controller no longer has
    fn conn_teardown(&mut self, conn: &ConnRef) {
        let id = conn.id();
        let (kind, pending, notify, current) = {
            let mut c = conn.lock();
            c.rx_buf.clear();
            c.iso_queue.clear();
            c.tx_ready = false;
            (
                c.kind,
                std::mem::take(&mut c.tx_pending),
                std::mem::take(&mut c.tx_notify),
                c.tx_current.take(),
            )
        };

        // The controller frees buffers of a dead handle on its own.
        self.credits.for_kind(kind).give(pending.len());
        self.tx.free_contexts += pending.len();
        self.tx.ready.retain(|c| *c != id);

        for cid in notify {
            self.l2cap.sdu_sent(id, cid, Ok(()));
        }
        for cid in pending.into_iter().filter_map(|rec| rec.sdu_done) {
            self.l2cap.sdu_sent(id, cid, Err(Error::Shutdown));
        }
        if let Some(pdu) = current.filter(|pdu| pdu.last_of_sdu && !pdu.iso) {
            self.l2cap.sdu_sent(id, pdu.cid, Err(Error::Shutdown));
        }
        self.l2cap.remove_conn(id);
    }

    /// The link is gone: clean up and return the object to `Disconnected`
    pub(crate) fn conn_link_lost(&mut self, conn: &ConnRef) {
        if let Err(e) = self.set_state(conn, ConnState::DisconnectComplete) {
            warn!("{}: cleanup failed: {}", conn.id(), e);
            return;
        }
        self.set_state_logged(conn, ConnState::Disconnected);
    }

    /// Connect to `peer` as central
    pub fn conn_le_create(
        &mut self,
        peer: LeAddr,
        create: CreateParams,
        params: ConnParams,
    ) -> Result<ConnRef> {
        params.validate()?;
        create.validate()?;
        if self.initiator_busy() {
            return Err(Error::Already);
        }
        if self.conn_by_peer(&peer).is_some() {
            return Err(Error::InvalidParameter(format!("Connection to {} exists", peer)));
        }

        let conn = self.conns.allocate()?;
        {
            let mut c = conn.lock();
            c.kind = ConnType::Le;
            c.role = Role::Central;
            c.peer = peer;
            c.pending_params = Some(params);
            c.create = create;
        }

        if create.scan_before_initiating {
            self.set_state(&conn, ConnState::ScanBeforeInitiating)?;
            if let Err(e) = self.scan_update() {
                self.set_state_logged(&conn, ConnState::Disconnected);
                return Err(e);
            }
            return Ok(conn);
        }

        self.set_state(&conn, ConnState::Initiating)?;
        if let Err(e) = self.conn_send_create(&conn) {
            conn.lock().err = 0;
            self.set_state_logged(&conn, ConnState::Disconnected);
            return Err(e);
        }
        info!("{}: initiating to {}", conn.id(), peer);
        Ok(conn)
    }

    /// Connect as central to whichever device of the filter accept list shows up first
    pub fn conn_le_create_auto(&mut self, create: CreateParams, params: ConnParams) -> Result<ConnRef> {
        params.validate()?;
        create.validate()?;
        if self.initiator_busy() {
            return Err(Error::Already);
        }

        let conn = self.conns.allocate()?;
        {
            let mut c = conn.lock();
            c.kind = ConnType::Le;
            c.role = Role::Central;
            c.peer = LeAddr::NONE;
            c.pending_params = Some(params);
            c.create = create;
        }
        self.set_state(&conn, ConnState::InitiatingFilterList)?;
        if let Err(e) = self.conn_send_create(&conn) {
            conn.lock().err = 0;
            self.set_state_logged(&conn, ConnState::Disconnected);
            return Err(e);
        }
        Ok(conn)
    }

    pub fn filter_accept_add(&mut self, addr: LeAddr) -> Result<()> {
        self.send_cmd(&HciCommand::LeAddDeviceToFilterAcceptList {
            addr_type: u8::from(addr.kind.base()),
            addr: addr.addr,
        })?;
        Ok(())
    }

    pub fn filter_accept_clear(&mut self) -> Result<()> {
        self.send_cmd(&HciCommand::LeClearFilterAcceptList)?;
        Ok(())
    }

    pub(crate) fn initiator_busy(&self) -> bool {
        self.conns
            .find(|c| {
                matches!(
                    c.state,
                    ConnState::Initiating | ConnState::InitiatingFilterList
                ) && c.kind == ConnType::Le
            })
            .is_some()
    }

    /// Issue the create connection command for a central object
    pub(crate) fn conn_send_create(&mut self, conn: &ConnRef) -> Result<()> {
        let (peer, create, params, filter_list, id) = {
            let c = conn.lock();
            (
                c.peer,
                c.create,
                c.pending_params.unwrap_or_default(),
                c.state == ConnState::InitiatingFilterList,
                c.id,
            )
        };
        let own_addr_type = self.id_own_addr_type(id)?;
        let filter_policy = if filter_list {
            FILTER_POLICY_FILTER_ACCEPT_LIST
        } else {
            FILTER_POLICY_ACCEPT_ALL
        };
        let (peer_addr_type, peer_addr) = if filter_list {
            (0, BdAddr::ANY)
        } else {
            (u8::from(peer.kind.base()), peer.addr)
        };

        let command = if self.info.le_features.contains(LeFeatures::EXT_ADV) {
            let phy = |phy| ExtConnPhy {
                phy,
                scan_interval: create.scan_interval,
                scan_window: create.scan_window,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            };
            let mut phys = vec![phy(PHY_1M)];
            if create.coded && self.info.le_features.contains(LeFeatures::PHY_CODED) {
                phys.push(phy(PHY_CODED));
            }
            HciCommand::LeExtCreateConnection {
                filter_policy,
                own_addr_type,
                peer_addr_type,
                peer_addr,
                phys,
            }
        } else {
            HciCommand::LeCreateConnection {
                scan_interval: create.scan_interval,
                scan_window: create.scan_window,
                filter_policy,
                peer_addr_type,
                peer_addr,
                own_addr_type,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            }
        };
        self.send_cmd(&command)?;
        Ok(())
    }

    /// Disconnect, or abandon a connection attempt, with HCI `reason`
    pub fn disconnect(&mut self, id: ConnId, reason: u8) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        let (state, handle) = {
            let c = conn.lock();
            (c.state, c.handle)
        };

        match state {
            ConnState::ScanBeforeInitiating => {
                conn.lock().err = reason;
                self.set_state(&conn, ConnState::Disconnected)?;
                self.scan_update()
            }
            ConnState::Initiating | ConnState::InitiatingFilterList => {
                {
                    let mut c = conn.lock();
                    if c.flags.contains(ConnFlags::CANCEL_PENDING) {
                        return Ok(());
                    }
                    c.flags.insert(ConnFlags::CANCEL_PENDING);
                    c.err = reason;
                }
                self.send_cmd(&HciCommand::LeCreateConnectionCancel)?;
                Ok(())
            }
            ConnState::AdvDirConnectable => {
                conn.lock().err = reason;
                self.adv_stop_for_conn(&conn)?;
                self.set_state(&conn, ConnState::Disconnected)
            }
            ConnState::Connected => {
                let handle = handle.ok_or(Error::InvalidState)?;
                self.send_cmd(&HciCommand::Disconnect { handle, reason })?;
                self.set_state(&conn, ConnState::Disconnecting)
            }
            ConnState::Disconnecting | ConnState::DisconnectComplete => Ok(()),
            ConnState::Disconnected | ConnState::AdvConnectable => Err(Error::NotConnected),
        }
    }

    /// Ask for new connection parameters.
    ///
    /// A central, or a peripheral when both controllers support the
    /// connection parameters request procedure, uses the link layer. Other
    /// peripherals, and peripherals whose peer lacks the procedure, go
    /// through L2CAP signalling.
    pub fn conn_le_param_update(&mut self, id: ConnId, params: ConnParams) -> Result<()> {
        params.validate()?;
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        let (state, role, handle, remote_features, current) = {
            let c = conn.lock();
            (c.state, c.role, c.handle, c.remote_features, (c.interval, c.latency, c.timeout))
        };
        if state != ConnState::Connected || conn.lock().kind != ConnType::Le {
            return Err(Error::NotConnected);
        }
        let handle = handle.ok_or(Error::InvalidState)?;
        if params.matches(current.0, current.1, current.2) {
            return Err(Error::Already);
        }

        let use_ll = role == Role::Central
            || (self.info.le_features.contains(LeFeatures::CONN_PARAM_REQ)
                && remote_features & REMOTE_CONN_PARAM_REQ != 0);
        if use_ll {
            let result = self.send_cmd(&HciCommand::LeConnectionUpdate {
                handle,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            });
            match result {
                Ok(_) => {
                    let mut c = conn.lock();
                    c.flags.insert(ConnFlags::PARAM_UPDATE_PENDING);
                    c.pending_params = Some(params);
                    return Ok(());
                }
                Err(e)
                    if role == Role::Peripheral
                        && e.controller_status() == Some(HCI_ERR_UNSUPP_REMOTE_FEATURE) =>
                {
                    debug!("{}: peer lacks parameter request, using L2CAP", id);
                }
                Err(e) => return Err(e),
            }
        }

        self.l2cap.request_conn_param_update(id, params)?;
        let mut c = conn.lock();
        c.flags.insert(ConnFlags::PARAM_L2CAP);
        c.pending_params = Some(params);
        Ok(())
    }

    /// Ask the controller for a new data length
    pub fn conn_set_data_len(&mut self, id: ConnId, tx_octets: u16, tx_time: u16) -> Result<()> {
        if !self.info.le_features.contains(LeFeatures::DATA_LENGTH) {
            return Err(Error::NotSupported);
        }
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        let handle = {
            let c = conn.lock();
            match (c.state, c.handle) {
                (ConnState::Connected, Some(handle)) => handle,
                _ => return Err(Error::NotConnected),
            }
        };
        self.send_cmd(&HciCommand::LeSetDataLength {
            handle,
            tx_octets,
            tx_time,
        })?;
        Ok(())
    }

    /// Raise the security level of a link after pairing completed elsewhere
    pub fn conn_set_security(&mut self, id: ConnId, level: SecurityLevel) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        {
            let mut c = conn.lock();
            if c.state != ConnState::Connected {
                return Err(Error::NotConnected);
            }
            if c.security == level {
                return Err(Error::Already);
            }
            c.security = level;
        }
        self.l2cap.set_security(id, level, level > SecurityLevel::None);
        self.notify(ConnEvent::SecurityChanged { conn: id, level });
        Ok(())
    }

    pub(crate) fn handle_le_conn_complete(&mut self, evt: LeConnectionComplete) {
        if evt.status != HCI_SUCCESS {
            self.handle_le_conn_failed(evt.status);
            return;
        }

        let peer = self.resolve_peer(&evt.peer);
        let role = if evt.role == ROLE_CENTRAL {
            Role::Central
        } else {
            Role::Peripheral
        };

        let found = match role {
            Role::Central => self
                .conns
                .find(|c| c.state == ConnState::Initiating && c.peer.same_device(&peer))
                .or_else(|| self.conns.find(|c| c.state == ConnState::InitiatingFilterList)),
            Role::Peripheral => evt
                .adv_handle
                .and_then(|h| {
                    self.conns.find(|c| {
                        c.adv_handle == Some(h)
                            && matches!(c.state, ConnState::AdvConnectable | ConnState::AdvDirConnectable)
                    })
                })
                .or_else(|| {
                    self.conns
                        .find(|c| c.state == ConnState::AdvDirConnectable && c.peer.same_device(&peer))
                })
                .or_else(|| self.conns.find(|c| c.state == ConnState::AdvConnectable)),
        };

        let conn = match found {
            Some(conn) => conn,
            None if role == Role::Peripheral => match self.conn_provision_peripheral() {
                Some(conn) => conn,
                None => {
                    warn!("No connection object for handle {}, rejecting", evt.handle);
                    self.reject_link(evt.handle, HCI_ERR_REMOTE_LOW_RESOURCES);
                    return;
                }
            },
            None => {
                warn!("Unexpected central connection to {}", peer);
                self.reject_link(evt.handle, HCI_ERR_REMOTE_USER_TERM_CONN);
                return;
            }
        };

        {
            let mut c = conn.lock();
            c.kind = ConnType::Le;
            c.role = role;
            c.handle = Some(evt.handle);
            c.peer = peer;
            c.peer_rpa = evt.peer_rpa;
            c.local_rpa = evt.local_rpa;
            c.interval = evt.interval;
            c.latency = evt.latency;
            c.timeout = evt.timeout;
            c.err = 0;
            c.flags.remove(ConnFlags::CANCEL_PENDING);
            if c.adv_handle.is_none() {
                c.adv_handle = evt.adv_handle;
            }
        }

        if role == Role::Peripheral {
            self.adv_conn_established(&conn, evt.adv_handle);
        }

        if let Err(e) = self.set_state(&conn, ConnState::Connected) {
            warn!("{}: cannot enter connected state: {}", conn.id(), e);
            return;
        }
        info!("{}: connected to {} as {:?}, handle {}", conn.id(), peer, role, evt.handle);

        if let Err(e) = self.scan_update() {
            warn!("Scan update after connection failed: {}", e);
        }
        if let Err(e) = self.send_cmd(&HciCommand::LeReadRemoteFeatures { handle: evt.handle }) {
            debug!("{}: reading remote features failed: {}", conn.id(), e);
        }
    }

    fn handle_le_conn_failed(&mut self, status: u8) {
        if status == HCI_ERR_ADV_TIMEOUT {
            if let Some(conn) = self.conns.find(|c| c.state == ConnState::AdvDirConnectable) {
                conn.lock().err = status;
                self.adv_dir_timeout(&conn);
                self.set_state_logged(&conn, ConnState::Disconnected);
            }
            return;
        }

        let pending = self.conns.find(|c| {
            matches!(
                c.state,
                ConnState::Initiating | ConnState::InitiatingFilterList
            )
        });
        let Some(conn) = pending else {
            warn!("Connection failure 0x{:02x} without a pending connection", status);
            return;
        };
        {
            let mut c = conn.lock();
            if c.err == 0 {
                c.err = status;
            }
        }
        debug!("{}: connection attempt failed with 0x{:02x}", conn.id(), status);
        self.set_state_logged(&conn, ConnState::Disconnected);
        if let Err(e) = self.scan_update() {
            warn!("Scan update failed: {}", e);
        }
    }

    /// Object for a peripheral link no advertiser provisioned
    fn conn_provision_peripheral(&mut self) -> Option<ConnRef> {
        let conn = self.conns.allocate().ok()?;
        {
            let mut c = conn.lock();
            c.kind = ConnType::Le;
            c.role = Role::Peripheral;
            c.peer = LeAddr::ANY;
        }
        self.set_state(&conn, ConnState::AdvConnectable).ok()?;
        Some(conn)
    }

    fn reject_link(&mut self, handle: u16, reason: u8) {
        if let Err(e) = self.send_cmd(&HciCommand::Disconnect { handle, reason }) {
            warn!("Disconnecting handle {} failed: {}", handle, e);
        }
    }

    pub(crate) fn handle_disconn_complete(&mut self, status: u8, handle: u16, reason: u8) {
        if status != HCI_SUCCESS {
            warn!("Disconnection of handle {} failed: 0x{:02x}", handle, status);
            return;
        }
        let Some(conn) = self.conn_by_handle(handle) else {
            debug!("Disconnection complete for unknown handle {}", handle);
            return;
        };
        info!("{}: disconnected, reason 0x{:02x}", conn.id(), reason);
        conn.lock().err = reason;
        self.conn_link_lost(&conn);
        if let Err(e) = self.scan_update() {
            warn!("Scan update failed: {}", e);
        }
    }

    pub(crate) fn handle_encrypt_change(&mut self, status: u8, handle: u16, enabled: bool) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        if status != HCI_SUCCESS {
            warn!("{}: encryption change failed: 0x{:02x}", conn.id(), status);
            return;
        }
        let level = {
            let mut c = conn.lock();
            c.encrypted = enabled;
            c.security = if enabled {
                c.security.max(SecurityLevel::Encryption)
            } else {
                SecurityLevel::None
            };
            c.security
        };
        self.l2cap.set_security(conn.id(), level, enabled);
        self.notify(ConnEvent::SecurityChanged {
            conn: conn.id(),
            level,
        });
    }

    pub(crate) fn handle_br_conn_request(&mut self, bd_addr: BdAddr, link_type: u8) {
        if link_type != HCI_LINK_ACL {
            debug!("Rejecting synchronous connection from {}", bd_addr);
            self.reject_br(bd_addr);
            return;
        }
        let Ok(conn) = self.conns.allocate() else {
            warn!("No room for a connection from {}", bd_addr);
            self.reject_br(bd_addr);
            return;
        };
        {
            let mut c = conn.lock();
            c.kind = ConnType::BrEdr;
            c.role = Role::Peripheral;
            c.peer = LeAddr::new(AddressType::Public, bd_addr);
        }
        if self.set_state(&conn, ConnState::Initiating).is_err() {
            return;
        }
        if let Err(e) = self.send_cmd(&HciCommand::AcceptConnectionRequest {
            bd_addr,
            role: ROLE_PERIPHERAL,
        }) {
            warn!("Accepting connection from {} failed: {}", bd_addr, e);
            conn.lock().err = 0;
            self.set_state_logged(&conn, ConnState::Disconnected);
        }
    }

    fn reject_br(&mut self, bd_addr: BdAddr) {
        if let Err(e) = self.send_cmd(&HciCommand::RejectConnectionRequest {
            bd_addr,
            reason: HCI_ERR_INSUFFICIENT_RESOURCES,
        }) {
            warn!("Rejecting {} failed: {}", bd_addr, e);
        }
    }

    pub(crate) fn handle_br_conn_complete(&mut self, status: u8, handle: u16, bd_addr: BdAddr, link_type: u8) {
        if link_type != HCI_LINK_ACL {
            return;
        }
        let Some(conn) = self.conns.find(|c| {
            c.kind == ConnType::BrEdr && c.state == ConnState::Initiating && c.peer.addr == bd_addr
        }) else {
            warn!("Connection complete for unexpected peer {}", bd_addr);
            return;
        };
        if status != HCI_SUCCESS {
            conn.lock().err = status;
            self.set_state_logged(&conn, ConnState::Disconnected);
            return;
        }
        conn.lock().handle = Some(handle);
        if !self.set_state_logged(&conn, ConnState::Connected) {
            conn.lock().handle = None;
            self.reject_link(handle, HCI_ERR_REMOTE_USER_TERM_CONN);
        }
    }

    pub(crate) fn handle_conn_update_complete(
        &mut self,
        status: u8,
        handle: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        let id = conn.id();
        if status == HCI_SUCCESS {
            {
                let mut c = conn.lock();
                c.interval = interval;
                c.latency = latency;
                c.timeout = timeout;
                c.flags.remove(ConnFlags::PARAM_UPDATE_PENDING | ConnFlags::PARAM_L2CAP);
                c.pending_params = None;
            }
            self.notify(ConnEvent::ParamUpdated {
                conn: id,
                interval,
                latency,
                timeout,
            });
            return;
        }

        let (role, pending) = {
            let mut c = conn.lock();
            c.flags.remove(ConnFlags::PARAM_UPDATE_PENDING);
            (c.role, c.pending_params.take())
        };
        match pending {
            Some(params) if status == HCI_ERR_UNSUPP_REMOTE_FEATURE && role == Role::Peripheral => {
                debug!("{}: falling back to L2CAP parameter request", id);
                match self.l2cap.request_conn_param_update(id, params) {
                    Ok(()) => {
                        let mut c = conn.lock();
                        c.flags.insert(ConnFlags::PARAM_L2CAP);
                        c.pending_params = Some(params);
                    }
                    Err(e) => warn!("{}: L2CAP parameter request failed: {}", id, e),
                }
            }
            _ => warn!("{}: connection update failed: 0x{:02x}", id, status),
        }
    }

    pub(crate) fn handle_remote_features(&mut self, status: u8, handle: u16, features: u64) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        if status != HCI_SUCCESS {
            debug!("{}: remote features unavailable: 0x{:02x}", conn.id(), status);
            return;
        }
        {
            let mut c = conn.lock();
            c.remote_features = features;
            c.flags.insert(ConnFlags::FEATURES_READ);
        }
        self.notify(ConnEvent::RemoteFeatures {
            conn: conn.id(),
            features,
        });
    }

    /// Whether the peer's requested parameters are valid and acceptable
    fn accept_params(&mut self, id: ConnId, params: &ConnParams) -> bool {
        if let Err(e) = params.validate() {
            debug!("{}: peer requested invalid parameters: {}", id, e);
            return false;
        }
        match self.param_filter.as_mut() {
            Some(filter) => filter(id, params),
            None => true,
        }
    }

    pub(crate) fn handle_remote_param_request(&mut self, handle: u16, params: ConnParams) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        let command = if self.accept_params(conn.id(), &params) {
            HciCommand::LeRemoteConnParamReqReply {
                handle,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            }
        } else {
            HciCommand::LeRemoteConnParamReqNegReply {
                handle,
                reason: HCI_ERR_INVALID_LL_PARAM,
            }
        };
        if let Err(e) = self.send_cmd(&command) {
            warn!("{}: answering parameter request failed: {}", conn.id(), e);
        }
    }

    pub(crate) fn handle_data_len_change(&mut self, handle: u16, data_len: DataLen) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        conn.lock().data_len = data_len;
        self.notify(ConnEvent::DataLenChanged {
            conn: conn.id(),
            data_len,
        });
    }

    pub(crate) fn handle_phy_update(&mut self, status: u8, handle: u16, tx_phy: u8, rx_phy: u8) {
        let Some(conn) = self.conn_by_handle(handle) else {
            return;
        };
        if status != HCI_SUCCESS {
            debug!("{}: PHY update failed: 0x{:02x}", conn.id(), status);
            return;
        }
        {
            let mut c = conn.lock();
            c.tx_phy = tx_phy;
            c.rx_phy = rx_phy;
        }
        self.notify(ConnEvent::PhyUpdated {
            conn: conn.id(),
            tx_phy,
            rx_phy,
        });
    }

    /// Carry out link layer requests queued by the channel layer
    pub(crate) fn process_l2cap_actions(&mut self) {
        for action in self.l2cap.take_actions() {
            match action {
                L2capAction::ConnParamRequest {
                    conn,
                    identifier,
                    params,
                } => {
                    let mut accepted = self.accept_params(conn, &params);
                    if accepted {
                        let handle = self.conns.get(conn).and_then(|c| c.lock().handle);
                        accepted = match handle {
                            Some(handle) => self
                                .send_cmd(&HciCommand::LeConnectionUpdate {
                                    handle,
                                    interval_min: params.interval_min,
                                    interval_max: params.interval_max,
                                    latency: params.latency,
                                    timeout: params.timeout,
                                })
                                .map_err(|e| warn!("{}: connection update failed: {}", conn, e))
                                .is_ok(),
                            None => false,
                        };
                    }
                    self.l2cap.conn_param_response(conn, identifier, accepted);
                }
                L2capAction::ConnParamResponse { conn, accepted } => {
                    if let Some(c) = self.conns.get(conn) {
                        let mut c = c.lock();
                        c.flags.remove(ConnFlags::PARAM_L2CAP);
                        if !accepted {
                            c.pending_params = None;
                        }
                    }
                    if !accepted {
                        debug!("{}: central rejected our parameters", conn);
                    }
                }
                L2capAction::SecurityRequired { conn, level } => {
                    self.notify(ConnEvent::SecurityRequired { conn, level })
                }
            }
        }
    }

    pub(crate) fn conn_process_timeouts(&mut self, now: Instant) {
        for conn in self.conns.live() {
            let (create_expired, update_expired) = {
                let mut c = conn.lock();
                (c.create_timer.fire(now), c.update_timer.fire(now))
            };

            if create_expired {
                debug!("{}: connection attempt timed out", conn.id());
                {
                    let mut c = conn.lock();
                    c.err = HCI_ERR_UNKNOWN_CONN_ID;
                    c.flags.insert(ConnFlags::CANCEL_PENDING);
                }
                if let Err(e) = self.send_cmd(&HciCommand::LeCreateConnectionCancel) {
                    warn!("{}: create connection cancel failed: {}", conn.id(), e);
                }
            }

            if update_expired {
                let (current, state) = {
                    let c = conn.lock();
                    ((c.interval, c.latency, c.timeout), c.state)
                };
                if let (Some(pref), ConnState::Connected) = (self.config.peripheral_pref_params, state) {
                    if !pref.matches(current.0, current.1, current.2) {
                        if let Err(e) = self.conn_le_param_update(conn.id(), pref) {
                            debug!("{}: preferred parameter update failed: {}", conn.id(), e);
                        }
                    }
                }
            }
        }
    }

    /// Report slots returned to the pool since the last call
    pub(crate) fn handle_recycled(&mut self) {
        let recycled = self.conns.take_recycled();
        if recycled.is_empty() {
            return;
        }
        for id in recycled {
            self.notify(ConnEvent::Recycled { conn: id });
        }
        if self.config.adv_auto_resume {
            self.adv_auto_resume();
        }
    }

    /// Bind an isochronous stream the controller set up on `handle`
    pub fn iso_bind(&mut self, handle: u16) -> Result<ConnRef> {
        if self.info.iso_pkts == 0 {
            return Err(Error::NotSupported);
        }
        let conn = self.conns.allocate()?;
        {
            let mut c = conn.lock();
            c.kind = ConnType::Iso;
            c.handle = Some(handle);
        }
        self.set_state(&conn, ConnState::Initiating)?;
        self.set_state(&conn, ConnState::Connected)?;
        Ok(conn)
    }

    /// Release an isochronous stream
    pub fn iso_unbind(&mut self, id: ConnId) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        {
            let mut c = conn.lock();
            if c.kind != ConnType::Iso || c.state != ConnState::Connected {
                return Err(Error::NotConnected);
            }
            c.err = HCI_ERR_LOCALHOST_TERM_CONN;
        }
        self.conn_link_lost(&conn);
        Ok(())
    }

    /// Queue one ISO SDU; it goes out with the next [`Host::process`]
    pub fn iso_send(&mut self, id: ConnId, data: Vec<u8>) -> Result<()> {
        let conn = self.conns.get(id).ok_or(Error::NotConnected)?;
        {
            let mut c = conn.lock();
            if c.kind != ConnType::Iso || c.state != ConnState::Connected {
                return Err(Error::NotConnected);
            }
            if data.len() > self.info.iso_mtu as usize {
                return Err(Error::InvalidParameter(format!(
                    "ISO SDU of {} bytes exceeds MTU {}",
                    data.len(),
                    self.info.iso_mtu
                )));
            }
            let load = IsoDataLoad {
                timestamp: None,
                sequence: c.iso_seq,
                sdu_length: data.len() as u16,
            };
            c.iso_seq = c.iso_seq.wrapping_add(1);
            let mut sdu = load.to_bytes();
            sdu.extend_from_slice(&data);
            c.iso_queue.push_back(sdu);
        }
        self.tx_mark_ready(&conn);
        Ok(())
    }
}
