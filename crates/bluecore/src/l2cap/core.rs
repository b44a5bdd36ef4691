//! L2CAP Core Manager implementation
//!
//! The manager owns every channel of every connection and handles:
//! - Channel setup and teardown (LE, enhanced credit based and BR/EDR basic)
//! - Data routing in both directions
//! - Signaling commands
//!
//! It never touches the controller. Outbound PDUs are pulled by the
//! connection layer through [`L2capManager::pull_pdu`]; connections that got
//! new data are reported through [`L2capManager::take_raised`], and requests
//! that need the link layer through [`L2capManager::take_actions`].

use super::channel::*;
use super::constants::*;
use super::packet::split_pdu;
use super::psm::{obtain_dynamic_psm, LE_PSM_DYN_END, LE_PSM_DYN_START, PSM};
use super::signaling::SignalingMessage;
use super::types::*;
use crate::config::L2capConfig;
use crate::conn::{ConnId, ConnParams};
use crate::error::Error;
use crate::timer::earliest;
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

/// Decides whether to accept an incoming channel and supplies its owner
pub type AcceptFn =
    Box<dyn FnMut(ConnId) -> Result<Box<dyn ChannelOps>, LeConnResult> + Send + 'static>;

/// Supplies the owner of a fixed channel for a new connection
pub type FixedChannelFn = Box<dyn FnMut(ConnId) -> Option<Box<dyn ChannelOps>> + Send + 'static>;

/// A registered server accepting incoming channels on a PSM
pub struct L2capServer {
    /// PSM to listen on; 0 picks a free dynamic LE SPSM
    pub psm: u16,
    /// Link security a connecting peer must have reached
    pub security: SecurityLevel,
    pub accept: AcceptFn,
}

impl fmt::Debug for L2capServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capServer")
            .field("psm", &self.psm)
            .field("security", &self.security)
            .finish()
    }
}

/// Requests for the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capAction {
    /// A peripheral asked for new connection parameters. Answer with
    /// [`L2capManager::conn_param_response`].
    ConnParamRequest {
        conn: ConnId,
        identifier: u8,
        params: ConnParams,
    },
    /// The central answered our connection parameter request
    ConnParamResponse { conn: ConnId, accepted: bool },
    /// A channel needs more link security than the link has
    SecurityRequired { conn: ConnId, level: SecurityLevel },
}

/// Channels of one connection
struct ConnChannels {
    kind: LinkKind,
    is_central: bool,
    security: SecurityLevel,
    ltk_present: bool,
    signaling: L2capChannel,
    channels: BTreeMap<u16, L2capChannel>,
    /// Channels with data queued, served round robin
    ready: VecDeque<u16>,
    next_ident: u8,
    /// Channels created by one enhanced connection request, keyed by its
    /// identifier, in request order
    ecred_batches: HashMap<u8, Vec<u16>>,
    /// Connection requests waiting for link security
    deferred: Vec<Vec<u16>>,
    param_req_ident: Option<u8>,
}

impl ConnChannels {
    fn new(conn: ConnId, kind: LinkKind, is_central: bool) -> Self {
        let sig_cid = match kind {
            LinkKind::LE => L2CAP_LE_SIGNALING_CID,
            LinkKind::Classic => L2CAP_SIGNALING_CID,
        };
        Self {
            kind,
            is_central,
            security: SecurityLevel::None,
            ltk_present: false,
            signaling: L2capChannel::new_fixed(conn, sig_cid, L2CAP_LE_FIXED_MTU, Box::new(NullOps)),
            channels: BTreeMap::new(),
            ready: VecDeque::new(),
            next_ident: 1,
            ecred_batches: HashMap::new(),
            deferred: Vec::new(),
            param_req_ident: None,
        }
    }

    /// Allocate a signalling identifier; zero is never used
    fn allocate_signal_id(&mut self) -> u8 {
        let id = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        if self.next_ident == 0 {
            self.next_ident = 1;
        }
        id
    }

    fn signal(&mut self, message: &SignalingMessage) {
        trace!("Signaling out: {:?}", message);
        if let Err(e) = self.signaling.queue_sdu(message.serialize()) {
            warn!("Dropping signaling command 0x{:02x}: {}", message.command_code(), e);
        }
    }

    fn reject(&mut self, identifier: u8, reason: u16, data: Vec<u8>) {
        self.signal(&SignalingMessage::CommandReject {
            identifier,
            reason,
            data,
        });
    }

    fn allocate_cid(&self) -> Option<u16> {
        let (start, end) = match self.kind {
            LinkKind::LE => (L2CAP_LE_DYN_CID_START, L2CAP_LE_DYN_CID_END),
            LinkKind::Classic => (L2CAP_BR_DYN_CID_START, L2CAP_BR_DYN_CID_END),
        };
        (start..=end).find(|cid| !self.channels.contains_key(cid))
    }

    fn remote_in_use(&self, remote_cid: u16) -> bool {
        self.channels
            .values()
            .any(|chan| chan.remote_cid() == remote_cid)
    }

    fn find_by_remote(&self, remote_cid: u16) -> Option<u16> {
        self.channels
            .values()
            .find(|chan| chan.remote_cid() == remote_cid)
            .map(|chan| chan.local_cid())
    }

    fn find_pending(&self, identifier: u8, state: ChannelState) -> Option<u16> {
        self.channels
            .values()
            .find(|chan| chan.state() == state && chan.ident == identifier)
            .map(|chan| chan.local_cid())
    }

    fn mark_ready(&mut self, cid: u16) {
        if let Some(chan) = self.channels.get_mut(&cid) {
            if !chan.ready && chan.can_send() {
                chan.ready = true;
                self.ready.push_back(cid);
            }
        }
    }

    /// Remove a channel, failing its unsent data and telling its owner
    fn destroy(&mut self, cid: u16) {
        if let Some(mut chan) = self.channels.remove(&cid) {
            debug!("Removing channel 0x{:04x}", cid);
            self.ready.retain(|c| *c != cid);
            chan.fail_pending();
            chan.set_state(ChannelState::Disconnected);
            chan.notify_disconnected();
        }
    }

    /// Send a disconnection request for one of our channels
    fn start_disconnect(&mut self, cid: u16, config: &L2capConfig) {
        let identifier = self.allocate_signal_id();
        let Some(chan) = self.channels.get_mut(&cid) else {
            return;
        };
        chan.set_state(ChannelState::Disconnecting);
        chan.ident = identifier;
        chan.rtx.arm(config.rtx_timeout);
        let message = SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: chan.remote_cid(),
            source_cid: cid,
        };
        self.ready.retain(|c| *c != cid);
        chan.ready = false;
        self.signal(&message);
    }

    /// Send the connection request for `cids`, which all belong to one
    /// request
    fn send_conn_request(&mut self, cids: &[u16], config: &L2capConfig) {
        let identifier = self.allocate_signal_id();
        let mut enhanced = false;
        let mut first = None;
        for cid in cids {
            if let Some(chan) = self.channels.get_mut(cid) {
                chan.ident = identifier;
                chan.rtx.arm(config.rtx_timeout);
                enhanced = chan.channel_type() == L2capChannelType::EnhancedCreditBased;
                if first.is_none() {
                    first = Some((chan.psm().map(|p| p.value()).unwrap_or(0), *chan.rx()));
                }
            }
        }
        let Some((psm, rx)) = first else {
            return;
        };

        let message = if enhanced {
            self.ecred_batches.insert(identifier, cids.to_vec());
            SignalingMessage::EcredConnectionRequest {
                identifier,
                psm,
                mtu: rx.mtu,
                mps: rx.mps,
                initial_credits: rx.init_credits,
                source_cids: cids.to_vec(),
            }
        } else {
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: psm,
                source_cid: cids[0],
                mtu: rx.mtu,
                mps: rx.mps,
                initial_credits: rx.init_credits,
            }
        };
        self.signal(&message);
    }

    /// Result code for a peer connecting to a server that needs `required`
    fn check_security(&self, required: SecurityLevel) -> Option<LeConnResult> {
        if self.security >= required {
            return None;
        }
        if self.security > SecurityLevel::None {
            Some(LeConnResult::Authentication)
        } else if self.ltk_present {
            Some(LeConnResult::Encryption)
        } else {
            Some(LeConnResult::Authentication)
        }
    }
}

/// L2CAP Manager
pub struct L2capManager {
    config: L2capConfig,
    le_servers: HashMap<u16, L2capServer>,
    br_servers: HashMap<u16, L2capServer>,
    fixed: BTreeMap<u16, FixedChannelFn>,
    conns: HashMap<ConnId, ConnChannels>,
    raised: Vec<ConnId>,
    actions: VecDeque<L2capAction>,
}

impl L2capManager {
    /// Create a new L2CAP manager
    pub fn new(config: L2capConfig) -> Self {
        Self {
            config,
            le_servers: HashMap::new(),
            br_servers: HashMap::new(),
            fixed: BTreeMap::new(),
            conns: HashMap::new(),
            raised: Vec::new(),
            actions: VecDeque::new(),
        }
    }

    fn rx_config(&self) -> LeCreditBasedConfig {
        LeCreditBasedConfig {
            mtu: self.config.rx_mtu,
            mps: self.config.rx_mps,
            initial_credits: self.config.initial_credits,
        }
    }

    fn raise(&mut self, conn: ConnId) {
        if !self.raised.contains(&conn) {
            self.raised.push(conn);
        }
    }

    /// Connections that got outbound data since the last call
    pub fn take_raised(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.raised)
    }

    /// Requests for the connection layer since the last call
    pub fn take_actions(&mut self) -> Vec<L2capAction> {
        self.actions.drain(..).collect()
    }

    /// Register a server for LE credit based channels.
    ///
    /// A PSM of 0 is replaced by a free dynamic SPSM, which is returned.
    pub fn register_server(&mut self, mut server: L2capServer) -> L2capResult<PSM> {
        if server.psm == 0 {
            let span = (LE_PSM_DYN_END - LE_PSM_DYN_START + 1) as usize;
            let psm = (0..span)
                .map(|_| obtain_dynamic_psm().value())
                .find(|psm| !self.le_servers.contains_key(psm))
                .ok_or(L2capError::ResourceLimitReached)?;
            server.psm = psm;
        }
        let psm = PSM::from_value(server.psm);
        if !psm.is_valid_le() {
            return Err(L2capError::InvalidParameter(format!("Invalid LE PSM {}", psm)));
        }
        if self.le_servers.contains_key(&server.psm) {
            return Err(L2capError::PsmInUse);
        }
        info!("Registered LE server on PSM {}", psm);
        self.le_servers.insert(server.psm, server);
        Ok(psm)
    }

    /// Register a server for BR/EDR basic mode channels
    pub fn register_br_server(&mut self, server: L2capServer) -> L2capResult<PSM> {
        let psm = PSM::from_value(server.psm);
        if !psm.is_valid_br() {
            return Err(L2capError::InvalidParameter(format!("Invalid BR/EDR PSM {}", psm)));
        }
        if self.br_servers.contains_key(&server.psm) {
            return Err(L2capError::PsmInUse);
        }
        info!("Registered BR/EDR server on PSM {}", psm);
        self.br_servers.insert(server.psm, server);
        Ok(psm)
    }

    /// Remove a server; existing channels stay open
    pub fn unregister_server(&mut self, psm: u16) -> L2capResult<()> {
        self.le_servers
            .remove(&psm)
            .or_else(|| self.br_servers.remove(&psm))
            .map(|_| ())
            .ok_or(L2capError::PsmNotRegistered)
    }

    /// Register the owner of a fixed channel such as ATT or SMP
    pub fn register_fixed_channel(&mut self, cid: u16, factory: FixedChannelFn) -> L2capResult<()> {
        if cid == L2CAP_NULL_CID
            || cid == L2CAP_SIGNALING_CID
            || cid == L2CAP_LE_SIGNALING_CID
            || cid >= L2CAP_LE_DYN_CID_START
        {
            return Err(L2capError::InvalidParameter(format!(
                "CID 0x{:04x} is not a fixed channel",
                cid
            )));
        }
        if self.fixed.contains_key(&cid) {
            return Err(L2capError::InvalidState);
        }
        self.fixed.insert(cid, factory);
        Ok(())
    }

    /// Set up channel state for a new connection
    pub fn add_conn(&mut self, conn: ConnId, kind: LinkKind, is_central: bool) {
        let mut cc = ConnChannels::new(conn, kind, is_central);
        if kind == LinkKind::LE {
            for (cid, factory) in self.fixed.iter_mut() {
                if let Some(ops) = factory(conn) {
                    let mut chan = L2capChannel::new_fixed(conn, *cid, L2CAP_LE_FIXED_MTU, ops);
                    chan.notify_connected();
                    cc.channels.insert(*cid, chan);
                }
            }
        }
        debug!("L2CAP ready on {:?} ({:?})", conn, kind);
        self.conns.insert(conn, cc);
    }

    /// Tear down every channel of a connection
    pub fn remove_conn(&mut self, conn: ConnId) {
        let Some(mut cc) = self.conns.remove(&conn) else {
            return;
        };
        let cids: Vec<u16> = cc.channels.keys().copied().collect();
        for cid in cids {
            cc.destroy(cid);
        }
        cc.signaling.fail_pending();
        self.raised.retain(|c| *c != conn);
    }

    /// Update the link security of a connection and send connection
    /// requests that were waiting for it
    pub fn set_security(&mut self, conn: ConnId, level: SecurityLevel, ltk_present: bool) {
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        cc.security = level;
        cc.ltk_present = ltk_present;

        let groups = std::mem::take(&mut cc.deferred);
        let mut sent = false;
        for group in groups {
            let required = group
                .iter()
                .filter_map(|cid| cc.channels.get(cid))
                .map(|chan| chan.required_security())
                .max();
            match required {
                None => {}
                Some(required) if required <= level => {
                    cc.send_conn_request(&group, &config);
                    sent = true;
                }
                Some(_) => cc.deferred.push(group),
            }
        }
        if sent {
            self.raise(conn);
        }
    }

    fn le_conn(&mut self, conn: ConnId) -> L2capResult<&mut ConnChannels> {
        match self.conns.get_mut(&conn) {
            Some(cc) if cc.kind == LinkKind::LE => Ok(cc),
            Some(_) => Err(L2capError::NotSupported),
            None => Err(L2capError::NotConnected),
        }
    }

    /// Open an LE credit based channel
    pub fn connect(
        &mut self,
        conn: ConnId,
        psm: u16,
        security: SecurityLevel,
        ops: Box<dyn ChannelOps>,
    ) -> L2capResult<u16> {
        let mut cids = self.create_channels(conn, psm, security, vec![ops], false)?;
        cids.pop().ok_or(L2capError::ResourceLimitReached)
    }

    /// Open up to five enhanced credit based channels with one request
    pub fn connect_ecred(
        &mut self,
        conn: ConnId,
        psm: u16,
        security: SecurityLevel,
        ops: Vec<Box<dyn ChannelOps>>,
    ) -> L2capResult<Vec<u16>> {
        if ops.is_empty() || ops.len() > L2CAP_ECRED_CHAN_MAX {
            return Err(L2capError::InvalidParameter(format!(
                "{} channels requested, 1..={} allowed",
                ops.len(),
                L2CAP_ECRED_CHAN_MAX
            )));
        }
        if self.config.rx_mtu < L2CAP_ECRED_MIN_MTU || self.config.rx_mps < L2CAP_ECRED_MIN_MPS {
            return Err(L2capError::InvalidParameter(
                "Enhanced channels need MTU and MPS of at least 64".into(),
            ));
        }
        self.create_channels(conn, psm, security, ops, true)
    }

    fn create_channels(
        &mut self,
        conn: ConnId,
        psm: u16,
        security: SecurityLevel,
        ops: Vec<Box<dyn ChannelOps>>,
        enhanced: bool,
    ) -> L2capResult<Vec<u16>> {
        let psm = PSM::from_value(psm);
        if !psm.is_valid_le() {
            return Err(L2capError::InvalidParameter(format!("Invalid LE PSM {}", psm)));
        }
        let rx_config = self.rx_config();
        let config = self.config;
        let cc = self.le_conn(conn)?;

        let mut cids = Vec::with_capacity(ops.len());
        for ops in ops {
            let Some(cid) = cc.allocate_cid() else {
                for cid in &cids {
                    cc.channels.remove(cid);
                }
                return Err(L2capError::ResourceLimitReached);
            };
            let mut chan =
                L2capChannel::new_credit_based(conn, cid, psm, enhanced, rx_config, security, ops);
            chan.set_state(ChannelState::Connecting);
            cc.channels.insert(cid, chan);
            cids.push(cid);
        }

        if cc.security < security {
            debug!("Deferring connection on PSM {} until {:?}", psm, security);
            cc.deferred.push(cids.clone());
            self.actions.push_back(L2capAction::SecurityRequired {
                conn,
                level: security,
            });
            return Ok(cids);
        }

        cc.send_conn_request(&cids, &config);
        self.raise(conn);
        Ok(cids)
    }

    /// Open a BR/EDR basic mode channel
    pub fn connect_br(
        &mut self,
        conn: ConnId,
        psm: u16,
        security: SecurityLevel,
        ops: Box<dyn ChannelOps>,
    ) -> L2capResult<u16> {
        let psm = PSM::from_value(psm);
        if !psm.is_valid_br() {
            return Err(L2capError::InvalidParameter(format!("Invalid BR/EDR PSM {}", psm)));
        }
        let config = self.config;
        let cc = match self.conns.get_mut(&conn) {
            Some(cc) if cc.kind == LinkKind::Classic => cc,
            Some(_) => return Err(L2capError::NotSupported),
            None => return Err(L2capError::NotConnected),
        };
        if cc.security < security {
            return Err(L2capError::SecurityRequirementsNotMet);
        }
        let cid = cc.allocate_cid().ok_or(L2capError::ResourceLimitReached)?;
        let identifier = cc.allocate_signal_id();
        let mut chan = L2capChannel::new_basic(conn, cid, psm, config.rx_mtu, security, ops);
        chan.set_state(ChannelState::Connecting);
        chan.ident = identifier;
        chan.rtx.arm(config.rtx_timeout);
        cc.channels.insert(cid, chan);
        cc.signal(&SignalingMessage::ConnectionRequest {
            identifier,
            psm: psm.value(),
            source_cid: cid,
        });
        self.raise(conn);
        Ok(cid)
    }

    /// Close a dynamic channel
    pub fn disconnect(&mut self, conn: ConnId, cid: u16) -> L2capResult<()> {
        let config = self.config;
        let cc = self.conns.get_mut(&conn).ok_or(L2capError::NotConnected)?;
        let chan = cc.channels.get(&cid).ok_or(L2capError::ChannelNotFound)?;
        if chan.channel_type() == L2capChannelType::Fixed {
            return Err(L2capError::InvalidParameter("Fixed channels cannot be closed".into()));
        }
        match chan.state() {
            ChannelState::Connected | ChannelState::Config => {
                cc.start_disconnect(cid, &config);
                self.raise(conn);
            }
            ChannelState::Disconnecting => return Err(L2capError::InvalidState),
            ChannelState::Connecting | ChannelState::Disconnected => {
                cc.deferred.iter_mut().for_each(|group| group.retain(|c| *c != cid));
                cc.destroy(cid);
            }
        }
        Ok(())
    }

    /// Queue an SDU on a channel
    pub fn send(&mut self, conn: ConnId, cid: u16, sdu: Vec<u8>) -> L2capResult<()> {
        let cc = self.conns.get_mut(&conn).ok_or(L2capError::NotConnected)?;
        let chan = cc.channels.get_mut(&cid).ok_or(L2capError::ChannelNotFound)?;
        chan.queue_sdu(sdu)?;
        cc.mark_ready(cid);
        self.raise(conn);
        Ok(())
    }

    /// Grant the peer more credits on a channel in segment receive mode
    pub fn give_credits(&mut self, conn: ConnId, cid: u16, credits: u16) -> L2capResult<()> {
        if credits == 0 {
            return Err(L2capError::InvalidParameter("Zero credits".into()));
        }
        let cc = self.conns.get_mut(&conn).ok_or(L2capError::NotConnected)?;
        let chan = cc.channels.get_mut(&cid).ok_or(L2capError::ChannelNotFound)?;
        if !chan.channel_type().is_credit_based() || chan.state() != ChannelState::Connected {
            return Err(L2capError::InvalidState);
        }
        chan.add_rx_credits(credits)?;
        let identifier = cc.allocate_signal_id();
        cc.signal(&SignalingMessage::FlowControlCredit {
            identifier,
            cid,
            credits,
        });
        self.raise(conn);
        Ok(())
    }

    /// Raise MTU and MPS of enhanced channels
    pub fn reconfigure(&mut self, conn: ConnId, cids: &[u16], mtu: u16, mps: u16) -> L2capResult<()> {
        if cids.is_empty() || cids.len() > L2CAP_ECRED_CHAN_MAX {
            return Err(L2capError::InvalidParameter("1..=5 channels per reconfigure".into()));
        }
        if mtu < L2CAP_ECRED_MIN_MTU || mps < L2CAP_ECRED_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!(
                "Unacceptable MTU {} / MPS {}",
                mtu, mps
            )));
        }
        let config = self.config;
        let cc = self.le_conn(conn)?;
        for cid in cids {
            let chan = cc.channels.get(cid).ok_or(L2capError::ChannelNotFound)?;
            if chan.channel_type() != L2capChannelType::EnhancedCreditBased
                || chan.state() != ChannelState::Connected
                || chan.pending_reconf.is_some()
            {
                return Err(L2capError::InvalidState);
            }
            if mtu < chan.rx().mtu {
                return Err(L2capError::InvalidParameter("MTU cannot be decreased".into()));
            }
            if mps < chan.rx().mps && cids.len() > 1 {
                return Err(L2capError::InvalidParameter(
                    "MPS can only be decreased on a single channel".into(),
                ));
            }
        }

        let identifier = cc.allocate_signal_id();
        for cid in cids {
            if let Some(chan) = cc.channels.get_mut(cid) {
                chan.pending_reconf = Some((mtu, mps));
                chan.ident = identifier;
                chan.rtx.arm(config.rtx_timeout);
            }
        }
        cc.signal(&SignalingMessage::EcredReconfigureRequest {
            identifier,
            mtu,
            mps,
            destination_cids: cids.to_vec(),
        });
        self.raise(conn);
        Ok(())
    }

    /// Ask the central for new connection parameters (peripheral only)
    pub fn request_conn_param_update(&mut self, conn: ConnId, params: ConnParams) -> L2capResult<()> {
        let cc = self.le_conn(conn)?;
        if cc.is_central {
            return Err(L2capError::InvalidState);
        }
        let identifier = cc.allocate_signal_id();
        cc.param_req_ident = Some(identifier);
        cc.signal(&SignalingMessage::ConnectionParameterUpdateRequest { identifier, params });
        self.raise(conn);
        Ok(())
    }

    /// Answer a [`L2capAction::ConnParamRequest`]
    pub fn conn_param_response(&mut self, conn: ConnId, identifier: u8, accepted: bool) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let result = if accepted {
            L2CAP_CONN_PARAM_ACCEPTED
        } else {
            L2CAP_CONN_PARAM_REJECTED
        };
        cc.signal(&SignalingMessage::ConnectionParameterUpdateResponse { identifier, result });
        self.raise(conn);
    }

    /// Look at a channel
    pub fn channel(&self, conn: ConnId, cid: u16) -> Option<&L2capChannel> {
        self.conns.get(&conn)?.channels.get(&cid)
    }

    /// Local CIDs of all channels on a connection
    pub fn channel_ids(&self, conn: ConnId) -> Vec<u16> {
        self.conns
            .get(&conn)
            .map(|cc| cc.channels.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Produce the next outbound PDU of a connection.
    ///
    /// Signalling goes first; data channels take turns one PDU at a time.
    pub fn pull_pdu(&mut self, conn: ConnId) -> Option<OutPdu> {
        let cc = self.conns.get_mut(&conn)?;
        if let Some(pdu) = cc.signaling.pull_pdu() {
            return Some(pdu);
        }
        while let Some(cid) = cc.ready.pop_front() {
            let Some(chan) = cc.channels.get_mut(&cid) else {
                continue;
            };
            match chan.pull_pdu() {
                Some(pdu) => {
                    if chan.can_send() {
                        cc.ready.push_back(cid);
                    } else {
                        chan.ready = false;
                    }
                    return Some(pdu);
                }
                None => chan.ready = false,
            }
        }
        None
    }

    /// Report the fate of the last PDU of an SDU
    pub fn sdu_sent(&mut self, conn: ConnId, cid: u16, result: Result<(), Error>) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        if let Some(chan) = cc.channels.get_mut(&cid) {
            chan.notify_sent(result);
        } else if let Err(e) = result {
            trace!("Signaling PDU on 0x{:04x} not sent: {}", cid, e);
        }
    }

    /// Drop channels whose signalling request went unanswered
    pub fn process_timeouts(&mut self, now: Instant) {
        for (conn, cc) in self.conns.iter_mut() {
            let mut expired = Vec::new();
            for chan in cc.channels.values_mut() {
                if chan.rtx.fire(now) {
                    expired.push(chan.local_cid());
                }
            }
            for cid in expired {
                let Some(chan) = cc.channels.get_mut(&cid) else {
                    continue;
                };
                if chan.pending_reconf.take().is_some() && chan.state() == ChannelState::Connected {
                    warn!("{:?}: reconfigure of 0x{:04x} timed out", conn, cid);
                    continue;
                }
                warn!("{:?}: signaling timeout on channel 0x{:04x}", conn, cid);
                cc.destroy(cid);
            }
        }
    }

    /// Earliest signalling deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.conns
            .values()
            .flat_map(|cc| cc.channels.values())
            .fold(None, |acc, chan| earliest(acc, chan.rtx.deadline()))
    }

    /// Handle a complete inbound L2CAP PDU
    pub fn recv(&mut self, conn: ConnId, pdu: &[u8]) {
        let (header, payload) = match split_pdu(pdu) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("{:?}: dropping malformed PDU: {}", conn, e);
                return;
            }
        };
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            warn!("{:?}: PDU for unknown connection", conn);
            return;
        };
        let cid = header.channel_id;
        if cid == cc.signaling.local_cid() {
            self.handle_signaling(conn, payload);
            return;
        }

        let Some(chan) = cc.channels.get_mut(&cid) else {
            debug!("{:?}: PDU for unknown channel 0x{:04x}", conn, cid);
            return;
        };
        if chan.state() != ChannelState::Connected {
            debug!("{:?}: PDU for channel 0x{:04x} in state {}", conn, cid, chan.state());
            return;
        }
        match chan.recv_pdu(payload) {
            Ok(0) => {}
            Ok(credits) => {
                let identifier = cc.allocate_signal_id();
                cc.signal(&SignalingMessage::FlowControlCredit {
                    identifier,
                    cid,
                    credits,
                });
                self.raise(conn);
            }
            Err(e) => {
                warn!("{:?}: channel 0x{:04x}: {}, disconnecting", conn, cid, e);
                cc.start_disconnect(cid, &config);
                self.raise(conn);
            }
        }
    }

    fn handle_signaling(&mut self, conn: ConnId, payload: &[u8]) {
        let mut offset = 0;
        while offset < payload.len() {
            match SignalingMessage::parse(&payload[offset..]) {
                Ok((message, used)) => {
                    offset += used;
                    trace!("Signaling in: {:?}", message);
                    self.handle_command(conn, message);
                }
                Err(e) => {
                    warn!("{:?}: dropping signaling PDU: {}", conn, e);
                    break;
                }
            }
        }
        self.raise(conn);
    }

    fn handle_command(&mut self, conn: ConnId, message: SignalingMessage) {
        let Some(kind) = self.conns.get(&conn).map(|cc| cc.kind) else {
            return;
        };
        let le = kind == LinkKind::LE;

        match message {
            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => self.handle_command_reject(conn, identifier, reason),
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } if !le => self.handle_br_conn_req(conn, identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                ..
            } if !le => self.handle_br_conn_rsp(conn, identifier, destination_cid, source_cid, result),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                mtu,
            } if !le => self.handle_config_req(conn, identifier, destination_cid, flags, mtu),
            SignalingMessage::ConfigureResponse {
                source_cid, result, ..
            } if !le => self.handle_config_rsp(conn, source_cid, result),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconn_req(conn, identifier, destination_cid, source_cid),
            SignalingMessage::DisconnectionResponse {
                identifier,
                source_cid,
                ..
            } => self.handle_disconn_rsp(conn, identifier, source_cid),
            SignalingMessage::EchoRequest { identifier, data } if !le => {
                if let Some(cc) = self.conns.get_mut(&conn) {
                    cc.signal(&SignalingMessage::EchoResponse { identifier, data });
                }
            }
            other @ (SignalingMessage::EchoResponse { .. }
            | SignalingMessage::InformationResponse { .. })
                if !le =>
            {
                debug!("{:?}: unsolicited {:?}", conn, other);
            }
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } if !le => self.handle_info_req(conn, identifier, info_type),
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } if le => {
                self.handle_param_req(conn, identifier, params)
            }
            SignalingMessage::ConnectionParameterUpdateResponse { identifier, result } if le => {
                self.handle_param_rsp(conn, identifier, result)
            }
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } if le => self.handle_le_conn_req(
                conn,
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            ),
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } if le => self.handle_le_conn_rsp(
                conn,
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            ),
            SignalingMessage::FlowControlCredit { cid, credits, .. } if le => {
                self.handle_credits(conn, cid, credits)
            }
            SignalingMessage::EcredConnectionRequest {
                identifier,
                psm,
                mtu,
                mps,
                initial_credits,
                source_cids,
            } if le => self.handle_ecred_conn_req(
                conn,
                identifier,
                psm,
                mtu,
                mps,
                initial_credits,
                &source_cids,
            ),
            SignalingMessage::EcredConnectionResponse {
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
            } if le => self.handle_ecred_conn_rsp(
                conn,
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                &destination_cids,
            ),
            SignalingMessage::EcredReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids,
            } if le => self.handle_reconf_req(conn, identifier, mtu, mps, &destination_cids),
            SignalingMessage::EcredReconfigureResponse { identifier, result } if le => {
                self.handle_reconf_rsp(conn, identifier, result)
            }
            other => {
                debug!(
                    "{:?}: rejecting command 0x{:02x} on {:?} link",
                    conn,
                    other.command_code(),
                    kind
                );
                if other.is_response() {
                    return;
                }
                if let Some(cc) = self.conns.get_mut(&conn) {
                    cc.reject(other.identifier(), L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                }
            }
        }
    }

    fn handle_command_reject(&mut self, conn: ConnId, identifier: u8, reason: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        if cc.param_req_ident == Some(identifier) {
            cc.param_req_ident = None;
            self.actions.push_back(L2capAction::ConnParamResponse {
                conn,
                accepted: false,
            });
            return;
        }
        let pending: Vec<u16> = cc
            .channels
            .values()
            .filter(|chan| chan.ident == identifier && chan.rtx.is_armed())
            .map(|chan| chan.local_cid())
            .collect();
        debug!(
            "{:?}: command {} rejected (0x{:04x}), {} channels affected",
            conn,
            identifier,
            reason,
            pending.len()
        );
        cc.ecred_batches.remove(&identifier);
        for cid in pending {
            let Some(chan) = cc.channels.get_mut(&cid) else {
                continue;
            };
            chan.rtx.cancel();
            if chan.pending_reconf.take().is_some() && chan.state() == ChannelState::Connected {
                continue;
            }
            cc.destroy(cid);
        }
    }

    /// Common checks for a peer opening channels on an LE server
    fn check_le_server(&self, conn: ConnId, psm: u16) -> Result<SecurityLevel, LeConnResult> {
        let server = self
            .le_servers
            .get(&psm)
            .ok_or(LeConnResult::PsmNotSupported)?;
        let cc = self.conns.get(&conn).ok_or(LeConnResult::NoResources)?;
        match cc.check_security(server.security) {
            Some(result) => Err(result),
            None => Ok(server.security),
        }
    }

    /// Create one accepted credit based channel for a peer's source CID
    #[allow(clippy::too_many_arguments)]
    fn accept_credit_based(
        &mut self,
        conn: ConnId,
        psm: u16,
        security: SecurityLevel,
        source_cid: u16,
        tx: (u16, u16, u16),
        enhanced: bool,
    ) -> Result<u16, LeConnResult> {
        let rx_config = self.rx_config();
        let cc = self.conns.get_mut(&conn).ok_or(LeConnResult::NoResources)?;
        if !(L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&source_cid) {
            return Err(LeConnResult::InvalidSourceCid);
        }
        if cc.remote_in_use(source_cid) {
            return Err(LeConnResult::SourceCidInUse);
        }
        let cid = cc.allocate_cid().ok_or(LeConnResult::NoResources)?;
        let server = self
            .le_servers
            .get_mut(&psm)
            .ok_or(LeConnResult::PsmNotSupported)?;
        let ops = (server.accept)(conn)?;

        let mut chan = L2capChannel::new_credit_based(
            conn,
            cid,
            PSM::from_value(psm),
            enhanced,
            rx_config,
            security,
            ops,
        );
        chan.set_remote_cid(source_cid);
        chan.set_tx(tx.0, tx.1, tx.2);
        chan.set_state(ChannelState::Connected);
        cc.channels.insert(cid, chan);
        Ok(cid)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_le_conn_req(
        &mut self,
        conn: ConnId,
        identifier: u8,
        psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        credits: u16,
    ) {
        let rx = self.rx_config();
        let result = if mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            Err(LeConnResult::UnacceptableParameters)
        } else {
            self.check_le_server(conn, psm).and_then(|security| {
                self.accept_credit_based(conn, psm, security, source_cid, (mtu, mps, credits), false)
            })
        };

        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let (destination_cid, result) = match result {
            Ok(cid) => (cid, LeConnResult::Success),
            Err(result) => {
                debug!("{:?}: refusing channel on PSM 0x{:04x}: {}", conn, psm, result);
                (L2CAP_NULL_CID, result)
            }
        };
        let (mtu, mps, initial_credits) = if result == LeConnResult::Success {
            (rx.mtu, rx.mps, rx.initial_credits)
        } else {
            (0, 0, 0)
        };
        cc.signal(&SignalingMessage::LeCreditBasedConnectionResponse {
            identifier,
            destination_cid,
            mtu,
            mps,
            initial_credits,
            result: result.value(),
        });
        if let Some(chan) = cc.channels.get_mut(&destination_cid) {
            chan.notify_connected();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_le_conn_rsp(
        &mut self,
        conn: ConnId,
        identifier: u8,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        credits: u16,
        result: u16,
    ) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(cid) = cc.find_pending(identifier, ChannelState::Connecting) else {
            debug!("{:?}: unexpected LE connection response {}", conn, identifier);
            return;
        };
        let result = LeConnResult::from_value(result);
        match result {
            LeConnResult::Success => {
                if !(L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&destination_cid)
                    || cc.remote_in_use(destination_cid)
                    || mtu < L2CAP_LE_MIN_MTU
                    || mps < L2CAP_LE_MIN_MPS
                {
                    warn!("{:?}: invalid LE connection response for 0x{:04x}", conn, cid);
                    cc.destroy(cid);
                    return;
                }
                if let Some(chan) = cc.channels.get_mut(&cid) {
                    chan.rtx.cancel();
                    chan.set_remote_cid(destination_cid);
                    chan.set_tx(mtu, mps, credits);
                    chan.set_state(ChannelState::Connected);
                    chan.notify_connected();
                }
                cc.mark_ready(cid);
            }
            result if result.needs_security() => {
                let Some(chan) = cc.channels.get_mut(&cid) else {
                    return;
                };
                chan.rtx.cancel();
                let level = match cc.security {
                    SecurityLevel::None => SecurityLevel::Encryption,
                    SecurityLevel::Encryption => SecurityLevel::Authenticated,
                    _ => SecurityLevel::SecureConnections,
                }
                .max(chan.required_security());
                debug!("{:?}: peer wants {:?} for channel 0x{:04x}", conn, level, cid);
                cc.deferred.push(vec![cid]);
                self.actions
                    .push_back(L2capAction::SecurityRequired { conn, level });
            }
            result => {
                info!("{:?}: channel 0x{:04x} refused: {}", conn, cid, result);
                cc.destroy(cid);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ecred_conn_req(
        &mut self,
        conn: ConnId,
        identifier: u8,
        psm: u16,
        mtu: u16,
        mps: u16,
        credits: u16,
        source_cids: &[u16],
    ) {
        let rx = self.rx_config();
        let mut destination_cids = vec![L2CAP_NULL_CID; source_cids.len()];
        let mut result = LeConnResult::Success;

        let common = if mtu < L2CAP_ECRED_MIN_MTU || mps < L2CAP_ECRED_MIN_MPS {
            Err(LeConnResult::UnacceptableParameters)
        } else {
            self.check_le_server(conn, psm)
        };

        match common {
            Err(e) => result = e,
            Ok(security) => {
                for (index, source_cid) in source_cids.iter().enumerate() {
                    // A CID repeated within this request counts as in use.
                    let repeated = source_cids[..index].contains(source_cid);
                    let accepted = if repeated {
                        Err(LeConnResult::SourceCidInUse)
                    } else {
                        self.accept_credit_based(
                            conn,
                            psm,
                            security,
                            *source_cid,
                            (mtu, mps, credits),
                            true,
                        )
                    };
                    match accepted {
                        Ok(cid) => destination_cids[index] = cid,
                        Err(e) => {
                            debug!("{:?}: refusing source CID 0x{:04x}: {}", conn, source_cid, e);
                            result = e;
                        }
                    }
                }
            }
        }

        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let any = destination_cids.iter().any(|cid| *cid != L2CAP_NULL_CID);
        let (mtu, mps, initial_credits) = if any {
            (rx.mtu, rx.mps, rx.initial_credits)
        } else {
            (0, 0, 0)
        };
        cc.signal(&SignalingMessage::EcredConnectionResponse {
            identifier,
            mtu,
            mps,
            initial_credits,
            result: result.value(),
            destination_cids: destination_cids.clone(),
        });
        for cid in destination_cids {
            if let Some(chan) = cc.channels.get_mut(&cid) {
                chan.notify_connected();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ecred_conn_rsp(
        &mut self,
        conn: ConnId,
        identifier: u8,
        mtu: u16,
        mps: u16,
        credits: u16,
        result: u16,
        destination_cids: &[u16],
    ) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(batch) = cc.ecred_batches.remove(&identifier) else {
            debug!("{:?}: unexpected enhanced connection response {}", conn, identifier);
            return;
        };
        let result = LeConnResult::from_value(result);
        if destination_cids.len() != batch.len() {
            warn!(
                "{:?}: enhanced response lists {} CIDs for {} channels",
                conn,
                destination_cids.len(),
                batch.len()
            );
        }

        for (index, cid) in batch.iter().enumerate() {
            let destination_cid = destination_cids
                .get(index)
                .copied()
                .unwrap_or(L2CAP_NULL_CID);
            let valid = destination_cid != L2CAP_NULL_CID
                && (L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&destination_cid)
                && !cc.remote_in_use(destination_cid)
                && mtu >= L2CAP_ECRED_MIN_MTU
                && mps >= L2CAP_ECRED_MIN_MPS;
            if !valid {
                debug!(
                    "{:?}: channel 0x{:04x} refused: {}",
                    conn, cid, result
                );
                cc.destroy(*cid);
                continue;
            }
            if let Some(chan) = cc.channels.get_mut(cid) {
                chan.rtx.cancel();
                chan.set_remote_cid(destination_cid);
                chan.set_tx(mtu, mps, credits);
                chan.set_state(ChannelState::Connected);
                chan.notify_connected();
            }
            cc.mark_ready(*cid);
        }
    }

    fn handle_credits(&mut self, conn: ConnId, remote_cid: u16, credits: u16) {
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(cid) = cc.find_by_remote(remote_cid) else {
            debug!("{:?}: credits for unknown channel 0x{:04x}", conn, remote_cid);
            return;
        };
        let Some(chan) = cc.channels.get_mut(&cid) else {
            return;
        };
        match chan.add_tx_credits(credits) {
            Ok(_) => {
                trace!("Channel 0x{:04x}: {} credits", cid, chan.tx().credits);
                cc.mark_ready(cid);
            }
            Err(e) => {
                warn!("{:?}: channel 0x{:04x}: {}, disconnecting", conn, cid, e);
                cc.start_disconnect(cid, &config);
            }
        }
    }

    fn handle_disconn_req(&mut self, conn: ConnId, identifier: u8, destination_cid: u16, source_cid: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let known = cc
            .channels
            .get(&destination_cid)
            .map(|chan| {
                chan.channel_type() != L2capChannelType::Fixed && chan.remote_cid() == source_cid
            })
            .unwrap_or(false);
        if !known {
            let mut data = destination_cid.to_le_bytes().to_vec();
            data.extend_from_slice(&source_cid.to_le_bytes());
            cc.reject(identifier, L2CAP_REJECT_INVALID_CID, data);
            return;
        }
        cc.signal(&SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid,
            source_cid,
        });
        cc.destroy(destination_cid);
    }

    fn handle_disconn_rsp(&mut self, conn: ConnId, identifier: u8, source_cid: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        match cc.channels.get(&source_cid) {
            Some(chan) if chan.state() == ChannelState::Disconnecting && chan.ident == identifier => {
                cc.destroy(source_cid);
            }
            _ => debug!("{:?}: unexpected disconnection response {}", conn, identifier),
        }
    }

    fn handle_param_req(&mut self, conn: ConnId, identifier: u8, params: ConnParams) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        if !cc.is_central {
            cc.reject(identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        }
        if let Err(e) = params.validate() {
            debug!("{:?}: rejecting connection parameters: {}", conn, e);
            cc.signal(&SignalingMessage::ConnectionParameterUpdateResponse {
                identifier,
                result: L2CAP_CONN_PARAM_REJECTED,
            });
            return;
        }
        self.actions.push_back(L2capAction::ConnParamRequest {
            conn,
            identifier,
            params,
        });
    }

    fn handle_param_rsp(&mut self, conn: ConnId, identifier: u8, result: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        if cc.param_req_ident != Some(identifier) {
            debug!("{:?}: unexpected parameter update response {}", conn, identifier);
            return;
        }
        cc.param_req_ident = None;
        self.actions.push_back(L2capAction::ConnParamResponse {
            conn,
            accepted: result == L2CAP_CONN_PARAM_ACCEPTED,
        });
    }

    fn handle_reconf_req(&mut self, conn: ConnId, identifier: u8, mtu: u16, mps: u16, remote_cids: &[u16]) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };

        let mut result = ReconfResult::Success;
        let mut targets = Vec::with_capacity(remote_cids.len());
        if mtu < L2CAP_ECRED_MIN_MTU || mps < L2CAP_ECRED_MIN_MPS {
            result = ReconfResult::Unacceptable;
        } else {
            for remote_cid in remote_cids {
                let Some(cid) = cc.find_by_remote(*remote_cid) else {
                    result = ReconfResult::InvalidDestinationCid;
                    break;
                };
                let Some(chan) = cc.channels.get(&cid) else {
                    continue;
                };
                if chan.channel_type() != L2capChannelType::EnhancedCreditBased {
                    result = ReconfResult::InvalidDestinationCid;
                    break;
                }
                if mtu < chan.tx().mtu {
                    result = ReconfResult::MtuReduced;
                    break;
                }
                if mps < chan.tx().mps && remote_cids.len() > 1 {
                    result = ReconfResult::MpsReduced;
                    break;
                }
                targets.push(cid);
            }
        }

        if result == ReconfResult::Success {
            for cid in &targets {
                if let Some(chan) = cc.channels.get_mut(cid) {
                    chan.set_tx_mtu(mtu);
                    chan.set_tx_mps(mps);
                }
            }
        } else {
            debug!("{:?}: refusing reconfigure: {:?}", conn, result);
        }
        cc.signal(&SignalingMessage::EcredReconfigureResponse {
            identifier,
            result: result.value(),
        });
        if result == ReconfResult::Success {
            for cid in targets {
                if let Some(chan) = cc.channels.get_mut(&cid) {
                    chan.notify_reconfigured();
                }
            }
        }
    }

    fn handle_reconf_rsp(&mut self, conn: ConnId, identifier: u8, result: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let result = ReconfResult::from_value(result);
        for chan in cc.channels.values_mut() {
            if chan.ident != identifier {
                continue;
            }
            let Some((mtu, mps)) = chan.pending_reconf.take() else {
                continue;
            };
            chan.rtx.cancel();
            if result == ReconfResult::Success {
                chan.set_rx_mtu_mps(mtu, mps);
                chan.notify_reconfigured();
            } else {
                debug!("Channel 0x{:04x}: reconfigure refused: {:?}", chan.local_cid(), result);
            }
        }
    }

    fn handle_br_conn_req(&mut self, conn: ConnId, identifier: u8, psm: u16, source_cid: u16) {
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };

        let accepted = (|| -> Result<u16, u16> {
            let server = self
                .br_servers
                .get_mut(&psm)
                .ok_or(L2CAP_BR_PSM_NOT_SUPPORTED)?;
            if cc.security < server.security {
                return Err(L2CAP_BR_SECURITY_BLOCK);
            }
            if source_cid < L2CAP_BR_DYN_CID_START {
                return Err(L2CAP_BR_INVALID_SCID);
            }
            if cc.remote_in_use(source_cid) {
                return Err(L2CAP_BR_SCID_IN_USE);
            }
            let cid = cc.allocate_cid().ok_or(L2CAP_BR_NO_RESOURCES)?;
            let ops = (server.accept)(conn).map_err(|e| match e {
                LeConnResult::PsmNotSupported => L2CAP_BR_PSM_NOT_SUPPORTED,
                e if e.needs_security() || e == LeConnResult::Authorization => {
                    L2CAP_BR_SECURITY_BLOCK
                }
                _ => L2CAP_BR_NO_RESOURCES,
            })?;
            let mut chan = L2capChannel::new_basic(
                conn,
                cid,
                PSM::from_value(psm),
                config.rx_mtu,
                server.security,
                ops,
            );
            chan.set_remote_cid(source_cid);
            chan.set_state(ChannelState::Config);
            cc.channels.insert(cid, chan);
            Ok(cid)
        })();

        let (destination_cid, result) = match accepted {
            Ok(cid) => (cid, L2CAP_BR_SUCCESS),
            Err(result) => (L2CAP_NULL_CID, result),
        };
        cc.signal(&SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid,
            source_cid,
            result,
            status: 0,
        });
        if result == L2CAP_BR_SUCCESS {
            Self::send_config_req(cc, destination_cid, &config);
        }
    }

    fn send_config_req(cc: &mut ConnChannels, cid: u16, config: &L2capConfig) {
        let identifier = cc.allocate_signal_id();
        let Some(chan) = cc.channels.get_mut(&cid) else {
            return;
        };
        chan.ident = identifier;
        chan.rtx.arm(config.rtx_timeout);
        let message = SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: chan.remote_cid(),
            flags: 0,
            mtu: Some(chan.rx().mtu),
        };
        cc.signal(&message);
    }

    fn handle_br_conn_rsp(
        &mut self,
        conn: ConnId,
        identifier: u8,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
    ) {
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        match cc.channels.get_mut(&source_cid) {
            Some(chan) if chan.state() == ChannelState::Connecting && chan.ident == identifier => {
                match result {
                    L2CAP_BR_SUCCESS => {
                        chan.set_remote_cid(destination_cid);
                        chan.set_state(ChannelState::Config);
                        Self::send_config_req(cc, source_cid, &config);
                    }
                    L2CAP_BR_PENDING => {
                        chan.rtx.arm(config.rtx_timeout);
                    }
                    result => {
                        info!("{:?}: BR/EDR channel refused: 0x{:04x}", conn, result);
                        cc.destroy(source_cid);
                    }
                }
            }
            _ => debug!("{:?}: unexpected connection response {}", conn, identifier),
        }
    }

    fn handle_config_req(
        &mut self,
        conn: ConnId,
        identifier: u8,
        destination_cid: u16,
        flags: u16,
        mtu: Option<u16>,
    ) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(chan) = cc.channels.get_mut(&destination_cid) else {
            let mut data = destination_cid.to_le_bytes().to_vec();
            data.extend_from_slice(&0u16.to_le_bytes());
            cc.reject(identifier, L2CAP_REJECT_INVALID_CID, data);
            return;
        };
        let source_cid = chan.remote_cid();
        let mtu = mtu.unwrap_or(L2CAP_BR_DEFAULT_MTU);
        if mtu < L2CAP_BR_MIN_MTU {
            cc.signal(&SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                flags: 0,
                result: L2CAP_CONF_UNACCEPT,
                mtu: Some(L2CAP_BR_MIN_MTU),
            });
            return;
        }
        chan.set_tx_mtu(mtu);
        // Continuation flag set: more options follow in another request.
        let complete = flags & 0x0001 == 0;
        if complete {
            chan.config_done.1 = true;
        }
        let connected = chan.config_done == (true, true);
        if connected {
            chan.rtx.cancel();
            chan.set_state(ChannelState::Connected);
        }
        cc.signal(&SignalingMessage::ConfigureResponse {
            identifier,
            source_cid,
            flags: flags & 0x0001,
            result: L2CAP_CONF_SUCCESS,
            mtu: None,
        });
        if connected {
            if let Some(chan) = cc.channels.get_mut(&destination_cid) {
                chan.notify_connected();
            }
            cc.mark_ready(destination_cid);
        }
    }

    fn handle_config_rsp(&mut self, conn: ConnId, source_cid: u16, result: u16) {
        let config = self.config;
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let Some(chan) = cc.channels.get_mut(&source_cid) else {
            debug!("{:?}: configure response for unknown channel 0x{:04x}", conn, source_cid);
            return;
        };
        if result != L2CAP_CONF_SUCCESS {
            warn!("{:?}: configuration of 0x{:04x} failed: 0x{:04x}", conn, source_cid, result);
            cc.start_disconnect(source_cid, &config);
            return;
        }
        chan.config_done.0 = true;
        chan.rtx.cancel();
        if chan.config_done == (true, true) {
            chan.set_state(ChannelState::Connected);
            chan.notify_connected();
            cc.mark_ready(source_cid);
        }
    }

    fn handle_info_req(&mut self, conn: ConnId, identifier: u8, info_type: u16) {
        let Some(cc) = self.conns.get_mut(&conn) else {
            return;
        };
        let (result, data) = match info_type {
            L2CAP_INFO_FEAT_MASK => (
                L2CAP_INFO_SUCCESS,
                L2CAP_FEAT_FIXED_CHAN_MASK.to_le_bytes().to_vec(),
            ),
            L2CAP_INFO_FIXED_CHAN => {
                let mut mask = [0u8; 8];
                mask[0] = 1 << L2CAP_SIGNALING_CID;
                (L2CAP_INFO_SUCCESS, mask.to_vec())
            }
            _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };
        cc.signal(&SignalingMessage::InformationResponse {
            identifier,
            info_type,
            result,
            data,
        });
    }
}

impl fmt::Debug for L2capManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capManager")
            .field("le_servers", &self.le_servers.keys().collect::<Vec<_>>())
            .field("br_servers", &self.br_servers.keys().collect::<Vec<_>>())
            .field("conns", &self.conns.len())
            .finish()
    }
}
