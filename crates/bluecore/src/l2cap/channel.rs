//! L2CAP Channel implementation
//!
//! A channel owns its transmit queue, the SDU currently being segmented, the
//! SDU currently being reassembled and both credit counters. Everything that
//! needs the signalling channel (credit grants, disconnects) is reported back
//! to [`super::core::L2capManager`], which owns the channels.

use super::constants::*;
use super::packet::{encode_kframe, encode_pdu};
use super::psm::PSM;
use super::types::*;
use crate::conn::ConnId;
use crate::error::Error;
use crate::timer::Timer;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fmt;

/// Identifies a channel to its callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChanRef {
    /// Connection the channel runs on
    pub conn: ConnId,
    /// Local channel identifier
    pub cid: u16,
}

/// How received data is handed to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Reassemble and deliver whole SDUs; credits are managed by the channel
    Sdu,
    /// Deliver every segment as it arrives; the application grants credits
    Segments,
}

/// Callbacks of a channel's owner
///
/// All callbacks run in the host's processing context.
pub trait ChannelOps: Send {
    /// Channel is open
    fn connected(&mut self, _chan: ChanRef) {}

    /// Channel is closed, either locally, by the peer or with the link
    fn disconnected(&mut self, _chan: ChanRef) {}

    /// A complete SDU was received
    fn recv(&mut self, _chan: ChanRef, _sdu: &[u8]) -> L2capResult<()> {
        Ok(())
    }

    /// A segment of an SDU was received, in [`RecvMode::Segments`]
    fn seg_recv(&mut self, _chan: ChanRef, _sdu_len: u16, _offset: u16, _segment: &[u8]) {}

    fn recv_mode(&self) -> RecvMode {
        RecvMode::Sdu
    }

    /// The last fragment of an SDU left the controller, or the SDU was
    /// dropped
    fn sent(&mut self, _chan: ChanRef, _result: Result<(), Error>) {}

    /// The channel ran out of transmit credits (`false`) or got some back
    fn status(&mut self, _chan: ChanRef, _can_send: bool) {}

    /// Buffer to reassemble an SDU of `sdu_len` bytes into
    fn alloc_buf(&mut self, _chan: ChanRef, sdu_len: u16) -> Vec<u8> {
        Vec::with_capacity(sdu_len as usize)
    }

    /// MTU or MPS of the channel changed
    fn reconfigured(&mut self, _chan: ChanRef) {}
}

/// Owner for channels the host drives itself, such as signalling
pub(crate) struct NullOps;

impl ChannelOps for NullOps {}

/// L2CAP Channel Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelType {
    /// Fixed channel (signalling, ATT, SMP)
    Fixed,
    /// LE credit based channel
    LeCreditBased,
    /// Enhanced credit based channel
    EnhancedCreditBased,
    /// BR/EDR basic mode channel
    Basic,
}

impl L2capChannelType {
    pub fn is_credit_based(self) -> bool {
        matches!(self, Self::LeCreditBased | Self::EnhancedCreditBased)
    }
}

/// One direction of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
    pub init_credits: u16,
}

/// One PDU ready for the ACL layer, basic header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPdu {
    /// Local CID of the channel the PDU came from
    pub cid: u16,
    pub data: Vec<u8>,
    /// Last PDU of an SDU; its completion is reported through `sent`
    pub last_of_sdu: bool,
}

struct TxSdu {
    data: Vec<u8>,
    offset: usize,
}

struct RxSdu {
    len: u16,
    received: usize,
    buf: Vec<u8>,
}

/// L2CAP Channel
pub struct L2capChannel {
    conn: ConnId,
    local_cid: u16,
    remote_cid: u16,
    psm: Option<PSM>,
    state: ChannelState,
    channel_type: L2capChannelType,
    rx: Endpoint,
    tx: Endpoint,
    required_security: SecurityLevel,
    ops: Box<dyn ChannelOps>,
    tx_queue: VecDeque<Vec<u8>>,
    tx_sdu: Option<TxSdu>,
    rx_sdu: Option<RxSdu>,
    /// Queued on the connection's ready list
    pub(crate) ready: bool,
    /// Identifier of the outstanding signalling request
    pub(crate) ident: u8,
    /// Response timeout of the outstanding request
    pub(crate) rtx: Timer,
    /// MTU and MPS asked for in an outstanding reconfigure request
    pub(crate) pending_reconf: Option<(u16, u16)>,
    /// BR/EDR configuration: our request accepted, peer's request accepted
    pub(crate) config_done: (bool, bool),
}

impl L2capChannel {
    fn new(
        conn: ConnId,
        local_cid: u16,
        channel_type: L2capChannelType,
        ops: Box<dyn ChannelOps>,
    ) -> Self {
        Self {
            conn,
            local_cid,
            remote_cid: L2CAP_NULL_CID,
            psm: None,
            state: ChannelState::Disconnected,
            channel_type,
            rx: Endpoint::default(),
            tx: Endpoint::default(),
            required_security: SecurityLevel::None,
            ops,
            tx_queue: VecDeque::new(),
            tx_sdu: None,
            rx_sdu: None,
            ready: false,
            ident: 0,
            rtx: Timer::new(),
            pending_reconf: None,
            config_done: (false, false),
        }
    }

    /// Create a fixed channel; it is connected from the start
    pub fn new_fixed(conn: ConnId, cid: u16, mtu: u16, ops: Box<dyn ChannelOps>) -> Self {
        let mut channel = Self::new(conn, cid, L2capChannelType::Fixed, ops);
        channel.remote_cid = cid;
        channel.state = ChannelState::Connected;
        channel.rx.mtu = mtu;
        channel.tx.mtu = mtu;
        channel
    }

    /// Create an LE or enhanced credit based channel with our receive
    /// parameters
    pub fn new_credit_based(
        conn: ConnId,
        local_cid: u16,
        psm: PSM,
        enhanced: bool,
        config: LeCreditBasedConfig,
        required_security: SecurityLevel,
        ops: Box<dyn ChannelOps>,
    ) -> Self {
        let channel_type = if enhanced {
            L2capChannelType::EnhancedCreditBased
        } else {
            L2capChannelType::LeCreditBased
        };
        let mut channel = Self::new(conn, local_cid, channel_type, ops);
        channel.psm = Some(psm);
        channel.required_security = required_security;
        channel.rx = Endpoint {
            mtu: config.mtu,
            mps: config.mps,
            credits: config.initial_credits,
            init_credits: config.initial_credits,
        };
        channel
    }

    /// Create a BR/EDR basic mode channel
    pub fn new_basic(
        conn: ConnId,
        local_cid: u16,
        psm: PSM,
        rx_mtu: u16,
        required_security: SecurityLevel,
        ops: Box<dyn ChannelOps>,
    ) -> Self {
        let mut channel = Self::new(conn, local_cid, L2capChannelType::Basic, ops);
        channel.psm = Some(psm);
        channel.required_security = required_security;
        channel.rx.mtu = rx_mtu;
        channel.tx.mtu = L2CAP_BR_DEFAULT_MTU;
        channel
    }

    pub fn chan_ref(&self) -> ChanRef {
        ChanRef {
            conn: self.conn,
            cid: self.local_cid,
        }
    }

    pub fn local_cid(&self) -> u16 {
        self.local_cid
    }

    pub fn remote_cid(&self) -> u16 {
        self.remote_cid
    }

    pub fn psm(&self) -> Option<PSM> {
        self.psm
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn channel_type(&self) -> L2capChannelType {
        self.channel_type
    }

    pub fn rx(&self) -> &Endpoint {
        &self.rx
    }

    pub fn tx(&self) -> &Endpoint {
        &self.tx
    }

    pub fn required_security(&self) -> SecurityLevel {
        self.required_security
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(
                "Channel 0x{:04x}: {} -> {}",
                self.local_cid, self.state, state
            );
            self.state = state;
        }
    }

    pub(crate) fn set_remote_cid(&mut self, cid: u16) {
        self.remote_cid = cid;
    }

    /// Record the peer's receive parameters, which bound what we send
    pub(crate) fn set_tx(&mut self, mtu: u16, mps: u16, credits: u16) {
        self.tx = Endpoint {
            mtu,
            mps,
            credits,
            init_credits: credits,
        };
    }

    pub(crate) fn set_tx_mtu(&mut self, mtu: u16) {
        self.tx.mtu = mtu;
    }

    pub(crate) fn set_tx_mps(&mut self, mps: u16) {
        self.tx.mps = mps;
    }

    pub(crate) fn set_rx_mtu_mps(&mut self, mtu: u16, mps: u16) {
        self.rx.mtu = mtu;
        self.rx.mps = mps;
    }

    pub(crate) fn notify_connected(&mut self) {
        let chan = self.chan_ref();
        self.ops.connected(chan);
    }

    pub(crate) fn notify_disconnected(&mut self) {
        let chan = self.chan_ref();
        self.ops.disconnected(chan);
    }

    pub(crate) fn notify_sent(&mut self, result: Result<(), Error>) {
        let chan = self.chan_ref();
        self.ops.sent(chan, result);
    }

    pub(crate) fn notify_reconfigured(&mut self) {
        let chan = self.chan_ref();
        self.ops.reconfigured(chan);
    }

    /// Whether anything is waiting to be sent
    pub fn has_data(&self) -> bool {
        self.tx_sdu.is_some() || !self.tx_queue.is_empty()
    }

    /// Whether a PDU can be produced right now
    pub fn can_send(&self) -> bool {
        if self.state != ChannelState::Connected || !self.has_data() {
            return false;
        }
        !self.channel_type.is_credit_based() || self.tx.credits > 0
    }

    /// Queue an SDU for transmission
    pub fn queue_sdu(&mut self, sdu: Vec<u8>) -> L2capResult<()> {
        if self.state != ChannelState::Connected {
            return Err(L2capError::NotConnected);
        }
        let limit = match self.channel_type {
            L2capChannelType::Fixed => u16::MAX as usize - L2CAP_BASIC_HEADER_SIZE,
            _ => self.tx.mtu as usize,
        };
        if sdu.len() > limit {
            return Err(L2capError::MtuExceeded);
        }
        self.tx_queue.push_back(sdu);
        Ok(())
    }

    /// Produce the next PDU, consuming one credit on credit based channels
    pub(crate) fn pull_pdu(&mut self) -> Option<OutPdu> {
        if !self.can_send() {
            return None;
        }

        if !self.channel_type.is_credit_based() {
            let sdu = self.tx_queue.pop_front()?;
            return Some(OutPdu {
                cid: self.local_cid,
                data: encode_pdu(self.remote_cid, &sdu),
                last_of_sdu: true,
            });
        }

        let mut seg = match self.tx_sdu.take() {
            Some(seg) => seg,
            None => TxSdu {
                data: self.tx_queue.pop_front()?,
                offset: 0,
            },
        };

        let mps = self.tx.mps as usize;
        let first = seg.offset == 0;
        let (sdu_len, room) = if first {
            (
                Some(seg.data.len() as u16),
                mps.saturating_sub(L2CAP_SDU_HEADER_SIZE),
            )
        } else {
            (None, mps)
        };
        let end = (seg.offset + room).min(seg.data.len());
        let data = encode_kframe(self.remote_cid, sdu_len, &seg.data[seg.offset..end]);
        seg.offset = end;

        let last_of_sdu = seg.offset >= seg.data.len();
        if !last_of_sdu {
            self.tx_sdu = Some(seg);
        }

        self.tx.credits -= 1;
        trace!(
            "Channel 0x{:04x}: PDU of {} bytes, {} credits left",
            self.local_cid,
            data.len(),
            self.tx.credits
        );
        if self.tx.credits == 0 {
            let chan = self.chan_ref();
            self.ops.status(chan, false);
        }

        Some(OutPdu {
            cid: self.local_cid,
            data,
            last_of_sdu,
        })
    }

    /// Add credits granted by the peer.
    ///
    /// Returns `true` when the channel went from no credits to some.
    pub(crate) fn add_tx_credits(&mut self, credits: u16) -> L2capResult<bool> {
        let total = self
            .tx
            .credits
            .checked_add(credits)
            .ok_or(L2capError::CreditOverflow)?;
        let resumed = self.tx.credits == 0 && total > 0;
        self.tx.credits = total;
        if resumed {
            let chan = self.chan_ref();
            self.ops.status(chan, true);
        }
        Ok(resumed)
    }

    /// Add credits we are about to grant the peer
    pub(crate) fn add_rx_credits(&mut self, credits: u16) -> L2capResult<()> {
        self.rx.credits = self
            .rx
            .credits
            .checked_add(credits)
            .ok_or(L2capError::CreditOverflow)?;
        Ok(())
    }

    /// Handle a received PDU payload.
    ///
    /// Returns the number of credits to grant the peer. An error means the
    /// peer violated the channel parameters and the channel must be closed.
    pub(crate) fn recv_pdu(&mut self, payload: &[u8]) -> L2capResult<u16> {
        match self.channel_type {
            L2capChannelType::Fixed => {
                self.deliver(payload);
                Ok(0)
            }
            L2capChannelType::Basic => {
                if payload.len() > self.rx.mtu as usize {
                    return Err(L2capError::MtuExceeded);
                }
                self.deliver(payload);
                Ok(0)
            }
            L2capChannelType::LeCreditBased | L2capChannelType::EnhancedCreditBased => {
                self.recv_kframe(payload)
            }
        }
    }

    fn deliver(&mut self, sdu: &[u8]) {
        let chan = self.chan_ref();
        if let Err(e) = self.ops.recv(chan, sdu) {
            warn!("Channel 0x{:04x}: receiver failed: {}", self.local_cid, e);
        }
    }

    fn recv_kframe(&mut self, payload: &[u8]) -> L2capResult<u16> {
        if self.rx.credits == 0 {
            return Err(L2capError::NoCredits);
        }
        self.rx.credits -= 1;

        if payload.len() > self.rx.mps as usize {
            return Err(L2capError::MpsExceeded(payload.len()));
        }

        let chan = self.chan_ref();
        let mode = self.ops.recv_mode();

        let mut sdu = match self.rx_sdu.take() {
            Some(mut sdu) => {
                if sdu.received + payload.len() > sdu.len as usize {
                    return Err(L2capError::SduLengthMismatch {
                        expected: sdu.len,
                        received: sdu.received + payload.len(),
                    });
                }
                match mode {
                    RecvMode::Sdu => sdu.buf.extend_from_slice(payload),
                    RecvMode::Segments => {
                        self.ops
                            .seg_recv(chan, sdu.len, sdu.received as u16, payload)
                    }
                }
                sdu.received += payload.len();
                sdu
            }
            None => {
                if payload.len() < L2CAP_SDU_HEADER_SIZE {
                    return Err(L2capError::InvalidParameter(
                        "first K-frame lacks the SDU length".into(),
                    ));
                }
                let len = u16::from_le_bytes([payload[0], payload[1]]);
                if len > self.rx.mtu {
                    return Err(L2capError::MtuExceeded);
                }
                let segment = &payload[L2CAP_SDU_HEADER_SIZE..];
                if segment.len() > len as usize {
                    return Err(L2capError::SduLengthMismatch {
                        expected: len,
                        received: segment.len(),
                    });
                }
                let mut buf = Vec::new();
                match mode {
                    RecvMode::Sdu => {
                        buf = self.ops.alloc_buf(chan, len);
                        buf.clear();
                        buf.extend_from_slice(segment);
                    }
                    RecvMode::Segments => self.ops.seg_recv(chan, len, 0, segment),
                }
                RxSdu {
                    len,
                    received: segment.len(),
                    buf,
                }
            }
        };

        if mode == RecvMode::Segments {
            if sdu.received < sdu.len as usize {
                self.rx_sdu = Some(sdu);
            }
            return Ok(0);
        }

        if sdu.received == sdu.len as usize {
            let buf = std::mem::take(&mut sdu.buf);
            self.deliver(&buf);
            // Restore the full window once the SDU is consumed.
            let grant = self.rx.init_credits.saturating_sub(self.rx.credits);
            self.rx.credits += grant;
            return Ok(grant);
        }

        self.rx_sdu = Some(sdu);
        if self.rx.credits == 0 {
            // Keep the peer able to finish the SDU.
            self.rx.credits = 1;
            return Ok(1);
        }
        Ok(0)
    }

    /// Drop everything queued for transmission, failing each unsent SDU.
    pub(crate) fn fail_pending(&mut self) {
        let mut dropped = self.tx_queue.len();
        if self.tx_sdu.take().is_some() {
            dropped += 1;
        }
        self.tx_queue.clear();
        self.rx_sdu = None;
        for _ in 0..dropped {
            self.notify_sent(Err(Error::Shutdown));
        }
    }
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("conn", &self.conn)
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("psm", &self.psm)
            .field("state", &self.state)
            .field("channel_type", &self.channel_type)
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("queued", &self.tx_queue.len())
            .finish()
    }
}
