//! Outbound data path
//!
//! Connections with data are queued on a ready list. The TX processor
//! serves them round robin, one controller fragment at a time, as long as
//! the buffer pool of the link type has a free packet credit and a TX
//! context is available. A connection without credit is skipped, not
//! removed; it is removed only once it has nothing more to send.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{error, trace, warn};

use super::{ConnId, ConnRef, ConnState, ConnType};
use crate::error::Error;
use crate::hci::acl::{AclHeader, IsoHeader, PacketBoundary};
use crate::hci::constants::HCI_ERR_REMOTE_USER_TERM_CONN;
use crate::hci::{HciCommand, HciDriver};
use crate::host::Host;
use crate::l2cap::OutPdu;

/// Counting semaphore for controller data buffers
#[derive(Debug, Default)]
pub struct PacketCredits {
    count: AtomicUsize,
}

impl PacketCredits {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    pub fn reset(&self, count: usize) {
        self.count.store(count, Ordering::Release);
    }

    pub fn available(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Take one credit if any is left
    pub fn try_take(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Take a credit the caller has checked is there
    pub fn take(&self) {
        if !self.try_take() {
            error!("Packet credit taken without checking availability");
            panic!("packet credit underflow");
        }
    }

    pub fn give(&self, count: usize) {
        self.count.fetch_add(count, Ordering::AcqRel);
    }
}

/// Credits of every controller buffer pool
#[derive(Debug, Default)]
pub(crate) struct Credits {
    le_acl: PacketCredits,
    br_acl: PacketCredits,
    iso: PacketCredits,
    /// LE traffic uses the BR/EDR pool
    le_shared: bool,
}

impl Credits {
    pub(crate) fn reset(&mut self, le_acl: usize, br_acl: usize, iso: usize, le_shared: bool) {
        self.le_acl.reset(le_acl);
        self.br_acl.reset(br_acl);
        self.iso.reset(iso);
        self.le_shared = le_shared;
    }

    pub(crate) fn for_kind(&self, kind: ConnType) -> &PacketCredits {
        match kind {
            ConnType::Le if !self.le_shared => &self.le_acl,
            ConnType::Le | ConnType::BrEdr | ConnType::Sco => &self.br_acl,
            ConnType::Iso => &self.iso,
        }
    }
}

/// A PDU being fragmented to the controller
#[derive(Debug)]
pub(crate) struct TxPdu {
    pub(crate) cid: u16,
    pub(crate) data: Vec<u8>,
    pub(crate) offset: usize,
    pub(crate) last_of_sdu: bool,
    pub(crate) iso: bool,
}

impl From<OutPdu> for TxPdu {
    fn from(pdu: OutPdu) -> Self {
        Self {
            cid: pdu.cid,
            data: pdu.data,
            offset: 0,
            last_of_sdu: pdu.last_of_sdu,
            iso: false,
        }
    }
}

impl TxPdu {
    fn iso(data: Vec<u8>) -> Self {
        Self {
            cid: 0,
            data,
            offset: 0,
            last_of_sdu: true,
            iso: true,
        }
    }
}

/// Controller fragment awaiting Number Of Completed Packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxRecord {
    /// Channel whose SDU this fragment completes
    pub(crate) sdu_done: Option<u16>,
}

/// Borrowed window over the next fragment of a PDU.
///
/// Dropping the view consumes the fragment.
pub(crate) struct FragmentView<'a> {
    pending: &'a mut TxPdu,
    len: usize,
}

impl<'a> FragmentView<'a> {
    pub(crate) fn new(pending: &'a mut TxPdu, mtu: usize) -> Self {
        let len = (pending.data.len() - pending.offset).min(mtu);
        Self { pending, len }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.pending.data[self.pending.offset..self.pending.offset + self.len]
    }

    pub(crate) fn is_first(&self) -> bool {
        self.pending.offset == 0
    }

    pub(crate) fn boundary(&self) -> PacketBoundary {
        if self.pending.offset == 0 {
            PacketBoundary::FirstNonFlushable
        } else {
            PacketBoundary::Continuation
        }
    }

    /// Last fragment of the PDU
    pub(crate) fn is_last(&self) -> bool {
        self.pending.offset + self.len == self.pending.data.len()
    }
}

impl Drop for FragmentView<'_> {
    fn drop(&mut self) {
        self.pending.offset += self.len;
    }
}

/// State of the TX processor
#[derive(Debug)]
pub(crate) struct TxState {
    running: bool,
    pub(crate) ready: VecDeque<ConnId>,
    /// TX contexts left, one per fragment in flight
    pub(crate) free_contexts: usize,
}

impl TxState {
    pub(crate) fn new(contexts: usize) -> Self {
        Self {
            running: false,
            ready: VecDeque::new(),
            free_contexts: contexts,
        }
    }
}

enum TxStep {
    Sent,
    Blocked,
    Idle,
}

impl<D: HciDriver> Host<D> {
    /// Put a connection on the ready list unless it already is
    pub(crate) fn tx_mark_ready(&mut self, conn: &ConnRef) {
        let mut c = conn.lock();
        if c.tx_ready {
            return;
        }
        c.tx_ready = true;
        self.tx.ready.push_back(conn.id());
    }

    /// Send as many fragments as credits and contexts allow
    pub(crate) fn process_tx(&mut self) {
        if self.tx.running {
            return;
        }
        self.tx.running = true;

        for id in self.l2cap.take_raised() {
            if let Some(conn) = self.conns.get(id) {
                self.tx_mark_ready(&conn);
            }
        }

        // Consecutive connections that could not make progress
        let mut skipped = 0;
        while skipped < self.tx.ready.len() {
            let Some(id) = self.tx.ready.pop_front() else {
                break;
            };
            match self.tx_conn(id) {
                TxStep::Sent => {
                    skipped = 0;
                    self.tx.ready.push_back(id);
                }
                TxStep::Blocked => {
                    skipped += 1;
                    self.tx.ready.push_back(id);
                }
                TxStep::Idle => {
                    if let Some(conn) = self.conns.get(id) {
                        conn.lock().tx_ready = false;
                    }
                }
            }
        }

        self.tx.running = false;
    }

    fn tx_conn(&mut self, id: ConnId) -> TxStep {
        let Some(conn) = self.conns.get(id) else {
            return TxStep::Idle;
        };
        let (state, kind, handle, has_current) = {
            let c = conn.lock();
            (c.state, c.kind, c.handle, c.tx_current.is_some())
        };
        let Some(handle) = handle.filter(|_| state == ConnState::Connected) else {
            return TxStep::Idle;
        };
        if self.credits.for_kind(kind).available() == 0 || self.tx.free_contexts == 0 {
            return TxStep::Blocked;
        }

        if !has_current {
            let next = if kind == ConnType::Iso {
                conn.lock().iso_queue.pop_front().map(TxPdu::iso)
            } else {
                self.l2cap.pull_pdu(id).map(TxPdu::from)
            };
            match next {
                Some(pdu) => conn.lock().tx_current = Some(pdu),
                None => return TxStep::Idle,
            }
        }

        let mtu = match kind {
            ConnType::Le => self.info.le_acl_mtu,
            ConnType::Iso => self.info.iso_mtu,
            ConnType::BrEdr | ConnType::Sco => self.info.br_acl_mtu,
        } as usize;

        let (result, cid, completes_sdu) = {
            let mut c = conn.lock();
            let Some(pdu) = c.tx_current.as_mut() else {
                return TxStep::Idle;
            };
            self.credits.for_kind(kind).take();
            self.tx.free_contexts -= 1;
            let (cid, last_of_sdu, iso) = (pdu.cid, pdu.last_of_sdu, pdu.iso);
            let view = FragmentView::new(pdu, mtu);
            let len = view.data().len() as u16;
            trace!("{}: fragment of {} bytes: {}", id, len, hex::encode(view.data()));
            let result = if iso {
                self.driver.send_iso(
                    IsoHeader {
                        handle,
                        boundary: IsoHeader::boundary_for(view.is_first(), view.is_last()),
                        timestamp: false,
                        length: len,
                    },
                    view.data(),
                )
            } else {
                self.driver
                    .send_acl(AclHeader::new(handle, view.boundary(), len), view.data())
            };
            let last = view.is_last();
            drop(view);

            if result.is_ok() {
                let sdu_done = (last && last_of_sdu && !iso).then_some(cid);
                c.tx_pending.push_back(TxRecord { sdu_done });
            }
            if last || result.is_err() {
                c.tx_current = None;
            }
            (result, cid, last_of_sdu && !iso)
        };

        let Err(e) = result else {
            return TxStep::Sent;
        };

        warn!("{}: sending to the controller failed: {}", id, e);
        self.credits.for_kind(kind).give(1);
        self.tx.free_contexts += 1;
        if completes_sdu {
            self.l2cap.sdu_sent(id, cid, Err(Error::Shutdown));
        }
        if kind != ConnType::Iso {
            conn.lock().err = HCI_ERR_REMOTE_USER_TERM_CONN;
            match self.send_cmd(&HciCommand::Disconnect {
                handle,
                reason: HCI_ERR_REMOTE_USER_TERM_CONN,
            }) {
                Ok(_) => {
                    self.set_state_logged(&conn, ConnState::Disconnecting);
                }
                Err(e) => warn!("{}: disconnect after send failure failed: {}", id, e),
            }
        }
        TxStep::Idle
    }

    /// Return credits for fragments the controller has finished with
    pub(crate) fn handle_num_completed(&mut self, completed: &[(u16, u16)]) {
        for &(handle, count) in completed {
            let Some(conn) = self.conn_by_handle(handle) else {
                warn!("Completed packets for unknown handle {}", handle);
                continue;
            };
            let kind = conn.lock().kind;
            for _ in 0..count {
                let record = conn.lock().tx_pending.pop_front();
                let Some(record) = record else {
                    warn!("{}: more packets completed than sent", conn.id());
                    break;
                };
                self.credits.for_kind(kind).give(1);
                self.tx.free_contexts += 1;
                if let Some(cid) = record.sdu_done {
                    conn.lock().tx_notify.push_back(cid);
                }
            }
        }
    }

    /// Report completed SDUs of one connection to their channels
    pub(crate) fn flush_tx_notify(&mut self, conn: &ConnRef) {
        let notify = std::mem::take(&mut conn.lock().tx_notify);
        for cid in notify {
            self.l2cap.sdu_sent(conn.id(), cid, Ok(()));
        }
    }

    pub(crate) fn flush_tx_notify_all(&mut self) {
        for conn in self.conns.live() {
            self.flush_tx_notify(&conn);
        }
    }
}
