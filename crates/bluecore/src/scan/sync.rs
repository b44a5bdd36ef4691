//! Periodic advertising syncs
//!
//! At most one sync is being established at a time; the controller only
//! accepts a new create sync command once the previous one completed.

use log::{debug, info, warn};

use super::reassembly::{Assembled, ReportBuf};
use crate::conn::ConnId;
use crate::error::{Error, Result};
use crate::gap::{BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::event::{PastReceived, SyncEstablished};
use crate::hci::{DataStatus, HciCommand, HciDriver};
use crate::host::{Host, LeFeatures};

/// Use the periodic advertiser list instead of an address
const SYNC_OPT_USE_LIST: u8 = 0x01;

/// Generational handle of a periodic sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId {
    pub index: u8,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Create sync issued, waiting for the controller
    Syncing,
    Synced,
}

/// Parameters of a new sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParams {
    /// Advertiser to sync to, `None` for the periodic advertiser list
    pub addr: Option<LeAddr>,
    pub sid: u8,
    /// Periodic events that may be skipped
    pub skip: u16,
    /// Supervision timeout (10 ms units)
    pub timeout: u16,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            addr: None,
            sid: 0,
            skip: 0,
            timeout: 0x03E8,
        }
    }
}

impl SyncParams {
    fn validate(&self) -> Result<()> {
        if self.sid > PER_ADV_SID_MAX {
            return Err(Error::InvalidParameter(format!("SID {} out of range", self.sid)));
        }
        if self.skip > PER_ADV_SKIP_MAX {
            return Err(Error::InvalidParameter(format!("Skip {} out of range", self.skip)));
        }
        if !(PER_ADV_TIMEOUT_MIN..=PER_ADV_TIMEOUT_MAX).contains(&self.timeout) {
            return Err(Error::InvalidParameter(format!(
                "Sync timeout 0x{:04x} out of range",
                self.timeout
            )));
        }
        Ok(())
    }
}

/// Notifications about periodic syncs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Synced {
        sync: SyncId,
        addr: LeAddr,
        sid: u8,
        interval: u16,
        phy: u8,
        /// Connection the sync was transferred over
        conn: Option<ConnId>,
        service_data: u16,
    },
    /// The sync ended, `reason` is an HCI status
    Terminated { sync: SyncId, reason: u8 },
    Report {
        sync: SyncId,
        tx_power: i8,
        rssi: i8,
        data: Vec<u8>,
        truncated: bool,
    },
}

pub type SyncCallback = Box<dyn FnMut(&SyncEvent) + Send + 'static>;

#[derive(Debug)]
pub struct PeriodicSync {
    generation: u32,
    state: SyncState,
    handle: Option<u16>,
    addr: Option<LeAddr>,
    sid: u8,
    interval: u16,
    /// Deleted by the host while still syncing
    cancelled: bool,
    reports: ReportBuf,
}

impl PeriodicSync {
    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn handle(&self) -> Option<u16> {
        self.handle
    }

    pub fn addr(&self) -> Option<LeAddr> {
        self.addr
    }

    pub fn sid(&self) -> u8 {
        self.sid
    }

    pub fn interval(&self) -> u16 {
        self.interval
    }
}

#[derive(Debug)]
pub(crate) struct SyncPool {
    slots: Vec<Option<PeriodicSync>>,
    generations: Vec<u32>,
    buf_len: usize,
}

impl SyncPool {
    pub(crate) fn new(max: usize, buf_len: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            generations: vec![0; max],
            buf_len,
        }
    }

    fn alloc(&mut self, state: SyncState) -> Option<SyncId> {
        let index = self.slots.iter().position(Option::is_none)?;
        let generation = self.generations[index];
        self.slots[index] = Some(PeriodicSync {
            generation,
            state,
            handle: None,
            addr: None,
            sid: 0,
            interval: 0,
            cancelled: false,
            reports: ReportBuf::new(self.buf_len),
        });
        Some(SyncId {
            index: index as u8,
            generation,
        })
    }

    pub(crate) fn get(&self, id: SyncId) -> Option<&PeriodicSync> {
        self.slots
            .get(id.index as usize)?
            .as_ref()
            .filter(|sync| sync.generation == id.generation)
    }

    fn get_mut(&mut self, id: SyncId) -> Option<&mut PeriodicSync> {
        self.slots
            .get_mut(id.index as usize)?
            .as_mut()
            .filter(|sync| sync.generation == id.generation)
    }

    fn find(&self, pred: impl Fn(&PeriodicSync) -> bool) -> Option<SyncId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.as_ref().filter(|sync| pred(sync)).map(|sync| SyncId {
                index: index as u8,
                generation: sync.generation,
            })
        })
    }

    /// The sync being established
    pub(crate) fn pending(&self) -> Option<SyncId> {
        self.find(|sync| sync.state == SyncState::Syncing)
    }

    fn by_handle(&self, handle: u16) -> Option<SyncId> {
        self.find(|sync| sync.state == SyncState::Synced && sync.handle == Some(handle))
    }

    fn free(&mut self, id: SyncId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            *slot = None;
            self.generations[id.index as usize] = id.generation.wrapping_add(1);
        }
    }

    pub(crate) fn clear(&mut self) {
        for index in 0..self.slots.len() {
            if let Some(sync) = self.slots[index].take() {
                self.generations[index] = sync.generation.wrapping_add(1);
            }
        }
    }
}

impl<D: HciDriver> Host<D> {
    pub fn register_sync_callback(&mut self, callback: SyncCallback) {
        self.scan.sync_callbacks.push(callback);
    }

    fn sync_notify(&mut self, event: SyncEvent) {
        for callback in self.scan.sync_callbacks.iter_mut() {
            callback(&event);
        }
    }

    pub fn periodic_sync(&self, sync: SyncId) -> Option<&PeriodicSync> {
        self.scan.syncs.get(sync)
    }

    /// Start synchronising to a periodic advertising train
    pub fn periodic_sync_create(&mut self, params: SyncParams) -> Result<SyncId> {
        if !self.info.le_features.contains(LeFeatures::PERIODIC_ADV) {
            return Err(Error::NotSupported);
        }
        if self.scan.syncs.pending().is_some() {
            return Err(Error::Busy);
        }
        params.validate()?;

        let id = self
            .scan
            .syncs
            .alloc(SyncState::Syncing)
            .ok_or(Error::ResourceExhausted("periodic sync"))?;

        let (options, addr_type, addr) = match params.addr {
            Some(addr) => (0, u8::from(addr.kind.base()), addr.addr),
            None => (SYNC_OPT_USE_LIST, 0, BdAddr::ANY),
        };
        let sent = self.send_cmd(&HciCommand::LePeriodicAdvCreateSync {
            options,
            sid: params.sid,
            addr_type,
            addr,
            skip: params.skip,
            sync_timeout: params.timeout,
        });
        if let Err(e) = sent {
            self.scan.syncs.free(id);
            return Err(e);
        }
        if let Some(sync) = self.scan.syncs.get_mut(id) {
            sync.addr = params.addr;
            sync.sid = params.sid;
        }

        // The controller only syncs while scanning.
        if let Err(e) = self.scan_update() {
            warn!("Scanning for periodic sync failed: {}", e);
        }
        Ok(id)
    }

    /// Cancel a pending sync or terminate an established one
    pub fn periodic_sync_delete(&mut self, id: SyncId) -> Result<()> {
        let sync = self
            .scan
            .syncs
            .get(id)
            .ok_or_else(|| Error::InvalidParameter("Unknown periodic sync".into()))?;

        match (sync.state, sync.handle) {
            (SyncState::Syncing, _) => {
                if sync.cancelled {
                    return Ok(());
                }
                self.send_cmd(&HciCommand::LePeriodicAdvCreateSyncCancel)?;
                if let Some(sync) = self.scan.syncs.get_mut(id) {
                    sync.cancelled = true;
                }
            }
            (SyncState::Synced, Some(handle)) => {
                self.send_cmd(&HciCommand::LePeriodicAdvTerminateSync { handle })?;
                self.scan.syncs.free(id);
            }
            (SyncState::Synced, None) => self.scan.syncs.free(id),
        }
        Ok(())
    }

    pub(crate) fn handle_sync_established(&mut self, evt: SyncEstablished) {
        let Some(id) = self.scan.syncs.pending() else {
            warn!("Periodic sync established without a pending sync");
            if evt.status == HCI_SUCCESS {
                self.sync_terminate_handle(evt.sync_handle);
            }
            return;
        };
        let cancelled = self.scan.syncs.get(id).is_some_and(|sync| sync.cancelled);

        if evt.status != HCI_SUCCESS || cancelled {
            self.scan.syncs.free(id);
            if evt.status == HCI_SUCCESS {
                // Cancel lost the race against establishment.
                self.sync_terminate_handle(evt.sync_handle);
            } else if !cancelled {
                debug!("Periodic sync failed: 0x{:02x}", evt.status);
                self.sync_notify(SyncEvent::Terminated {
                    sync: id,
                    reason: evt.status,
                });
            }
        } else {
            let addr = self.resolve_peer(&evt.addr);
            if let Some(sync) = self.scan.syncs.get_mut(id) {
                sync.state = SyncState::Synced;
                sync.handle = Some(evt.sync_handle);
                sync.addr = Some(addr);
                sync.sid = evt.sid;
                sync.interval = evt.interval;
            }
            info!("Periodic sync {} to {} established", evt.sync_handle, addr);
            self.sync_notify(SyncEvent::Synced {
                sync: id,
                addr,
                sid: evt.sid,
                interval: evt.interval,
                phy: evt.phy,
                conn: None,
                service_data: 0,
            });
        }

        if let Err(e) = self.scan_update() {
            warn!("Scan update after periodic sync failed: {}", e);
        }
    }

    fn sync_terminate_handle(&mut self, handle: u16) {
        if let Err(e) = self.send_cmd(&HciCommand::LePeriodicAdvTerminateSync { handle }) {
            warn!("Terminating periodic sync {} failed: {}", handle, e);
        }
    }

    pub(crate) fn handle_periodic_report(
        &mut self,
        sync_handle: u16,
        tx_power: i8,
        rssi: i8,
        status: DataStatus,
        data: Vec<u8>,
    ) {
        let Some(id) = self.scan.syncs.by_handle(sync_handle) else {
            debug!("Report for unknown periodic sync {}", sync_handle);
            return;
        };
        let assembled = match self.scan.syncs.get_mut(id) {
            Some(sync) => sync.reports.push(status, &data),
            None => return,
        };
        if let Assembled::Done { data, truncated } = assembled {
            self.sync_notify(SyncEvent::Report {
                sync: id,
                tx_power,
                rssi,
                data,
                truncated,
            });
        }
    }

    pub(crate) fn handle_sync_lost(&mut self, sync_handle: u16) {
        let Some(id) = self.scan.syncs.by_handle(sync_handle) else {
            debug!("Loss of unknown periodic sync {}", sync_handle);
            return;
        };
        info!("Periodic sync {} lost", sync_handle);
        self.scan.syncs.free(id);
        self.sync_notify(SyncEvent::Terminated {
            sync: id,
            reason: HCI_ERR_CONN_TIMEOUT,
        });
    }

    /// A peer handed over a periodic sync
    pub(crate) fn handle_past_received(&mut self, evt: PastReceived) {
        if evt.status != HCI_SUCCESS {
            debug!("Periodic sync transfer failed: 0x{:02x}", evt.status);
            return;
        }
        let Some(conn) = self.conn_by_handle(evt.conn_handle) else {
            warn!("Periodic sync transfer on unknown handle {}", evt.conn_handle);
            self.sync_terminate_handle(evt.sync_handle);
            return;
        };
        let Some(id) = self.scan.syncs.alloc(SyncState::Synced) else {
            warn!("No periodic sync slot for transferred sync {}", evt.sync_handle);
            self.sync_terminate_handle(evt.sync_handle);
            return;
        };

        let addr = self.resolve_peer(&evt.addr);
        if let Some(sync) = self.scan.syncs.get_mut(id) {
            sync.handle = Some(evt.sync_handle);
            sync.addr = Some(addr);
            sync.sid = evt.sid;
            sync.interval = evt.interval;
        }
        self.sync_notify(SyncEvent::Synced {
            sync: id,
            addr,
            sid: evt.sid,
            interval: evt.interval,
            phy: evt.phy,
            conn: Some(conn.id()),
            service_data: evt.service_data,
        });
    }
}
