//! Scanning and periodic advertising syncs
//!
//! The controller has one scanner shared by several users: the application
//! (explicit scans), connections waiting to see their peer before
//! initiating, and periodic syncs being established. [`ScanFlags`] records
//! which of them currently need it. An explicit scan takes precedence; the
//! implicit users get a passive scan whenever nothing explicit runs.

pub mod reassembly;
pub mod sync;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, trace, warn};

pub use self::sync::{PeriodicSync, SyncCallback, SyncEvent, SyncId, SyncParams, SyncState};

use self::reassembly::{Assembled, ExtReassembly};
use self::sync::SyncPool;
use crate::conn::{ConnRef, ConnState};
use crate::error::{Error, Result};
use crate::gap::{BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::{AdvReport, ExtAdvReport, ExtScanPhy, HciCommand, HciDriver};
use crate::host::{Host, LeFeatures};
use crate::timer::Timer;

/// Scan interval and window of implicit scans (0.625 ms units)
const IMPLICIT_SCAN_INTERVAL: u16 = 0x0060;
const IMPLICIT_SCAN_WINDOW: u16 = 0x0030;

/// Unknown TX power in advertising reports
pub const TX_POWER_UNKNOWN: i8 = 0x7F;
/// No SID in a legacy report
pub const SID_NONE: u8 = 0xFF;

bitflags! {
    /// Reasons the scanner is in use, and its current mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFlags: u8 {
        /// Started by the application
        const EXPLICIT = 1 << 0;
        /// A connection waits to see its peer
        const INITIATOR = 1 << 1;
        /// A periodic sync is being established
        const SYNC = 1 << 2;
        const ACTIVE = 1 << 3;
        /// The explicit scan has a duration
        const LIMITED = 1 << 4;
        /// Enabled in the controller
        const SCANNING = 1 << 5;
        /// Own address is an NRPA that should rotate
        const NRPA = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanType {
    #[default]
    Passive,
    Active,
}

/// Parameters of an explicit scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub scan_type: ScanType,
    /// Scan interval (0.625 ms units)
    pub interval: u16,
    /// Scan window (0.625 ms units)
    pub window: u16,
    /// Report each advertiser once
    pub filter_duplicates: bool,
    /// Only report devices on the filter accept list
    pub filter_accept_list: bool,
    /// Scan the coded PHY as well, with its own interval and window
    pub coded: Option<(u16, u16)>,
    /// Scan duration in 10 ms units, 0 for no limit
    pub timeout: u16,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scan_type: ScanType::Active,
            interval: 0x0010,
            window: 0x0010,
            filter_duplicates: true,
            filter_accept_list: false,
            coded: None,
            timeout: 0,
        }
    }
}

impl ScanParams {
    /// Passive scan used by implicit users
    fn implicit() -> Self {
        Self {
            scan_type: ScanType::Passive,
            interval: IMPLICIT_SCAN_INTERVAL,
            window: IMPLICIT_SCAN_WINDOW,
            filter_duplicates: false,
            filter_accept_list: false,
            coded: None,
            timeout: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        let timing = [(self.interval, self.window)]
            .into_iter()
            .chain(self.coded);
        for (interval, window) in timing {
            let range = SCAN_INTERVAL_MIN..=SCAN_INTERVAL_MAX;
            if !range.contains(&interval) || !range.contains(&window) {
                return Err(Error::InvalidParameter(format!(
                    "Scan interval 0x{:04x} or window 0x{:04x} out of range",
                    interval, window
                )));
            }
            if window > interval {
                return Err(Error::InvalidParameter("Scan window above scan interval".into()));
            }
        }
        Ok(())
    }

    fn hci_type(&self) -> u8 {
        match self.scan_type {
            ScanType::Passive => LE_SCAN_PASSIVE,
            ScanType::Active => LE_SCAN_ACTIVE,
        }
    }
}

/// One advertising report, reassembled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Advertiser, resolved to its identity when possible
    pub addr: LeAddr,
    pub rssi: i8,
    pub tx_power: i8,
    /// Extended advertising event properties; legacy reports are mapped
    pub adv_props: u16,
    pub sid: u8,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub periodic_interval: u16,
    pub data: Vec<u8>,
    /// The advertiser sent more data than was delivered
    pub truncated: bool,
}

impl ScanReport {
    pub fn is_connectable(&self) -> bool {
        self.adv_props & EXT_ADV_EVT_CONNECTABLE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Report(ScanReport),
    /// A scan with a duration ended
    Timeout,
}

pub type ScanCallback = Box<dyn FnMut(&ScanEvent) + Send + 'static>;

/// Event properties equivalent to a legacy PDU type
fn legacy_props(event_type: u8) -> u16 {
    let props = match event_type {
        ADV_IND => EXT_ADV_EVT_CONNECTABLE | EXT_ADV_EVT_SCANNABLE,
        ADV_DIRECT_IND => EXT_ADV_EVT_CONNECTABLE | EXT_ADV_EVT_DIRECTED,
        ADV_SCAN_IND => EXT_ADV_EVT_SCANNABLE,
        ADV_SCAN_RSP => EXT_ADV_EVT_SCANNABLE | EXT_ADV_EVT_SCAN_RSP,
        _ => 0,
    };
    props | EXT_ADV_EVT_LEGACY
}

pub(crate) struct ScanState {
    pub(crate) flags: ScanFlags,
    params: Option<ScanParams>,
    callback: Option<ScanCallback>,
    /// Duration of a legacy explicit scan
    pub(crate) limited_timer: Timer,
    reassembly: ExtReassembly,
    pub(crate) syncs: SyncPool,
    pub(crate) sync_callbacks: Vec<SyncCallback>,
}

impl std::fmt::Debug for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanState")
            .field("flags", &self.flags)
            .field("params", &self.params)
            .field("limited_timer", &self.limited_timer)
            .field("syncs", &self.syncs)
            .finish_non_exhaustive()
    }
}

impl ScanState {
    pub(crate) fn new(max_syncs: usize, buf_len: usize) -> Self {
        Self {
            flags: ScanFlags::empty(),
            params: None,
            callback: None,
            limited_timer: Timer::new(),
            reassembly: ExtReassembly::new(buf_len),
            syncs: SyncPool::new(max_syncs, buf_len),
            sync_callbacks: Vec::new(),
        }
    }
}

impl<D: HciDriver> Host<D> {
    pub fn scan_flags(&self) -> ScanFlags {
        self.scan.flags
    }

    /// Start an explicit scan, reporting to `callback`
    pub fn scan_start(&mut self, params: ScanParams, callback: ScanCallback) -> Result<()> {
        params.validate()?;
        if self.scan.flags.contains(ScanFlags::EXPLICIT) {
            return Err(Error::Already);
        }
        let coded_capable = self
            .info
            .le_features
            .contains(LeFeatures::EXT_ADV | LeFeatures::PHY_CODED);
        if params.coded.is_some() && !coded_capable {
            return Err(Error::NotSupported);
        }

        self.scan_disable()?;
        if let Err(e) = self.scan_apply(&params) {
            if let Err(e) = self.scan_update() {
                warn!("Restoring implicit scan failed: {}", e);
            }
            return Err(e);
        }

        self.scan.flags.insert(ScanFlags::EXPLICIT);
        self.scan.params = Some(params);
        self.scan.callback = Some(callback);
        if params.timeout > 0 {
            self.scan.flags.insert(ScanFlags::LIMITED);
            if !self.info.le_features.contains(LeFeatures::EXT_ADV) {
                self.scan
                    .limited_timer
                    .arm(Duration::from_millis(params.timeout as u64 * 10));
            }
        }
        info!("Scanning started ({:?})", params.scan_type);
        Ok(())
    }

    /// Stop the explicit scan and fall back to whatever implicit scan is needed
    pub fn scan_stop(&mut self) -> Result<()> {
        if !self.scan.flags.contains(ScanFlags::EXPLICIT) {
            return Err(Error::Already);
        }
        self.scan_end_explicit();
        self.scan_disable()?;
        self.scan_update()
    }

    fn scan_end_explicit(&mut self) {
        self.scan.flags.remove(ScanFlags::EXPLICIT | ScanFlags::LIMITED);
        self.scan.limited_timer.cancel();
        self.scan.params = None;
        self.scan.callback = None;
    }

    /// Re-evaluate the implicit scan needs
    pub(crate) fn scan_update(&mut self) -> Result<()> {
        if self.scan.flags.contains(ScanFlags::EXPLICIT) {
            return Ok(());
        }

        let initiator = self
            .conns
            .find(|c| c.state == ConnState::ScanBeforeInitiating)
            .is_some();
        let sync = self.scan.syncs.pending().is_some();

        self.scan_disable()?;
        self.scan.flags.remove(ScanFlags::INITIATOR | ScanFlags::SYNC);
        if !initiator && !sync {
            return Ok(());
        }

        self.scan.flags.set(ScanFlags::INITIATOR, initiator);
        self.scan.flags.set(ScanFlags::SYNC, sync);
        debug!("Implicit scan for {:?}", self.scan.flags);
        self.scan_apply(&ScanParams::implicit())
    }

    /// Own address type of the scanner, programming a random address when
    /// nothing else depends on the current one
    fn scan_own_addr_type(&mut self, active: bool) -> Result<u8> {
        let busy = self.adv_shares_random_addr() || self.initiator_busy();
        if self.config.privacy {
            if busy {
                return Ok(OWN_ADDR_RANDOM);
            }
            return self.id_own_addr_type(0);
        }
        if active && !busy {
            self.set_random_address(BdAddr::new_nrpa())?;
            self.scan.flags.insert(ScanFlags::NRPA);
            return Ok(OWN_ADDR_RANDOM);
        }
        let identity = self
            .ids
            .get(0)
            .map(|identity| identity.addr)
            .ok_or_else(|| Error::Config("No identity 0".into()))?;
        if !identity.is_random() {
            return Ok(OWN_ADDR_PUBLIC);
        }
        if !busy {
            self.set_random_address(identity.addr)?;
        }
        Ok(OWN_ADDR_RANDOM)
    }

    /// Program and enable the controller scanner
    fn scan_apply(&mut self, params: &ScanParams) -> Result<()> {
        let active = params.scan_type == ScanType::Active;
        self.scan.flags.remove(ScanFlags::NRPA);
        let own_addr_type = self.scan_own_addr_type(active)?;
        let filter_policy = if params.filter_accept_list {
            FILTER_POLICY_FILTER_ACCEPT_LIST
        } else {
            FILTER_POLICY_ACCEPT_ALL
        };

        if self.info.le_features.contains(LeFeatures::EXT_ADV) {
            let mut phys = vec![ExtScanPhy {
                phy: PHY_1M,
                scan_type: params.hci_type(),
                interval: params.interval,
                window: params.window,
            }];
            if let Some((interval, window)) = params.coded {
                phys.push(ExtScanPhy {
                    phy: PHY_CODED,
                    scan_type: params.hci_type(),
                    interval,
                    window,
                });
            }
            self.send_cmd(&HciCommand::LeSetExtScanParameters {
                own_addr_type,
                filter_policy,
                phys,
            })?;
            self.send_cmd(&HciCommand::LeSetExtScanEnable {
                enable: true,
                filter_duplicates: params.filter_duplicates,
                duration: params.timeout,
                period: 0,
            })?;
        } else {
            self.send_cmd(&HciCommand::LeSetScanParameters {
                scan_type: params.hci_type(),
                scan_interval: params.interval,
                scan_window: params.window,
                own_address_type: own_addr_type,
                filter_policy,
            })?;
            self.send_cmd(&HciCommand::LeSetScanEnable {
                enable: true,
                filter_duplicates: params.filter_duplicates,
            })?;
        }

        self.scan.flags.insert(ScanFlags::SCANNING);
        self.scan.flags.set(ScanFlags::ACTIVE, active);
        Ok(())
    }

    /// Disable the controller scanner if it runs
    fn scan_disable(&mut self) -> Result<()> {
        if !self.scan.flags.contains(ScanFlags::SCANNING) {
            return Ok(());
        }
        let command = if self.info.le_features.contains(LeFeatures::EXT_ADV) {
            HciCommand::LeSetExtScanEnable {
                enable: false,
                filter_duplicates: false,
                duration: 0,
                period: 0,
            }
        } else {
            HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false,
            }
        };
        self.send_cmd(&command)?;
        self.scan
            .flags
            .remove(ScanFlags::SCANNING | ScanFlags::ACTIVE | ScanFlags::NRPA);
        self.scan.reassembly.reset();
        Ok(())
    }

    fn scan_report(&mut self, report: ScanReport) {
        trace!("Report from {}: {}", report.addr, hex::encode(&report.data));
        if report.is_connectable() {
            self.scan_check_pending_conn(&report.addr);
        }
        if !self.scan.flags.contains(ScanFlags::EXPLICIT) {
            return;
        }
        if let Some(callback) = self.scan.callback.as_mut() {
            callback(&ScanEvent::Report(report));
        }
    }

    /// A connection waiting for `addr` can now initiate
    fn scan_check_pending_conn(&mut self, addr: &LeAddr) {
        // No connections are started under an explicit scan.
        if self.scan.flags.contains(ScanFlags::EXPLICIT) {
            return;
        }
        let Some(conn) = self
            .conns
            .find(|c| c.state == ConnState::ScanBeforeInitiating && c.peer.same_device(addr))
        else {
            return;
        };
        if let Err(e) = self.scan_disable() {
            warn!("Stopping scan before initiating failed: {}", e);
            return;
        }
        self.scan_initiate(&conn);
        if let Err(e) = self.scan_update() {
            warn!("Scan update failed: {}", e);
        }
    }

    fn scan_initiate(&mut self, conn: &ConnRef) {
        if self.set_state(conn, ConnState::Initiating).is_err() {
            return;
        }
        if let Err(e) = self.conn_send_create(conn) {
            warn!("{}: create connection failed: {}", conn.id(), e);
            conn.lock().err = e.controller_status().unwrap_or(HCI_ERR_UNSPECIFIED);
            self.set_state_logged(conn, ConnState::Disconnected);
        }
    }

    pub(crate) fn handle_adv_reports(&mut self, reports: Vec<AdvReport>) {
        for report in reports {
            let addr = self.resolve_peer(&report.addr);
            self.scan_report(ScanReport {
                addr,
                rssi: report.rssi,
                tx_power: TX_POWER_UNKNOWN,
                adv_props: legacy_props(report.event_type),
                sid: SID_NONE,
                primary_phy: PHY_1M,
                secondary_phy: 0,
                periodic_interval: 0,
                data: report.data,
                truncated: false,
            });
        }
    }

    pub(crate) fn handle_ext_adv_reports(&mut self, reports: Vec<ExtAdvReport>) {
        for report in reports {
            let (data, truncated) = if report.is_legacy() {
                (report.data.clone(), false)
            } else {
                match self.scan.reassembly.push(
                    &report.addr,
                    report.sid,
                    report.data_status(),
                    &report.data,
                ) {
                    Assembled::Done { data, truncated } => (data, truncated),
                    Assembled::Pending | Assembled::Dropped => continue,
                }
            };
            let addr = self.resolve_peer(&report.addr);
            self.scan_report(ScanReport {
                addr,
                rssi: report.rssi,
                tx_power: report.tx_power,
                adv_props: report.event_type & !EXT_ADV_EVT_DATA_STATUS_MASK,
                sid: report.sid,
                primary_phy: report.primary_phy,
                secondary_phy: report.secondary_phy,
                periodic_interval: report.periodic_interval,
                data,
                truncated,
            });
        }
    }

    /// A scan with a duration ended
    pub(crate) fn handle_scan_timeout(&mut self) {
        if !self.scan.flags.contains(ScanFlags::LIMITED) {
            debug!("Scan timeout without a limited scan");
            return;
        }
        info!("Scan timed out");
        self.scan
            .flags
            .remove(ScanFlags::SCANNING | ScanFlags::ACTIVE | ScanFlags::NRPA);
        self.scan.reassembly.reset();
        self.rpa_invalidate();

        let callback = self.scan.callback.take();
        self.scan_end_explicit();
        if let Some(mut callback) = callback {
            callback(&ScanEvent::Timeout);
        }
        if let Err(e) = self.scan_update() {
            warn!("Scan update after timeout failed: {}", e);
        }
    }

    pub(crate) fn scan_process_timeouts(&mut self, now: Instant) {
        if !self.scan.limited_timer.fire(now) {
            return;
        }
        if let Err(e) = self.scan_disable() {
            warn!("Stopping limited scan failed: {}", e);
        }
        self.handle_scan_timeout();
    }

    /// Move an active scanner to a fresh private address
    pub(crate) fn scan_rpa_expired(&mut self) {
        let flags = self.scan.flags;
        if !flags.contains(ScanFlags::SCANNING | ScanFlags::ACTIVE) {
            return;
        }
        if !self.config.privacy && !flags.contains(ScanFlags::NRPA) {
            return;
        }
        let params = match self.scan.params {
            Some(params) if flags.contains(ScanFlags::EXPLICIT) => params,
            _ => ScanParams::implicit(),
        };
        let restarted = self.scan_disable().and_then(|_| self.scan_apply(&params));
        if let Err(e) = restarted {
            warn!("Restarting scan with a new address failed: {}", e);
        }
    }

    /// Forget scan and sync state; the controller is about to be reset
    pub(crate) fn scan_shutdown(&mut self) {
        self.scan_end_explicit();
        self.scan.flags = ScanFlags::empty();
        self.scan.reassembly.reset();
        self.scan.syncs.clear();
    }
}
