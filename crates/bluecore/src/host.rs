//! Host context
//!
//! [`Host`] owns the controller driver and every piece of host state: the
//! connection pool, the L2CAP manager, advertising sets, the scanner,
//! periodic syncs and the local identities. Subsystems add their operations
//! in their own modules through `impl<D: HciDriver> Host<D>` blocks.
//!
//! Inbound packets enter through [`Host::recv`]. Time critical events are
//! handled at once, everything else is queued until [`Host::process`], which
//! also runs the transmit scheduler. Timers are driven by
//! [`Host::process_timeouts`].

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::time::Instant;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, error, info, trace, warn};

use crate::adv::{AdvEventCallback, AdvSets};
use crate::config::HostConfig;
use crate::conn::tx::{Credits, TxState};
use crate::conn::{ConnEventCallback, ConnId, ConnPool, ConnRef, ParamRequestFn};
use crate::error::{Error, HciError, Result};
use crate::gap::BdAddr;
use crate::hci::constants::*;
use crate::hci::{AclHeader, Event, HciCommand, HciDriver, LeEvent};
use crate::id::IdState;
use crate::l2cap::L2capManager;
use crate::scan::ScanState;
use crate::timer::earliest;

bitflags! {
    /// LE features supported by the controller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LeFeatures: u64 {
        const ENCRYPTION = 1 << 0;
        const CONN_PARAM_REQ = 1 << 1;
        const DATA_LENGTH = 1 << 5;
        const PRIVACY = 1 << 6;
        const PHY_2M = 1 << 8;
        const PHY_CODED = 1 << 11;
        const EXT_ADV = 1 << 12;
        const PERIODIC_ADV = 1 << 13;
        const PAST_RECIPIENT = 1 << 25;
        const CIS_CENTRAL = 1 << 28;
        const CIS_PERIPHERAL = 1 << 29;
        const ISO_BROADCASTER = 1 << 30;
    }
}

impl LeFeatures {
    /// Any isochronous role, which means the v2 buffer size command exists
    pub fn has_iso(self) -> bool {
        self.intersects(Self::CIS_CENTRAL | Self::CIS_PERIPHERAL | Self::ISO_BROADCASTER)
    }
}

/// What the controller reported about itself during [`Host::init`]
#[derive(Debug, Clone, Default)]
pub struct ControllerInfo {
    pub bd_addr: BdAddr,
    /// LMP features page 0
    pub features: u64,
    pub le_features: LeFeatures,
    pub le_acl_mtu: u16,
    pub le_acl_pkts: u16,
    pub br_acl_mtu: u16,
    pub br_acl_pkts: u16,
    pub iso_mtu: u16,
    pub iso_pkts: u16,
    pub resolving_list_size: u8,
    pub max_adv_data_len: u16,
    pub num_adv_sets: u8,
}

/// Queued inbound work
#[derive(Debug)]
pub(crate) enum Inbound {
    Event(Event),
    Acl(Vec<u8>),
}

/// Bluetooth LE host
pub struct Host<D: HciDriver> {
    pub(crate) driver: D,
    pub(crate) config: HostConfig,
    pub(crate) info: ControllerInfo,
    pub(crate) credits: Credits,
    pub(crate) conns: ConnPool,
    /// Reference held for every connection outside the disconnected state
    pub(crate) conn_lifetime: HashMap<ConnId, ConnRef>,
    pub(crate) conn_callbacks: Vec<ConnEventCallback>,
    pub(crate) param_filter: Option<ParamRequestFn>,
    pub(crate) l2cap: L2capManager,
    pub(crate) tx: TxState,
    pub(crate) ids: IdState,
    pub(crate) adv: AdvSets,
    pub(crate) adv_callbacks: Vec<AdvEventCallback>,
    pub(crate) scan: ScanState,
    rx_queue: VecDeque<Inbound>,
    initialized: bool,
}

fn short(_: std::io::Error) -> Error {
    Error::Hci(HciError::InvalidPacketFormat)
}

impl<D: HciDriver> Host<D> {
    /// Create a host on top of `driver`. Nothing is sent until [`Host::init`].
    pub fn new(driver: D, config: HostConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            credits: Credits::default(),
            conns: ConnPool::new(config.max_conn),
            conn_lifetime: HashMap::new(),
            conn_callbacks: Vec::new(),
            param_filter: None,
            l2cap: L2capManager::new(config.l2cap),
            tx: TxState::new(config.acl_tx_contexts),
            ids: IdState::new(config.id_max),
            adv: AdvSets::new(config.max_adv_sets),
            adv_callbacks: Vec::new(),
            scan: ScanState::new(config.max_periodic_syncs, config.ext_scan_buf_len),
            info: ControllerInfo::default(),
            rx_queue: VecDeque::new(),
            initialized: false,
            driver,
            config,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn controller(&self) -> &ControllerInfo {
        &self.info
    }

    pub fn le_features(&self) -> LeFeatures {
        self.info.le_features
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The L2CAP channel layer.
    ///
    /// Changes made here go out on the next [`Host::process`].
    pub fn l2cap(&mut self) -> &mut L2capManager {
        &mut self.l2cap
    }

    /// Connection pool
    pub fn conns(&self) -> &ConnPool {
        &self.conns
    }

    /// Send a command and return its return parameters after the status
    pub(crate) fn send_cmd(&mut self, command: &HciCommand) -> Result<Vec<u8>> {
        let complete = self.driver.send_command(command)?;
        if complete.status != HCI_SUCCESS {
            debug!(
                "Command 0x{:04x} failed with status 0x{:02x}",
                complete.opcode, complete.status
            );
            return Err(Error::Controller {
                opcode: complete.opcode,
                status: complete.status,
            });
        }
        Ok(complete.params)
    }

    /// Bring up the controller
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::Already);
        }

        self.send_cmd(&HciCommand::Reset)?;

        let rp = self.send_cmd(&HciCommand::ReadLocalSupportedFeatures)?;
        self.info.features = Cursor::new(&rp).read_u64::<LittleEndian>().map_err(short)?;

        let rp = self.send_cmd(&HciCommand::ReadBdAddr)?;
        self.info.bd_addr = BdAddr::from_slice(&rp).ok_or(Error::Hci(HciError::InvalidParamLength(rp.len())))?;

        let rp = self.send_cmd(&HciCommand::LeReadLocalSupportedFeatures)?;
        let le_features = Cursor::new(&rp).read_u64::<LittleEndian>().map_err(short)?;
        self.info.le_features = LeFeatures::from_bits_retain(le_features);

        self.read_buffer_sizes()?;

        self.send_cmd(&HciCommand::SetEventMask {
            event_mask: EVENT_MASK_DEFAULT,
        })?;
        self.send_cmd(&HciCommand::LeSetEventMask {
            event_mask: LE_EVENT_MASK_DEFAULT,
        })?;

        if let Some(fc) = self.config.host_flow_control {
            self.send_cmd(&HciCommand::HostBufferSize {
                acl_mtu: fc.acl_mtu,
                sco_mtu: 0,
                acl_pkts: fc.acl_pkts,
                sco_pkts: 0,
            })?;
            self.send_cmd(&HciCommand::SetControllerToHostFlowControl { enable: true })?;
        }

        if self.info.le_features.contains(LeFeatures::EXT_ADV) {
            let rp = self.send_cmd(&HciCommand::LeReadMaxAdvDataLen)?;
            self.info.max_adv_data_len = Cursor::new(&rp).read_u16::<LittleEndian>().map_err(short)?;
            let rp = self.send_cmd(&HciCommand::LeReadNumAdvSets)?;
            self.info.num_adv_sets = Cursor::new(&rp).read_u8().map_err(short)?;
        }

        if self.config.privacy && self.info.le_features.contains(LeFeatures::PRIVACY) {
            let rp = self.send_cmd(&HciCommand::LeReadResolvingListSize)?;
            self.info.resolving_list_size = Cursor::new(&rp).read_u8().map_err(short)?;
            self.send_cmd(&HciCommand::LeClearResolvingList)?;
        }

        self.id_init()?;

        self.initialized = true;
        info!(
            "Controller {} up, LE features {:?}, ACL {}x{}",
            self.info.bd_addr, self.info.le_features, self.info.le_acl_pkts, self.info.le_acl_mtu
        );
        Ok(())
    }

    fn read_buffer_sizes(&mut self) -> Result<()> {
        if self.info.le_features.has_iso() {
            let rp = self.send_cmd(&HciCommand::LeReadBufferSizeV2)?;
            let mut cur = Cursor::new(&rp);
            self.info.le_acl_mtu = cur.read_u16::<LittleEndian>().map_err(short)?;
            self.info.le_acl_pkts = cur.read_u8().map_err(short)? as u16;
            self.info.iso_mtu = cur.read_u16::<LittleEndian>().map_err(short)?;
            self.info.iso_pkts = cur.read_u8().map_err(short)? as u16;
        } else {
            let rp = self.send_cmd(&HciCommand::LeReadBufferSize)?;
            let mut cur = Cursor::new(&rp);
            self.info.le_acl_mtu = cur.read_u16::<LittleEndian>().map_err(short)?;
            self.info.le_acl_pkts = cur.read_u8().map_err(short)? as u16;
        }

        let rp = self.send_cmd(&HciCommand::ReadBufferSize)?;
        let mut cur = Cursor::new(&rp);
        self.info.br_acl_mtu = cur.read_u16::<LittleEndian>().map_err(short)?;
        // Synchronous MTU
        cur.read_u8().map_err(short)?;
        self.info.br_acl_pkts = cur.read_u16::<LittleEndian>().map_err(short)?;

        let shared = self.info.le_acl_pkts == 0 || self.info.le_acl_mtu == 0;
        if shared {
            debug!("No dedicated LE buffers, sharing BR/EDR ACL buffers");
            self.info.le_acl_mtu = self.info.br_acl_mtu;
            self.info.le_acl_pkts = 0;
        }
        self.credits.reset(
            self.info.le_acl_pkts as usize,
            self.info.br_acl_pkts as usize,
            self.info.iso_pkts as usize,
            shared,
        );
        Ok(())
    }

    /// Tear down every connection and stop all radio activity
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::InvalidState);
        }
        info!("Shutting down host");

        self.adv_shutdown();
        self.scan_shutdown();

        for conn in self.conns.live() {
            let state = conn.lock().state;
            if state.has_handle() {
                conn.lock().err = HCI_ERR_LOCALHOST_TERM_CONN;
                self.conn_link_lost(&conn);
            } else if state.is_pending() {
                conn.lock().err = HCI_ERR_LOCALHOST_TERM_CONN;
                self.set_state_logged(&conn, crate::conn::ConnState::Disconnected);
            }
        }
        self.rx_queue.clear();
        self.handle_recycled();

        if let Err(e) = self.send_cmd(&HciCommand::Reset) {
            warn!("Controller reset on shutdown failed: {}", e);
        }
        self.initialized = false;
        Ok(())
    }

    /// Feed one packet from the controller, H4 type byte included
    pub fn recv(&mut self, packet: &[u8]) -> Result<()> {
        let (&kind, body) = packet
            .split_first()
            .ok_or(HciError::InvalidPacketFormat)?;

        match kind {
            HCI_EVENT_PKT => {
                let event = Event::decode(body)?;
                if event.is_priority() {
                    self.handle_priority_event(event);
                } else {
                    self.rx_queue.push_back(Inbound::Event(event));
                }
            }
            HCI_ACL_PKT => self.rx_queue.push_back(Inbound::Acl(body.to_vec())),
            HCI_ISO_PKT => debug!("Dropping ISO data packet of {} bytes", body.len()),
            _ => {
                warn!("Unknown packet type 0x{:02x}", kind);
                return Err(HciError::InvalidPacketFormat.into());
            }
        }
        Ok(())
    }

    /// Handle queued events and data, then send whatever is ready
    pub fn process(&mut self) {
        self.flush_tx_notify_all();

        while let Some(inbound) = self.rx_queue.pop_front() {
            match inbound {
                Inbound::Event(event) => self.handle_event(event),
                Inbound::Acl(data) => self.handle_acl(&data),
            }
            self.process_l2cap_actions();
        }

        self.process_l2cap_actions();
        self.process_tx();
        self.handle_recycled();
    }

    /// Run every timer that expired at `now`
    pub fn process_timeouts(&mut self, now: Instant) {
        self.l2cap.process_timeouts(now);
        self.conn_process_timeouts(now);
        self.adv_process_timeouts(now);
        self.scan_process_timeouts(now);

        if self.ids.rpa_timer.fire(now) {
            self.rpa_timeout();
        }

        self.process_l2cap_actions();
        self.process_tx();
        self.handle_recycled();
    }

    /// When [`Host::process_timeouts`] next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next = self.l2cap.next_deadline();
        next = earliest(next, self.ids.rpa_timer.deadline());
        next = earliest(next, self.adv_next_deadline());
        next = earliest(next, self.scan.limited_timer.deadline());
        for conn in self.conns.live() {
            let guard = conn.lock();
            next = earliest(next, guard.update_timer.deadline());
            next = earliest(next, guard.create_timer.deadline());
        }
        next
    }

    fn handle_priority_event(&mut self, event: Event) {
        match event {
            Event::CommandComplete { opcode, .. } | Event::CommandStatus { opcode, .. } => {
                trace!("Unsolicited completion for command 0x{:04x}", opcode);
            }
            // Data received before the disconnection still reaches the link.
            Event::DisconnectionComplete { handle, .. } if self.rx_queued_for(handle) => {
                debug!("Deferring disconnection of handle {} behind queued data", handle);
                self.rx_queue.push_back(Inbound::Event(event));
            }
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => self.handle_disconn_complete(status, handle, reason),
            Event::NumberOfCompletedPackets(completed) => self.handle_num_completed(&completed),
            other => self.rx_queue.push_back(Inbound::Event(other)),
        }
    }

    fn rx_queued_for(&self, handle: u16) -> bool {
        self.rx_queue.iter().any(|inbound| match inbound {
            Inbound::Acl(data) => AclHeader::parse(data).is_ok_and(|h| h.handle == handle),
            _ => false,
        })
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ConnectionRequest { bd_addr, link_type } => {
                self.handle_br_conn_request(bd_addr, link_type)
            }
            Event::ConnectionComplete {
                status,
                handle,
                bd_addr,
                link_type,
            } => self.handle_br_conn_complete(status, handle, bd_addr, link_type),
            Event::EncryptionChange {
                status,
                handle,
                enabled,
            } => self.handle_encrypt_change(status, handle, enabled),
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => self.handle_disconn_complete(status, handle, reason),
            Event::NumberOfCompletedPackets(completed) => self.handle_num_completed(&completed),
            Event::HardwareError { code } => error!("Controller hardware error 0x{:02x}", code),
            Event::DataBufferOverflow { link_type } => {
                warn!("Controller data buffer overflow on link type {}", link_type)
            }
            Event::CommandComplete { .. } | Event::CommandStatus { .. } => {}
            Event::Le(le) => self.handle_le_event(le),
            Event::Unknown { code, params } => {
                debug!("Unhandled event 0x{:02x}: {}", code, hex::encode(params))
            }
        }
    }

    fn handle_le_event(&mut self, event: LeEvent) {
        match event {
            LeEvent::ConnectionComplete(evt) => self.handle_le_conn_complete(evt),
            LeEvent::AdvertisingReport(reports) => self.handle_adv_reports(reports),
            LeEvent::ExtAdvertisingReport(reports) => self.handle_ext_adv_reports(reports),
            LeEvent::ConnectionUpdateComplete {
                status,
                handle,
                interval,
                latency,
                timeout,
            } => self.handle_conn_update_complete(status, handle, interval, latency, timeout),
            LeEvent::RemoteFeaturesComplete {
                status,
                handle,
                features,
            } => self.handle_remote_features(status, handle, features),
            LeEvent::RemoteConnParamRequest {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => self.handle_remote_param_request(
                handle,
                crate::conn::ConnParams {
                    interval_min,
                    interval_max,
                    latency,
                    timeout,
                },
            ),
            LeEvent::DataLengthChange {
                handle,
                max_tx_octets,
                max_tx_time,
                max_rx_octets,
                max_rx_time,
            } => self.handle_data_len_change(
                handle,
                crate::conn::DataLen {
                    tx_octets: max_tx_octets,
                    tx_time: max_tx_time,
                    rx_octets: max_rx_octets,
                    rx_time: max_rx_time,
                },
            ),
            LeEvent::PhyUpdateComplete {
                status,
                handle,
                tx_phy,
                rx_phy,
            } => self.handle_phy_update(status, handle, tx_phy, rx_phy),
            LeEvent::PeriodicSyncEstablished(evt) => self.handle_sync_established(evt),
            LeEvent::PeriodicAdvertisingReport {
                sync_handle,
                tx_power,
                rssi,
                data_status,
                data,
            } => self.handle_periodic_report(sync_handle, tx_power, rssi, data_status, data),
            LeEvent::PeriodicSyncLost { sync_handle } => self.handle_sync_lost(sync_handle),
            LeEvent::PastReceived(evt) => self.handle_past_received(evt),
            LeEvent::ScanTimeout => self.handle_scan_timeout(),
            LeEvent::AdvSetTerminated {
                status,
                adv_handle,
                conn_handle,
                num_events,
            } => self.handle_adv_set_terminated(status, adv_handle, conn_handle, num_events),
            LeEvent::Unknown { subevent, params } => {
                debug!("Unhandled LE event 0x{:02x}: {}", subevent, hex::encode(params))
            }
        }
    }
}
