//! Host configuration
//!
//! Pool sizes, timers and protocol defaults used by [`crate::Host`].

use std::time::Duration;

use crate::conn::ConnParams;
use crate::error::{Error, Result};
use crate::l2cap::constants::{L2CAP_LE_MIN_MPS, L2CAP_LE_MIN_MTU, L2CAP_LE_MAX_MPS};

/// Controller-to-host flow control settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFlowControl {
    /// Largest ACL payload the host accepts
    pub acl_mtu: u16,
    /// Number of ACL buffers the host provides
    pub acl_pkts: u16,
}

/// L2CAP defaults for locally created channels
#[derive(Debug, Clone, Copy)]
pub struct L2capConfig {
    /// MTU advertised to peers for credit based channels
    pub rx_mtu: u16,
    /// MPS advertised to peers for credit based channels
    pub rx_mps: u16,
    /// Credits granted when a channel is set up, and restored after each SDU
    pub initial_credits: u16,
    /// Time to wait for a signalling response
    pub rtx_timeout: Duration,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            rx_mtu: 256,
            rx_mps: 247,
            initial_credits: 10,
            rtx_timeout: Duration::from_secs(2),
        }
    }
}

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Size of the connection pool
    pub max_conn: usize,
    /// Number of advertising sets
    pub max_adv_sets: usize,
    /// Number of periodic advertising syncs
    pub max_periodic_syncs: usize,
    /// Number of local identities
    pub id_max: usize,
    /// Number of ACL TX contexts shared by all connections
    pub acl_tx_contexts: usize,
    /// Use resolvable private addresses
    pub privacy: bool,
    /// Lifetime of a resolvable private address
    pub rpa_timeout: Duration,
    /// Name placed in advertising data when requested
    pub device_name: String,
    /// L2CAP channel defaults
    pub l2cap: L2capConfig,
    /// Delay before a peripheral asks for its preferred connection parameters
    pub conn_param_update_timeout: Duration,
    /// Parameters a peripheral asks for once connected
    pub peripheral_pref_params: Option<ConnParams>,
    /// How long an initiator may wait for a connection
    pub create_conn_timeout: Duration,
    /// Largest extended advertising data block
    pub ext_adv_max_data_len: usize,
    /// Largest reassembled extended advertising report
    pub ext_scan_buf_len: usize,
    /// Controller-to-host flow control, disabled when `None`
    pub host_flow_control: Option<HostFlowControl>,
    /// Restart legacy advertising when a connection slot is freed.
    ///
    /// Deprecated behaviour kept for existing deployments, off by default.
    pub adv_auto_resume: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_conn: 4,
            max_adv_sets: 2,
            max_periodic_syncs: 1,
            id_max: 1,
            acl_tx_contexts: 8,
            privacy: false,
            rpa_timeout: Duration::from_secs(900),
            device_name: String::from("bluecore"),
            l2cap: L2capConfig::default(),
            conn_param_update_timeout: Duration::from_secs(5),
            peripheral_pref_params: None,
            create_conn_timeout: Duration::from_secs(3),
            ext_adv_max_data_len: 1650,
            ext_scan_buf_len: 1650,
            host_flow_control: None,
            adv_auto_resume: false,
        }
    }
}

impl HostConfig {
    /// Check the configuration for values the host cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_conn == 0 {
            return Err(Error::Config("max_conn must be at least 1".into()));
        }
        if self.id_max == 0 {
            return Err(Error::Config("id_max must be at least 1".into()));
        }
        if self.max_adv_sets == 0 || self.max_adv_sets > 0xEF {
            return Err(Error::Config("max_adv_sets must be within 1..=239".into()));
        }
        if self.acl_tx_contexts == 0 {
            return Err(Error::Config("acl_tx_contexts must be at least 1".into()));
        }
        if self.l2cap.rx_mtu < L2CAP_LE_MIN_MTU {
            return Err(Error::Config(format!(
                "L2CAP rx_mtu {} below minimum {}",
                self.l2cap.rx_mtu, L2CAP_LE_MIN_MTU
            )));
        }
        if self.l2cap.rx_mps < L2CAP_LE_MIN_MPS || self.l2cap.rx_mps > L2CAP_LE_MAX_MPS {
            return Err(Error::Config(format!(
                "L2CAP rx_mps {} outside {}..={}",
                self.l2cap.rx_mps, L2CAP_LE_MIN_MPS, L2CAP_LE_MAX_MPS
            )));
        }
        if self.l2cap.initial_credits == 0 {
            return Err(Error::Config("L2CAP initial_credits must be at least 1".into()));
        }
        let rtx = self.l2cap.rtx_timeout;
        if rtx < Duration::from_secs(1) || rtx > Duration::from_secs(60) {
            return Err(Error::Config("L2CAP rtx_timeout must be within 1..=60 s".into()));
        }
        let rpa = self.rpa_timeout.as_secs();
        if rpa == 0 || rpa > 0xA1B8 {
            return Err(Error::Config("rpa_timeout must be within 1..=41400 s".into()));
        }
        if let Some(params) = &self.peripheral_pref_params {
            params.validate()?;
        }
        if let Some(fc) = &self.host_flow_control {
            if fc.acl_pkts == 0 || fc.acl_mtu == 0 {
                return Err(Error::Config("host flow control needs non-zero buffers".into()));
            }
        }
        Ok(())
    }
}
