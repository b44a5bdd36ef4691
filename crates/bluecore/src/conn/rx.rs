//! Inbound ACL data
//!
//! Controller fragments are reassembled into complete L2CAP PDUs per
//! connection before they are handed to the channel layer.

use log::{debug, trace, warn};

use super::ConnState;
use crate::hci::acl::AclHeader;
use crate::hci::constants::HCI_ACL_HDR_SIZE;
use crate::hci::{HciCommand, HciDriver};
use crate::host::Host;
use crate::l2cap::constants::L2CAP_BASIC_HEADER_SIZE;

impl<D: HciDriver> Host<D> {
    /// Handle one ACL packet without its H4 type byte
    pub(crate) fn handle_acl(&mut self, data: &[u8]) {
        let header = match AclHeader::parse(data) {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping malformed ACL packet: {}", e);
                return;
            }
        };
        let payload = &data[HCI_ACL_HDR_SIZE..];
        if payload.len() != header.length as usize {
            warn!(
                "ACL length mismatch on handle {}: header {} payload {}",
                header.handle,
                header.length,
                payload.len()
            );
            return;
        }

        self.ack_host_flow(header.handle);

        let Some(conn) = self
            .conn_by_handle(header.handle)
            .filter(|conn| conn.lock().state == ConnState::Connected)
        else {
            debug!("ACL data for unknown handle {}", header.handle);
            return;
        };
        self.flush_tx_notify(&conn);
        trace!("{}: ACL in {:?}: {}", conn.id(), header.boundary, hex::encode(payload));

        let complete = {
            let mut c = conn.lock();
            if header.boundary.is_start() {
                if !c.rx_buf.is_empty() {
                    warn!("{}: discarding {} bytes of unfinished PDU", conn.id(), c.rx_buf.len());
                    c.rx_buf.clear();
                }
                c.rx_buf.extend_from_slice(payload);
            } else if c.rx_buf.is_empty() {
                warn!("{}: continuation without start fragment", conn.id());
            } else {
                c.rx_buf.extend_from_slice(payload);
            }

            if c.rx_buf.len() < L2CAP_BASIC_HEADER_SIZE {
                None
            } else {
                let total = L2CAP_BASIC_HEADER_SIZE + u16::from_le_bytes([c.rx_buf[0], c.rx_buf[1]]) as usize;
                match c.rx_buf.len().cmp(&total) {
                    std::cmp::Ordering::Less => None,
                    std::cmp::Ordering::Equal => Some(std::mem::take(&mut c.rx_buf)),
                    std::cmp::Ordering::Greater => {
                        warn!(
                            "{}: PDU overflow, {} bytes for a {} byte PDU",
                            conn.id(),
                            c.rx_buf.len(),
                            total
                        );
                        c.rx_buf.clear();
                        None
                    }
                }
            }
        };

        if let Some(pdu) = complete {
            self.l2cap.recv(conn.id(), &pdu);
        }
    }

    /// Return the host buffer of one ACL packet to the controller
    fn ack_host_flow(&mut self, handle: u16) {
        if self.config.host_flow_control.is_none() {
            return;
        }
        let command = HciCommand::HostNumberOfCompletedPackets {
            completed: vec![(handle, 1)],
        };
        if let Err(e) = self.driver.send_unacked(&command) {
            warn!("Host flow control ack for handle {} failed: {}", handle, e);
        }
    }
}
