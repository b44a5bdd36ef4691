//! Linux raw HCI socket transport
//!
//! This module provides a wrapper around the raw HCI socket interface and
//! implements [`HciDriver`] on top of it. Packets that arrive while a command
//! is waiting for its completion are kept in a backlog so the caller can feed
//! them to the host afterwards.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::HciError;
use crate::hci::acl::{AclHeader, IsoHeader};
use crate::hci::constants::{HCI_ACL_PKT, HCI_EVENT_PKT, HCI_ISO_PKT};
use crate::hci::driver::{CommandComplete, HciDriver};
use crate::hci::event::Event;
use crate::hci::packet::HciCommand;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_USER: u16 = 1;

/// Largest packet the socket hands back (ACL with a 1021 byte payload)
const MAX_PACKET_SIZE: usize = 1 + 4 + 1021;

/// How long a command may take before the controller is considered gone
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

// Define the sockaddr_hci structure
#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Represents an HCI user channel socket
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
    backlog: VecDeque<Vec<u8>>,
}

impl HciSocket {
    /// Opens the controller `dev_id` exclusively through the user channel
    pub fn open(dev_id: u16) -> Result<Self, HciError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI) };

        if fd < 0 {
            return Err(HciError::SocketError(std::io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_USER,
        };

        let result = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(HciError::BindError(err));
        }

        Ok(HciSocket {
            fd,
            backlog: VecDeque::new(),
        })
    }

    /// Wait up to `timeout` for the socket to become readable
    fn poll_readable(&self, timeout: Duration) -> Result<bool, HciError> {
        let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_SET(self.fd, &mut read_fds);
        }

        let mut timeout_val = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let result = unsafe {
            libc::select(
                self.fd + 1,
                &mut read_fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut timeout_val,
            )
        };

        if result < 0 {
            return Err(HciError::ReceiveError(std::io::Error::last_os_error()));
        }
        Ok(result > 0)
    }

    fn read_raw(&self) -> Result<Vec<u8>, HciError> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let bytes_read = unsafe {
            libc::read(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };

        if bytes_read < 0 {
            return Err(HciError::ReceiveError(std::io::Error::last_os_error()));
        }
        if bytes_read < 2 {
            return Err(HciError::InvalidPacketFormat);
        }

        buffer.truncate(bytes_read as usize);
        Ok(buffer)
    }

    /// Read the next packet (H4 type byte included), serving the backlog first
    pub fn read_packet_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, HciError> {
        if let Some(packet) = self.backlog.pop_front() {
            return Ok(Some(packet));
        }
        if let Some(timeout) = timeout {
            if !self.poll_readable(timeout)? {
                return Ok(None);
            }
        }
        self.read_raw().map(Some)
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), HciError> {
        match unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        } {
            -1 => Err(HciError::SendError(std::io::Error::last_os_error())),
            _ => Ok(()),
        }
    }
}

impl HciDriver for HciSocket {
    fn send_command(&mut self, command: &HciCommand) -> Result<CommandComplete, HciError> {
        let opcode = command.opcode();
        let packet = command.to_packet();
        trace!("HCI command 0x{:04x}: {}", opcode, hex::encode(&packet[1..]));
        self.write_packet(&packet)?;

        let deadline = Instant::now() + COMMAND_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.poll_readable(remaining)? {
                return Err(HciError::Timeout(opcode));
            }

            let packet = self.read_raw()?;
            if packet[0] == HCI_EVENT_PKT {
                match Event::decode(&packet[1..]) {
                    Ok(event) => {
                        if let Some(complete) = CommandComplete::from_event(opcode, &event) {
                            return Ok(complete);
                        }
                    }
                    Err(err) => warn!("Dropping malformed event: {}", err),
                }
            }
            self.backlog.push_back(packet);
        }
    }

    fn send_unacked(&mut self, command: &HciCommand) -> Result<(), HciError> {
        let packet = command.to_packet();
        trace!("HCI command 0x{:04x}: {}", command.opcode(), hex::encode(&packet[1..]));
        self.write_packet(&packet)
    }

    fn send_acl(&mut self, header: AclHeader, data: &[u8]) -> Result<(), HciError> {
        let mut packet = Vec::with_capacity(1 + 4 + data.len());
        packet.push(HCI_ACL_PKT);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(data);
        self.write_packet(&packet)
    }

    fn send_iso(&mut self, header: IsoHeader, data: &[u8]) -> Result<(), HciError> {
        let mut packet = Vec::with_capacity(1 + 4 + data.len());
        packet.push(HCI_ISO_PKT);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(data);
        self.write_packet(&packet)
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
