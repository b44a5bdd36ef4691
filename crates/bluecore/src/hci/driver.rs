//! Controller driver boundary
//!
//! The host core never touches a transport directly. It talks to the
//! controller through [`HciDriver`], which sends commands and data packets and
//! reports the outcome of each command synchronously.

use crate::error::HciError;
use crate::hci::acl::{AclHeader, IsoHeader};
use crate::hci::event::Event;
use crate::hci::packet::HciCommand;

/// Outcome of a command, taken from its Command Complete or Command Status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub opcode: u16,
    pub status: u8,
    /// Return parameters following the status byte (empty for Command Status)
    pub params: Vec<u8>,
}

impl CommandComplete {
    pub fn success(opcode: u16, params: Vec<u8>) -> Self {
        Self {
            opcode,
            status: 0,
            params,
        }
    }

    /// Extract the completion for `opcode` from a decoded event
    pub fn from_event(opcode: u16, event: &Event) -> Option<Self> {
        match event {
            Event::CommandComplete {
                opcode: op,
                return_params,
                ..
            } if *op == opcode => {
                let (status, params) = match return_params.split_first() {
                    Some((status, rest)) => (*status, rest.to_vec()),
                    None => (0, Vec::new()),
                };
                Some(Self {
                    opcode,
                    status,
                    params,
                })
            }
            Event::CommandStatus {
                opcode: op, status, ..
            } if *op == opcode => Some(Self {
                opcode,
                status: *status,
                params: Vec::new(),
            }),
            _ => None,
        }
    }
}

/// Transport to a Bluetooth controller
pub trait HciDriver {
    /// Send a command and wait for its completion or status event
    fn send_command(&mut self, command: &HciCommand) -> Result<CommandComplete, HciError>;

    /// Send a command the controller never answers, such as
    /// Host Number Of Completed Packets
    fn send_unacked(&mut self, command: &HciCommand) -> Result<(), HciError> {
        self.send_command(command).map(|_| ())
    }

    /// Send one ACL data fragment
    fn send_acl(&mut self, header: AclHeader, data: &[u8]) -> Result<(), HciError>;

    /// Send one ISO data packet
    fn send_iso(&mut self, header: IsoHeader, data: &[u8]) -> Result<(), HciError> {
        let _ = (header, data);
        Err(HciError::Unsupported)
    }
}
