//! Connection states and the transitions between them

use std::fmt;

/// State of a connection object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    /// Central waiting for the controller to establish the link
    Initiating,
    /// Central initiating towards any device on the filter accept list
    InitiatingFilterList,
    /// Scanning for the peer before the create connection command is sent
    ScanBeforeInitiating,
    /// Undirected connectable advertising is running for this object
    AdvConnectable,
    /// Directed connectable advertising is running for this object
    AdvDirConnectable,
    Connected,
    /// Disconnect command sent, waiting for Disconnection Complete
    Disconnecting,
    /// The controller has dropped the link, host side cleanup pending
    DisconnectComplete,
}

impl ConnState {
    /// States in which a connection attempt is under way
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Initiating
                | Self::InitiatingFilterList
                | Self::ScanBeforeInitiating
                | Self::AdvConnectable
                | Self::AdvDirConnectable
        )
    }

    /// States in which the controller handle is valid
    pub fn has_handle(self) -> bool {
        matches!(self, Self::Connected | Self::Disconnecting)
    }

    /// Whether the state machine allows going from `self` to `to`
    pub fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;

        match self {
            Disconnected => matches!(
                to,
                Initiating
                    | InitiatingFilterList
                    | ScanBeforeInitiating
                    | AdvConnectable
                    | AdvDirConnectable
            ),
            ScanBeforeInitiating => matches!(to, Initiating | Disconnected),
            Initiating | InitiatingFilterList => {
                matches!(to, Connected | Disconnected | Disconnecting)
            }
            AdvConnectable | AdvDirConnectable => matches!(to, Connected | Disconnected),
            Connected => matches!(to, Disconnecting | DisconnectComplete),
            Disconnecting => matches!(to, DisconnectComplete | Disconnected),
            DisconnectComplete => to == Disconnected,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Initiating => "initiating",
            Self::InitiatingFilterList => "initiating-filter-list",
            Self::ScanBeforeInitiating => "scan-before-initiating",
            Self::AdvConnectable => "adv-connectable",
            Self::AdvDirConnectable => "adv-dir-connectable",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::DisconnectComplete => "disconnect-complete",
        };
        f.write_str(name)
    }
}
