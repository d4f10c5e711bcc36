use crate::negotiation::NegotiationState;
use crate::transport::IceState;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub negotiation: NegotiationState,
    pub ice_state: IceState,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            negotiation: NegotiationState::Idle,
            ice_state: IceState::New,
            last_error: None,
        }
    }
}

/// Observable status of one peer connection.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_negotiation(&self, state: NegotiationState) {
        self.status.send_modify(|status| {
            status.negotiation = state;
        });
    }

    /// Returns the derived connection state when it changed.
    pub fn update_ice_state(&self, state: IceState) -> Option<ConnectionState> {
        let mut changed = None;
        self.status.send_modify(|status| {
            status.ice_state = state;
            let next = match state {
                IceState::Connected | IceState::Completed => ConnectionState::Connected,
                IceState::Failed => ConnectionState::Failed,
                IceState::Disconnected | IceState::Closed => ConnectionState::Disconnected,
                IceState::New | IceState::Checking => ConnectionState::Connecting,
            };
            if next != status.state {
                status.state = next;
                changed = Some(next);
            }
        });
        changed
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.state = ConnectionState::Failed;
        });
    }

    pub fn close(&self) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.ice_state = IceState::Closed;
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
