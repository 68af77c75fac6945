//! Link State
//!
//! Tracks the transport's session lifecycle and publishes the coarse
//! [`ConnectionStatus`] the rest of the agent observes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

use super::transport::ConnectionStatus;

/// Session lifecycle of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Reconnecting => write!(f, "Reconnecting"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

struct LinkInner {
    current: LinkState,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
}

/// Thread-safe link state tracker
#[derive(Clone)]
pub struct LinkStateManager {
    inner: Arc<RwLock<LinkInner>>,
    status: watch::Sender<ConnectionStatus>,
}

impl LinkStateManager {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(RwLock::new(LinkInner {
                current: LinkState::Disconnected,
                last_connected: None,
                connection_attempts: 0,
            })),
            status,
        }
    }

    pub fn current(&self) -> LinkState {
        self.inner.read().current
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Observe connected/disconnected changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Move to `next`; invalid transitions are ignored and return false
    pub fn transition_to(&self, next: LinkState, reason: Option<&str>) -> bool {
        let mut inner = self.inner.write();
        let previous = inner.current;
        if !is_valid_transition(previous, next) {
            return false;
        }

        inner.current = next;
        match next {
            LinkState::Connected => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            LinkState::Connecting | LinkState::Reconnecting => {
                inner.connection_attempts += 1;
            }
            _ => {}
        }

        tracing::info!(
            from = %previous,
            to = %next,
            attempts = inner.connection_attempts,
            reason = reason.unwrap_or(""),
            "Link state transition"
        );

        let status = if next == LinkState::Connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });

        true
    }

    pub fn set_connecting(&self) {
        self.transition_to(LinkState::Connecting, None);
    }

    pub fn set_connected(&self) {
        self.transition_to(LinkState::Connected, Some("session established"));
    }

    pub fn set_disconnected(&self, reason: &str) {
        self.transition_to(LinkState::Disconnected, Some(reason));
    }

    pub fn set_reconnecting(&self) {
        self.transition_to(LinkState::Reconnecting, None);
    }

    pub fn set_closed(&self) {
        self.transition_to(LinkState::Closed, Some("transport closed"));
    }
}

impl Default for LinkStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_transition(from: LinkState, to: LinkState) -> bool {
    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (_, LinkState::Closed)
            | (LinkState::Disconnected, LinkState::Connecting)
            | (LinkState::Disconnected, LinkState::Reconnecting)
            | (LinkState::Connecting, LinkState::Connected)
            | (LinkState::Connecting, LinkState::Disconnected)
            | (LinkState::Connected, LinkState::Disconnected)
            | (LinkState::Reconnecting, LinkState::Connecting)
            | (LinkState::Reconnecting, LinkState::Disconnected)
    )
}
