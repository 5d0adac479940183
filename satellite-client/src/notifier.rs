//! Connectivity notifications.

use std::fmt;

/// Connection state reported to a [`ConnectivityNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Connected,
    Error,
    Disconnected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Connected => write!(f, "connected"),
            ConnectivityState::Error => write!(f, "error"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Observer of socket-level connectivity changes.
///
/// Reconnecting is up to the observer; the client never reconnects on its own.
pub trait ConnectivityNotifier: Send + Sync {
    fn connectivity_state_change(&self, db_name: &str, state: ConnectivityState);
}

/// Logs connectivity changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ConnectivityNotifier for TracingNotifier {
    fn connectivity_state_change(&self, db_name: &str, state: ConnectivityState) {
        match state {
            ConnectivityState::Connected => tracing::info!("{}: connected", db_name),
            ConnectivityState::Error => tracing::warn!("{}: connection error", db_name),
            ConnectivityState::Disconnected => tracing::info!("{}: disconnected", db_name),
        }
    }
}
