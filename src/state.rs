//! Server state and shared application state for request handlers.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::orchestrator::HostControl;

/// Which listeners the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Loopback listener only
    Local,
    /// Loopback listener plus the TLS export listener on all interfaces
    LocalAndExported,
}

impl ServerMode {
    pub fn from_export_flag(export: bool) -> Self {
        if export {
            ServerMode::LocalAndExported
        } else {
            ServerMode::Local
        }
    }

    pub fn exports(self) -> bool {
        self == ServerMode::LocalAndExported
    }
}

/// Lifecycle phase: `Stopped → Starting → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of the server, published by the lifecycle and read everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerState {
    pub mode: ServerMode,
    pub phase: ServerPhase,
    /// Bound whenever the phase is `Running`
    pub loopback_addr: Option<SocketAddr>,
    /// Bound only in `LocalAndExported` mode, and only if the bind succeeded
    pub export_addr: Option<SocketAddr>,
}

impl ServerState {
    pub fn stopped(mode: ServerMode) -> Self {
        Self {
            mode,
            phase: ServerPhase::Stopped,
            loopback_addr: None,
            export_addr: None,
        }
    }

    pub fn running(&self) -> bool {
        self.phase == ServerPhase::Running
    }
}

/// Shared application state, cloned into every handler.
///
/// Handlers never own the server: they read its state through a watch
/// receiver and ask the orchestrator for transitions through `control`.
#[derive(Clone)]
pub struct AppState {
    pub server: watch::Receiver<ServerState>,
    pub control: HostControl,
    pub version: &'static str,
}

impl AppState {
    pub fn new(server: watch::Receiver<ServerState>, control: HostControl) -> Self {
        Self {
            server,
            control,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_export_flag() {
        assert_eq!(ServerMode::from_export_flag(false), ServerMode::Local);
        assert_eq!(
            ServerMode::from_export_flag(true),
            ServerMode::LocalAndExported
        );
        assert!(ServerMode::LocalAndExported.exports());
        assert!(!ServerMode::Local.exports());
    }

    #[test]
    fn test_stopped_state_has_no_listeners() {
        let state = ServerState::stopped(ServerMode::LocalAndExported);
        assert!(!state.running());
        assert!(state.loopback_addr.is_none());
        assert!(state.export_addr.is_none());
    }

    #[test]
    fn test_mode_serializes_snake_case() {
        let json = serde_json::to_string(&ServerMode::LocalAndExported).unwrap();
        assert_eq!(json, "\"local_and_exported\"");
        let mode: ServerMode = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(mode, ServerMode::Local);
    }
}
