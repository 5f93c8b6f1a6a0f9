//! HTTP/HTTPS server lifecycle.
//!
//! Two listeners are managed:
//! - Loopback: `127.0.0.1` on an OS-assigned port, plain HTTP, always present
//!   while running. Losing it is fatal since the UI has no other channel.
//! - Export: all interfaces on a fixed port, TLS with the persisted identity.
//!   Best effort: any failure degrades to loopback-only with a warning.
//!
//! Transitions are serialized. A `start` or `stop` issued while another one is
//! in flight is rejected with [`ServerError::TransitionInProgress`]; changing
//! mode is `stop` followed by `start`, never a mutation of live listeners.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::{self, RustlsConfig};
use axum_server::Handle;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::identity::{Acquired, CertificateStore, IdentityError, TlsIdentity};
use crate::routes::Routers;
use crate::state::{ServerMode, ServerPhase, ServerState};

/// Which listener an error or log line refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    Loopback,
    Export,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerRole::Loopback => f.write_str("loopback"),
            ListenerRole::Export => f.write_str("export"),
        }
    }
}

/// Server lifecycle error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {role} listener on {addr}: {source}")]
    ListenerBindFailure {
        role: ListenerRole,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("A server start or stop is already in progress")]
    TransitionInProgress,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("TLS identity unavailable: {0}")]
    Identity(#[from] IdentityError),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),
}

/// Listener settings resolved from configuration at startup
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub export_port: u16,
    pub shutdown_grace: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            export_port: config.export_port,
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// What happened to the export listener during `start`
#[derive(Debug)]
pub enum ExportOutcome {
    /// Mode is `Local`
    Disabled,
    /// Serving TLS on `addr`
    Listening {
        addr: SocketAddr,
        identity: TlsIdentity,
        /// The identity was created by this start and has not been shown to the operator
        newly_generated: bool,
    },
    /// Export failed; the loopback listener serves alone
    Unavailable(ServerError),
}

/// Result of a successful `start`
#[derive(Debug)]
pub struct StartReport {
    pub mode: ServerMode,
    pub loopback_addr: SocketAddr,
    pub export: ExportOutcome,
}

impl StartReport {
    /// URL the UI surface loads
    pub fn loopback_url(&self) -> String {
        format!("http://{}/", self.loopback_addr)
    }
}

struct ServingListener {
    role: ListenerRole,
    addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<()>,
}

struct RunningServer {
    mode: ServerMode,
    listeners: Vec<ServingListener>,
}

struct PreparedExport {
    listener: TcpListener,
    addr: SocketAddr,
    tls: RustlsConfig,
    acquired: Acquired,
}

/// Owns the listeners and is the only writer of [`ServerState`].
pub struct ServerLifecycle {
    settings: ServerSettings,
    certificates: CertificateStore,
    routers: Routers,
    state: watch::Sender<ServerState>,
    running: Mutex<Option<RunningServer>>,
}

impl ServerLifecycle {
    pub fn new(
        settings: ServerSettings,
        certificates: CertificateStore,
        routers: Routers,
        state: watch::Sender<ServerState>,
    ) -> Self {
        Self {
            settings,
            certificates,
            routers,
            state,
            running: Mutex::new(None),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    /// Bind the listeners for `mode` and start serving.
    ///
    /// `on_ready` runs exactly once, after every listener is bound and before
    /// any accept loop runs. It does not run when `start` fails.
    pub async fn start<F>(&self, mode: ServerMode, on_ready: F) -> Result<StartReport, ServerError>
    where
        F: FnOnce(&StartReport),
    {
        let mut slot = self
            .running
            .try_lock()
            .map_err(|_| ServerError::TransitionInProgress)?;
        if slot.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        self.publish(ServerState {
            phase: ServerPhase::Starting,
            ..ServerState::stopped(mode)
        });

        let loopback = bind_listener(
            ListenerRole::Loopback,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        );
        let (loopback, loopback_addr) = match loopback {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(error = %e, "Loopback listener failed to bind");
                self.publish(ServerState::stopped(mode));
                return Err(e);
            }
        };

        let mut export = None;
        let outcome = if mode.exports() {
            match self.prepare_export().await {
                Ok(prepared) => {
                    let outcome = ExportOutcome::Listening {
                        addr: prepared.addr,
                        newly_generated: prepared.acquired.was_generated(),
                        identity: prepared.acquired.into_identity(),
                    };
                    export = Some((prepared.listener, prepared.addr, prepared.tls));
                    outcome
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        port = self.settings.export_port,
                        "Export listener unavailable, serving on loopback only"
                    );
                    ExportOutcome::Unavailable(e)
                }
            }
        } else {
            ExportOutcome::Disabled
        };

        let report = StartReport {
            mode,
            loopback_addr,
            export: outcome,
        };

        self.publish(ServerState {
            mode,
            phase: ServerPhase::Running,
            loopback_addr: Some(loopback_addr),
            export_addr: export.as_ref().map(|(_, addr, _)| *addr),
        });

        on_ready(&report);

        let mut listeners = vec![spawn_plain(
            loopback,
            loopback_addr,
            self.routers.loopback.clone(),
        )];
        if let Some((listener, addr, tls)) = export {
            listeners.push(spawn_tls(listener, addr, tls, self.routers.export.clone()));
        }

        for listener in &listeners {
            tracing::info!(role = %listener.role, addr = %listener.addr, "Listener serving");
        }

        *slot = Some(RunningServer { mode, listeners });
        Ok(report)
    }

    /// Gracefully stop every listener.
    ///
    /// New connections are refused immediately; in-flight requests get the
    /// configured grace period before their connections are closed. Calling
    /// this when nothing runs is a no-op.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut slot = self
            .running
            .try_lock()
            .map_err(|_| ServerError::TransitionInProgress)?;
        let Some(running) = slot.take() else {
            return Ok(());
        };

        let current = self.state();
        self.publish(ServerState {
            phase: ServerPhase::Stopping,
            ..current
        });

        let grace = self.settings.shutdown_grace;
        tracing::info!(
            grace_secs = grace.as_secs_f64(),
            "Stopping server, waiting for in-flight requests"
        );

        for listener in &running.listeners {
            listener.handle.graceful_shutdown(Some(grace));
        }

        let (roles, tasks): (Vec<_>, Vec<_>) = running
            .listeners
            .into_iter()
            .map(|listener| (listener.role, listener.task))
            .unzip();
        for (role, result) in roles
            .into_iter()
            .zip(futures::future::join_all(tasks).await)
        {
            if let Err(e) = result {
                tracing::warn!(role = %role, error = %e, "Listener task ended abnormally");
            }
        }

        self.publish(ServerState::stopped(running.mode));
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Stop, then start again with `mode`.
    pub async fn restart<F>(&self, mode: ServerMode, on_ready: F) -> Result<StartReport, ServerError>
    where
        F: FnOnce(&StartReport),
    {
        self.stop().await?;
        self.start(mode, on_ready).await
    }

    async fn prepare_export(&self) -> Result<PreparedExport, ServerError> {
        let acquired = self.certificates.acquire_off_thread().await?;
        acquired
            .identity()
            .check_validity(self.certificates.path(), Utc::now())?;

        let tls = acquired
            .identity()
            .rustls_config()
            .await
            .map_err(|e| ServerError::TlsConfig(e.to_string()))?;

        let (listener, addr) = bind_listener(
            ListenerRole::Export,
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.settings.export_port)),
        )?;

        Ok(PreparedExport {
            listener,
            addr,
            tls,
            acquired,
        })
    }

    fn publish(&self, state: ServerState) {
        tracing::debug!(phase = ?state.phase, mode = ?state.mode, "Server state changed");
        self.state.send_replace(state);
    }
}

fn bind_listener(
    role: ListenerRole,
    addr: SocketAddr,
) -> Result<(TcpListener, SocketAddr), ServerError> {
    let failure = |source| ServerError::ListenerBindFailure { role, addr, source };

    let listener = TcpListener::bind(addr).map_err(failure)?;
    listener.set_nonblocking(true).map_err(failure)?;
    let local = listener.local_addr().map_err(failure)?;
    Ok((listener, local))
}

fn spawn_plain(listener: TcpListener, addr: SocketAddr, app: Router) -> ServingListener {
    let handle = Handle::new();
    let server = axum_server::from_tcp(listener).handle(handle.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = server.serve(app.into_make_service()).await {
            tracing::error!(error = %e, %addr, "Loopback listener failed");
        }
    });

    ServingListener {
        role: ListenerRole::Loopback,
        addr,
        handle,
        task,
    }
}

fn spawn_tls(
    listener: TcpListener,
    addr: SocketAddr,
    tls: RustlsConfig,
    app: Router,
) -> ServingListener {
    let handle = Handle::new();
    let server = tls_rustls::from_tcp_rustls(listener, tls).handle(handle.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = server.serve(app.into_make_service()).await {
            tracing::error!(error = %e, %addr, "Export listener failed");
        }
    });

    ServingListener {
        role: ListenerRole::Export,
        addr,
        handle,
        task,
    }
}
