//! Host orchestration.
//!
//! The orchestrator owns the server lifecycle and is the only component that
//! drives its transitions. Everything else talks to it through messages:
//! handlers and the UI send [`HostCommand`]s through a [`HostControl`], and
//! the orchestrator reports back to the operator through the [`UiHandle`].
//! Commands are processed one at a time, so transitions never interleave.

use std::future::Future;

use tokio::sync::{mpsc, watch};

use crate::config::AppConfig;
use crate::http::{
    ExportOutcome, ListenerRole, ServerError, ServerLifecycle, ServerSettings, StartReport,
};
use crate::identity::CertificateStore;
use crate::routes::create_routers;
use crate::state::{AppState, ServerMode, ServerState};
use crate::ui::{UiEvent, UiHandle};

/// Requests for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    StartServer(ServerMode),
    /// Stop; also ends the host when `exit_process_on_server_stop` is set
    StopServer,
    /// Stop, then start in the given mode
    SwitchMode(ServerMode),
    Quit,
}

/// The orchestrator has finished and no longer takes commands.
#[derive(Debug, thiserror::Error)]
#[error("host control channel is closed")]
pub struct ControlClosed;

/// Cloneable command sender
#[derive(Debug, Clone)]
pub struct HostControl {
    tx: mpsc::UnboundedSender<HostCommand>,
}

impl HostControl {
    pub fn send(&self, command: HostCommand) -> Result<(), ControlClosed> {
        self.tx.send(command).map_err(|_| ControlClosed)
    }
}

pub struct Orchestrator {
    config: AppConfig,
    lifecycle: ServerLifecycle,
    ui: UiHandle,
    control: HostControl,
    commands: mpsc::UnboundedReceiver<HostCommand>,
}

impl Orchestrator {
    /// Wire the lifecycle, routers and shared state from `config`.
    pub fn new(config: AppConfig, ui: UiHandle) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let control = HostControl { tx };

        let (state_tx, state_rx) = watch::channel(ServerState::stopped(ServerMode::from_export_flag(
            config.server.export,
        )));
        let routers = create_routers(
            AppState::new(state_rx, control.clone()),
            &config.server.web_root,
        );
        let certificates =
            CertificateStore::new(config.identity.path(), config.identity.subject.clone());
        let lifecycle = ServerLifecycle::new(
            ServerSettings::from_config(&config.server),
            certificates,
            routers,
            state_tx,
        );

        Self {
            config,
            lifecycle,
            ui,
            control,
            commands,
        }
    }

    pub fn control(&self) -> HostControl {
        self.control.clone()
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.lifecycle.subscribe()
    }

    /// Mode read from configuration at startup
    pub fn configured_mode(&self) -> ServerMode {
        ServerMode::from_export_flag(self.config.server.export)
    }

    /// Start the server and point the UI at it.
    pub async fn start_server(&self, mode: ServerMode) -> Result<StartReport, ServerError> {
        let ui = self.ui.clone();
        let report = self
            .lifecycle
            .start(mode, move |report| {
                ui.post(UiEvent::Navigate {
                    url: report.loopback_url(),
                })
            })
            .await?;

        self.report_export(&report);
        Ok(report)
    }

    pub async fn stop_server(&self) -> Result<(), ServerError> {
        self.lifecycle.stop().await
    }

    /// Change mode by restarting every listener.
    pub async fn switch_mode(&self, mode: ServerMode) -> Result<StartReport, ServerError> {
        tracing::info!(from = ?self.state().mode, to = ?mode, "Switching server mode");
        self.stop_server().await?;
        self.start_server(mode).await
    }

    fn report_export(&self, report: &StartReport) {
        match &report.export {
            ExportOutcome::Disabled => {}
            ExportOutcome::Listening {
                addr,
                identity,
                newly_generated,
            } => {
                tracing::info!(
                    %addr,
                    fingerprint = %identity.fingerprint(),
                    "API exported over TLS"
                );
                if *newly_generated {
                    self.ui.post(UiEvent::TrustIdentity {
                        subject: identity.subject.clone(),
                        fingerprint: identity.fingerprint(),
                        path: self.lifecycle.certificates().path().display().to_string(),
                    });
                }
            }
            ExportOutcome::Unavailable(e) => {
                self.ui.diagnostic(
                    "Export unavailable",
                    format!("{}. The API is only reachable from this machine.", e),
                );
            }
        }
    }

    /// Start in the configured mode, then process commands until `shutdown`
    /// resolves, a command ends the host, or a loopback failure makes the
    /// host unusable. Always stops the server and closes the UI before
    /// returning.
    pub async fn run<S>(mut self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let result = self.serve(shutdown).await;

        if let Err(e) = self.lifecycle.stop().await {
            tracing::warn!(error = %e, "Server did not stop cleanly");
        }
        if let Err(e) = &result {
            self.ui.diagnostic("Server failed", e.to_string());
        }
        self.ui.post(UiEvent::Exit);
        result
    }

    async fn serve<S>(&mut self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        self.start_server(self.configured_mode()).await?;

        tokio::pin!(shutdown);
        loop {
            let command = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                command = self.commands.recv() => command,
            };
            let Some(command) = command else {
                return Ok(());
            };

            tracing::debug!(?command, "Host command");
            if !self.handle(command).await? {
                return Ok(());
            }
        }
    }

    /// Apply one command. `Ok(false)` ends the host.
    async fn handle(&self, command: HostCommand) -> Result<bool, ServerError> {
        let outcome = match command {
            HostCommand::StartServer(mode) => self.start_server(mode).await.map(|_| ()),
            HostCommand::SwitchMode(mode) => self.switch_mode(mode).await.map(|_| ()),
            HostCommand::StopServer => {
                self.stop_server().await?;
                if self.config.server.exit_process_on_server_stop {
                    tracing::info!("Server stopped, exiting host");
                    return Ok(false);
                }
                Ok(())
            }
            HostCommand::Quit => return Ok(false),
        };

        match outcome {
            Ok(()) => Ok(true),
            Err(e @ ServerError::ListenerBindFailure {
                role: ListenerRole::Loopback,
                ..
            }) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Host command failed");
                self.ui.diagnostic("Server command failed", e.to_string());
                Ok(true)
            }
        }
    }
}
