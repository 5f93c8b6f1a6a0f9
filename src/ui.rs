//! Host UI surface.
//!
//! The UI owns its own thread. Network-facing code never calls into the
//! surface directly: it posts a [`UiEvent`] through a [`UiHandle`] and the UI
//! thread applies events one at a time, in order. The thread ends after
//! [`UiEvent::Exit`] or once every handle is dropped.

use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Work for the UI thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Point the UI at the loopback listener
    Navigate { url: String },
    /// A later launch was forwarded here; bring the window to the front
    Activate { args: Vec<String> },
    /// A new self-signed identity was created; show it for trust registration
    TrustIdentity {
        subject: String,
        fingerprint: String,
        path: String,
    },
    /// Operator-visible error or warning
    Diagnostic { title: String, message: String },
    /// Close the surface and end the UI thread
    Exit,
}

/// The window, tray icon or webview the operator interacts with.
///
/// Methods run on the UI thread only.
pub trait UiSurface {
    fn navigate(&mut self, url: &str);
    fn bring_to_front(&mut self, args: &[String]);
    fn show_identity(&mut self, subject: &str, fingerprint: &str, path: &str);
    fn show_diagnostic(&mut self, title: &str, message: &str);
    fn close(&mut self) {}
}

/// Cloneable sender half, safe to use from any thread or task.
#[derive(Debug, Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiHandle {
    /// Post `event` to the UI thread. Events sent after the UI closed are dropped.
    pub fn post(&self, event: UiEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(event = ?e.0, "UI thread gone, dropping event");
        }
    }

    pub fn diagnostic(&self, title: impl Into<String>, message: impl Into<String>) {
        self.post(UiEvent::Diagnostic {
            title: title.into(),
            message: message.into(),
        });
    }
}

/// Receiving half, consumed by [`run_event_loop`].
#[derive(Debug)]
pub struct UiEvents {
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl UiEvents {
    /// Next event, for surfaces driven by an async toolkit instead of
    /// [`run_event_loop`].
    pub async fn recv(&mut self) -> Option<UiEvent> {
        self.rx.recv().await
    }
}

pub fn channel() -> (UiHandle, UiEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UiHandle { tx }, UiEvents { rx })
}

/// Apply events to `surface` until `Exit` or until every handle is dropped.
///
/// Blocks the calling thread, which becomes the UI thread. Must not be called
/// from inside an async task.
pub fn run_event_loop<S: UiSurface>(mut surface: S, mut events: UiEvents) -> S {
    while let Some(event) = events.rx.blocking_recv() {
        match event {
            UiEvent::Navigate { url } => surface.navigate(&url),
            UiEvent::Activate { args } => surface.bring_to_front(&args),
            UiEvent::TrustIdentity {
                subject,
                fingerprint,
                path,
            } => surface.show_identity(&subject, &fingerprint, &path),
            UiEvent::Diagnostic { title, message } => surface.show_diagnostic(&title, &message),
            UiEvent::Exit => break,
        }
    }
    surface.close();
    surface
}

/// Run the event loop on a dedicated thread.
pub fn spawn_ui_thread<S>(surface: S, events: UiEvents) -> std::io::Result<JoinHandle<S>>
where
    S: UiSurface + Send + 'static,
{
    std::thread::Builder::new()
        .name("homeport-ui".to_string())
        .spawn(move || run_event_loop(surface, events))
}

/// Surface for headless runs: reports every event through the log.
#[derive(Debug, Default)]
pub struct LogSurface {
    current_url: Option<String>,
}

impl LogSurface {
    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }
}

impl UiSurface for LogSurface {
    fn navigate(&mut self, url: &str) {
        tracing::info!(%url, "UI available");
        self.current_url = Some(url.to_string());
    }

    fn bring_to_front(&mut self, args: &[String]) {
        tracing::info!(args = ?args, url = ?self.current_url, "Activation requested");
    }

    fn show_identity(&mut self, subject: &str, fingerprint: &str, path: &str) {
        tracing::warn!(
            %subject,
            %fingerprint,
            %path,
            "New TLS identity created; verify this fingerprint when trusting it on other devices"
        );
    }

    fn show_diagnostic(&mut self, title: &str, message: &str) {
        tracing::error!(%title, %message, "Operator diagnostic");
    }
}
