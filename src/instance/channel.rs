//! Activation channel between a forwarding launch and the owning instance.
//!
//! Unix uses a stream socket next to the lock file, Windows a named pipe
//! keyed by the application identifier. The exchange is one JSON line from
//! the client followed by an `ok` line from the owner, sent only after the
//! activation handler has run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;

use super::{Activation, InstanceError};
use crate::config::{ACTIVATION_MAX_MESSAGE_BYTES, ACTIVATION_RETRY_DELAY_MS};

const ACK: &str = "ok";

/// Platform address of the channel
#[derive(Debug, Clone)]
pub struct ChannelName {
    #[cfg_attr(not(unix), allow(dead_code))]
    socket_path: PathBuf,
    #[cfg_attr(not(windows), allow(dead_code))]
    pipe_name: String,
}

impl ChannelName {
    pub fn new(runtime_dir: &Path, app_key: &str) -> Self {
        Self {
            socket_path: runtime_dir.join(format!("{}.sock", app_key)),
            pipe_name: format!(r"\\.\pipe\{}-activation", app_key),
        }
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(unix)]
        return write!(f, "{}", self.socket_path.display());
        #[cfg(not(unix))]
        return f.write_str(&self.pipe_name);
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};

    use super::ChannelName;

    pub struct Listener {
        inner: UnixListener,
        path: PathBuf,
    }

    impl Listener {
        /// Caller must hold the instance lock: any existing socket file is stale.
        pub fn bind(name: &ChannelName) -> io::Result<Self> {
            match std::fs::remove_file(&name.socket_path) {
                Ok(()) => tracing::debug!(path = %name.socket_path.display(), "Removed stale activation socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let inner = UnixListener::bind(&name.socket_path)?;
            Ok(Self {
                inner,
                path: name.socket_path.clone(),
            })
        }

        pub async fn accept(&mut self) -> io::Result<UnixStream> {
            let (stream, _) = self.inner.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn connect(name: &ChannelName) -> io::Result<UnixStream> {
        UnixStream::connect(&name.socket_path).await
    }
}

#[cfg(windows)]
mod platform {
    use std::io;

    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    use super::ChannelName;

    pub struct Listener {
        name: String,
        next: NamedPipeServer,
    }

    impl Listener {
        pub fn bind(name: &ChannelName) -> io::Result<Self> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&name.pipe_name)?;
            Ok(Self {
                name: name.pipe_name.clone(),
                next,
            })
        }

        pub async fn accept(&mut self) -> io::Result<NamedPipeServer> {
            self.next.connect().await?;
            let replacement = ServerOptions::new().create(&self.name)?;
            Ok(std::mem::replace(&mut self.next, replacement))
        }
    }

    pub async fn connect(name: &ChannelName) -> io::Result<NamedPipeClient> {
        ClientOptions::new().open(&name.pipe_name)
    }
}

pub use platform::Listener;

/// Accept activations until the task is cancelled.
///
/// Connections are handled one at a time, so the handler observes
/// activations in the order their senders connected.
pub async fn serve<F>(listener: &mut Listener, mut on_activation: F)
where
    F: FnMut(Activation),
{
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept activation connection");
                tokio::time::sleep(Duration::from_millis(ACTIVATION_RETRY_DELAY_MS)).await;
                continue;
            }
        };

        let received = tokio::time::timeout(
            read_timeout(),
            receive(stream, &mut on_activation),
        )
        .await;
        match received {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Rejected activation message"),
            Err(_) => tracing::warn!("Activation client stalled, dropping connection"),
        }
    }
}

async fn receive<S, F>(stream: S, on_activation: &mut F) -> Result<(), InstanceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Activation),
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader.take(ACTIVATION_MAX_MESSAGE_BYTES));

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let activation: Activation = serde_json::from_str(line.trim_end())?;

    tracing::info!(
        from_pid = activation.pid,
        args = ?activation.args,
        "Received forwarded activation"
    );
    on_activation(activation);

    writer.write_all(format!("{}\n", ACK).as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Deliver `activation` to the owner, retrying until `timeout` while the
/// owner may still be binding its end.
pub async fn forward(
    name: &ChannelName,
    activation: &Activation,
    timeout: Duration,
) -> Result<(), InstanceError> {
    let deadline = Instant::now() + timeout;
    let unavailable = |reason: String| InstanceError::ActivationChannelUnavailable {
        channel: name.to_string(),
        reason,
    };

    let stream = loop {
        match platform::connect(name).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + retry_delay() < deadline => {
                tracing::debug!(error = %e, "Activation channel not ready, retrying");
                tokio::time::sleep(retry_delay()).await;
            }
            Err(e) => return Err(unavailable(e.to_string())),
        }
    };

    match tokio::time::timeout_at(deadline, send(stream, activation)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(unavailable(e.to_string())),
        Err(_) => Err(unavailable("owner did not acknowledge in time".to_string())),
    }
}

async fn send<S>(stream: S, activation: &Activation) -> Result<(), InstanceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    let mut message = serde_json::to_string(activation)?;
    message.push('\n');
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await?;

    let mut reply = String::new();
    BufReader::new(reader.take(64)).read_line(&mut reply).await?;
    if reply.trim_end() == ACK {
        Ok(())
    } else {
        Err(InstanceError::Protocol(format!(
            "unexpected reply {:?}",
            reply.trim_end()
        )))
    }
}

fn retry_delay() -> Duration {
    Duration::from_millis(ACTIVATION_RETRY_DELAY_MS)
}

fn read_timeout() -> Duration {
    Duration::from_millis(crate::config::ACTIVATION_CONNECT_TIMEOUT_MS)
}
