//! Single-instance guard.
//!
//! The first launch takes a system-wide named lock keyed by the application
//! identifier and becomes the owner: the only process that hosts the server.
//! Every later launch fails to take the lock, forwards its command-line
//! arguments to the owner over the activation channel and exits.
//!
//! Lock races are settled by the operating system lock itself. A loser is
//! always a forwarder; there is no partially owned state.

mod channel;
mod lock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{InstanceConfig, ACTIVATION_CONNECT_TIMEOUT_MS};

pub use channel::ChannelName;
pub use lock::InstanceLock;

/// Single-instance errors
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("Could not reach the running instance via {channel}: {reason}")]
    ActivationChannelUnavailable { channel: String, reason: String },

    #[error("Failed to take instance lock '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open activation channel {channel}: {source}")]
    Channel {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed activation message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Activation protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message a forwarding launch sends to the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    /// Invocation arguments of the forwarding process
    pub args: Vec<String>,
    /// Pid of the forwarding process
    pub pid: u32,
}

impl Activation {
    /// Activation carrying `args` from the current process
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            pid: std::process::id(),
        }
    }
}

/// Result of [`SingleInstanceGuard::try_acquire`]
pub enum Acquisition {
    /// This process holds the lock and hosts the server
    Owned(InstanceOwner),
    /// Another process holds the lock
    Forwarded(Forwarder),
}

/// Named lock plus activation channel, keyed by the application identifier.
#[derive(Debug, Clone)]
pub struct SingleInstanceGuard {
    app_key: String,
    runtime_dir: PathBuf,
    forward_timeout: Duration,
}

impl SingleInstanceGuard {
    pub fn new(app_key: impl Into<String>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_key: app_key.into(),
            runtime_dir: runtime_dir.into(),
            forward_timeout: Duration::from_millis(ACTIVATION_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(config.app_key.clone(), config.runtime_dir())
    }

    /// Override how long a forwarder waits for the owner
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.lock", self.app_key))
    }

    pub fn channel_name(&self) -> ChannelName {
        ChannelName::new(&self.runtime_dir, &self.app_key)
    }

    /// Take the lock, or learn who holds it.
    ///
    /// The owner's activation channel is bound before this returns, so
    /// forwarders racing the owner only wait for it to start serving.
    pub async fn try_acquire(&self) -> Result<Acquisition, InstanceError> {
        let lock_path = self.lock_path();
        let lock = InstanceLock::try_acquire(&lock_path).map_err(|source| InstanceError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let Some(lock) = lock else {
            let owner_pid = lock::recorded_owner(&lock_path);
            tracing::info!(owner_pid = ?owner_pid, "Another instance is running");
            return Ok(Acquisition::Forwarded(Forwarder {
                channel: self.channel_name(),
                owner_pid,
                timeout: self.forward_timeout,
            }));
        };

        let name = self.channel_name();
        let listener = channel::Listener::bind(&name).map_err(|source| InstanceError::Channel {
            channel: name.to_string(),
            source,
        })?;

        tracing::info!(
            pid = lock.owner_pid(),
            lock = %lock.path().display(),
            channel = %name,
            "Acquired single-instance ownership"
        );
        Ok(Acquisition::Owned(InstanceOwner { lock, listener }))
    }

    /// Acquire ownership, or forward `args` to the owner.
    ///
    /// Returns `None` once the owner has acknowledged the arguments; the caller
    /// then exits without starting any listener.
    pub async fn acquire_or_forward(
        &self,
        args: Vec<String>,
    ) -> Result<Option<InstanceOwner>, InstanceError> {
        match self.try_acquire().await? {
            Acquisition::Owned(owner) => Ok(Some(owner)),
            Acquisition::Forwarded(forwarder) => {
                forwarder.forward(args).await?;
                Ok(None)
            }
        }
    }
}

/// Held by the process that won the lock.
pub struct InstanceOwner {
    // Drop order: the channel is removed before the lock is released, so a
    // successor never has its fresh channel deleted by this owner.
    listener: channel::Listener,
    lock: InstanceLock,
}

impl InstanceOwner {
    pub fn owner_pid(&self) -> u32 {
        self.lock.owner_pid()
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Start accepting forwarded activations.
    ///
    /// `on_activation` runs on a runtime worker; anything touching the UI must
    /// be posted to the UI thread from inside it.
    pub fn serve<F>(self, on_activation: F) -> ActivationService
    where
        F: FnMut(Activation) + Send + 'static,
    {
        let lock_path = self.lock.path().to_path_buf();
        let owner = self;
        let task = tokio::spawn(async move {
            // Move the whole owner in; cancelling the task drops it in field order
            let mut owner = owner;
            channel::serve(&mut owner.listener, on_activation).await;
        });
        ActivationService { task, lock_path }
    }
}

/// Running activation listener. Ownership ends when this is shut down or dropped.
///
/// After a drop the lock is released once the runtime has cancelled the
/// listener task; [`ActivationService::shutdown`] waits for that.
pub struct ActivationService {
    task: JoinHandle<()>,
    lock_path: PathBuf,
}

impl ActivationService {
    /// Stop listening, remove the channel and release the lock.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        tracing::debug!(lock = %self.lock_path.display(), "Released single-instance ownership");
    }
}

impl Drop for ActivationService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One-shot client of the owner's activation channel.
#[derive(Debug)]
pub struct Forwarder {
    channel: ChannelName,
    owner_pid: Option<u32>,
    timeout: Duration,
}

impl Forwarder {
    /// Pid the owner recorded in the lock file, when readable
    pub fn owner_pid(&self) -> Option<u32> {
        self.owner_pid
    }

    /// Send `args` to the owner and wait for its acknowledgement.
    pub async fn forward(&self, args: Vec<String>) -> Result<(), InstanceError> {
        let activation = Activation::new(args);
        channel::forward(&self.channel, &activation, self.timeout).await?;
        tracing::info!(owner_pid = ?self.owner_pid, "Forwarded activation to running instance");
        Ok(())
    }
}
