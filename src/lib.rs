//! Homeport: local control-plane host.
//!
//! Hosts an HTTP API for a desktop UI on the loopback interface and, when
//! export mode is enabled, over TLS to other devices on the network. Only one
//! instance runs per user: later launches forward their arguments to it.
//!
//! - [`instance`]: single-instance lock and activation channel
//! - [`identity`]: persisted self-signed TLS identity
//! - [`http`]: listener lifecycle
//! - [`orchestrator`]: composes the above and owns the server state
//! - [`ui`]: the UI thread and its event queue

pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod instance;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod tls;
pub mod ui;

pub use config::AppConfig;
pub use error::AppError;
pub use http::{ServerError, ServerLifecycle};
pub use identity::{CertificateStore, IdentityError, TlsIdentity};
pub use instance::{Acquisition, InstanceError, SingleInstanceGuard};
pub use orchestrator::{HostCommand, HostControl, Orchestrator};
pub use state::{ServerMode, ServerPhase, ServerState};
