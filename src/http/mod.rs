//! Embedded HTTP(S) server.
//!
//! - [`server`]: listener lifecycle (loopback always, TLS export on demand)
//! - [`shutdown`]: termination signals
//! - [`static_files`]: the UI bundle served at `/`

pub mod server;
mod shutdown;
pub mod static_files;

pub use server::{
    ExportOutcome, ListenerRole, ServerError, ServerLifecycle, ServerSettings, StartReport,
};
pub use shutdown::shutdown_signal;
