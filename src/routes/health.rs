//! Health check endpoint.
//!
//! Provides a simple liveness probe that returns 200 OK when the listener
//! accepts requests. The UI surface polls it before loading the bundle.

/// Health check handler.
///
/// Returns a simple "ok" response to indicate the service is running.
pub async fn health() -> &'static str {
    "ok"
}
