//! HTTP route handlers.
//!
//! The loopback and export listeners serve different routers. Both carry the
//! read-only endpoints and the UI bundle; only the loopback router accepts
//! control requests and publishes the OpenAPI document, so devices reaching
//! the export port cannot stop or reconfigure the host.
//!
//! Request tracing is enabled via middleware that generates a unique request ID
//! for each incoming request, allowing correlation of all logs within a request.

pub mod health;
pub mod openapi;
pub mod server;

use std::path::Path;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::services::ServeDir;
use tower_http::set_header::{SetResponseHeader, SetResponseHeaderLayer};
use tower_http::trace::TraceLayer;

use crate::config::{CACHE_CONTROL_API, CACHE_CONTROL_STATIC};
use crate::http::static_files::create_static_service;
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Routers for the two listeners
#[derive(Clone)]
pub struct Routers {
    /// Served on 127.0.0.1 to the local UI surface
    pub loopback: Router,
    /// Served over TLS to other devices
    pub export: Router,
}

/// Creates both routers from shared state.
pub fn create_routers(state: AppState, web_root: &Path) -> Routers {
    let read_only = Router::new()
        .route("/health", get(health::health))
        .route("/api/server", get(server::status))
        .layer(no_store());

    let control = Router::new()
        .route("/api/server/mode", post(server::set_mode))
        .route("/api/server/stop", post(server::stop))
        .route("/openapi.json", get(openapi::document))
        .layer(no_store());

    let loopback = read_only
        .clone()
        .merge(control)
        .fallback_service(static_bundle(web_root))
        .with_state(state.clone());

    let export = read_only
        .fallback_service(static_bundle(web_root))
        .with_state(state);

    Routers {
        loopback: with_layers(loopback),
        export: with_layers(export),
    }
}

fn no_store() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(
        CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_API),
    )
}

fn static_bundle(web_root: &Path) -> SetResponseHeader<ServeDir, HeaderValue> {
    SetResponseHeader::if_not_present(
        create_static_service(web_root),
        CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_STATIC),
    )
}

fn with_layers(router: Router) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}
