use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::orchestrator::ControlClosed;

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Host is shutting down: {0}")]
    HostUnavailable(#[from] ControlClosed),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::HostUnavailable(_) => {
                tracing::warn!("Control request after host shutdown");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let message = self.to_string();

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_unavailable_maps_to_503() {
        let response = AppError::HostUnavailable(ControlClosed).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
