//! Static file serving for the UI bundle.

use std::path::Path;

use tower_http::services::ServeDir;

/// Serve the UI bundle from `web_root`.
///
/// Directory requests resolve to their `index.html`, so `/` loads the UI entry
/// point the orchestrator navigates to.
pub fn create_static_service(web_root: &Path) -> ServeDir {
    ServeDir::new(web_root).append_index_html_on_directories(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_static_service_for_missing_root() {
        // Missing roots answer 404 per request instead of failing construction
        let _service = create_static_service(Path::new("/nonexistent/homeport/wwwroot"));
    }
}
