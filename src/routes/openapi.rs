//! OpenAPI description of the host API.
//!
//! Served on the loopback listener only, next to the control endpoints it
//! documents. Any OpenAPI viewer can load it from `/openapi.json`.

use axum::Json;
use serde_json::{json, Value};

pub async fn document() -> Json<Value> {
    Json(spec())
}

fn mode_schema() -> Value {
    json!({
        "type": "string",
        "enum": ["local", "local_and_exported"]
    })
}

fn accepted(description: &str) -> Value {
    json!({
        "202": { "description": description },
        "503": {
            "description": "The host is shutting down",
            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/Error" } } }
        }
    })
}

/// Build the OpenAPI 3.0 document for the current crate version.
pub fn spec() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "homeport",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Local control-plane API. Control endpoints exist on the loopback listener only."
        },
        "paths": {
            "/health": {
                "get": {
                    "summary": "Liveness probe",
                    "responses": {
                        "200": {
                            "description": "The listener accepts requests",
                            "content": { "text/plain": { "schema": { "type": "string", "example": "ok" } } }
                        }
                    }
                }
            },
            "/api/server": {
                "get": {
                    "summary": "Current server state",
                    "responses": {
                        "200": {
                            "description": "State snapshot",
                            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/ServerStatus" } } }
                        }
                    }
                }
            },
            "/api/server/mode": {
                "post": {
                    "summary": "Restart the server in another mode",
                    "requestBody": {
                        "required": true,
                        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/ModeRequest" } } }
                    },
                    "responses": accepted("Mode switch queued; it runs after this response is sent")
                }
            },
            "/api/server/stop": {
                "post": {
                    "summary": "Stop the server",
                    "responses": accepted("Stop queued")
                }
            }
        },
        "components": {
            "schemas": {
                "ServerMode": mode_schema(),
                "ServerPhase": {
                    "type": "string",
                    "enum": ["stopped", "starting", "running", "stopping"]
                },
                "ServerStatus": {
                    "type": "object",
                    "required": ["mode", "phase", "running", "version"],
                    "properties": {
                        "mode": { "$ref": "#/components/schemas/ServerMode" },
                        "phase": { "$ref": "#/components/schemas/ServerPhase" },
                        "running": { "type": "boolean" },
                        "loopback_addr": { "type": "string", "nullable": true, "example": "127.0.0.1:49152" },
                        "export_addr": { "type": "string", "nullable": true, "example": "0.0.0.0:5001" },
                        "version": { "type": "string" }
                    }
                },
                "ModeRequest": {
                    "type": "object",
                    "required": ["mode"],
                    "properties": { "mode": { "$ref": "#/components/schemas/ServerMode" } }
                },
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": { "error": { "type": "string" } }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::{ServerMode, ServerPhase};

    #[test]
    fn test_documents_every_route() {
        let spec = spec();
        let paths = spec["paths"].as_object().unwrap();
        let mut documented: Vec<_> = paths.keys().map(String::as_str).collect();
        documented.sort_unstable();
        assert_eq!(
            documented,
            vec!["/api/server", "/api/server/mode", "/api/server/stop", "/health"]
        );
        assert!(paths["/api/server/mode"]["post"]["responses"]["202"].is_object());
        assert_eq!(spec["info"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_enums_match_wire_format() {
        let spec = spec();
        let schemas = &spec["components"]["schemas"];
        for mode in [ServerMode::Local, ServerMode::LocalAndExported] {
            let wire = serde_json::to_value(mode).unwrap();
            assert!(schemas["ServerMode"]["enum"]
                .as_array()
                .unwrap()
                .contains(&wire));
        }
        for phase in [
            ServerPhase::Stopped,
            ServerPhase::Starting,
            ServerPhase::Running,
            ServerPhase::Stopping,
        ] {
            let wire = serde_json::to_value(phase).unwrap();
            assert!(schemas["ServerPhase"]["enum"]
                .as_array()
                .unwrap()
                .contains(&wire));
        }
    }
}
