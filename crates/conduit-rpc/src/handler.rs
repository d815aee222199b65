//! JSON-RPC request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use conduit_core::platform::StopSignal;
use conduit_core::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

// ============================================================================
// JSON-RPC types
// ============================================================================

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Look a parameter up by its snake_case or camelCase name.
fn get_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    params.get(snake).or_else(|| params.get(camel))
}

fn require_str_param(params: &Value, snake: &str, camel: &str) -> Result<String> {
    get_param(params, snake, camel)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| ConduitError::InvalidParams {
            message: format!("Missing required parameter: {}", snake),
        })
}

fn require_param<'a>(params: &'a Value, name: &str) -> Result<&'a Value> {
    params.get(name).ok_or_else(|| ConduitError::InvalidParams {
        message: format!("Missing required parameter: {}", name),
    })
}

fn get_u64_param(params: &Value, snake: &str, camel: &str) -> Option<u64> {
    get_param(params, snake, camel).and_then(Value::as_u64)
}

// ============================================================================
// HTTP endpoints
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id.clone();
    debug!("RPC call: {}({:?})", request.method, params);

    match dispatch_method(&state, &request.method, &params).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", request.method, e);
            let code = e.to_rpc_error_code();
            (StatusCode::OK, Json(JsonRpcResponse::error(id, code, e.to_string())))
        }
    }
}

// ============================================================================
// Method dispatcher
// ============================================================================

pub(crate) async fn dispatch_method(state: &AppState, method: &str, params: &Value) -> Result<Value> {
    let bridge = &state.bridge;
    match method {
        "health_check" => Ok(json!({"status": "ok"})),

        // Processes
        "get_process_status" => {
            let id = require_str_param(params, "id", "id")?;
            Ok(serde_json::to_value(bridge.supervisor().get_process_status(&id)?)?)
        }
        "list_processes" => Ok(serde_json::to_value(bridge.supervisor().list_processes())?),
        "get_all_processes_status" => {
            Ok(serde_json::to_value(bridge.supervisor().get_all_processes_status())?)
        }
        "get_process_logs" => {
            let id = require_str_param(params, "id", "id")?;
            let lines = get_u64_param(params, "lines", "lines").map(|n| n as usize);
            Ok(serde_json::to_value(
                bridge.supervisor().get_process_logs(&id, lines)?,
            )?)
        }
        "stop_process" => {
            let id = require_str_param(params, "id", "id")?;
            let signal = match get_param(params, "signal", "signal").and_then(Value::as_str) {
                Some(name) => StopSignal::parse(name).ok_or_else(|| ConduitError::InvalidParams {
                    message: format!("Unknown signal: {}", name),
                })?,
                None => StopSignal::default(),
            };
            let timeout = get_u64_param(params, "timeout_ms", "timeoutMs")
                .map(Duration::from_millis)
                .unwrap_or_else(|| bridge.supervisor().config().stop_timeout());
            bridge.supervisor().stop(&id, signal, timeout).await?;
            Ok(json!({"success": true}))
        }
        "restart_process" => {
            let id = require_str_param(params, "id", "id")?;
            let id = bridge.supervisor().restart(&id).await?;
            Ok(json!({"success": true, "id": id}))
        }

        // Servers
        "get_server_status" => {
            let id = require_str_param(params, "id", "id")?;
            Ok(serde_json::to_value(bridge.get_server_status(&id)?)?)
        }
        "list_servers" => Ok(serde_json::to_value(bridge.list_servers())?),
        "get_all_servers_status" => Ok(serde_json::to_value(bridge.get_all_servers_status())?),
        "get_metrics" => Ok(serde_json::to_value(bridge.get_metrics())?),
        "start_server" => {
            let id = require_str_param(params, "id", "id")?;
            bridge.start_server(&id).await?;
            Ok(json!({"success": true}))
        }
        "stop_server" => {
            let id = require_str_param(params, "id", "id")?;
            bridge.stop_server(&id).await?;
            Ok(json!({"success": true}))
        }

        // Messaging
        "send_to_server" => {
            let id = require_str_param(params, "id", "id")?;
            let message = require_param(params, "message")?;
            bridge.send_to_server(&id, message).await?;
            Ok(json!({"success": true}))
        }
        "request" => {
            let id = require_str_param(params, "id", "id")?;
            let message = require_param(params, "message")?.clone();
            let timeout = get_u64_param(params, "timeout_ms", "timeoutMs").map(Duration::from_millis);
            bridge.request(&id, message, timeout).await
        }
        "list_routes" => {
            let source = require_str_param(params, "source", "source")?;
            Ok(serde_json::to_value(bridge.router().routes_from(&source))?)
        }
        "unregister_route" => {
            let source = require_str_param(params, "source", "source")?;
            let destination = require_str_param(params, "destination", "destination")?;
            let removed = bridge.router().unregister_route(&source, &destination);
            Ok(json!({"success": removed}))
        }

        _ => Err(ConduitError::InvalidParams {
            message: format!("Unknown method: {}", method),
        }),
    }
}
