//! Conversion of routed messages into external wire shapes.

use serde_json::{json, Map, Value};

/// An external message shape understood by [`transform_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `{"jsonrpc": "2.0", "method", "params", "id"?}`
    JsonRpc,
    /// `{"method": "POST", "path", "headers", "body"}`
    Rest,
    /// `{"event", "data", "id"?}`, shared by SSE and websocket pushes.
    EventStream,
}

impl WireFormat {
    /// Parse a target name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jsonrpc" | "json-rpc" | "rpc" => Some(Self::JsonRpc),
            "rest" | "http" => Some(Self::Rest),
            "event-stream" | "eventstream" | "sse" | "websocket" | "ws" => Some(Self::EventStream),
            _ => None,
        }
    }
}

/// Convert `message` to `target`. Unknown targets return the message
/// unchanged.
pub fn transform_format(message: &Value, target: &str) -> Value {
    match WireFormat::parse(target) {
        Some(WireFormat::JsonRpc) => to_jsonrpc(message),
        Some(WireFormat::Rest) => to_rest(message),
        Some(WireFormat::EventStream) => to_event_stream(message),
        None => message.clone(),
    }
}

fn method_of(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Fields of `message` other than envelope keys.
fn payload_of(message: &Value) -> Value {
    match message {
        Value::Object(fields) => {
            if let Some(params) = fields.get("params") {
                return params.clone();
            }
            let rest: Map<String, Value> = fields
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "jsonrpc" | "method" | "id" | "_routing"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(rest)
        }
        other => other.clone(),
    }
}

fn to_jsonrpc(message: &Value) -> Value {
    if message.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
        return message.clone();
    }
    let mut envelope = json!({
        "jsonrpc": "2.0",
        "method": method_of(message).unwrap_or("message"),
        "params": payload_of(message),
    });
    if let Some(id) = message.get("id") {
        envelope["id"] = id.clone();
    }
    envelope
}

fn to_rest(message: &Value) -> Value {
    let path = match method_of(message) {
        Some(method) => format!("/{}", method.trim_start_matches('/').replace('.', "/")),
        None => "/".to_string(),
    };
    json!({
        "method": "POST",
        "path": path,
        "headers": {"content-type": "application/json"},
        "body": payload_of(message),
    })
}

fn to_event_stream(message: &Value) -> Value {
    let mut envelope = json!({
        "event": method_of(message).unwrap_or("message"),
        "data": message,
    });
    let id = message
        .pointer("/_routing/messageId")
        .or_else(|| message.get("id"));
    if let Some(id) = id {
        envelope["id"] = id.clone();
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_envelope_from_plain_message() {
        let out = transform_format(&json!({"method": "tools/call", "id": 4, "name": "x"}), "jsonrpc");
        assert_eq!(
            out,
            json!({"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "x"}, "id": 4})
        );
    }

    #[test]
    fn test_jsonrpc_passthrough_when_already_enveloped() {
        let msg = json!({"jsonrpc": "2.0", "method": "ping", "id": 1});
        assert_eq!(transform_format(&msg, "json-rpc"), msg);
    }

    #[test]
    fn test_rest_descriptor() {
        let out = transform_format(&json!({"method": "tools.list", "params": {"cursor": "a"}}), "rest");
        assert_eq!(out["method"], "POST");
        assert_eq!(out["path"], "/tools/list");
        assert_eq!(out["body"], json!({"cursor": "a"}));
    }

    #[test]
    fn test_event_stream_uses_routing_message_id() {
        let msg = json!({"task": "x", "_routing": {"messageId": "m-1"}});
        let out = transform_format(&msg, "sse");
        assert_eq!(out["event"], "message");
        assert_eq!(out["id"], "m-1");
        assert_eq!(out["data"], msg);
        assert_eq!(transform_format(&msg, "websocket"), out);
    }

    #[test]
    fn test_unknown_target_passes_through() {
        let msg = json!({"anything": [1, 2]});
        assert_eq!(transform_format(&msg, "carrier-pigeon"), msg);
    }
}
