//! JSON-RPC 2.0 framing for the Model Context Protocol.
//!
//! One wire type ([`JsonRpcMessage`]) covers requests, notifications, and
//! responses. Inbound frames are validated once at the edge into a
//! [`RequestEnvelope`]; everything past the edge works with the envelope
//! and its derived views and never re-parses raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// JSON-RPC error codes used by the gateway.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const NOT_INITIALIZED: i64 = -32002;
    /// Generic security violation; also used for request timeout.
    pub const REQUEST_TIMEOUT: i64 = -32000;
    /// Security violation carrying an aggregate verdict in `data`.
    pub const SECURITY_VIOLATION: i64 = -32004;
}

/// MCP method names recognized by the gateway.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const INITIALIZED_LEGACY: &str = "initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const SAMPLING_CREATE: &str = "sampling/createMessage";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PROGRESS: &str = "notifications/progress";
    pub const LOG_MESSAGE: &str = "notifications/message";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
}

/// The protocol version the gateway speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One JSON-RPC 2.0 message in wire form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcMessage {
    /// Parses a raw frame.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// True for a request or notification.
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// True for a notification (request without id).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// True for a response.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// A success response for `id`.
    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            ..Default::default()
        }
    }

    /// An error response for `id`. The request `id` is always preserved.
    pub fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Self {
        let mut error = serde_json::json!({
            "code": code,
            "message": message,
        });
        if let Some(data) = data {
            error["data"] = data;
        }
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            error: Some(error),
            ..Default::default()
        }
    }

    /// A request frame.
    pub fn request(id: Value, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// A notification frame.
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// Serializes to one newline-terminated frame.
    pub fn to_frame(&self) -> String {
        let mut frame = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        frame.push('\n');
        frame
    }
}

/// The validated form of one inbound request or notification.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: String,
    pub params: Map<String, Value>,
    /// Present for requests, absent for notifications.
    pub id: Option<Value>,
}

impl RequestEnvelope {
    /// Validates a parsed message into an envelope.
    ///
    /// Checks the JSON-RPC version and requires a string method. Params
    /// must be an object when present.
    pub fn validate(message: JsonRpcMessage) -> Result<Self, GatewayError> {
        if message.jsonrpc != "2.0" {
            return Err(GatewayError::Protocol(format!(
                "unsupported jsonrpc version '{}'",
                message.jsonrpc
            )));
        }
        let method = message
            .method
            .ok_or_else(|| GatewayError::Protocol("missing method".to_string()))?;

        let params = match message.params {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(GatewayError::Protocol(
                    "params must be an object".to_string(),
                ))
            }
        };

        Ok(Self {
            method,
            params,
            id: message.id,
        })
    }

    /// The tool name of a `tools/call`.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.get("name").and_then(Value::as_str)
    }

    /// The argument map of a `tools/call`.
    pub fn tool_arguments(&self) -> Map<String, Value> {
        match self.params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// The resource URI of a `resources/read` or subscribe.
    pub fn resource_uri(&self) -> Option<&str> {
        self.params.get("uri").and_then(Value::as_str)
    }

    /// Flattened text view: every string leaf in the params, concatenated
    /// in document order. This is what the text analyzers see.
    pub fn text_view(&self) -> String {
        let mut out = String::new();
        for value in self.params.values() {
            collect_strings(value, &mut out);
        }
        out.trim_end().to_string()
    }
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(text) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(text);
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Collects the string leaves of an arbitrary response payload.
pub fn response_text_view(value: &Value) -> String {
    let mut out = String::new();
    collect_strings(value, &mut out);
    out
}
