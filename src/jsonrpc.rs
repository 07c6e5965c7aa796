//! JSON-RPC 2.0 envelope validation shared by the proxy engine, the
//! management surface, and the SSE recognizer.
//!
//! The gateway deliberately does not attempt to understand tool payloads; it
//! only needs enough of the JSON-RPC 2.0 envelope to route, capture, and log
//! exchanges. Strict envelope shape checking is delegated to `jsonrpc-core`
//! (the crate the pack's MCP servers already use for this), while the raw
//! `serde_json::Value` is always retained alongside so forwarding and capture
//! can re-serialize the original body without lossy round-tripping through a
//! narrower Rust type.

use jsonrpc_core::{Call, Id, MethodCall, Notification, Params};
use serde_json::Value;

use crate::error::GatewayError;

/// A validated inbound JSON-RPC call, carrying both the parsed shape and the
/// original JSON value (needed to forward the exact bytes upstream).
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
    pub raw: Value,
}

impl RequestEnvelope {
    /// A request with no `id` is a notification: no response is expected and
    /// none is captured or logged.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Parse and validate a raw JSON body as a single (non-batch) JSON-RPC
/// request or notification.
pub fn parse_request(body: &[u8]) -> Result<RequestEnvelope, GatewayError> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|err| GatewayError::validation("body", format!("invalid JSON: {err}")))?;

    let call: Call = serde_json::from_value(raw.clone()).map_err(|_| {
        GatewayError::validation(
            "body",
            "body must be a JSON-RPC 2.0 request with jsonrpc, method, and optional id/params",
        )
    })?;

    match call {
        Call::MethodCall(MethodCall {
            method,
            params,
            id,
            ..
        }) => Ok(RequestEnvelope {
            id: Some(id_to_value(&id)),
            method,
            params: params_to_value(params),
            raw,
        }),
        Call::Notification(Notification { method, params, .. }) => Ok(RequestEnvelope {
            id: None,
            method,
            params: params_to_value(params),
            raw,
        }),
        Call::Invalid { .. } => Err(GatewayError::validation(
            "body",
            "malformed JSON-RPC request",
        )),
    }
}

fn id_to_value(id: &Id) -> Value {
    match id {
        Id::Num(n) => Value::from(*n),
        Id::Str(s) => Value::from(s.clone()),
        Id::Null => Value::Null,
    }
}

fn params_to_value(params: Params) -> Option<Value> {
    match params {
        Params::None => None,
        Params::Array(items) => Some(Value::Array(items)),
        Params::Map(map) => Some(Value::Object(map)),
    }
}

/// Classification of a JSON-RPC-shaped value, used by the SSE recognizer
/// (§4.C) to decide whether a `data:` payload is a request, a response, or
/// a notification, purely from the presence of `id`/`result`/`error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcShape {
    Request,
    Response,
    Notification,
}

/// Returns `None` when `value` is not JSON-RPC shaped at all (missing
/// `jsonrpc: "2.0"`).
pub fn classify(value: &Value) -> Option<JsonRpcShape> {
    let obj = value.as_object()?;
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return None;
    }
    let has_id = obj.contains_key("id");
    let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");
    if has_result_or_error {
        Some(JsonRpcShape::Response)
    } else if obj.contains_key("method") {
        if has_id {
            Some(JsonRpcShape::Request)
        } else {
            Some(JsonRpcShape::Notification)
        }
    } else {
        None
    }
}

/// Extract the `error.code`/`error.message` pair from an upstream JSON-RPC
/// error envelope, used to build `GatewayError::UpstreamSemantic` and the
/// log entry's `errorMessage` (§8 scenario 5: `"JSON-RPC -32602: bad"`).
pub fn extract_error(value: &Value) -> Option<(i64, String)> {
    let error = value.get("error")?.as_object()?;
    let code = error.get("code")?.as_i64()?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some((code, message))
}

pub fn format_error_message(code: i64, message: &str) -> String {
    format!("JSON-RPC {code}: {message}")
}
