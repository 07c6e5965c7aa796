//! Management RPC surface (component H).
//!
//! Exposes gateway introspection as an MCP endpoint on the same process:
//! `list_servers`, `get_server_status`, `tail_session_log`,
//! `subscribe_activity` (§4.H). Consumes the registry (A) and capture store
//! (B) read-only, and the event bus (E) for the bounded activity tap.
//! Grounded on `src/mcp/services_tools.rs`'s tool-dispatch shape (a
//! `method` string routed to a handler, tools enumerated via
//! `get_tool_definitions`) and `src/mcp_http_bridge.rs`'s
//! `McpToolsListResponse` JSON shape.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::capture::CaptureStore;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventBus, GatewayEvent};
use crate::jsonrpc::RequestEnvelope;
use crate::registry::{Registry, ServerSpec};

pub struct ManagementSurface {
    pub registry: Arc<Registry>,
    pub captures: Arc<CaptureStore>,
    pub events: EventBus,
}

fn tool_definitions() -> Vec<Value> {
    vec![
        serde_json::json!({
            "name": "list_servers",
            "description": "List every registered upstream MCP server and its current metadata.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        serde_json::json!({
            "name": "get_server_status",
            "description": "Get the registry record for a single named server.",
            "inputSchema": {
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }
        }),
        serde_json::json!({
            "name": "add_server",
            "description": "Register a new upstream MCP server with the gateway.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "url": { "type": "string" },
                    "headers": { "type": "object", "additionalProperties": { "type": "string" } }
                },
                "required": ["name", "url"]
            }
        }),
        serde_json::json!({
            "name": "remove_server",
            "description": "Unregister an upstream MCP server from the gateway.",
            "inputSchema": {
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }
        }),
        serde_json::json!({
            "name": "tail_session_log",
            "description": "Read the last N records of a session's capture file.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "server": { "type": "string" },
                    "sessionId": { "type": "string" },
                    "limit": { "type": "integer", "default": 50 }
                },
                "required": ["server", "sessionId"]
            }
        }),
        serde_json::json!({
            "name": "subscribe_activity",
            "description": "Collect a bounded window of live_log entries published on the event bus.",
            "inputSchema": {
                "type": "object",
                "properties": { "windowMs": { "type": "integer", "default": 1000 } }
            }
        }),
    ]
}

impl ManagementSurface {
    pub async fn handle(&self, envelope: RequestEnvelope) -> GatewayResult<Value> {
        let id = envelope.id.clone().unwrap_or(Value::Null);
        let result = match envelope.method.as_str() {
            "initialize" => serde_json::json!({
                "protocolVersion": "2025-06-18",
                "serverInfo": { "name": "mcp-gateway-management", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": { "tools": {} }
            }),
            "tools/list" => serde_json::json!({ "tools": tool_definitions() }),
            "tools/call" => self.dispatch_tool_call(envelope.params.clone()).await?,
            other => {
                return Err(GatewayError::validation(
                    "method",
                    format!("unknown management method '{other}'"),
                ))
            }
        };
        Ok(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    async fn dispatch_tool_call(&self, params: Option<Value>) -> GatewayResult<Value> {
        let params = params.ok_or_else(|| GatewayError::validation("params", "tools/call requires params"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("params.name", "tool name is required"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));

        let content = match name {
            "list_servers" => self.list_servers().await,
            "get_server_status" => self.get_server_status(&arguments).await?,
            "add_server" => self.add_server(&arguments).await?,
            "remove_server" => self.remove_server(&arguments).await?,
            "tail_session_log" => self.tail_session_log(&arguments).await?,
            "subscribe_activity" => self.subscribe_activity(&arguments).await,
            other => {
                return Err(GatewayError::validation(
                    "params.name",
                    format!("unknown management tool '{other}'"),
                ))
            }
        };

        Ok(serde_json::json!({
            "content": [{ "type": "text", "text": serde_json::to_string_pretty(&content).unwrap_or_default() }]
        }))
    }

    async fn list_servers(&self) -> Value {
        let servers = self.registry.list().await;
        serde_json::to_value(servers).unwrap_or(Value::Array(Vec::new()))
    }

    async fn get_server_status(&self, arguments: &Value) -> GatewayResult<Value> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("name", "server name is required"))?;
        let server = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;
        Ok(serde_json::to_value(server).unwrap_or(Value::Null))
    }

    async fn add_server(&self, arguments: &Value) -> GatewayResult<Value> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("name", "server name is required"))?;
        let url = arguments
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("url", "server url is required"))?;
        let headers = arguments
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let record = self
            .registry
            .add(ServerSpec { name: name.to_string(), url: url.to_string(), headers })
            .await?;
        Ok(serde_json::to_value(record).unwrap_or(Value::Null))
    }

    async fn remove_server(&self, arguments: &Value) -> GatewayResult<Value> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("name", "server name is required"))?;
        self.registry.remove(name).await?;
        Ok(serde_json::json!({ "removed": name }))
    }

    async fn tail_session_log(&self, arguments: &Value) -> GatewayResult<Value> {
        let server = arguments
            .get("server")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("server", "server is required"))?;
        let session_id = arguments
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("sessionId", "sessionId is required"))?;
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;

        let path = self
            .captures
            .session_file_path(server, session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("{server}/{session_id}")))?;
        let records = self
            .captures
            .read_records(&path)
            .await
            .map_err(|err| GatewayError::CaptureIo(anyhow::anyhow!(err.to_string())))?;

        let tail: Vec<_> = records.into_iter().rev().take(limit).collect();
        Ok(serde_json::to_value(tail).unwrap_or(Value::Array(Vec::new())))
    }

    /// Collect `log_added` entries published during a bounded window, as a
    /// one-shot SSE-less substitute for the TUI/web frontend's live tap.
    async fn subscribe_activity(&self, arguments: &Value) -> Value {
        let window_ms = arguments.get("windowMs").and_then(Value::as_u64).unwrap_or(1000);
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = collected.clone();
        let subscription = self.events.on(move |event| {
            if let GatewayEvent::LogAdded(entry) = event {
                sink.lock().push(entry.clone());
            }
        });

        tokio::time::sleep(Duration::from_millis(window_ms)).await;
        self.events.off(subscription);

        let entries = collected.lock().clone();
        serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::STATELESS;

    async fn surface() -> ManagementSurface {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let registry = Arc::new(Registry::load(dir.path(), events.clone()).await.unwrap());
        let captures = Arc::new(CaptureStore::new(dir.path().join("captures")));
        ManagementSurface { registry, captures, events }
    }

    fn envelope(method: &str, params: Option<Value>) -> RequestEnvelope {
        RequestEnvelope {
            id: Some(Value::from(1)),
            method: method.to_string(),
            params,
            raw: Value::Null,
        }
    }

    #[tokio::test]
    async fn tools_list_enumerates_the_fixed_tool_set() {
        let surface = surface().await;
        let response = surface.handle(envelope("tools/list", None)).await.unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 6);
    }

    #[tokio::test]
    async fn add_server_then_remove_server_round_trips_through_the_registry() {
        let surface = surface().await;
        let add = envelope(
            "tools/call",
            Some(serde_json::json!({
                "name": "add_server",
                "arguments": {"name": "echo", "url": "http://localhost:9000"}
            })),
        );
        let response = surface.handle(add).await.unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"echo\""));
        assert!(surface.registry.get("echo").await.is_some());

        let remove = envelope(
            "tools/call",
            Some(serde_json::json!({"name": "remove_server", "arguments": {"name": "echo"}})),
        );
        surface.handle(remove).await.unwrap();
        assert!(surface.registry.get("echo").await.is_none());
    }

    #[tokio::test]
    async fn add_server_rejects_duplicate_names() {
        let surface = surface().await;
        let add = |name: &str| {
            envelope(
                "tools/call",
                Some(serde_json::json!({
                    "name": "add_server",
                    "arguments": {"name": name, "url": "http://localhost:9000"}
                })),
            )
        };
        surface.handle(add("echo")).await.unwrap();
        let err = surface.handle(add("ECHO")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn list_servers_reflects_registry_contents() {
        let surface = surface().await;
        surface
            .registry
            .add(crate::registry::ServerSpec {
                name: "echo".to_string(),
                url: "http://localhost:9000".to_string(),
                headers: Default::default(),
            })
            .await
            .unwrap();

        let call = envelope(
            "tools/call",
            Some(serde_json::json!({"name": "list_servers", "arguments": {}})),
        );
        let response = surface.handle(call).await.unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("echo"));
    }

    #[tokio::test]
    async fn get_server_status_on_unknown_server_is_not_found() {
        let surface = surface().await;
        let call = envelope(
            "tools/call",
            Some(serde_json::json!({"name": "get_server_status", "arguments": {"name": "ghost"}})),
        );
        let err = surface.handle(call).await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn tail_session_log_returns_captured_records() {
        let surface = surface().await;
        surface
            .captures
            .capture_error("echo", STATELESS, "ping", crate::capture::Direction::Inbound, "boom".to_string(), chrono::Utc::now())
            .await
            .unwrap();

        let call = envelope(
            "tools/call",
            Some(serde_json::json!({
                "name": "tail_session_log",
                "arguments": {"server": "echo", "sessionId": STATELESS, "limit": 10}
            })),
        );
        let response = surface.handle(call).await.unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("boom"));
    }
}
