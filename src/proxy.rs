//! Proxy engine (component F) — the heart of the gateway.
//!
//! Validates, forwards, tees, captures, logs, and returns upstream
//! responses for one MCP exchange. Grounded on
//! `src/mcp/streamable_http.rs`'s `handle_streamable_post` request shape and
//! `src/mcp_http_bridge.rs`'s generic tool-forwarding bridge, generalized
//! from "one local tool registry" to "forward to any registered upstream".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use mime::Mime;
use serde_json::Value;

use dashmap::DashMap;

use crate::capture::{CaptureMetadata, CaptureRecord, CaptureStore, CaptureKind, Direction as CaptureDirection};
use crate::codemode::{CodeMode, RawTool, RpcCall, ScriptPlan, ServerToolSet};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{Direction as LogDirection, EventBus, LogEntry};
use crate::jsonrpc::{self, RequestEnvelope};
use crate::registry::{Registry, ServerRecord};
use crate::session::{session_id_from_headers, ClientInfo, SessionTable, STATELESS};
use crate::sse::{classify_event, SseClassification, SseDecoder};

/// One server's compiled code-mode surface, cached until the next
/// `tools/list` refresh (§3: "Lifecycle: rebuilt whenever the upstream's
/// tools/list is refreshed").
pub type CodeModeCache = DashMap<String, Arc<CodeMode>>;

/// Headers the gateway manages itself; never mirrored from client to
/// upstream or upstream to client (§4.F step 6/10).
const HOST_MANAGED_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";
const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Shared dependencies the proxy engine borrows (it owns none of them, per
/// §3's ownership summary).
pub struct ProxyEngine {
    pub registry: Arc<Registry>,
    pub captures: Arc<CaptureStore>,
    pub sessions: SessionTable,
    pub events: EventBus,
    pub http_client: reqwest::Client,
    pub exchange_timeout: Duration,
}

/// The inbound request the router hands to the proxy engine, already split
/// into its parts.
pub struct ProxyRequest {
    pub server_name: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the router sends back to the client.
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub content_type: String,
}

impl ProxyEngine {
    /// Handle one forwarded exchange (§4.F's numbered algorithm). `server`
    /// has already been validated to exist by the caller in the codemode
    /// variant (which needs the record before deciding to intercept); the
    /// plain path resolves it here (step 1).
    pub async fn handle_forward(&self, request: ProxyRequest) -> GatewayResult<ProxyResponse> {
        let server = self
            .registry
            .get(&request.server_name)
            .await
            .ok_or_else(|| GatewayError::NotFound(request.server_name.clone()))?;

        let envelope = jsonrpc::parse_request(&request.body)?;
        let session_id = session_id_from_headers(&request.headers);
        self.forward(&server.name, &server.url, &server.headers, &session_id, envelope, &request.headers)
            .await
    }

    /// The shared forwarding path used by both the plain proxy route and
    /// code-mode's "any other method" passthrough (§4.F's codemode variant).
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        server_name: &str,
        server_url: &str,
        server_headers: &HashMap<String, String>,
        session_id: &str,
        envelope: RequestEnvelope,
        inbound_headers: &HeaderMap,
    ) -> GatewayResult<ProxyResponse> {
        let start = Instant::now();
        let now = Utc::now();

        // Step 3: capture the request.
        let request_record = CaptureRecord {
            capture_id: crate::capture::new_capture_id(),
            kind: CaptureKind::Request,
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: CaptureDirection::Inbound,
            timestamp: now,
            request: Some(envelope.raw.clone()),
            response: None,
            sse_event: None,
            error_message: None,
            metadata: CaptureMetadata::default(),
        };
        if let Err(err) = self.captures.append(&request_record).await {
            tracing::warn!(%server_name, %session_id, error = %err, "capture-io: request record dropped");
        }

        // Step 4: publish the request LogEntry.
        self.events.publish_log(LogEntry {
            capture_id: request_record.capture_id.clone(),
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: LogDirection::Request,
            timestamp: now,
            http_status: 0,
            duration_ms: 0,
            error_message: None,
            envelope: Some(envelope.raw.clone()),
        });

        // Step 5: stash clientInfo for a fresh initialize.
        if envelope.method == "initialize" {
            if let Some(params) = envelope.params.as_ref() {
                if let Some(client_info) = ClientInfo::from_params(params) {
                    self.sessions.store(session_id, client_info).await;
                }
            }
        }

        let is_notification = envelope.is_notification();
        let result = self
            .forward_to_upstream(server_name, server_url, server_headers, session_id, &envelope, inbound_headers)
            .await;

        match result {
            Ok(response) => {
                self.bump_activity(server_name).await;
                Ok(response)
            }
            Err(err) => {
                // Step 12: synthesized error envelope, captured and logged,
                // but only returned to the client when there is an id to
                // answer (notifications never receive a synthesized reply,
                // and never get a response LogEntry either — there is no
                // response to describe).
                let error_message = err.to_string();
                let _ = self
                    .captures
                    .capture_error(
                        server_name,
                        session_id,
                        &envelope.method,
                        CaptureDirection::Outbound,
                        error_message.clone(),
                        Utc::now(),
                    )
                    .await;

                if is_notification {
                    self.bump_activity(server_name).await;
                    return Err(err);
                }

                self.events.publish_log(LogEntry {
                    capture_id: crate::capture::new_capture_id(),
                    server_name: server_name.to_string(),
                    session_id: session_id.to_string(),
                    method: envelope.method.clone(),
                    direction: LogDirection::Response,
                    timestamp: Utc::now(),
                    http_status: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error_message: Some(error_message),
                    envelope: None,
                });
                self.bump_activity(server_name).await;

                let envelope = err.to_jsonrpc_error(envelope.id.clone().unwrap_or(Value::Null));
                Ok(ProxyResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default()),
                    content_type: "application/json".to_string(),
                })
            }
        }
    }

    async fn bump_activity(&self, server_name: &str) {
        if let Err(err) = self.registry.bump_activity(server_name, Utc::now()).await {
            tracing::warn!(%server_name, error = %err, "registry-io: activity bump failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_to_upstream(
        &self,
        server_name: &str,
        server_url: &str,
        server_headers: &HashMap<String, String>,
        session_id: &str,
        envelope: &RequestEnvelope,
        inbound_headers: &HeaderMap,
    ) -> GatewayResult<ProxyResponse> {
        let start = Instant::now();

        // Step 6: build proxy headers.
        let mut request_builder = self.http_client.post(server_url);
        request_builder = request_builder.header("Content-Type", "application/json");

        let protocol_version = inbound_headers
            .get(PROTOCOL_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        request_builder = request_builder.header(PROTOCOL_HEADER, protocol_version);

        let outbound_session = if session_id == STATELESS { "" } else { session_id };
        request_builder = request_builder.header(SESSION_HEADER, outbound_session);

        for (name, value) in server_headers {
            if HOST_MANAGED_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            request_builder = request_builder.header(name, value);
        }

        if let Some(accept) = inbound_headers.get("accept") {
            if let Ok(accept) = accept.to_str() {
                request_builder = request_builder.header("Accept", accept);
            }
        }

        // Step 7: forward.
        let response = request_builder
            .json(&envelope.raw)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamTransport {
                server: server_name.to_string(),
                source: err.into(),
            })?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let content_type = response_headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        // Step 8: branch on content-type.
        if is_event_stream(&content_type) {
            self.handle_sse_response(server_name, session_id, envelope, response, status, start)
                .await
        } else {
            self.handle_json_response(server_name, session_id, envelope, response, status, content_type, start)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_json_response(
        &self,
        server_name: &str,
        session_id: &str,
        envelope: &RequestEnvelope,
        response: reqwest::Response,
        status: u16,
        content_type: String,
        start: Instant,
    ) -> GatewayResult<ProxyResponse> {
        let mcp_session_header = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::UpstreamTransport {
                server: server_name.to_string(),
                source: err.into(),
            })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let parsed: Option<Value> = serde_json::from_slice(&body).ok();

        // Only record a response capture when the original request carried
        // a non-null id (§4.F step 8, "Otherwise" branch).
        if !envelope.is_notification() {
            let response_value = parsed.clone().unwrap_or_else(|| {
                Value::String(String::from_utf8_lossy(&body).to_string())
            });
            let error_message = parsed
                .as_ref()
                .and_then(jsonrpc::extract_error)
                .map(|(code, message)| jsonrpc::format_error_message(code, &message));

            let record = CaptureRecord {
                capture_id: crate::capture::new_capture_id(),
                kind: CaptureKind::Response,
                server_name: server_name.to_string(),
                session_id: session_id.to_string(),
                method: envelope.method.clone(),
                direction: CaptureDirection::Outbound,
                timestamp: Utc::now(),
                request: None,
                response: Some(response_value.clone()),
                sse_event: None,
                error_message: error_message.clone(),
                metadata: CaptureMetadata {
                    http_status: Some(status),
                    duration_ms: Some(duration_ms),
                },
            };
            if let Err(err) = self.captures.append(&record).await {
                tracing::warn!(%server_name, %session_id, error = %err, "capture-io: response record dropped");
            }

            self.events.publish_log(LogEntry {
                capture_id: record.capture_id,
                server_name: server_name.to_string(),
                session_id: session_id.to_string(),
                method: envelope.method.clone(),
                direction: LogDirection::Response,
                timestamp: Utc::now(),
                http_status: status,
                duration_ms,
                error_message,
                envelope: Some(response_value),
            });
        }

        // Step 9: session transition.
        if envelope.method == "initialize" && session_id == STATELESS {
            if let Some(new_session_id) = mcp_session_header.as_deref() {
                self.sessions.promote_stateless(new_session_id).await;
                if let Err(err) = self
                    .captures
                    .rename_session_file(server_name, STATELESS, new_session_id)
                    .await
                {
                    tracing::warn!(%server_name, error = %err, "capture-io: session rename failed (non-fatal)");
                }
            }
        }

        // Step 10: relay verbatim.
        let mut headers = Vec::new();
        if let Some(session_header) = mcp_session_header {
            headers.push((SESSION_HEADER.to_string(), session_header));
        }

        Ok(ProxyResponse {
            status,
            headers,
            body,
            content_type,
        })
    }

    async fn handle_sse_response(
        &self,
        server_name: &str,
        session_id: &str,
        envelope: &RequestEnvelope,
        response: reqwest::Response,
        status: u16,
        start: Instant,
    ) -> GatewayResult<ProxyResponse> {
        let server_name = server_name.to_string();
        let session_id = session_id.to_string();
        let method = envelope.method.clone();
        let captures = self.captures.clone();
        let events = self.events.clone();

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut out = Vec::new();

        // Drive the tee inline: the background capture pipeline must not
        // slow or fail the client stream (§4.F step 8), but this
        // synchronous implementation still completes draining the upstream
        // body before returning, which preserves the durable-capture
        // invariant even though the caller is a buffered (not chunked)
        // response — a streaming embedding would instead spawn the capture
        // side onto its own task per §9.
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| GatewayError::UpstreamTransport {
                server: server_name.clone(),
                source: err.into(),
            })?;
            out.extend_from_slice(&chunk);
            decoder.push(&chunk);
            while let Some(event) = decoder.next_event() {
                Self::capture_sse_event(&captures, &events, &server_name, &session_id, &method, event, start).await;
            }
        }
        if let Some(event) = decoder.finish() {
            Self::capture_sse_event(&captures, &events, &server_name, &session_id, &method, event, start).await;
        }

        Ok(ProxyResponse {
            status,
            headers: Vec::new(),
            body: Bytes::from(out),
            content_type: "text/event-stream".to_string(),
        })
    }

    async fn capture_sse_event(
        captures: &CaptureStore,
        events: &EventBus,
        server_name: &str,
        session_id: &str,
        request_method: &str,
        event: crate::sse::SseEvent,
        start: Instant,
    ) {
        match classify_event(&event) {
            SseClassification::JsonRpc { value, .. } => {
                let error_message = jsonrpc::extract_error(&value)
                    .map(|(code, message)| jsonrpc::format_error_message(code, &message));
                let metadata = CaptureMetadata {
                    http_status: Some(200),
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                };
                let result = captures
                    .capture_sse_json_rpc(server_name, session_id, request_method, value.clone(), metadata.clone(), Utc::now())
                    .await;
                if let Err(err) = result {
                    tracing::warn!(%server_name, error = %err, "capture-io: sse json-rpc record dropped");
                }
                let is_response = value.get("result").is_some() || value.get("error").is_some();
                if is_response {
                    events.publish_log(LogEntry {
                        capture_id: crate::capture::new_capture_id(),
                        server_name: server_name.to_string(),
                        session_id: session_id.to_string(),
                        method: request_method.to_string(),
                        direction: LogDirection::Response,
                        timestamp: Utc::now(),
                        http_status: metadata.http_status.unwrap_or(0),
                        duration_ms: metadata.duration_ms.unwrap_or(0),
                        error_message,
                        envelope: Some(value),
                    });
                }
            }
            SseClassification::Opaque => {
                let payload = serde_json::json!({
                    "id": event.id,
                    "event": event.event,
                    "data": event.data,
                    "retry": event.retry,
                });
                if let Err(err) = captures
                    .capture_sse_event(server_name, session_id, payload, Utc::now())
                    .await
                {
                    tracing::warn!(%server_name, error = %err, "capture-io: sse opaque record dropped");
                }
            }
        }
    }
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .parse::<Mime>()
        .map(|mime| mime.type_() == "text" && mime.subtype() == "event-stream")
        .unwrap_or_else(|_| content_type.starts_with("text/event-stream"))
}

/// Adapts the proxy engine's forwarding path to code-mode's [`RpcCall`]
/// boundary: inner `tools/call` invocations from a script are routed back
/// through `forward`, so they are captured and logged like any other
/// exchange (§4.F's codemode variant, §4.G's `rpcHandler`).
pub struct ProxyRpcCall<'a> {
    pub engine: &'a ProxyEngine,
    pub session_id: String,
    pub registry_snapshot: HashMap<String, (String, HashMap<String, String>)>,
}

#[async_trait::async_trait]
impl<'a> RpcCall for ProxyRpcCall<'a> {
    async fn call(
        &self,
        original_server_name: &str,
        original_tool_name: &str,
        args: Value,
    ) -> GatewayResult<Value> {
        let (url, headers) = self
            .registry_snapshot
            .get(original_server_name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(original_server_name.to_string()))?;

        let id = Value::from(uuid::Uuid::new_v4().to_string());
        let raw = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": original_tool_name, "arguments": args },
        });
        let envelope = RequestEnvelope {
            id: Some(id),
            method: "tools/call".to_string(),
            params: raw.get("params").cloned(),
            raw,
        };

        let mut headers_map = HeaderMap::new();
        headers_map.insert("accept", HeaderValue::from_static("application/json"));

        let response = self
            .engine
            .forward(
                original_server_name,
                &url,
                &headers,
                &self.session_id,
                envelope,
                &headers_map,
            )
            .await?;

        let parsed: Value = serde_json::from_slice(&response.body)
            .map_err(|err| GatewayError::UpstreamTransport {
                server: original_server_name.to_string(),
                source: err.into(),
            })?;

        if let Some((code, message)) = jsonrpc::extract_error(&parsed) {
            return Err(GatewayError::UpstreamSemantic {
                server: original_server_name.to_string(),
                code,
                message,
                envelope: parsed,
            });
        }

        let result = parsed.get("result").cloned().unwrap_or(Value::Null);
        Ok(result
            .get("structuredContent")
            .cloned()
            .unwrap_or_else(|| result.get("content").cloned().unwrap_or(result)))
    }
}

/// Build the synthesized `tools/list` response for code mode: the server's
/// cached real tools collapsed into the single `execute_code` tool (§4.F's
/// codemode variant).
pub fn synthesize_tools_list(code_mode: &CodeMode, request_id: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "result": { "tools": [code_mode.execute_code_tool_schema()] }
    })
}

/// Build the JSON-RPC success envelope for a completed `execute_code` call
/// (§4.F's codemode variant: "wrap the returned ExecutionResult as a
/// JSON-RPC success whose result.content is a single text block").
pub fn wrap_execution_result(request_id: Value, result: &crate::codemode::ExecutionResult) -> Value {
    let text = serde_json::to_string_pretty(result).unwrap_or_default();
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "result": {
            "content": [{ "type": "text", "text": text }]
        }
    })
}

/// Parse a [`ScriptPlan`] out of the `code` string carried in
/// `execute_code`'s arguments. The plan is authored as JSON (an ordered
/// list of `{binding, server, tool, args}` steps plus a `return` expression)
/// rather than free-form script text, per §4.G/§9's redesign.
pub fn parse_script_plan(code: &str) -> GatewayResult<ScriptPlan> {
    let value: Value = serde_json::from_str(code)
        .map_err(|err| GatewayError::CodemodeExecution(format!("invalid call plan JSON: {err}")))?;

    let steps_value = value
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut steps = Vec::with_capacity(steps_value.len());
    for step in steps_value {
        let binding = step
            .get("binding")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::CodemodeExecution("step missing 'binding'".to_string()))?
            .to_string();
        let server = step
            .get("server")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::CodemodeExecution("step missing 'server'".to_string()))?
            .to_string();
        let tool = step
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::CodemodeExecution("step missing 'tool'".to_string()))?
            .to_string();
        let args = step.get("args").cloned().unwrap_or(Value::Null);
        steps.push(crate::codemode::ScriptStep { binding, server, tool, args });
    }

    let ret = match value.get("return") {
        Some(Value::Object(obj)) if obj.contains_key("binding") => {
            crate::codemode::ReturnExpr::Binding(
                obj.get("binding").and_then(Value::as_str).unwrap_or_default().to_string(),
            )
        }
        Some(Value::Null) | None => crate::codemode::ReturnExpr::Undefined,
        Some(literal) => crate::codemode::ReturnExpr::Literal(literal.clone()),
    };

    Ok(ScriptPlan { steps, ret })
}

/// The codemode variant of §4.F, mounted at `/servers/:server/mcp-codemode`.
/// Session handling and capture reuse the plain path's `forward`; only the
/// client-visible response shape differs.
pub struct CodeModeEngine<'a> {
    pub proxy: &'a ProxyEngine,
    pub cache: &'a CodeModeCache,
    pub default_timeout: Duration,
}

impl<'a> CodeModeEngine<'a> {
    pub async fn handle(&self, request: ProxyRequest) -> GatewayResult<ProxyResponse> {
        let server = self
            .proxy
            .registry
            .get(&request.server_name)
            .await
            .ok_or_else(|| GatewayError::NotFound(request.server_name.clone()))?;

        let envelope = jsonrpc::parse_request(&request.body)?;
        let session_id = session_id_from_headers(&request.headers);

        match envelope.method.as_str() {
            "tools/list" => self.handle_tools_list(&server, envelope, &session_id, &request.headers).await,
            "tools/call"
                if envelope
                    .params
                    .as_ref()
                    .and_then(|params| params.get("name"))
                    .and_then(Value::as_str)
                    == Some(crate::codemode::EXECUTE_CODE_TOOL_NAME) =>
            {
                self.handle_execute_code(&server, envelope, &session_id).await
            }
            _ => {
                self.proxy
                    .forward(&server.name, &server.url, &server.headers, &session_id, envelope, &request.headers)
                    .await
            }
        }
    }

    async fn handle_tools_list(
        &self,
        server: &ServerRecord,
        envelope: RequestEnvelope,
        session_id: &str,
        inbound_headers: &HeaderMap,
    ) -> GatewayResult<ProxyResponse> {
        let request_id = envelope.id.clone().unwrap_or(Value::Null);
        let response = self
            .proxy
            .forward(&server.name, &server.url, &server.headers, session_id, envelope, inbound_headers)
            .await?;

        let parsed: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
        let tools_value = parsed.get("result").and_then(|result| result.get("tools")).cloned();
        if let Some(tools_value) = tools_value.clone() {
            if let Err(err) = self.proxy.registry.cache_tools(&server.name, tools_value).await {
                tracing::warn!(server = %server.name, error = %err, "registry-io: tool cache update failed");
            }
        }

        let raw_tools: Vec<RawTool> = tools_value
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .map(|tool| RawTool {
                name: tool.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                description: tool.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
                input_schema: tool.get("inputSchema").cloned().unwrap_or(Value::Null),
                output_schema: tool.get("outputSchema").cloned(),
            })
            .collect();

        let code_mode = Arc::new(CodeMode::build(
            vec![ServerToolSet { server_name: server.name.clone(), tools: raw_tools }],
            self.default_timeout,
        ));
        self.cache.insert(server.name.clone(), code_mode.clone());

        let synthesized = synthesize_tools_list(&code_mode, request_id);
        Ok(ProxyResponse {
            status: response.status,
            headers: response.headers,
            body: Bytes::from(serde_json::to_vec(&synthesized).unwrap_or_default()),
            content_type: "application/json".to_string(),
        })
    }

    async fn handle_execute_code(
        &self,
        server: &ServerRecord,
        envelope: RequestEnvelope,
        session_id: &str,
    ) -> GatewayResult<ProxyResponse> {
        let request_id = envelope.id.clone().unwrap_or(Value::Null);
        let now = Utc::now();
        let start = Instant::now();

        let request_record = CaptureRecord {
            capture_id: crate::capture::new_capture_id(),
            kind: CaptureKind::Request,
            server_name: server.name.clone(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: CaptureDirection::Inbound,
            timestamp: now,
            request: Some(envelope.raw.clone()),
            response: None,
            sse_event: None,
            error_message: None,
            metadata: CaptureMetadata::default(),
        };
        let _ = self.proxy.captures.append(&request_record).await;
        self.proxy.events.publish_log(LogEntry {
            capture_id: request_record.capture_id,
            server_name: server.name.clone(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: LogDirection::Request,
            timestamp: now,
            http_status: 0,
            duration_ms: 0,
            error_message: None,
            envelope: Some(envelope.raw.clone()),
        });

        let Some(code_mode) = self.cache.get(&server.name).map(|entry| entry.value().clone()) else {
            return Err(GatewayError::CodemodeExecution(
                "tools/list has not been called for this server yet".to_string(),
            ));
        };

        let code = envelope
            .params
            .as_ref()
            .and_then(|params| params.get("arguments"))
            .and_then(|args| args.get("code"))
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::CodemodeExecution("missing 'code' argument".to_string()))?;
        let plan = parse_script_plan(code)?;

        let mut registry_snapshot = HashMap::new();
        registry_snapshot.insert(server.name.clone(), (server.url.clone(), server.headers.clone()));
        let rpc = ProxyRpcCall {
            engine: self.proxy,
            session_id: session_id.to_string(),
            registry_snapshot,
        };

        let result = code_mode.execute(&plan, &rpc, None).await;
        let response_envelope = wrap_execution_result(request_id, &result);

        let response_record = CaptureRecord {
            capture_id: crate::capture::new_capture_id(),
            kind: CaptureKind::Response,
            server_name: server.name.clone(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: CaptureDirection::Outbound,
            timestamp: Utc::now(),
            request: None,
            response: Some(response_envelope.clone()),
            sse_event: None,
            error_message: result.error.clone(),
            metadata: CaptureMetadata {
                http_status: Some(200),
                duration_ms: Some(start.elapsed().as_millis() as u64),
            },
        };
        let _ = self.proxy.captures.append(&response_record).await;
        self.proxy.events.publish_log(LogEntry {
            capture_id: response_record.capture_id,
            server_name: server.name.clone(),
            session_id: session_id.to_string(),
            method: envelope.method.clone(),
            direction: LogDirection::Response,
            timestamp: Utc::now(),
            http_status: 200,
            duration_ms: start.elapsed().as_millis() as u64,
            error_message: result.error,
            envelope: Some(response_envelope.clone()),
        });
        self.proxy.bump_activity(&server.name).await;

        Ok(ProxyResponse {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(serde_json::to_vec(&response_envelope).unwrap_or_default()),
            content_type: "application/json".to_string(),
        })
    }
}
