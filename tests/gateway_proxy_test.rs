//! End-to-end exercises of the gateway: a real axum server bound to an
//! ephemeral port, driven with `reqwest`, forwarding to `wiremock`-stubbed
//! upstream MCP servers. Mirrors `tests/mcp_streamable_http_test.rs`'s
//! bind-a-real-listener-and-drive-with-reqwest shape, generalized to a
//! gateway fronting an upstream instead of hosting one directly.

use std::net::SocketAddr;
use std::time::Duration;

use mcp_gateway::config::{CodemodeConfig, GatewayConfig, McpConfig, ServerConfig, StorageConfig};
use mcp_gateway::registry::ServerSpec;
use mcp_gateway::{build_router, GatewayState};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestGateway {
    addr: SocketAddr,
    _temp_dir: TempDir,
    _task: tokio::task::JoinHandle<()>,
}

async fn start_gateway() -> (TestGateway, GatewayState) {
    let temp_dir = TempDir::new().unwrap();
    let config = GatewayConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            exchange_timeout: Duration::from_secs(5),
        },
        storage: StorageConfig {
            registry_root: temp_dir.path().to_path_buf(),
            capture_root: temp_dir.path().join("captures"),
        },
        mcp: McpConfig {
            default_protocol_version: "2025-06-18".to_string(),
        },
        codemode: CodemodeConfig {
            default_script_timeout: Duration::from_millis(2_000),
        },
    };

    let state = GatewayState::bootstrap(&config).await.unwrap();
    let router = build_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });

    tokio::time::sleep(Duration::from_millis(30)).await;

    (
        TestGateway {
            addr,
            _temp_dir: temp_dir,
            _task: task,
        },
        state,
    )
}

#[tokio::test]
async fn simple_echo_request_is_forwarded_and_captured() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"pong": true}})),
        )
        .mount(&upstream)
        .await;

    let (gateway, state) = start_gateway().await;
    state
        .registry
        .add(ServerSpec {
            name: "echo".to_string(),
            url: format!("{}/mcp", upstream.uri()),
            headers: Default::default(),
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/echo/mcp", gateway.addr))
        .header("content-type", "application/json")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["pong"], true);

    let record = state.registry.get("echo").await.unwrap();
    assert_eq!(record.exchange_count, 1);
}

#[tokio::test]
async fn initialize_transitions_a_stateless_session_to_a_real_session_id() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "sess-123")
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {"protocolVersion": "2025-06-18"}
                })),
        )
        .mount(&upstream)
        .await;

    let (gateway, state) = start_gateway().await;
    state
        .registry
        .add(ServerSpec {
            name: "init-server".to_string(),
            url: format!("{}/mcp", upstream.uri()),
            headers: Default::default(),
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/init-server/mcp", gateway.addr))
        .header("content-type", "application/json")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"clientInfo": {"name": "test-client", "version": "1.0"}}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap().to_str().unwrap(),
        "sess-123"
    );

    let path = state
        .captures
        .session_file_path("init-server", "sess-123")
        .expect("capture file should have been renamed to the real session id");
    assert!(tokio::fs::metadata(&path).await.is_ok());
}

#[tokio::test]
async fn notification_receives_no_body_even_on_upstream_failure() {
    let (gateway, state) = start_gateway().await;
    state
        .registry
        .add(ServerSpec {
            name: "down".to_string(),
            url: "http://127.0.0.1:1/mcp".to_string(),
            headers: Default::default(),
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/down/mcp", gateway.addr))
        .header("content-type", "application/json")
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn upstream_json_rpc_error_passes_through_untouched() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "error": {"code": -32601, "message": "Method not found"}
        })))
        .mount(&upstream)
        .await;

    let (gateway, state) = start_gateway().await;
    state
        .registry
        .add(ServerSpec {
            name: "erroring".to_string(),
            url: format!("{}/mcp", upstream.uri()),
            headers: Default::default(),
        })
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/erroring/mcp", gateway.addr))
        .header("content-type", "application/json")
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "ghost/call"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn registering_a_duplicate_server_name_is_rejected() {
    let (_gateway, state) = start_gateway().await;
    state
        .registry
        .add(ServerSpec {
            name: "dup".to_string(),
            url: "http://127.0.0.1:9/mcp".to_string(),
            headers: Default::default(),
        })
        .await
        .unwrap();

    let second = state
        .registry
        .add(ServerSpec {
            name: "DUP".to_string(),
            url: "http://127.0.0.1:10/mcp".to_string(),
            headers: Default::default(),
        })
        .await;
    assert!(second.is_err());
}
