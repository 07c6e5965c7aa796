//! Session & client-info table (component D).
//!
//! An explicit dependency injected into the proxy engine rather than process-
//! wide mutable state (§9's redesign flag) — tests construct a fresh table
//! per scenario instead of sharing a global.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Sentinel id for a request that has not yet been bound to a session.
pub const STATELESS: &str = "stateless";

/// The client info advertised in `initialize.params.clientInfo`. Kept as a
/// permissive JSON value plus the commonly-needed `name`/`version` fields,
/// since the gateway does not validate beyond recognizing the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub raw: Value,
}

impl ClientInfo {
    /// Parse `initialize.params.clientInfo`; returns `None` if the params
    /// don't carry a recognizable clientInfo object (the spec treats this as
    /// "does not validate", which is not itself an error — initialize simply
    /// proceeds without a stored client-info entry).
    pub fn from_params(params: &Value) -> Option<Self> {
        let client_info = params.get("clientInfo")?;
        let name = client_info.get("name")?.as_str()?.to_string();
        let version = client_info
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            name,
            version,
            raw: client_info.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, session_id: &str, info: ClientInfo) {
        self.inner.write().await.insert(session_id.to_string(), info);
    }

    pub async fn get(&self, session_id: &str) -> Option<ClientInfo> {
        self.inner.read().await.get(session_id).cloned()
    }

    /// Copy the entry under `"stateless"` into `new_session_id`, the
    /// transition the proxy engine performs immediately after a successful
    /// `initialize` assigns a fresh session id. A no-op (not an error) if
    /// there is no stateless entry to copy, which happens when `initialize`
    /// carried no recognizable `clientInfo`.
    pub async fn promote_stateless(&self, new_session_id: &str) {
        let stateless = self.inner.read().await.get(STATELESS).cloned();
        if let Some(info) = stateless {
            self.inner
                .write()
                .await
                .insert(new_session_id.to_string(), info);
        }
    }
}

/// Normalize the inbound session header per §9's resolved open question:
/// case-insensitive lookup, sentinel default when absent.
pub fn session_id_from_headers(headers: &axum::http::HeaderMap) -> String {
    headers
        .iter()
        .find(|(name, _)| name.as_str().eq_ignore_ascii_case("mcp-session-id"))
        .and_then(|(_, value)| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or(STATELESS)
        .to_string()
}
