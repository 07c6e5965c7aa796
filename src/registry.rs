//! Registry store (component A) — the in-memory + on-disk catalog of
//! upstream servers.
//!
//! Persistence is a single JSON file at `<root>/registry.json`, rewritten
//! atomically via write-temp-then-`tokio::fs::rename`, the same pattern the
//! teacher uses for WAL rotation in `native_graph_storage.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Up,
    Down,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Unknown
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
}

/// One registered upstream MCP server. Field order matches §3: identity,
/// then attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub url: String,
    pub transport: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exchange_count: u64,
    #[serde(default)]
    pub tool_cache: Option<serde_json::Value>,
    #[serde(default)]
    pub oauth: OAuthMetadata,
}

/// Caller-supplied fields for `add`; the rest of `ServerRecord` is derived.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl ServerRecord {
    fn new(spec: ServerSpec) -> Self {
        Self {
            name: spec.name,
            url: spec.url,
            transport: "http".to_string(),
            headers: spec.headers,
            health: HealthState::Unknown,
            last_health_check: None,
            last_activity: None,
            exchange_count: 0,
            tool_cache: None,
            oauth: OAuthMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

/// Names are normalized (trimmed, lowercased) and URLs have their trailing
/// slash stripped before either is stored or compared.
fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn normalize_url(url: &str) -> Result<String, GatewayError> {
    let trimmed = url.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed)
        .map_err(|err| GatewayError::validation("url", format!("not an absolute URL: {err}")))?;
    Ok(parsed.to_string().trim_end_matches('/').to_string())
}

/// In-memory catalog, guarded by a single `RwLock` since every mutation
/// rewrites the whole file anyway — there is no benefit to per-server
/// sharding at this layer (activity/header writes are sharded instead, at
/// the proxy engine, per §9).
pub struct Registry {
    root: PathBuf,
    servers: RwLock<HashMap<String, ServerRecord>>,
    events: EventBus,
}

impl Registry {
    /// Load the on-disk registry at `root`, or start empty if no file exists
    /// yet (first boot).
    pub async fn load(root: impl Into<PathBuf>, events: EventBus) -> Result<Self, GatewayError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| GatewayError::RegistryIo(err.into()))?;

        let path = registry_path(&root);
        let servers = if path.exists() {
            let contents = fs::read_to_string(&path)
                .await
                .map_err(|err| GatewayError::RegistryIo(err.into()))?;
            let file: RegistryFile = serde_json::from_str(&contents)
                .map_err(|err| GatewayError::RegistryIo(err.into()))?;
            file.servers
                .into_iter()
                .map(|server| (server.name.clone(), server))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            servers: RwLock::new(servers),
            events,
        })
    }

    pub async fn get(&self, name: &str) -> Option<ServerRecord> {
        self.servers.read().await.get(&normalize_name(name)).cloned()
    }

    pub async fn list(&self) -> Vec<ServerRecord> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn add(&self, spec: ServerSpec) -> Result<ServerRecord, GatewayError> {
        let name = normalize_name(&spec.name);
        let url = normalize_url(&spec.url)?;
        let spec = ServerSpec { name: name.clone(), url, headers: spec.headers };

        {
            let servers = self.servers.read().await;
            if servers.contains_key(&name) {
                return Err(GatewayError::validation(
                    "name",
                    format!("server '{name}' is already registered"),
                ));
            }
        }

        let record = ServerRecord::new(spec);
        {
            let mut servers = self.servers.write().await;
            servers.insert(name, record.clone());
        }
        self.persist().await?;
        self.events.publish_registry_updated();
        Ok(record)
    }

    pub async fn remove(&self, name: &str) -> Result<(), GatewayError> {
        let name = normalize_name(name);
        self.servers.write().await.remove(&name);
        self.persist().await?;
        self.events.publish_registry_updated();
        Ok(())
    }

    pub async fn update_health(
        &self,
        name: &str,
        state: HealthState,
        checked_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let name = normalize_name(name);
        {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(&name)
                .ok_or_else(|| GatewayError::NotFound(name.clone()))?;
            server.health = state;
            server.last_health_check = Some(checked_at);
        }
        self.persist().await?;
        self.events.publish_registry_updated();
        Ok(())
    }

    /// Bump `lastActivity` and increment `exchangeCount`. Monotonicity
    /// (§3/P5) holds because `now` is always read at call time and
    /// `exchangeCount` only ever increases by one per call, under the
    /// exclusive write lock.
    pub async fn bump_activity(&self, name: &str, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let name = normalize_name(name);
        {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(&name)
                .ok_or_else(|| GatewayError::NotFound(name.clone()))?;
            server.last_activity = Some(now);
            server.exchange_count += 1;
        }
        self.persist().await?;
        self.events.publish_registry_updated();
        Ok(())
    }

    pub async fn cache_tools(&self, name: &str, tools: serde_json::Value) -> Result<(), GatewayError> {
        let name = normalize_name(name);
        {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(&name)
                .ok_or_else(|| GatewayError::NotFound(name.clone()))?;
            server.tool_cache = Some(tools);
        }
        self.persist().await?;
        self.events.publish_registry_updated();
        Ok(())
    }

    async fn persist(&self) -> Result<(), GatewayError> {
        let servers: Vec<ServerRecord> = self.servers.read().await.values().cloned().collect();
        let file = RegistryFile { servers };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|err| GatewayError::RegistryIo(err.into()))?;

        let path = registry_path(&self.root);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .await
            .map_err(|err| GatewayError::RegistryIo(err.into()))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| GatewayError::RegistryIo(err.into()))?;
        Ok(())
    }
}

pub type SharedRegistry = Arc<Registry>;

fn registry_path(root: &Path) -> PathBuf {
    root.join("registry.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, url: &str) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn add_normalizes_name_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path(), EventBus::new()).await.unwrap();
        registry.add(spec(" Echo ", "http://localhost:9000/")).await.unwrap();
        let server = registry.get("echo").await.expect("normalized lookup");
        assert_eq!(server.name, "echo");
        assert_eq!(server.url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn add_rejects_case_insensitive_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path(), EventBus::new()).await.unwrap();
        registry.add(spec("echo", "http://localhost:9000")).await.unwrap();
        let err = registry.add(spec("ECHO", "http://localhost:9001")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn persisted_registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::load(dir.path(), EventBus::new()).await.unwrap();
            registry.add(spec("echo", "http://localhost:9000")).await.unwrap();
        }
        let reloaded = Registry::load(dir.path(), EventBus::new()).await.unwrap();
        assert!(reloaded.get("echo").await.is_some());
    }

    #[tokio::test]
    async fn bump_activity_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path(), EventBus::new()).await.unwrap();
        registry.add(spec("echo", "http://localhost:9000")).await.unwrap();

        let t1 = Utc::now();
        registry.bump_activity("echo", t1).await.unwrap();
        let after_first = registry.get("echo").await.unwrap();
        assert_eq!(after_first.exchange_count, 1);

        let t2 = t1 + chrono::Duration::seconds(1);
        registry.bump_activity("echo", t2).await.unwrap();
        let after_second = registry.get("echo").await.unwrap();
        assert_eq!(after_second.exchange_count, 2);
        assert!(after_second.last_activity.unwrap() >= after_first.last_activity.unwrap());
    }

    #[tokio::test]
    async fn bump_activity_on_unknown_server_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path(), EventBus::new()).await.unwrap();
        let err = registry.bump_activity("ghost", Utc::now()).await;
        assert!(matches!(err, Err(GatewayError::NotFound(_))));
    }
}
