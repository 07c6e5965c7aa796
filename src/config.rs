//! Gateway configuration, owned by the hosting binary (`gatewayd`).
//!
//! The proxy/capture/session engine itself never reads this struct directly
//! — it accepts already-resolved paths, timeouts, and protocol defaults at
//! construction time (see `src/router.rs`'s `GatewayState::bootstrap`, which
//! builds `ProxyEngine` from a `GatewayConfig`). This keeps the
//! core engine's contract free of file/CLI concerns, matching the
//! specification's "configuration loading is an external collaborator"
//! boundary, while still giving the binary a real, teacher-style config
//! layer (nested serde structs + an optional TOML file + CLI overrides).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub mcp: McpConfig,
    pub codemode: CodemodeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_seconds")]
    pub exchange_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub registry_root: PathBuf,
    pub capture_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    pub default_protocol_version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodemodeConfig {
    #[serde(with = "duration_millis")]
    pub default_script_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4848,
                exchange_timeout: Duration::from_secs(30),
            },
            storage: StorageConfig {
                registry_root: PathBuf::from("./gateway-data"),
                capture_root: PathBuf::from("./gateway-data/captures"),
            },
            mcp: McpConfig {
                default_protocol_version: "2025-06-18".to_string(),
            },
            codemode: CodemodeConfig {
                default_script_timeout: Duration::from_millis(10_000),
            },
        }
    }
}

impl GatewayConfig {
    /// Load a config file if it exists, falling back to defaults; then apply
    /// CLI overrides. `path` not existing is not an error — CLI flags alone
    /// are a valid configuration.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.server.port > 0, "server.port must be nonzero");
        anyhow::ensure!(
            !self.mcp.default_protocol_version.trim().is_empty(),
            "mcp.default_protocol_version must not be empty"
        );
        Ok(())
    }
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
