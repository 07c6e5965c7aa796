//! Code-mode dispatcher (component G).
//!
//! Collapses one upstream server's tool surface into a single sandboxed
//! `execute_code` tool: [`CodeMode::build`] compiles a server's cached
//! `tools/list` into a typed surface (`type_definitions` + `runtime_api`),
//! and [`CodeMode::execute`] interprets a call plan against an injected
//! [`runtime::RpcCall`]. No direct teacher analogue exists (kotadb has no
//! script-execution surface); the tool-schema modeling follows
//! `src/mcp/tools/mod.rs`'s `ToolDefinition` shape, generalized to carry
//! both the original and canonicalized names the identifier map needs.

pub mod client;
pub mod identifiers;
pub mod runtime;
pub mod serialize;
pub mod typegen;

use std::time::Duration;

use serde_json::Value;

use identifiers::{to_camel_case, to_pascal_case, IdentifierMap};
pub use runtime::{execute_code, CanonicalLookup, ExecutionResult, ReturnExpr, RpcCall, ScriptPlan, ScriptStep};

/// The fixed name of the synthesized tool clients see in code mode (§4.G).
pub const EXECUTE_CODE_TOOL_NAME: &str = "execute_code";

/// One real upstream tool, carrying both its original identity and its
/// canonicalized script-surface identity.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub original_server_name: String,
    pub original_name: String,
    pub canonical_name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

/// One upstream server's raw `tools/list` entry, before canonicalization.
#[derive(Debug, Clone)]
pub struct RawTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

/// One server descriptor fed into [`CodeMode::build`].
#[derive(Debug, Clone)]
pub struct ServerToolSet {
    pub server_name: String,
    pub tools: Vec<RawTool>,
}

struct CompiledServer {
    original_name: String,
    identifier: String,
    tools: Vec<ToolDescriptor>,
}

/// The compiled code-mode surface for one or more servers: generated type
/// declarations, a generated runtime client module, and the identifier maps
/// needed to translate a [`ScriptPlan`] (written in canonical identifiers)
/// back to real RPC calls (which must carry original names, per §3).
pub struct CodeMode {
    servers: Vec<CompiledServer>,
    server_identifiers: IdentifierMap,
    timeout: Duration,
}

impl CodeMode {
    /// Compile a code-mode surface for `servers`. Tool name collisions
    /// within one server, and server name collisions across servers, are
    /// disambiguated by [`IdentifierMap`] rather than rejected — the
    /// mapping is required to be total.
    pub fn build(servers: Vec<ServerToolSet>, timeout: Duration) -> Self {
        let mut server_identifiers = IdentifierMap::new();
        let compiled = servers
            .into_iter()
            .map(|server_set| {
                let identifier = server_identifiers.insert(
                    to_pascal_case(&server_set.server_name),
                    server_set.server_name.clone(),
                );
                let mut tool_identifiers = IdentifierMap::new();
                let tools = server_set
                    .tools
                    .into_iter()
                    .map(|tool| {
                        let canonical = tool_identifiers
                            .insert(to_camel_case(&tool.name), tool.name.clone());
                        ToolDescriptor {
                            original_server_name: server_set.server_name.clone(),
                            original_name: tool.name,
                            canonical_name: canonical,
                            description: tool.description,
                            input_schema: tool.input_schema,
                            output_schema: tool.output_schema,
                        }
                    })
                    .collect();
                CompiledServer {
                    original_name: server_set.server_name,
                    identifier,
                    tools,
                }
            })
            .collect();

        Self {
            servers: compiled,
            server_identifiers,
            timeout,
        }
    }

    pub fn type_definitions(&self) -> String {
        self.servers
            .iter()
            .map(|server| typegen::render_namespace(&server.identifier, &server.tools))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn runtime_api(&self) -> String {
        let servers: Vec<(String, Vec<ToolDescriptor>)> = self
            .servers
            .iter()
            .map(|server| (server.identifier.clone(), server.tools.clone()))
            .collect();
        client::render_call_plan_guide(&servers)
    }

    /// The single synthesized tool returned to clients in place of the
    /// upstream's real tool list (§6's code-mode tool schema).
    pub fn execute_code_tool_schema(&self) -> Value {
        let description = format!(
            "Execute a call plan (JSON, not JavaScript) against the following typed tool surface:\n\n{}\n\n{}",
            self.type_definitions(),
            self.runtime_api()
        );
        serde_json::json!({
            "name": EXECUTE_CODE_TOOL_NAME,
            "description": description,
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "A JSON call plan (see tool description for the exact shape), not a JavaScript source string."
                    }
                },
                "required": ["code"]
            }
        })
    }

    fn resolve_server_identifier(&self, canonical: &str) -> Option<String> {
        self.server_identifiers.original_of(canonical).map(str::to_string)
    }

    fn resolve_tool_identifier(&self, server_identifier: &str, canonical: &str) -> Option<String> {
        let server = self
            .servers
            .iter()
            .find(|server| server.identifier == server_identifier)?;
        server
            .tools
            .iter()
            .find(|tool| tool.canonical_name == canonical)
            .map(|tool| tool.original_name.clone())
    }

    /// Resolve a server's original name directly, for building the initial
    /// `CanonicalLookup` closures without borrowing issues in callers.
    pub fn original_server_name(&self, server_identifier: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|server| server.identifier == server_identifier)
            .map(|server| server.original_name.as_str())
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Interpret `plan` against `rpc`, using this surface's identifier maps
    /// to translate canonical server/tool identifiers back to the names the
    /// upstream actually registered.
    pub async fn execute(&self, plan: &ScriptPlan, rpc: &dyn RpcCall, timeout: Option<Duration>) -> ExecutionResult {
        let lookup = CanonicalLookup {
            server_original: &|identifier| self.resolve_server_identifier(identifier),
            tool_original: &|server_identifier, tool_identifier| {
                self.resolve_tool_identifier(server_identifier, tool_identifier)
            },
        };
        execute_code(plan, rpc, lookup, timeout.unwrap_or(self.timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::GatewayError;

    struct EchoRpc;
    #[async_trait]
    impl RpcCall for EchoRpc {
        async fn call(
            &self,
            _original_server_name: &str,
            _original_tool_name: &str,
            args: Value,
        ) -> Result<Value, GatewayError> {
            Ok(serde_json::json!({"echo": args}))
        }
    }

    fn sample() -> CodeMode {
        CodeMode::build(
            vec![ServerToolSet {
                server_name: "weather-server".to_string(),
                tools: vec![RawTool {
                    name: "get_weather".to_string(),
                    description: "fetch weather".to_string(),
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": {"loc": {"type": "string"}},
                        "required": ["loc"],
                    }),
                    output_schema: None,
                }],
            }],
            Duration::from_millis(500),
        )
    }

    #[test]
    fn type_definitions_include_generated_namespace() {
        let code_mode = sample();
        let defs = code_mode.type_definitions();
        assert!(defs.contains("namespace WeatherServer"));
        assert!(defs.contains("GetWeatherInput"));
    }

    #[test]
    fn execute_code_tool_schema_has_fixed_name_and_required_code() {
        let schema = sample().execute_code_tool_schema();
        assert_eq!(schema["name"], EXECUTE_CODE_TOOL_NAME);
        assert_eq!(schema["inputSchema"]["required"][0], "code");
    }

    #[tokio::test]
    async fn execute_resolves_canonical_identifiers_to_original_names() {
        let code_mode = sample();
        let plan = ScriptPlan {
            steps: vec![ScriptStep {
                binding: "r".to_string(),
                server: "WeatherServer".to_string(),
                tool: "getWeather".to_string(),
                args: serde_json::json!({"loc": "nyc"}),
            }],
            ret: ReturnExpr::Binding("r".to_string()),
        };
        let result = code_mode.execute(&plan, &EchoRpc, None).await;
        assert!(result.success);
        assert_eq!(
            result.return_value,
            Some(serde_json::json!({"echo": {"loc": "nyc"}}))
        );
    }
}
