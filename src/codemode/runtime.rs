//! `executeCode` harness (§4.G, §9).
//!
//! The reference evaluates a JavaScript source string in-process — unsafe,
//! and explicitly disclaimed in §9. This rendition replaces the source
//! string with [`ScriptPlan`], a small expression-oriented call plan (an
//! ordered list of tool invocations with named bindings, plus a return
//! expression referencing an earlier binding or a literal) that the
//! dispatcher interprets directly against an injected [`RpcCall`]. Every
//! contract the specification binds to `executeCode` still holds:
//! `__rpcCall` dispatch through the original (non-canonicalized) tool name,
//! a captured console, a deadline race, and placeholder-safe serialization
//! of the final value. A real embedding would swap this interpreter for a
//! WASM/child-process/embedded-interpreter evaluator behind the same
//! [`RpcCall`] boundary.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::serialize::ScriptGraph;
use crate::error::GatewayError;

/// One step of a call plan: call `tool` on `server` (both canonical script
/// identifiers) with `args`, binding the result to `binding` for later steps
/// to reference.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub binding: String,
    pub server: String,
    pub tool: String,
    pub args: Value,
}

/// What the script returns: either a named binding's value or a literal,
/// mirroring the `return <expr>;` tail of the reference's JS snippets.
#[derive(Debug, Clone)]
pub enum ReturnExpr {
    Binding(String),
    Literal(Value),
    Undefined,
}

#[derive(Debug, Clone)]
pub struct ScriptPlan {
    pub steps: Vec<ScriptStep>,
    pub ret: ReturnExpr,
}

/// The host-provided `__rpcCall(originalServerName, originalToolName, args)`
/// binding (§3/§4.G). Implemented by the proxy engine, which routes through
/// its own forwarding path so code-mode calls are captured and logged like
/// any other exchange.
#[async_trait]
pub trait RpcCall: Send + Sync {
    async fn call(
        &self,
        original_server_name: &str,
        original_tool_name: &str,
        args: Value,
    ) -> Result<Value, GatewayError>;
}

/// Canonical-identifier -> original-name lookups needed to translate a plan
/// (written in script identifiers) back into RPC calls (which must carry the
/// original server/tool names, per the invariant in §3).
pub struct CanonicalLookup<'a> {
    pub server_original: &'a dyn Fn(&str) -> Option<String>,
    pub tool_original: &'a dyn Fn(&str, &str) -> Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
}

/// Console lines collected during plan execution, joined into `output`
/// alongside the final serialized return value (the reference's `console`
/// capture of `log|info|warn|debug|error`, formatted as
/// `"[<level>] <message>"` lines).
#[derive(Debug, Default)]
struct Console {
    lines: Vec<String>,
}

impl Console {
    fn record(&mut self, level: &str, message: String) {
        self.lines.push(format!("[{level}] {message}"));
    }
}

/// Evaluate `plan` against `rpc`, racing the deadline derived from
/// `timeout`. Bindings are resolved in step order — referencing a binding
/// not yet produced, or referencing oneself, is reported the same way the
/// placeholder scheme reports a circular value, since both are "this name
/// doesn't resolve to a value yet" failures from the script's perspective.
pub async fn execute_code(
    plan: &ScriptPlan,
    rpc: &dyn RpcCall,
    lookup: CanonicalLookup<'_>,
    timeout: Duration,
) -> ExecutionResult {
    let run = run_plan(plan, rpc, &lookup);
    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => ExecutionResult {
            output: String::new(),
            success: false,
            error: Some(format!("Execution timeout after {}ms", timeout.as_millis())),
            stack: None,
            return_value: None,
        },
    }
}

async fn run_plan(
    plan: &ScriptPlan,
    rpc: &dyn RpcCall,
    lookup: &CanonicalLookup<'_>,
) -> ExecutionResult {
    let mut console = Console::default();
    let mut bindings: HashMap<String, Value> = HashMap::new();

    for step in &plan.steps {
        let Some(original_server) = (lookup.server_original)(&step.server) else {
            return failure(
                console,
                format!("unknown server identifier '{}'", step.server),
            );
        };
        let Some(original_tool) = (lookup.tool_original)(&step.server, &step.tool) else {
            return failure(
                console,
                format!("unknown tool identifier '{}' on server '{}'", step.tool, step.server),
            );
        };

        let args = match resolve(&step.args, &bindings) {
            Ok(args) => args,
            Err(message) => return failure(console, message),
        };

        console.record("log", format!("calling {original_server}.{original_tool}"));

        match rpc.call(&original_server, &original_tool, args).await {
            Ok(value) => {
                bindings.insert(step.binding.clone(), value);
            }
            Err(err) => {
                console.record("error", err.to_string());
                return failure(console, err.to_string());
            }
        }
    }

    let return_value = match &plan.ret {
        ReturnExpr::Binding(name) => match bindings.get(name) {
            Some(value) => Some(value.clone()),
            None => return failure(console, format!("binding '{name}' was never produced")),
        },
        ReturnExpr::Literal(value) => Some(value.clone()),
        ReturnExpr::Undefined => None,
    };

    let graph = match &return_value {
        Some(value) => ScriptGraph::from_json(value.clone()),
        None => {
            let mut graph = ScriptGraph::new();
            graph.push(super::serialize::ScriptValue::Undefined);
            graph
        }
    };
    let rendered = graph.render(graph.root());

    let mut output = console.lines.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(&serde_json::to_string_pretty(&rendered).unwrap_or_default());

    ExecutionResult {
        output,
        success: true,
        error: None,
        stack: None,
        return_value,
    }
}

fn failure(console: Console, message: String) -> ExecutionResult {
    ExecutionResult {
        output: console.lines.join("\n"),
        success: false,
        error: Some(message),
        stack: None,
        return_value: None,
    }
}

/// Substitute `$binding` string references (top-level or nested) with the
/// value that binding resolved to.
fn resolve(value: &Value, bindings: &HashMap<String, Value>) -> Result<Value, String> {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix('$') {
                bindings
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("binding '{name}' was never produced"))
            } else {
                Ok(value.clone())
            }
        }
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, String> =
                items.iter().map(|item| resolve(item, bindings)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                out.insert(key.clone(), resolve(val, bindings)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubRpc {
        calls: Arc<AtomicUsize>,
        response: Value,
    }

    #[async_trait]
    impl RpcCall for StubRpc {
        async fn call(
            &self,
            _original_server_name: &str,
            _original_tool_name: &str,
            _args: Value,
        ) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn identity_lookup() -> CanonicalLookup<'static> {
        CanonicalLookup {
            server_original: &|s| Some(s.to_string()),
            tool_original: &|_s, t| Some(t.to_string()),
        }
    }

    #[tokio::test]
    async fn round_trips_structured_content_through_a_binding() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rpc = StubRpc {
            calls: calls.clone(),
            response: serde_json::json!({"y": 2}),
        };
        let plan = ScriptPlan {
            steps: vec![ScriptStep {
                binding: "r".to_string(),
                server: "srv".to_string(),
                tool: "getWeather".to_string(),
                args: serde_json::json!({"x": 1}),
            }],
            ret: ReturnExpr::Binding("r".to_string()),
        };

        let result = execute_code(&plan, &rpc, identity_lookup(), Duration::from_secs(1)).await;
        assert!(result.success);
        assert_eq!(result.return_value, Some(serde_json::json!({"y": 2})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_binding_is_a_clean_failure_not_a_panic() {
        let rpc = StubRpc {
            calls: Arc::new(AtomicUsize::new(0)),
            response: Value::Null,
        };
        let plan = ScriptPlan {
            steps: vec![],
            ret: ReturnExpr::Binding("never_bound".to_string()),
        };
        let result = execute_code(&plan, &rpc, identity_lookup(), Duration::from_secs(1)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("never_bound"));
    }

    #[tokio::test]
    async fn deadline_elapsing_reports_timeout() {
        struct HangingRpc;
        #[async_trait]
        impl RpcCall for HangingRpc {
            async fn call(
                &self,
                _original_server_name: &str,
                _original_tool_name: &str,
                _args: Value,
            ) -> Result<Value, GatewayError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let plan = ScriptPlan {
            steps: vec![ScriptStep {
                binding: "r".to_string(),
                server: "srv".to_string(),
                tool: "slow".to_string(),
                args: Value::Null,
            }],
            ret: ReturnExpr::Binding("r".to_string()),
        };

        let start = std::time::Instant::now();
        let result = execute_code(&plan, &HangingRpc, identity_lookup(), Duration::from_millis(100)).await;
        let elapsed = start.elapsed();

        assert!(!result.success);
        assert!(result.error.unwrap().to_lowercase().contains("timeout"));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unknown_server_identifier_fails_before_any_rpc_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rpc = StubRpc {
            calls: calls.clone(),
            response: Value::Null,
        };
        let lookup = CanonicalLookup {
            server_original: &|_s| None,
            tool_original: &|_s, t| Some(t.to_string()),
        };
        let plan = ScriptPlan {
            steps: vec![ScriptStep {
                binding: "r".to_string(),
                server: "ghost".to_string(),
                tool: "anything".to_string(),
                args: Value::Null,
            }],
            ret: ReturnExpr::Binding("r".to_string()),
        };
        let result = execute_code(&plan, &rpc, lookup, Duration::from_secs(1)).await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
