//! Call-plan surface rendering for the code-mode surface (§4.G).
//!
//! Renders the documentation embedded in the `execute_code` tool
//! description alongside the generated types (§6): the shape of the
//! `ScriptPlan` JSON the dispatcher actually parses ([`super::runtime`]),
//! and the list of `server.tool` identifiers a step may reference. This
//! text is documentation for the calling LLM, not code the Rust side
//! evaluates — the real dispatch is
//! [`super::runtime::execute_code`] interpreting the plan directly against
//! an injected `RpcCall`, translating canonical identifiers back to the
//! *original* server/tool names before the upstream ever sees them.

use super::identifiers::to_pascal_case;
use super::ToolDescriptor;

pub fn render_call_plan_guide(servers: &[(String, Vec<ToolDescriptor>)]) -> String {
    let mut out = String::from(
        "Call plan format: `code` must be a JSON string (not JavaScript) shaped like:\n\
         {\n\
         \x20\x20\"steps\": [\n\
         \x20\x20\x20\x20{ \"binding\": \"r\", \"server\": \"<ServerId>\", \"tool\": \"<toolId>\", \"args\": { ... } }\n\
         \x20\x20],\n\
         \x20\x20\"return\": { \"binding\": \"r\" }\n\
         }\n\
         Steps run in order. An `args` value may reference an earlier step's\n\
         result with the string \"$<binding>\" in place of that value. `return`\n\
         is either `{\"binding\": \"<name>\"}`, a JSON literal, or omitted.\n\n\
         Available server.tool identifiers (args/result shapes are the\n\
         matching Input/Output types declared above):\n",
    );
    for (server_identifier, tools) in servers {
        for tool in tools {
            let base = to_pascal_case(&tool.canonical_name);
            out.push_str(&format!(
                "  {server_identifier}.{}  args: {server_identifier}.{base}Input  result: {server_identifier}.{base}Output\n",
                tool.canonical_name
            ));
        }
    }
    out
}
