//! Type generation for the code-mode surface (§4.G).
//!
//! Compiles each tool's JSON input/output schema into a named
//! TypeScript-like type declaration, grouped inside a namespace keyed by the
//! canonical server identifier. This is purely textual — the "type" here is
//! documentation embedded in the `execute_code` tool description (§6), not
//! something the Rust compiler checks; the generated surface is read by an
//! LLM client deciding how to call tools, the same role the teacher's
//! `ToolDefinition::description` plays for its own MCP tools
//! (`src/mcp/tools/mod.rs`).

use serde_json::Value;

use super::identifiers::to_pascal_case;
use super::ToolDescriptor;

/// Render one server's tools as a `namespace <Server> { ... }` block.
pub fn render_namespace(server_identifier: &str, tools: &[ToolDescriptor]) -> String {
    let mut out = format!("export namespace {server_identifier} {{\n");
    for tool in tools {
        out.push_str(&render_tool_types(tool));
        out.push('\n');
    }
    out.push_str("}\n");
    out
}

fn render_tool_types(tool: &ToolDescriptor) -> String {
    let base = to_pascal_case(&tool.canonical_name);
    let input_name = format!("{base}Input");
    let output_name = format!("{base}Output");

    let mut out = String::new();
    if !tool.description.is_empty() {
        out.push_str(&format!("  /** {} */\n", tool.description.replace('\n', " ")));
    }
    out.push_str(&format!(
        "  export type {input_name} = {};\n",
        render_schema_type(&tool.input_schema, 1)
    ));
    let output_type = tool
        .output_schema
        .as_ref()
        .map(|schema| render_schema_type(schema, 1))
        .unwrap_or_else(|| "{ [key: string]: any }".to_string());
    out.push_str(&format!("  export type {output_name} = {output_type};\n"));
    out.push_str(&format!(
        "  // step: {{ \"server\": \"<ServerId>\", \"tool\": \"{}\", \"args\": {input_name} }} -> {output_name}\n",
        tool.canonical_name
    ));
    out
}

/// Compile one JSON Schema node to a type expression. Unrecognized or
/// absent schemas degrade to `any` rather than failing generation — the
/// contract is best-effort documentation, never a hard type check.
fn render_schema_type(schema: &Value, indent: usize) -> String {
    let Some(obj) = schema.as_object() else {
        return "any".to_string();
    };

    if let Some(values) = obj.get("enum").and_then(Value::as_array) {
        let variants: Vec<String> = values.iter().map(render_literal).collect();
        return variants.join(" | ");
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("string") => "string".to_string(),
        Some("number") | Some("integer") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("null") => "null".to_string(),
        Some("array") => {
            let item_type = obj
                .get("items")
                .map(|items| render_schema_type(items, indent))
                .unwrap_or_else(|| "any".to_string());
            format!("{item_type}[]")
        }
        Some("object") | None => render_object_type(obj, indent),
        Some(_) => "any".to_string(),
    }
}

fn render_object_type(obj: &serde_json::Map<String, Value>, indent: usize) -> String {
    let Some(properties) = obj.get("properties").and_then(Value::as_object) else {
        return "{ [key: string]: any }".to_string();
    };

    let required: Vec<&str> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let pad = "  ".repeat(indent + 1);
    let mut fields = Vec::new();
    for (name, prop_schema) in properties {
        let optional = if required.contains(&name.as_str()) { "" } else { "?" };
        let field_type = render_schema_type(prop_schema, indent + 1);
        fields.push(format!("{pad}{name}{optional}: {field_type};"));
    }

    if fields.is_empty() {
        return "{ [key: string]: any }".to_string();
    }

    let closing_pad = "  ".repeat(indent);
    format!("{{\n{}\n{closing_pad}}}", fields.join("\n"))
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, input_schema: Value, output_schema: Option<Value>) -> ToolDescriptor {
        ToolDescriptor {
            original_server_name: "srv".to_string(),
            original_name: name.to_string(),
            canonical_name: name.to_string(),
            description: format!("{name} description"),
            input_schema,
            output_schema,
        }
    }

    #[test]
    fn renders_object_with_required_and_optional_fields() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "loc": {"type": "string"}, "units": {"type": "string"} },
            "required": ["loc"],
        });
        let rendered = render_schema_type(&schema, 0);
        assert!(rendered.contains("loc: string;"));
        assert!(rendered.contains("units?: string;"));
    }

    #[test]
    fn missing_output_schema_becomes_open_object() {
        let t = tool("get_weather", serde_json::json!({"type": "object"}), None);
        let rendered = render_tool_types(&t);
        assert!(rendered.contains("GetWeatherOutput = { [key: string]: any }"));
    }

    #[test]
    fn namespace_wraps_every_tool() {
        let tools = vec![tool(
            "get_weather",
            serde_json::json!({"type": "object", "properties": {"loc": {"type": "string"}}, "required": ["loc"]}),
            Some(serde_json::json!({"type": "object", "properties": {"tempC": {"type": "number"}}})),
        )];
        let rendered = render_namespace("Weather", &tools);
        assert!(rendered.starts_with("export namespace Weather {"));
        assert!(rendered.contains("GetWeatherInput"));
        assert!(rendered.contains("GetWeatherOutput"));
    }
}
