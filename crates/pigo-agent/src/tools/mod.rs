//! Tool system: the trait all tools implement, the registry that builds and
//! dispatches them, and the conversion to provider-level definitions.

pub mod build;
pub mod execute_command;
pub mod list_files;
pub mod memory;
pub mod read_file;
pub mod search_files;
pub mod skill;
pub mod write_file;

use async_trait::async_trait;
use tracing::debug;

use crate::provider::{ToolCall, ToolDefinition};

/// Result of executing a tool, split by audience: `for_llm` feeds back into
/// the conversation, `for_user` (when present) is shown in the terminal
/// between steps.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub for_llm: String,
    pub for_user: Option<String>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            for_user: None,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            for_llm: message.into(),
            for_user: None,
            is_error: true,
        }
    }

    /// Attach an operator-facing summary.
    pub fn with_display(mut self, text: impl Into<String>) -> Self {
        self.for_user = Some(text.into());
        self
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "read_file").
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with arguments already parsed and checked against the schema.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Convert a tool list to provider-level definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.input_schema(),
        })
        .collect()
}

/// Look up and run the named tool. Hallucinated names and malformed
/// arguments come back as error results the model can react to; dispatch
/// itself never fails.
pub async fn dispatch(tools: &[Box<dyn Tool>], call: &ToolCall) -> ToolResult {
    let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
        return ToolResult::error(format!("unknown tool: {}", call.name));
    };

    let args: serde_json::Value = if call.arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult::error(format!(
                    "invalid JSON arguments for {}: {}",
                    call.name, e
                ))
            }
        }
    };

    if let Err(missing) = check_required(&tool.input_schema(), &args) {
        return ToolResult::error(format!(
            "missing required parameter for {}: {}",
            call.name, missing
        ));
    }

    debug!(tool = %call.name, "executing tool");
    tool.execute(args).await
}

/// Verify every `required` property of the schema is present in the input.
fn check_required(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for field in required.iter().filter_map(|f| f.as_str()) {
        if args.get(field).is_none() {
            return Err(field.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn dispatch_runs_a_known_tool() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(Echo)];
        let result = dispatch(&tools, &call("echo", r#"{"text":"hi"}"#)).await;
        assert!(!result.is_error);
        assert_eq!(result.for_llm, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_conversational_error() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(Echo)];
        let result = dispatch(&tools, &call("hallucinated", "{}")).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("unknown tool"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_conversational_error() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(Echo)];
        let result = dispatch(&tools, &call("echo", "{not json")).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("invalid JSON"));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_reported() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(Echo)];
        let result = dispatch(&tools, &call("echo", "{}")).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("text"));
    }

    #[test]
    fn definitions_mirror_the_tool_surface() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(Echo)];
        let defs = to_definitions(&tools);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].parameters["required"][0], "text");
    }
}
