//! Tool: execute_command — one-shot shell command via `sh -c`.

use async_trait::async_trait;
use tokio::process::Command;

use super::{Tool, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Combined stdout+stderr cap fed back to the model.
const MAX_OUTPUT_CHARS: usize = 20_000;

pub struct ExecuteCommandTool;

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command via `sh -c` and return its stdout and \
         stderr. Commands are killed after the timeout (default 30s)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds before the command is killed (optional)."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: command");
        };
        let timeout_secs = input
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let fut = Command::new("sh").arg("-c").arg(command).output();
        let output = match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), fut)
            .await
        {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return ToolResult::error(format!("failed to run command: {e}")),
            Err(_) => {
                return ToolResult::error(format!("command timed out after {timeout_secs}s"))
            }
        };

        let mut text = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            text.push_str(&format!("\n[exit code: {code}]"));
        }
        if text.is_empty() {
            text = "(no output)".to_string();
        }
        if text.len() > MAX_OUTPUT_CHARS {
            text.truncate(MAX_OUTPUT_CHARS);
            text.push_str("\n[output truncated]");
        }

        // A failed command is still a successful tool invocation; the model
        // reads the exit code from the output.
        ToolResult::success(text).with_display(format!("$ {command}"))
    }
}
