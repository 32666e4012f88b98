//! Tool: write_file — write content to a file, creating parents as needed.

use async_trait::async_trait;

use super::{Tool, ToolResult};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a file, overwriting any existing content. \
         Parent directories are created if missing."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to write to."
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: content");
        };

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolResult::error(format!(
                        "failed to create directories for '{path}': {e}"
                    ));
                }
            }
        }

        let bytes = content.len();
        if let Err(e) = std::fs::write(path, content) {
            return ToolResult::error(format!("failed to write '{path}': {e}"));
        }

        ToolResult::success(format!("wrote {bytes} bytes to '{path}'"))
            .with_display(format!("✎ {path} ({bytes} bytes)"))
    }
}
