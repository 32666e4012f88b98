//! Tool: list_files — list a directory with type and size per entry.

use async_trait::async_trait;

use super::{Tool, ToolResult};

const MAX_ENTRIES: usize = 500;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List a directory's entries with their type (file/dir) and size. \
         Returns at most 500 entries, sorted by name."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative directory path."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };

        let read_dir = match std::fs::read_dir(path) {
            Ok(rd) => rd,
            Err(e) => return ToolResult::error(format!("failed to list '{path}': {e}")),
        };

        let mut entries: Vec<String> = Vec::new();
        let mut total = 0usize;
        for entry in read_dir.flatten() {
            total += 1;
            if entries.len() >= MAX_ENTRIES {
                continue; // keep counting for the notice
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = if metadata.is_dir() { "dir" } else { "file" };
            entries.push(format!("[{kind}] {name} ({} bytes)", metadata.len()));
        }

        entries.sort();
        let mut output = entries.join("\n");
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n[{} more entries not shown]", total - MAX_ENTRIES));
        }
        if output.is_empty() {
            output = "(empty directory)".to_string();
        }

        ToolResult::success(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "xy").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let result = ListFilesTool
            .execute(serde_json::json!({ "path": dir.path().to_str().unwrap() }))
            .await;
        assert!(!result.is_error);
        assert!(result.for_llm.contains("[file] a.txt (2 bytes)"));
        assert!(result.for_llm.contains("[dir] sub"));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error_result() {
        let result = ListFilesTool
            .execute(serde_json::json!({ "path": "/nonexistent/dir" }))
            .await;
        assert!(result.is_error);
    }
}
