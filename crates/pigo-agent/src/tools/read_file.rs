//! Tool: read_file — read a file, optionally a line range of it.

use async_trait::async_trait;

use super::{Tool, ToolResult};

/// Cap on returned characters so one file can't flood the context window.
const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Use `offset` (1-based line) and `limit` \
         (line count) to read a slice of a large file."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file."
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line number to start from (optional)."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{path}': {e}")),
        };

        let offset = input.get("offset").and_then(|v| v.as_u64());
        let limit = input.get("limit").and_then(|v| v.as_u64());

        let sliced = match (offset, limit) {
            (None, None) => content,
            (offset, limit) => {
                let start = offset.unwrap_or(1).saturating_sub(1) as usize;
                let take = limit.map(|n| n as usize).unwrap_or(usize::MAX);
                content
                    .lines()
                    .skip(start)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        let result = if sliced.len() > MAX_OUTPUT_CHARS {
            let cut = sliced[..MAX_OUTPUT_CHARS]
                .rfind('\n')
                .unwrap_or(MAX_OUTPUT_CHARS);
            format!(
                "{}\n[truncated at {} characters; use offset/limit to read more]",
                &sliced[..cut],
                MAX_OUTPUT_CHARS
            )
        } else {
            sliced
        };

        ToolResult::success(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();

        let result = ReadFileTool
            .execute(serde_json::json!({ "path": path.to_str().unwrap() }))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.for_llm, "alpha\nbeta\n");
    }

    #[tokio::test]
    async fn reads_a_line_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let result = ReadFileTool
            .execute(serde_json::json!({
                "path": path.to_str().unwrap(),
                "offset": 2,
                "limit": 2
            }))
            .await;
        assert_eq!(result.for_llm, "two\nthree");
    }

    #[tokio::test]
    async fn missing_file_is_an_error_result() {
        let result = ReadFileTool
            .execute(serde_json::json!({ "path": "/nonexistent/file.txt" }))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("failed to read"));
    }
}
