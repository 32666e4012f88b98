//! Tool: search_files — recursive substring search over file contents.

use std::path::Path;

use async_trait::async_trait;

use super::{Tool, ToolResult};

const MAX_MATCHES: usize = 100;
/// Files whose first bytes contain a NUL are treated as binary and skipped.
const BINARY_PROBE_BYTES: usize = 8192;

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Recursively search file contents for a substring. Results come back \
         as `file:line: content` lines, at most 100 matches. Binary files \
         and .git are skipped."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Root directory to search."
                },
                "pattern": {
                    "type": "string",
                    "description": "Substring to look for (case-sensitive)."
                },
                "suffix": {
                    "type": "string",
                    "description": "Optional filename suffix filter, e.g. '.rs'."
                }
            },
            "required": ["path", "pattern"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(root) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let Some(pattern) = input.get("pattern").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: pattern");
        };
        let suffix = input.get("suffix").and_then(|v| v.as_str());

        let mut matches = Vec::new();
        walk(Path::new(root), pattern, suffix, &mut matches);

        if matches.is_empty() {
            return ToolResult::success("No matches found.");
        }

        let truncated = matches.len() >= MAX_MATCHES;
        let mut output = matches.join("\n");
        if truncated {
            output.push_str(&format!(
                "\n[stopped at {MAX_MATCHES} matches; narrow the pattern to see more]"
            ));
        }

        ToolResult::success(output)
    }
}

fn walk(dir: &Path, pattern: &str, suffix: Option<&str>, matches: &mut Vec<String>) {
    if matches.len() >= MAX_MATCHES {
        return;
    }
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };

    let mut entries: Vec<std::path::PathBuf> =
        read_dir.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    entries.sort();

    for entry in entries {
        if matches.len() >= MAX_MATCHES {
            return;
        }
        if entry.file_name().map(|n| n == ".git").unwrap_or(false) {
            continue;
        }
        if entry.is_dir() {
            walk(&entry, pattern, suffix, matches);
        } else if entry.is_file() {
            if let Some(sfx) = suffix {
                if !entry.to_string_lossy().ends_with(sfx) {
                    continue;
                }
            }
            scan_file(&entry, pattern, matches);
        }
    }
}

fn scan_file(path: &Path, pattern: &str, matches: &mut Vec<String>) {
    let Ok(bytes) = std::fs::read(path) else {
        return;
    };
    if bytes[..bytes.len().min(BINARY_PROBE_BYTES)].contains(&0u8) {
        return;
    }
    let Ok(text) = std::str::from_utf8(&bytes) else {
        return;
    };

    let display = path.to_string_lossy();
    for (idx, line) in text.lines().enumerate() {
        if matches.len() >= MAX_MATCHES {
            return;
        }
        if line.contains(pattern) {
            matches.push(format!("{display}:{}: {line}", idx + 1));
        }
    }
}
