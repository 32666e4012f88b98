use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pigo_core::TokenUsage;

use crate::provider::{
    classify_status, valid_tools, ChatOutcome, ChatProvider, ChatRequest, ProviderError, Role,
    ToolCall,
};
use crate::stream::StreamEvent;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages adapter (`/v1/messages`).
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(req, false);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }
}

async fn error_from_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|s| s * 1000);
    let text = resp.text().await.unwrap_or_default();
    warn!(status, body = %text, "Anthropic API error");
    classify_status(status, text, retry_after)
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    // All system messages concatenate into the top-level system block array;
    // the last block carries a cache breakpoint.
    let mut system_blocks: Vec<serde_json::Value> = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| serde_json::json!({ "type": "text", "text": m.content }))
        .collect();
    if let Some(last) = system_blocks.last_mut() {
        last["cache_control"] = serde_json::json!({ "type": "ephemeral" });
    }

    let mut messages: Vec<serde_json::Value> = Vec::new();
    for msg in req.messages.iter().filter(|m| m.role != Role::System) {
        match msg.role {
            Role::User => messages.push(serde_json::json!({
                "role": "user",
                "content": [{ "type": "text", "text": msg.content }],
            })),
            Role::Assistant => {
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(serde_json::json!({ "type": "text", "text": msg.content }));
                }
                for call in &msg.tool_calls {
                    let input: serde_json::Value = serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                messages.push(serde_json::json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                    "content": msg.content,
                });
                // Tool results ride inside a user message; consecutive
                // results share one.
                match messages.last_mut() {
                    Some(last) if is_tool_result_carrier(last) => {
                        last["content"].as_array_mut().expect("carrier content").push(block);
                    }
                    _ => messages.push(serde_json::json!({
                        "role": "user",
                        "content": [block],
                    })),
                }
            }
            Role::System => unreachable!("system messages filtered above"),
        }
    }

    // Multi-turn caching: breakpoints on the 2nd- and 4th-to-last messages.
    let len = messages.len();
    for idx in [len.checked_sub(2), len.checked_sub(4)].into_iter().flatten() {
        mark_last_text_block(&mut messages[idx]);
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": messages,
        "stream": stream,
    });

    if !system_blocks.is_empty() {
        body["system"] = serde_json::Value::Array(system_blocks);
    }

    let tools = valid_tools(&req.tools);
    if !tools.is_empty() {
        let defs: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(defs);
    }

    body
}

fn is_tool_result_carrier(msg: &serde_json::Value) -> bool {
    msg["role"] == "user"
        && msg["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .all(|b| b["type"] == "tool_result")
            })
            .unwrap_or(false)
}

/// Set a cache breakpoint on the last text block of a message, if it has one.
fn mark_last_text_block(msg: &mut serde_json::Value) {
    if let Some(blocks) = msg["content"].as_array_mut() {
        if let Some(block) = blocks.iter_mut().rev().find(|b| b["type"] == "text") {
            block["cache_control"] = serde_json::json!({ "type": "ephemeral" });
        }
    }
}

/// Map Anthropic stop reasons onto the normalised vocabulary.
pub(crate) fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                });
            }
            ContentBlock::Unknown => {}
        }
    }

    ChatOutcome {
        content: text_parts.join(""),
        tool_calls,
        finish_reason: map_stop_reason(&resp.stop_reason.unwrap_or_default()),
        usage: TokenUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
    }
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn system_messages_merge_into_cached_block_array() {
        let req = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                Message::system("base prompt"),
                Message::system("<skill name=\"x\">…</skill>"),
                Message::user("hi"),
            ],
            128,
        );
        let body = build_request_body(&req, false);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert!(system[0].get("cache_control").is_none());
        assert_eq!(system[1]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_round_trip_uses_content_blocks() {
        let req = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                Message::user("read it"),
                Message::assistant_with_calls(
                    "on it",
                    vec![ToolCall {
                        id: "tu_1".into(),
                        name: "read_file".into(),
                        arguments: r#"{"path":"/tmp/x"}"#.into(),
                    }],
                ),
                Message::tool("tu_1", "contents=42"),
            ],
            128,
        );
        let body = build_request_body(&req, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);

        let assistant = &messages[1];
        assert_eq!(assistant["content"][0]["type"], "text");
        assert_eq!(assistant["content"][1]["type"], "tool_use");
        assert_eq!(assistant["content"][1]["input"]["path"], "/tmp/x");

        // tool_result nests inside a user message
        let result_msg = &messages[2];
        assert_eq!(result_msg["role"], "user");
        assert_eq!(result_msg["content"][0]["type"], "tool_result");
        assert_eq!(result_msg["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn consecutive_tool_results_share_one_user_message() {
        let req = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                Message::assistant_with_calls(
                    "",
                    vec![
                        ToolCall {
                            id: "a".into(),
                            name: "read_file".into(),
                            arguments: "{}".into(),
                        },
                        ToolCall {
                            id: "b".into(),
                            name: "list_files".into(),
                            arguments: "{}".into(),
                        },
                    ],
                ),
                Message::tool("a", "one"),
                Message::tool("b", "two"),
            ],
            128,
        );
        let body = build_request_body(&req, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        let results = messages[1]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "a");
        assert_eq!(results[1]["tool_use_id"], "b");
    }

    #[test]
    fn trailing_messages_get_cache_breakpoints() {
        let msgs: Vec<Message> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("u{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .collect();
        let req = ChatRequest::new("claude-sonnet-4-5", msgs, 128);
        let body = build_request_body(&req, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 6);
        // 2nd-to-last (index 4) and 4th-to-last (index 2) are marked.
        assert_eq!(messages[4]["content"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(messages[2]["content"][0]["cache_control"]["type"], "ephemeral");
        assert!(messages[5]["content"][0].get("cache_control").is_none());
        assert!(messages[3]["content"][0].get("cache_control").is_none());
    }

    #[test]
    fn stop_reasons_are_normalised() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
    }

    #[test]
    fn response_parse_extracts_tool_use_blocks() {
        let raw = serde_json::json!({
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_9", "name": "grep", "input": {"pattern": "fn main"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 30, "output_tokens": 11}
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let out = parse_response(resp);
        assert_eq!(out.content, "let me check");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "tu_9");
        assert!(out.tool_calls[0].arguments.contains("fn main"));
        assert_eq!(out.finish_reason, "tool_calls");
        assert_eq!(out.usage.total, 41);
    }
}
