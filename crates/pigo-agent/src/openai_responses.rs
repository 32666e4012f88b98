use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pigo_core::TokenUsage;

use crate::provider::{
    classify_status, valid_tools, ChatOutcome, ChatProvider, ChatRequest, ProviderError, Role,
    ToolCall,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// OpenAI Responses adapter (`/v1/responses`).
///
/// The first system message becomes the top-level `instructions` field;
/// everything else turns into typed input items (`message`, `function_call`,
/// `function_call_output`).
pub struct OpenAiResponsesProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiResponsesProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(req, false);
        let url = format!("{}/v1/responses", self.base_url);

        debug!(model = %req.model, "sending request to OpenAI responses");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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
        let url = format!("{}/v1/responses", self.base_url);

        debug!(model = %req.model, "sending streaming request to OpenAI responses");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        process_stream(resp, tx).await;
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
    warn!(status, body = %text, "OpenAI responses API error");
    classify_status(status, text, retry_after)
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut instructions: Option<&str> = None;
    let mut input: Vec<serde_json::Value> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::System => {
                if instructions.is_none() {
                    instructions = Some(&msg.content);
                } else {
                    // Later system messages (skill injections) stay in the
                    // input stream.
                    input.push(text_item("system", "input_text", &msg.content));
                }
            }
            Role::User => input.push(text_item("user", "input_text", &msg.content)),
            Role::Assistant => {
                if !msg.content.is_empty() {
                    input.push(text_item("assistant", "output_text", &msg.content));
                }
                for call in &msg.tool_calls {
                    input.push(serde_json::json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
            Role::Tool => input.push(serde_json::json!({
                "type": "function_call_output",
                "call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                "output": msg.content,
            })),
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "input": input,
        "max_output_tokens": req.max_tokens,
        "store": false,
        "stream": stream,
    });

    if let Some(instructions) = instructions {
        body["instructions"] = serde_json::json!(instructions);
    }

    if req.json_mode {
        body["text"] = serde_json::json!({ "format": { "type": "json_object" } });
    }

    let tools = valid_tools(&req.tools);
    if !tools.is_empty() {
        let defs: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(defs);
    }

    body
}

fn text_item(role: &str, content_type: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "message",
        "role": role,
        "content": [{ "type": content_type, "text": text }],
    })
}

pub(crate) fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in resp.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    if let Some(text) = part.text {
                        text_parts.push(text);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => tool_calls.push(ToolCall {
                id: call_id,
                name,
                arguments,
            }),
            OutputItem::Unknown => {}
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls".to_string()
    } else if resp.status.as_deref() == Some("incomplete") {
        "length".to_string()
    } else {
        "stop".to_string()
    };

    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    ChatOutcome {
        content: text_parts.join(""),
        tool_calls,
        finish_reason,
        usage,
    }
}

#[derive(Default)]
struct CallAccumulator {
    call_id: String,
    name: String,
    arguments: String,
}

async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    // Accumulators keyed by item id; argument deltas reference the item.
    let mut pending: HashMap<String, CallAccumulator> = HashMap::new();
    let mut usage = TokenUsage::default();
    let mut had_tool_call = false;
    let mut incomplete = false;
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        // Reassemble SSE lines from arbitrary byte chunks; the trailing
        // incomplete line stays buffered.
        line_buf.push_str(text);
        while let Some(newline) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                continue;
            }
            let Ok(ev) = serde_json::from_str::<SseEvent>(&data) else {
                continue;
            };

            match ev.kind.as_str() {
                "response.output_text.delta" => {
                    if let Some(delta) = ev.delta {
                        if !delta.is_empty()
                            && tx.send(StreamEvent::TextDelta { text: delta }).await.is_err()
                        {
                            return;
                        }
                    }
                }
                "response.output_item.added" => {
                    if let Some(item) = ev.item.as_ref().filter(|i| i.is_function_call()) {
                        let key = ev.item_id.clone().unwrap_or_else(|| item.id.clone().unwrap_or_default());
                        pending.insert(
                            key,
                            CallAccumulator {
                                call_id: item.call_id.clone().unwrap_or_default(),
                                name: item.name.clone().unwrap_or_default(),
                                arguments: item.arguments.clone().unwrap_or_default(),
                            },
                        );
                    }
                }
                "response.function_call_arguments.delta" => {
                    if let (Some(item_id), Some(delta)) = (ev.item_id.as_ref(), ev.delta.as_ref()) {
                        if let Some(acc) = pending.get_mut(item_id) {
                            acc.arguments.push_str(delta);
                        }
                    }
                }
                "response.output_item.done" => {
                    if let Some(item) = ev.item.as_ref().filter(|i| i.is_function_call()) {
                        let key = ev
                            .item_id
                            .clone()
                            .or_else(|| item.id.clone())
                            .unwrap_or_default();
                        let acc = pending.remove(&key).unwrap_or_default();
                        // The done item carries the authoritative fields;
                        // fall back to what we accumulated.
                        let arguments = item
                            .arguments
                            .clone()
                            .filter(|a| !a.is_empty())
                            .unwrap_or(acc.arguments);
                        had_tool_call = true;
                        if tx
                            .send(StreamEvent::ToolUse {
                                id: item.call_id.clone().unwrap_or(acc.call_id),
                                name: item.name.clone().unwrap_or(acc.name),
                                arguments,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                "response.completed" | "response.incomplete" => {
                    if ev.kind == "response.incomplete" {
                        incomplete = true;
                    }
                    if let Some(resp) = &ev.response {
                        if let Some(u) = resp.get("usage") {
                            let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                            let output =
                                u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                            usage = TokenUsage::new(input as u32, output as u32);
                        }
                        if resp.get("status").and_then(|s| s.as_str()) == Some("incomplete") {
                            incomplete = true;
                        }
                    }
                }
                "response.failed" => {
                    let message = ev
                        .response
                        .as_ref()
                        .and_then(|r| r.get("error"))
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "response failed".to_string());
                    let _ = tx.send(StreamEvent::Error { message }).await;
                    return;
                }
                _ => {}
            }
        }
    }

    let finish_reason = if had_tool_call {
        "tool_calls".to_string()
    } else if incomplete {
        "length".to_string()
    } else {
        "stop".to_string()
    };

    let _ = tx
        .send(StreamEvent::Done {
            finish_reason,
            usage,
        })
        .await;
}

// Responses API types (private — deserialization only)

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) output: Vec<OutputItem>,
    pub(crate) usage: Option<Usage>,
    pub(crate) status: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
pub(crate) enum OutputItem {
    #[serde(rename = "message")]
    Message { content: Vec<OutputContent> },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
pub(crate) struct OutputContent {
    pub(crate) text: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) input_tokens: u32,
    pub(crate) output_tokens: u32,
}

#[derive(Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<String>,
    item: Option<SseItem>,
    item_id: Option<String>,
    response: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SseItem {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    call_id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
}

impl SseItem {
    fn is_function_call(&self) -> bool {
        self.kind == "function_call"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn first_system_message_becomes_instructions() {
        let req = ChatRequest::new(
            "gpt-4o",
            vec![
                Message::system("be terse"),
                Message::system("<skill name=\"deploy\">…</skill>"),
                Message::user("hi"),
            ],
            64,
        );
        let body = build_request_body(&req, false);
        assert_eq!(body["instructions"], "be terse");
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 2);
        assert_eq!(input[0]["role"], "system");
        assert_eq!(input[1]["role"], "user");
        assert_eq!(input[1]["content"][0]["type"], "input_text");
    }

    #[test]
    fn tool_round_trip_becomes_call_items() {
        let req = ChatRequest::new(
            "gpt-4o",
            vec![
                Message::assistant_with_calls(
                    "checking",
                    vec![ToolCall {
                        id: "c1".into(),
                        name: "read_file".into(),
                        arguments: r#"{"path":"/tmp/x"}"#.into(),
                    }],
                ),
                Message::tool("c1", "contents=42"),
            ],
            64,
        );
        let body = build_request_body(&req, false);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[0]["content"][0]["type"], "output_text");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "c1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["call_id"], "c1");
        assert_eq!(input[2]["output"], "contents=42");
    }

    #[test]
    fn json_mode_sets_text_format() {
        let mut req = ChatRequest::new("m", vec![Message::user("hi")], 16);
        req.json_mode = true;
        let body = build_request_body(&req, false);
        assert_eq!(body["text"]["format"]["type"], "json_object");
    }

    #[test]
    fn response_parse_collects_text_and_calls() {
        let raw = serde_json::json!({
            "status": "completed",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "done"}]},
                {"type": "function_call", "call_id": "c2", "name": "grep", "arguments": "{}"},
                {"type": "reasoning", "summary": []}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 4}
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let out = parse_response(resp);
        assert_eq!(out.content, "done");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.finish_reason, "tool_calls");
        assert_eq!(out.usage.prompt, 20);
    }

    #[test]
    fn incomplete_response_maps_to_length() {
        let raw = serde_json::json!({
            "status": "incomplete",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "trunc"}]}
            ],
            "usage": null
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parse_response(resp).finish_reason, "length");
    }
}
