use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pigo_core::TokenUsage;

use crate::provider::{
    classify_status, valid_tools, ChatOutcome, ChatProvider, ChatRequest, Message, ProviderError,
    Role, ToolCall,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// OpenAI Chat Completions adapter (`/v1/chat/completions`).
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChatProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let body = build_request_body(req, false);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %req.model, "sending request to OpenAI chat completions");

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
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %req.model, "sending streaming request to OpenAI chat completions");

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
    warn!(status, body = %text, "OpenAI API error");
    classify_status(status, text, retry_after)
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_to_json).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if stream {
        // Without this OpenAI omits token usage from streamed responses.
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }

    if req.json_mode {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }

    let tools = valid_tools(&req.tools);
    if !tools.is_empty() {
        let defs: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(defs);
    }

    body
}

/// The chat protocol maps 1:1: the only wrinkle is that an assistant message
/// carrying tool calls sends a null content plus a `tool_calls` array, and
/// tool replies use `role = "tool"` with the call-id back-reference.
fn message_to_json(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<serde_json::Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(msg.content.clone())
            };
            serde_json::json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
            "content": msg.content,
        }),
        _ => serde_json::json!({ "role": msg.role, "content": msg.content }),
    }
}

pub(crate) fn parse_response(resp: ApiResponse) -> ChatOutcome {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();
    let usage = resp
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    ChatOutcome {
        content,
        tool_calls,
        finish_reason,
        usage,
    }
}

/// Accumulates a streamed tool call. OpenAI sends the id and name once on
/// the first fragment, then argument text deltas keyed by call index.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut pending_calls: Vec<ToolCallAccumulator> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut finish_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
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
                break 'outer;
            }
            let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            if let Some(u) = &chunk_resp.usage {
                usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
            }

            for choice in &chunk_resp.choices {
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        finish_reason = reason.clone();
                    }
                }
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty()
                        && tx
                            .send(StreamEvent::TextDelta {
                                text: content.clone(),
                            })
                            .await
                            .is_err()
                    {
                        return; // receiver dropped
                    }
                }
                for frag in choice.delta.tool_calls.iter().flatten() {
                    let idx = frag.index;
                    while pending_calls.len() <= idx {
                        pending_calls.push(ToolCallAccumulator::default());
                    }
                    let acc = &mut pending_calls[idx];
                    if let Some(id) = &frag.id {
                        acc.id = id.clone();
                    }
                    if let Some(f) = &frag.function {
                        if let Some(name) = &f.name {
                            acc.name.push_str(name);
                        }
                        if let Some(args) = &f.arguments {
                            acc.arguments.push_str(args);
                        }
                    }
                }
            }
        }
    }

    // Flush completed calls in index order so execution matches emission.
    for acc in pending_calls {
        if acc.id.is_empty() && acc.name.is_empty() {
            continue;
        }
        if tx
            .send(StreamEvent::ToolUse {
                id: acc.id,
                name: acc.name,
                arguments: acc.arguments,
            })
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            finish_reason,
            usage,
        })
        .await;
}

// OpenAI API response types (private — deserialization only)

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<Usage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ChoiceMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ChoiceMessage {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallFragment>>,
}

#[derive(Deserialize)]
struct StreamToolCallFragment {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunctionFragment>,
}

#[derive(Deserialize)]
struct StreamFunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}
