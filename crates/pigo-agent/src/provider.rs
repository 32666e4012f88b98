use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pigo_core::{ApiType, PigoConfig, TokenUsage};

use crate::stream::StreamEvent;

/// A single message in the conversation history.
///
/// Assistant messages may carry tool calls; tool messages answer exactly one
/// of them via `tool_call_id`. The turn pipeline keeps the pairing invariant;
/// provider adapters only translate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call extracted from a model response. `arguments` stays a raw JSON
/// string until the registry validates and dispatches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    /// Ask for a JSON object response where the protocol supports it.
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens,
            json_mode: false,
        }
    }
}

/// Response from an LLM provider. `finish_reason` is normalised to
/// `stop` / `length` / `tool_calls` across backends.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: TokenUsage,
}

/// Common interface for the three chat backends.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for the full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError>;

    /// Stream response events through a channel. Text deltas arrive as they
    /// are generated; tool-call fragments are accumulated inside the adapter
    /// and surface only as complete `ToolUse` events.
    ///
    /// Default: falls back to the non-streaming path.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        if !resp.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: resp.content.clone(),
                })
                .await;
        }
        for call in &resp.tool_calls {
            let _ = tx
                .send(StreamEvent::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                finish_reason: resp.finish_reason,
                usage: resp.usage,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient failures worth another attempt: transport errors, 429, 5xx.
    /// Auth and other 4xx failures are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } | Self::Unavailable(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Classify an HTTP error response into the provider error taxonomy.
pub(crate) fn classify_status(status: u16, message: String, retry_after_ms: Option<u64>) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Auth { status, message },
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(5000),
        },
        _ => ProviderError::Api { status, message },
    }
}

/// Phrases providers use when the prompt no longer fits the context window.
const OVERFLOW_PHRASES: &[&str] = &[
    "context length",
    "context window",
    "too many tokens",
    "token limit",
    "prompt is too long",
    "maximum prompt length",
    "reduce the length",
    "input token count",
];

/// True when the error is a 400/413 whose body reads like a context-window
/// rejection. This classification is what triggers compaction.
pub fn is_context_overflow(err: &ProviderError) -> bool {
    let ProviderError::Api { status, message } = err else {
        return false;
    };
    if *status != 400 && *status != 413 {
        return false;
    }
    let body = message.to_lowercase();
    OVERFLOW_PHRASES.iter().any(|p| body.contains(p))
        || (body.contains("maximum") && body.contains("token"))
}

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Send with up to 3 attempts and exponential backoff on transient failures.
/// The error returned is the final one; callers classify overflow on it.
pub async fn send_with_retry(
    provider: &dyn ChatProvider,
    req: &ChatRequest,
) -> Result<ChatOutcome, ProviderError> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match provider.send(req).await {
            Ok(resp) => {
                if attempt > 0 {
                    debug!(provider = %provider.name(), attempt, "request succeeded after retry");
                }
                return Ok(resp);
            }
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                warn!(provider = %provider.name(), attempt, err = %e, "provider send failed, retrying");
                tokio::time::sleep(backoff_delay(attempt, &e)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::Unavailable("retries exhausted".to_string())))
}

/// Streaming variant of [`send_with_retry`]. Adapters fail before the first
/// event on HTTP-level errors, so a retry never duplicates output.
pub async fn send_stream_with_retry(
    provider: &dyn ChatProvider,
    req: &ChatRequest,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<(), ProviderError> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match provider.send_stream(req, tx.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                warn!(provider = %provider.name(), attempt, err = %e, "provider stream failed, retrying");
                tokio::time::sleep(backoff_delay(attempt, &e)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::Unavailable("retries exhausted".to_string())))
}

fn backoff_delay(attempt: u32, err: &ProviderError) -> std::time::Duration {
    let backoff = BACKOFF_BASE_MS * (1 << attempt);
    let ms = match err {
        ProviderError::RateLimited { retry_after_ms } => backoff.max(*retry_after_ms),
        _ => backoff,
    };
    std::time::Duration::from_millis(ms)
}

/// Tool definitions with a name and a parameters schema. Malformed entries
/// are dropped with a warning rather than failing the request.
pub(crate) fn valid_tools(tools: &[ToolDefinition]) -> Vec<&ToolDefinition> {
    tools
        .iter()
        .filter(|t| {
            let ok = !t.name.is_empty() && !t.parameters.is_null();
            if !ok {
                warn!(name = %t.name, "skipping malformed tool definition");
            }
            ok
        })
        .collect()
}

/// Construct the concrete provider selected by `api_type`.
pub fn build_provider(cfg: &PigoConfig) -> std::sync::Arc<dyn ChatProvider> {
    match cfg.api_type {
        ApiType::Chat => std::sync::Arc::new(crate::openai::OpenAiChatProvider::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        )),
        ApiType::Responses => std::sync::Arc::new(crate::openai_responses::OpenAiResponsesProvider::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        )),
        ApiType::Anthropic => std::sync::Arc::new(crate::anthropic::AnthropicProvider::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> ProviderError {
        ProviderError::Api {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn overflow_matches_recognised_phrases() {
        for msg in [
            "This model's maximum context length is 128000 tokens",
            "the context window has been exceeded",
            "too many tokens in the request",
            "you hit the token limit",
            "prompt is too long: 210000 tokens",
            "maximum prompt length exceeded",
            "please reduce the length of the messages",
            "input token count exceeds the limit",
        ] {
            assert!(is_context_overflow(&api(400, msg)), "should match: {msg}");
        }
    }

    #[test]
    fn overflow_matches_joint_maximum_token_pattern() {
        assert!(is_context_overflow(&api(
            413,
            "request exceeds the maximum of 200000 tokens"
        )));
    }

    #[test]
    fn overflow_requires_400_or_413() {
        assert!(!is_context_overflow(&api(500, "context length exceeded")));
        assert!(!is_context_overflow(&api(429, "token limit")));
        assert!(!is_context_overflow(&ProviderError::Unavailable(
            "context window".to_string()
        )));
    }

    #[test]
    fn overflow_requires_a_matching_phrase() {
        assert!(!is_context_overflow(&api(400, "invalid request body")));
        assert!(!is_context_overflow(&api(400, "maximum temperature is 2.0")));
    }

    #[test]
    fn retryability_follows_status_class() {
        assert!(api(500, "oops").is_retryable());
        assert!(api(503, "busy").is_retryable());
        assert!(!api(400, "bad").is_retryable());
        assert!(ProviderError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(!ProviderError::Auth {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn classify_routes_auth_and_rate_limits() {
        assert!(matches!(
            classify_status(401, "bad key".into(), None),
            ProviderError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(429, "slow down".into(), Some(1200)),
            ProviderError::RateLimited { retry_after_ms: 1200 }
        ));
        assert!(matches!(
            classify_status(400, "bad".into(), None),
            ProviderError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn malformed_tool_definitions_are_dropped() {
        let tools = vec![
            ToolDefinition {
                name: "ok".into(),
                description: "fine".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
            ToolDefinition {
                name: String::new(),
                description: "no name".into(),
                parameters: serde_json::json!({}),
            },
            ToolDefinition {
                name: "no_params".into(),
                description: String::new(),
                parameters: serde_json::Value::Null,
            },
        ];
        let kept = valid_tools(&tools);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "ok");
    }

    struct FlakyProvider {
        failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ChatProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
            if self.failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                Err(ProviderError::Api {
                    status: 503,
                    message: "overloaded".into(),
                })
            } else {
                Ok(ChatOutcome {
                    content: "ok".into(),
                    finish_reason: "stop".into(),
                    ..Default::default()
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let provider = FlakyProvider {
            failures: std::sync::atomic::AtomicU32::new(2),
        };
        let req = ChatRequest::new("m", vec![Message::user("hi")], 16);
        let out = send_with_retry(&provider, &req).await.unwrap();
        assert_eq!(out.content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let provider = FlakyProvider {
            failures: std::sync::atomic::AtomicU32::new(10),
        };
        let req = ChatRequest::new("m", vec![Message::user("hi")], 16);
        assert!(send_with_retry(&provider, &req).await.is_err());
    }

    struct AuthFail;

    #[async_trait]
    impl ChatProvider for AuthFail {
        fn name(&self) -> &str {
            "auth-fail"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
            Err(ProviderError::Auth {
                status: 401,
                message: "invalid key".into(),
            })
        }
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let req = ChatRequest::new("m", vec![Message::user("hi")], 16);
        let err = send_with_retry(&AuthFail, &req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
    }
}
