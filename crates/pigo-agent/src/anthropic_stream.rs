use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pigo_core::TokenUsage;

use crate::anthropic::map_stop_reason;
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Parse an Anthropic streaming SSE response and emit StreamEvents.
///
/// Tool input arrives as `input_json_delta` fragments; the state machine
/// accumulates them and surfaces a single `ToolUse` when the content block
/// closes.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
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

        // SSE arrives as arbitrary byte chunks; reassemble lines and keep
        // the trailing incomplete one buffered.
        line_buf.push_str(text);
        while let Some(newline) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=newline).collect();
            if let Some(event) = state.handle_line(line.trim()) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    let _ = tx.send(state.finish()).await;
}

/// Per-response parser state: the current SSE event name, the open content
/// block, and the running usage totals.
#[derive(Default)]
struct StreamState {
    event_name: String,
    block_type: String,
    tool_id: String,
    tool_name: String,
    tool_input_json: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl StreamState {
    fn handle_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            return None;
        }
        match parse_sse_line(line)? {
            SseParsed::Event(name) => {
                self.event_name = name;
                None
            }
            SseParsed::Data(data) => self.handle_data(&data),
        }
    }

    fn handle_data(&mut self, data: &str) -> Option<StreamEvent> {
        match self.event_name.as_str() {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                    self.tokens_in = msg.message.usage.input_tokens;
                }
                None
            }

            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    self.block_type = start.content_block.block_type;
                    if self.block_type == "tool_use" {
                        self.tool_id = start.content_block.id.unwrap_or_default();
                        self.tool_name = start.content_block.name.unwrap_or_default();
                        self.tool_input_json.clear();
                    }
                }
                None
            }

            "content_block_delta" => {
                let delta = serde_json::from_str::<ContentBlockDelta>(data).ok()?.delta;
                match delta.delta_type.as_str() {
                    "text_delta" => delta.text.map(|text| {
                        debug!(len = text.len(), "stream text delta");
                        StreamEvent::TextDelta { text }
                    }),
                    "input_json_delta" => {
                        if let Some(partial) = delta.partial_json {
                            self.tool_input_json.push_str(&partial);
                        }
                        None
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                        None
                    }
                }
            }

            "content_block_stop" => self.close_block(),

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }

            "error" => {
                warn!(data, "anthropic stream error");
                Some(StreamEvent::Error {
                    message: data.to_string(),
                })
            }

            // message_stop, ping, unknown events: nothing to do
            _ => None,
        }
    }

    /// A closing tool_use block yields the complete call; text blocks close
    /// silently.
    fn close_block(&mut self) -> Option<StreamEvent> {
        let was_tool = self.block_type == "tool_use";
        self.block_type.clear();
        if !was_tool {
            return None;
        }
        let arguments = if self.tool_input_json.is_empty() {
            "{}".to_string()
        } else {
            std::mem::take(&mut self.tool_input_json)
        };
        Some(StreamEvent::ToolUse {
            id: std::mem::take(&mut self.tool_id),
            name: std::mem::take(&mut self.tool_name),
            arguments,
        })
    }

    fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            finish_reason: map_stop_reason(&self.stop_reason),
            usage: TokenUsage::new(self.tokens_in, self.tokens_out),
        }
    }
}

// Anthropic SSE payload types (private, deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}
