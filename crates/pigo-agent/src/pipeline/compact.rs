//! History compaction — the recovery path for context-window overflow.
//!
//! The leading system run always survives; the most recent `keep_recent`
//! messages survive; everything in between is summarised into one synthetic
//! user message and handed to the memory extractor.

use tracing::{debug, info};

use crate::provider::{send_with_retry, ChatProvider, ChatRequest, Message, ProviderError, Role};

const SUMMARIZER_PROMPT: &str = "You are a conversation compactor. Summarise the conversation below into a \
     single dense paragraph set. Preserve technical details, file paths, \
     decisions, constraints, and unresolved questions verbatim where they \
     matter; drop pleasantries and dead ends. The summary replaces the \
     original messages, so anything you omit is gone.";

const SUMMARY_MAX_TOKENS: u32 = 1024;
/// Per-message cap when rendering a transcript for an LLM call.
const TRANSCRIPT_MSG_CHARS: usize = 2000;

pub enum CompactError {
    /// There was nothing between the stable prefix and the recent tail.
    /// Compaction cannot help; the caller should surface its original error.
    NothingToCompact,
    Provider(ProviderError),
}

pub struct Compaction {
    /// The span removed from history, in original order.
    pub discarded: Vec<Message>,
}

/// Rewrite `messages` to `stable_prefix ++ [synopsis] ++ recent_tail`,
/// returning the discarded span for memory extraction.
pub async fn compact(
    provider: &dyn ChatProvider,
    model: &str,
    messages: &mut Vec<Message>,
    keep_recent: usize,
) -> Result<Compaction, CompactError> {
    let stable = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();

    let mut tail_start = messages.len().saturating_sub(keep_recent).max(stable);

    // The seam must not split a tool-call/tool-result pair: a tool message
    // at the boundary belongs to an assistant in the discard span, so the
    // whole reply run moves into the discard with it.
    while tail_start < messages.len() && messages[tail_start].role == Role::Tool {
        tail_start += 1;
    }

    if tail_start <= stable {
        return Err(CompactError::NothingToCompact);
    }

    let discarded: Vec<Message> = messages[stable..tail_start].to_vec();
    if discarded.is_empty() {
        return Err(CompactError::NothingToCompact);
    }

    debug!(
        discarded = discarded.len(),
        kept = messages.len() - tail_start,
        "compacting history"
    );

    let transcript = render_transcript(&discarded);
    let req = ChatRequest::new(
        model,
        vec![
            Message::system(SUMMARIZER_PROMPT),
            Message::user(transcript),
        ],
        SUMMARY_MAX_TOKENS,
    );
    let summary = send_with_retry(provider, &req)
        .await
        .map_err(CompactError::Provider)?;

    let synopsis = Message::user(format!(
        "[Conversation summary: {}]",
        summary.content.trim()
    ));

    let tail = messages.split_off(tail_start);
    messages.truncate(stable);
    messages.push(synopsis);
    messages.extend(tail);

    info!(
        discarded = discarded.len(),
        history = messages.len(),
        "history compacted"
    );

    Ok(Compaction { discarded })
}

/// Render messages as a plain-text transcript for summarisation and
/// extraction prompts. Each body is truncated so one huge tool result
/// cannot blow up the secondary call.
pub(crate) fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "SYSTEM",
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                Role::Tool => "TOOL",
            };
            let mut body = truncate(&m.content, TRANSCRIPT_MSG_CHARS);
            for call in &m.tool_calls {
                body.push_str(&format!(
                    "\n[tool_call: {}({})]",
                    call.name,
                    truncate(&call.arguments, 200)
                ));
            }
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i <= max)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}…", &s[..cut])
}
