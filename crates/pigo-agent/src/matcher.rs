//! Pre-flight skill matching: one cheap non-streaming call that decides
//! which skills apply to the operator's input before the main turn runs.

use tracing::{debug, warn};

use crate::provider::{send_with_retry, ChatProvider, ChatRequest, Message};
use crate::skills::Skill;

const MATCHER_PROMPT: &str = "You match a user request against a list of available skills. \
     Reply with ONLY a JSON array of the names of the skills that apply, e.g. \
     [\"deploy\"]. Reply with [] if none apply. Do not explain.";

const MATCHER_MAX_TOKENS: u32 = 256;

/// Ask the model which of the visible skills apply to `input`.
///
/// Every failure mode (provider error, unparseable reply) degrades to an
/// empty match set: the turn proceeds normally and `use_skill` remains
/// available to the model.
pub async fn match_skills(
    provider: &dyn ChatProvider,
    model: &str,
    input: &str,
    visible: &[&Skill],
) -> Vec<String> {
    if visible.is_empty() {
        return Vec::new();
    }

    let mut listing = String::from("Available skills:\n");
    for skill in visible {
        listing.push_str(&format!("- {}: {}\n", skill.name, skill.description));
    }
    listing.push_str(&format!("\nUser request:\n{input}"));

    let mut req = ChatRequest::new(
        model,
        vec![Message::system(MATCHER_PROMPT), Message::user(listing)],
        MATCHER_MAX_TOKENS,
    );
    req.json_mode = true;

    let response = match send_with_retry(provider, &req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "skill matcher call failed, proceeding without pre-flight skills");
            return Vec::new();
        }
    };

    let names = match parse_name_array(&response.content) {
        Some(names) => names,
        None => {
            warn!(raw = %response.content, "skill matcher reply unparseable");
            return Vec::new();
        }
    };

    // Only names that correspond to a known visible skill count.
    let matched: Vec<String> = names
        .into_iter()
        .filter(|n| visible.iter().any(|s| &s.name == n))
        .collect();
    debug!(count = matched.len(), "skills matched");
    matched
}

/// Tolerant JSON-array parse: try the raw text, then the substring between
/// the first `[` and the last `]`.
pub(crate) fn parse_name_array(raw: &str) -> Option<Vec<String>> {
    let cleaned = strip_code_fences(raw);
    if let Ok(names) = serde_json::from_str::<Vec<String>>(cleaned) {
        return Some(names);
    }
    let rescued = rescue_between(cleaned, '[', ']')?;
    serde_json::from_str::<Vec<String>>(rescued).ok()
}

/// Remove a surrounding markdown code fence, if any.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // skip an optional language tag on the opening fence line
    let inner = match inner.find('\n') {
        Some(idx) => &inner[idx + 1..],
        None => inner,
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Substring between the first `open` and the last `close`, inclusive.
pub(crate) fn rescue_between(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end >= start).then(|| &raw[start..=end])
}
