//! Memory extraction from discarded conversation spans, with two-stage
//! deduplication (vector prefilter, then an LLM CREATE/MERGE/SKIP decision).

use serde::Deserialize;
use tracing::{debug, info, warn};

use pigo_memory::{Memory, MemoryCategory, MemoryStore};

use crate::embed::Embedder;
use crate::matcher::{rescue_between, strip_code_fences};
use crate::provider::{send_with_retry, ChatProvider, ChatRequest, Message, ProviderError};

use super::compact::render_transcript;

const EXTRACTION_PROMPT: &str = "You extract long-term memories from a conversation that is about to be \
     discarded. Return ONLY a JSON array; each element is an object with \
     \"category\" (one of profile, preferences, entities, events, cases, \
     patterns), \"abstract\" (one sentence), \"overview\" (short structured \
     summary), and \"content\" (full detail). Record only durable facts \
     about the user, their projects, decisions, and solutions — not \
     transient chit-chat. Return [] if nothing is worth keeping.";

const DEDUP_PROMPT: &str = "You decide whether a candidate memory duplicates existing ones. Reply with \
     ONLY a JSON object: {\"decision\": \"CREATE\" | \"MERGE\" | \"SKIP\", \
     \"reason\": \"...\", \"merge_target\": \"<id>\"}. Use MERGE when the \
     candidate refines an existing memory (set merge_target to its id), SKIP \
     when it adds nothing, CREATE otherwise.";

const MERGE_PROMPT: &str = "Merge the candidate memory into the existing one. Reply with ONLY a JSON \
     object {\"abstract\": \"...\", \"overview\": \"...\", \"content\": \
     \"...\"} containing the combined memory. Keep the abstract to one \
     sentence; fold every still-true detail of both versions into overview \
     and content.";

/// Vector prefilter threshold for candidate deduplication.
const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Existing memories shown to the dedup LLM call, at most.
const MAX_NEIGHBOURS: usize = 5;
const EXTRACT_MAX_TOKENS: u32 = 1024;
const DECIDE_MAX_TOKENS: u32 = 256;
const MERGE_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
struct Candidate {
    category: String,
    #[serde(rename = "abstract")]
    abstract_: String,
    #[serde(default)]
    overview: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, PartialEq)]
enum Decision {
    Create,
    Merge(String),
    Skip,
}

/// Extract memories from a discarded span and fold them into the store.
/// Returns how many memories were created or merged. Every failure mode is
/// soft: extraction never breaks the compaction path it runs inside.
pub async fn extract_memories(
    provider: &dyn ChatProvider,
    model: &str,
    embedder: &dyn Embedder,
    store: &MemoryStore,
    discarded: &[Message],
) -> usize {
    if discarded.is_empty() {
        return 0;
    }

    let transcript = render_transcript(discarded);
    let mut req = ChatRequest::new(
        model,
        vec![
            Message::system(EXTRACTION_PROMPT),
            Message::user(format!("Extract memories from this conversation:\n\n{transcript}")),
        ],
        EXTRACT_MAX_TOKENS,
    );
    req.json_mode = true;

    let response = match send_with_retry(provider, &req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "memory extraction call failed");
            return 0;
        }
    };

    let candidates = parse_candidates(&response.content);
    if candidates.is_empty() {
        debug!("no memory candidates extracted");
        return 0;
    }

    let mut persisted = 0usize;
    for candidate in candidates {
        // Unknown categories are dropped silently; the model sometimes
        // invents new ones.
        let Ok(category) = candidate.category.parse::<MemoryCategory>() else {
            continue;
        };

        let vector = match embedder
            .embed(&format!("{} {}", candidate.abstract_, candidate.overview))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "candidate embedding failed, continuing without vector");
                Vec::new()
            }
        };

        let decision = decide(provider, model, store, &candidate, category, &vector).await;
        debug!(category = %category, ?decision, abstract_ = %candidate.abstract_, "dedup decision");

        match decision {
            Decision::Create => {
                store.add(Memory::new(
                    category,
                    candidate.abstract_,
                    candidate.overview,
                    candidate.content,
                    vector,
                ));
                persisted += 1;
            }
            Decision::Merge(target_id) => {
                if merge_into(provider, model, store, &target_id, &candidate, vector).await {
                    persisted += 1;
                } else {
                    // Merge failed; keep the information rather than lose it.
                    store.add(Memory::new(
                        category,
                        candidate.abstract_,
                        candidate.overview,
                        candidate.content,
                        Vec::new(),
                    ));
                    persisted += 1;
                }
            }
            Decision::Skip => {}
        }
    }

    if let Err(e) = store.save() {
        warn!(err = %e, "memory store save failed after extraction");
    }

    info!(persisted, "memory extraction complete");
    persisted
}

/// Two-stage deduplication: vector prefilter, then category overrides, then
/// the LLM decision. Anything unparseable falls open to CREATE.
async fn decide(
    provider: &dyn ChatProvider,
    model: &str,
    store: &MemoryStore,
    candidate: &Candidate,
    category: MemoryCategory,
    vector: &[f32],
) -> Decision {
    let similar = store.find_similar(vector, SIMILARITY_THRESHOLD, Some(category));
    if similar.is_empty() {
        return Decision::Create;
    }

    // Events and cases record history; a near-duplicate is a new entry.
    if category.is_append_only() {
        return Decision::Create;
    }

    // Profile facts converge: always fold into the closest existing one.
    if category == MemoryCategory::Profile {
        return Decision::Merge(similar[0].0.id.clone());
    }

    let mut listing = String::from("Existing memories:\n");
    for (mem, score) in similar.iter().take(MAX_NEIGHBOURS) {
        listing.push_str(&format!(
            "- id={} similarity={score:.2} abstract={}\n  overview={}\n",
            mem.id, mem.abstract_, mem.overview
        ));
    }
    listing.push_str(&format!(
        "\nCandidate:\nabstract={}\noverview={}\ncontent={}",
        candidate.abstract_, candidate.overview, candidate.content
    ));

    let mut req = ChatRequest::new(
        model,
        vec![Message::system(DEDUP_PROMPT), Message::user(listing)],
        DECIDE_MAX_TOKENS,
    );
    req.json_mode = true;

    let response = match send_with_retry(provider, &req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "dedup decision call failed, defaulting to CREATE");
            return Decision::Create;
        }
    };

    parse_decision(&response.content, &similar)
}

fn parse_decision(raw: &str, similar: &[(Memory, f64)]) -> Decision {
    #[derive(Deserialize)]
    struct Reply {
        decision: String,
        #[serde(default)]
        merge_target: Option<String>,
    }

    let cleaned = strip_code_fences(raw);
    let parsed: Option<Reply> = serde_json::from_str(cleaned).ok().or_else(|| {
        rescue_between(cleaned, '{', '}').and_then(|s| serde_json::from_str(s).ok())
    });

    let Some(reply) = parsed else {
        return Decision::Create;
    };

    match reply.decision.to_uppercase().as_str() {
        "SKIP" => Decision::Skip,
        "MERGE" => {
            let target = reply
                .merge_target
                .filter(|id| similar.iter().any(|(m, _)| &m.id == id))
                .or_else(|| similar.first().map(|(m, _)| m.id.clone()));
            match target {
                Some(id) => Decision::Merge(id),
                None => Decision::Create,
            }
        }
        // Unrecognised decisions fail open.
        _ => Decision::Create,
    }
}

/// Second LLM call producing the merged three layers; updates the target in
/// place. Returns false when anything goes wrong.
async fn merge_into(
    provider: &dyn ChatProvider,
    model: &str,
    store: &MemoryStore,
    target_id: &str,
    candidate: &Candidate,
    vector: Vec<f32>,
) -> bool {
    #[derive(Deserialize)]
    struct Merged {
        #[serde(rename = "abstract")]
        abstract_: String,
        #[serde(default)]
        overview: String,
        #[serde(default)]
        content: String,
    }

    let Some(mut existing) = store.get(target_id) else {
        return false;
    };

    let prompt = format!(
        "Existing memory:\nabstract={}\noverview={}\ncontent={}\n\n\
         Candidate memory:\nabstract={}\noverview={}\ncontent={}",
        existing.abstract_,
        existing.overview,
        existing.content,
        candidate.abstract_,
        candidate.overview,
        candidate.content
    );

    let mut req = ChatRequest::new(
        model,
        vec![Message::system(MERGE_PROMPT), Message::user(prompt)],
        MERGE_MAX_TOKENS,
    );
    req.json_mode = true;

    let response = match send_with_retry(provider, &req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "merge call failed");
            return false;
        }
    };

    let cleaned = strip_code_fences(&response.content);
    let merged: Option<Merged> = serde_json::from_str(cleaned).ok().or_else(|| {
        rescue_between(cleaned, '{', '}').and_then(|s| serde_json::from_str(s).ok())
    });
    let Some(merged) = merged else {
        warn!(raw = %response.content, "merge reply unparseable");
        return false;
    };

    existing.abstract_ = merged.abstract_;
    existing.overview = merged.overview;
    existing.content = merged.content;
    if !vector.is_empty() {
        existing.vector = vector;
    }
    existing.updated_at = chrono::Utc::now().to_rfc3339();
    store.update(existing).is_ok()
}

fn parse_candidates(raw: &str) -> Vec<Candidate> {
    let cleaned = strip_code_fences(raw);
    if let Ok(candidates) = serde_json::from_str::<Vec<Candidate>>(cleaned) {
        return candidates;
    }
    if let Some(rescued) = rescue_between(cleaned, '[', ']') {
        if let Ok(candidates) = serde_json::from_str::<Vec<Candidate>>(rescued) {
            return candidates;
        }
    }
    warn!(raw = %raw, "extraction reply unparseable");
    Vec::new()
}
