use serde::{Deserialize, Serialize};

/// The closed set of memory categories. Order here is the order used when
/// rendering memories into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    /// Stable facts about who the user is.
    Profile,
    /// How the user likes things done.
    Preferences,
    /// People, projects, and systems the user works with.
    Entities,
    /// Things that happened (append-only).
    Events,
    /// Problem → solution records (append-only).
    Cases,
    /// Recurring behaviours and conventions.
    Patterns,
}

/// All categories in prompt-rendering order.
pub const CATEGORY_ORDER: [MemoryCategory; 6] = [
    MemoryCategory::Profile,
    MemoryCategory::Preferences,
    MemoryCategory::Entities,
    MemoryCategory::Events,
    MemoryCategory::Cases,
    MemoryCategory::Patterns,
];

impl MemoryCategory {
    /// Events and cases record history; merging would rewrite it, so the
    /// deduplicator always creates fresh entries for them.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Self::Events | Self::Cases)
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profile => write!(f, "profile"),
            Self::Preferences => write!(f, "preferences"),
            Self::Entities => write!(f, "entities"),
            Self::Events => write!(f, "events"),
            Self::Cases => write!(f, "cases"),
            Self::Patterns => write!(f, "patterns"),
        }
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "preferences" => Ok(Self::Preferences),
            "entities" => Ok(Self::Entities),
            "events" => Ok(Self::Events),
            "cases" => Ok(Self::Cases),
            "patterns" => Ok(Self::Patterns),
            other => Err(format!("unknown memory category: {other}")),
        }
    }
}

/// A single memory with its three detail layers.
///
/// `abstract_` (L0) is one sentence, `overview` (L1) a structured summary,
/// `content` (L2) the full detail. `vector` embeds L0+L1 and is empty when
/// embedding failed; vector search skips such entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub category: MemoryCategory,
    #[serde(rename = "abstract")]
    pub abstract_: String,
    pub overview: String,
    pub content: String,
    #[serde(default)]
    pub vector: Vec<f32>,
    #[serde(default)]
    pub active_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl Memory {
    /// Build a fresh memory with a new id and current timestamps.
    pub fn new(
        category: MemoryCategory,
        abstract_: impl Into<String>,
        overview: impl Into<String>,
        content: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: new_memory_id(),
            category,
            abstract_: abstract_.into(),
            overview: overview.into(),
            content: content.into(),
            vector,
            active_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Generate a memory id: `mem_` + 8 random bytes as hex.
pub fn new_memory_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = &uuid.as_bytes()[..8];
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("mem_{hex}")
}
