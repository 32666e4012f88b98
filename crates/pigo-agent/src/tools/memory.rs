//! Memory tools: explicit remember / forget / search for the model.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use pigo_memory::{Memory, MemoryCategory, MemoryStore};

use crate::embed::Embedder;

use super::{Tool, ToolResult};

const SEARCH_DEFAULT_K: usize = 5;

pub struct RememberTool {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
}

impl RememberTool {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save a long-term memory about the user or their work. Categories: \
         profile, preferences, entities, events, cases, patterns."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "enum": ["profile", "preferences", "entities", "events", "cases", "patterns"],
                    "description": "Which kind of memory this is."
                },
                "abstract": {
                    "type": "string",
                    "description": "One-sentence summary."
                },
                "overview": {
                    "type": "string",
                    "description": "Structured overview (optional)."
                },
                "content": {
                    "type": "string",
                    "description": "Full detail (optional)."
                }
            },
            "required": ["category", "abstract"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let category: MemoryCategory = match input
            .get("category")
            .and_then(|v| v.as_str())
            .map(str::parse)
        {
            Some(Ok(c)) => c,
            _ => return ToolResult::error("invalid or missing category"),
        };
        let Some(abstract_) = input.get("abstract").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: abstract");
        };
        let overview = input.get("overview").and_then(|v| v.as_str()).unwrap_or("");
        let content = input.get("content").and_then(|v| v.as_str()).unwrap_or("");

        let vector = match self.embedder.embed(&format!("{abstract_} {overview}")).await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "embedding failed; storing memory without a vector");
                Vec::new()
            }
        };

        let mem = Memory::new(category, abstract_, overview, content, vector);
        let id = mem.id.clone();
        self.store.add(mem);
        if let Err(e) = self.store.save() {
            warn!(err = %e, "memory store save failed");
        }

        ToolResult::success(format!("remembered ({category}): {abstract_} [{id}]"))
            .with_display(format!("🧠 remembered: {abstract_}"))
    }
}

pub struct ForgetTool {
    store: Arc<MemoryStore>,
}

impl ForgetTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ForgetTool {
    fn name(&self) -> &str {
        "forget"
    }

    fn description(&self) -> &str {
        "Delete a stored memory by id (as returned by memory_search or remember)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Memory id, e.g. mem_a1b2c3d4e5f60718."
                }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(id) = input.get("id").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: id");
        };

        match self.store.delete(id) {
            Ok(()) => {
                if let Err(e) = self.store.save() {
                    warn!(err = %e, "memory store save failed");
                }
                ToolResult::success(format!("forgot {id}"))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory. Uses semantic similarity when possible, \
         falling back to keyword search."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for."
                },
                "k": {
                    "type": "integer",
                    "description": "Maximum results (default 5)."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: query");
        };
        let k = input
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(SEARCH_DEFAULT_K);

        let hits = match self.embedder.embed(query).await {
            Ok(vector) => self.store.search_by_vector(&vector, k, None),
            Err(e) => {
                warn!(err = %e, "embedding failed; falling back to keyword search");
                self.store.search_by_keyword(query, k)
            }
        };

        if hits.is_empty() {
            return ToolResult::success("no matching memories");
        }

        let mut out = String::new();
        for mem in &hits {
            // Surfacing counts as usage.
            let _ = self.store.touch(&mem.id);
            out.push_str(&format!("[{}] ({}) {}\n", mem.id, mem.category, mem.abstract_));
            if !mem.overview.is_empty() {
                out.push_str(&format!("    {}\n", mem.overview));
            }
        }

        ToolResult::success(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(memories: Vec<Memory>) -> (tempfile::TempDir, Arc<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(dir.path().join("memories.jsonl")));
        for m in memories {
            store.add(m);
        }
        (dir, store)
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::provider::ProviderError> {
            Err(crate::provider::ProviderError::Unavailable("no embeddings".into()))
        }
    }

    fn unreachable_embedder() -> Arc<dyn Embedder> {
        Arc::new(FailingEmbedder)
    }

    #[tokio::test]
    async fn remember_without_embeddings_still_stores() {
        let (_dir, store) = store_with(vec![]);
        let tool = RememberTool::new(Arc::clone(&store), unreachable_embedder());

        let result = tool
            .execute(serde_json::json!({
                "category": "preferences",
                "abstract": "prefers tabs"
            }))
            .await;
        assert!(!result.is_error);
        assert_eq!(store.len(), 1);
        let saved = &store.search_by_keyword("tabs", 1)[0];
        assert!(saved.vector.is_empty());
    }

    #[tokio::test]
    async fn remember_rejects_unknown_category() {
        let (_dir, store) = store_with(vec![]);
        let tool = RememberTool::new(store, unreachable_embedder());
        let result = tool
            .execute(serde_json::json!({ "category": "vibes", "abstract": "x" }))
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn forget_removes_by_id() {
        let mem = Memory::new(MemoryCategory::Events, "deployed", "", "", vec![]);
        let id = mem.id.clone();
        let (_dir, store) = store_with(vec![mem]);
        let tool = ForgetTool::new(Arc::clone(&store));

        let result = tool.execute(serde_json::json!({ "id": id })).await;
        assert!(!result.is_error);
        assert!(store.is_empty());

        let result = tool.execute(serde_json::json!({ "id": id })).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn search_falls_back_to_keywords_and_touches() {
        let mem = Memory::new(MemoryCategory::Cases, "fixed the linker flag", "", "", vec![]);
        let id = mem.id.clone();
        let (_dir, store) = store_with(vec![mem]);
        let tool = MemorySearchTool::new(Arc::clone(&store), unreachable_embedder());

        let result = tool.execute(serde_json::json!({ "query": "linker" })).await;
        assert!(!result.is_error);
        assert!(result.for_llm.contains(&id));
        assert_eq!(store.get(&id).unwrap().active_count, 1);
    }
}
