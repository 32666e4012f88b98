//! The turn pipeline: streamed steps, tool dispatch, overflow recovery, and
//! memory extraction from discarded history.

pub mod compact;
pub mod extract;
pub mod turn;

use std::sync::Arc;

use pigo_hooks::HookRunner;
use pigo_memory::MemoryStore;

use crate::embed::Embedder;
use crate::provider::{ChatProvider, ProviderError};
use crate::tools::Tool;

/// Everything a turn needs besides the session itself. Built once at agent
/// construction and shared for the process lifetime.
pub struct AgentDeps {
    pub provider: Arc<dyn ChatProvider>,
    pub embedder: Arc<dyn Embedder>,
    /// None when the store failed to load; the agent runs without memory
    /// persistence for the rest of the session.
    pub store: Option<Arc<MemoryStore>>,
    pub hooks: HookRunner,
    pub tools: Vec<Box<dyn Tool>>,
    pub max_tokens: u32,
    /// Messages kept as the recent tail when compaction runs.
    pub keep_recent: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Compaction shrank the tail to nothing and the provider still rejects
    /// the history.
    #[error("context window exhausted beyond recovery")]
    IrrecoverableOverflow,
}
