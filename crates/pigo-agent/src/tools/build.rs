//! Tool registry assembly — the canonical tool list for a session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pigo_memory::MemoryStore;

use crate::embed::Embedder;
use crate::skills::Skill;

use super::execute_command::ExecuteCommandTool;
use super::list_files::ListFilesTool;
use super::memory::{ForgetTool, MemorySearchTool, RememberTool};
use super::read_file::ReadFileTool;
use super::search_files::SearchFilesTool;
use super::skill::UseSkillTool;
use super::write_file::WriteFileTool;
use super::Tool;

/// Build the full tool list.
///
/// The memory tools appear only when a store is available: a session whose
/// store failed to load keeps working without them. `injected` is the
/// per-turn skill tracking set shared with the turn pipeline.
pub fn build_tools(
    store: Option<Arc<MemoryStore>>,
    embedder: Arc<dyn Embedder>,
    skills: Arc<Vec<Skill>>,
    injected: Arc<Mutex<HashSet<String>>>,
) -> Vec<Box<dyn Tool>> {
    let mut tools: Vec<Box<dyn Tool>> = vec![
        Box::new(ReadFileTool),
        Box::new(WriteFileTool),
        Box::new(ListFilesTool),
        Box::new(SearchFilesTool),
        Box::new(ExecuteCommandTool),
        Box::new(UseSkillTool::new(skills, injected)),
    ];

    if let Some(store) = store {
        tools.push(Box::new(RememberTool::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
        )));
        tools.push(Box::new(ForgetTool::new(Arc::clone(&store))));
        tools.push(Box::new(MemorySearchTool::new(store, embedder)));
    }

    tools
}
