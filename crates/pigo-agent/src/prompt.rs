use pigo_memory::MemoryStore;

/// Memories rendered into the system prompt, at most.
const MEMORY_SECTION_MAX: usize = 20;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are pigo, a coding assistant running in the user's terminal. \
     You can read and modify files, search the workspace, and run shell \
     commands through your tools. Prefer tools over guessing. Be concise; \
     show your work only when it helps.";

/// Assemble the session's opening system prompt: the configured base text
/// plus a memory section rendered from the store.
pub fn build_system_prompt(base: Option<&str>, store: Option<&MemoryStore>) -> String {
    let mut out = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();

    if let Some(store) = store {
        let memories = store.format_for_prompt(MEMORY_SECTION_MAX);
        if !memories.is_empty() {
            out.push_str("\n\n# What you remember about this user\n\n");
            out.push_str(&memories);
        }
    }

    out
}
