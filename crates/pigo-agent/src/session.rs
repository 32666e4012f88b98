use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pigo_core::{ApiType, TokenUsage};

use crate::provider::{Message, Role, ToolCall};
use crate::skills::Skill;

/// Conversation state for one interactive session. Single-owner: the agent
/// loop is the only mutator, so no internal locking beyond the shared
/// injected-skill set (which the `use_skill` tool also reads).
pub struct Session {
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
    pub model: String,
    pub api_type: ApiType,
    pub skills: Arc<Vec<Skill>>,
    /// Names eligible for pre-flight matching.
    pub visible_skills: Vec<String>,
    /// Skills injected during the current turn, shared with the `use_skill`
    /// tool so the two injection paths dedup against each other.
    pub injected_skills: Arc<Mutex<HashSet<String>>>,
    /// Tool calls emitted by the last assistant message that still await
    /// their results.
    pub pending_tool_calls: Vec<ToolCall>,
    pub turn_index: u32,
}

impl Session {
    pub fn new(
        model: impl Into<String>,
        api_type: ApiType,
        system_prompt: impl Into<String>,
        skills: Arc<Vec<Skill>>,
    ) -> Self {
        let visible_skills = skills
            .iter()
            .filter(|s| !s.disable_model_invocation)
            .map(|s| s.name.clone())
            .collect();
        Self {
            messages: vec![Message::system(system_prompt)],
            usage: TokenUsage::default(),
            model: model.into(),
            api_type,
            skills,
            visible_skills,
            injected_skills: Arc::new(Mutex::new(HashSet::new())),
            pending_tool_calls: Vec::new(),
            turn_index: 0,
        }
    }

    /// Length of the leading system-message run. These messages survive
    /// every compaction.
    pub fn stable_prefix_len(&self) -> usize {
        self.messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count()
    }

    /// Skills eligible for pre-flight matching, resolved to references.
    pub fn visible_skill_refs(&self) -> Vec<&Skill> {
        self.skills
            .iter()
            .filter(|s| self.visible_skills.contains(&s.name))
            .collect()
    }

    pub fn find_skill(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name)
    }

    /// Start a new turn: bump the counter and reset per-turn skill tracking.
    pub fn begin_turn(&mut self) {
        self.turn_index += 1;
        self.injected_skills
            .lock()
            .expect("injected skill set poisoned")
            .clear();
        self.pending_tool_calls.clear();
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }
}
