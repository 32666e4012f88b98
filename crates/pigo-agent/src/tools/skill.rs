//! Tool: use_skill — lets the model pull in a skill body mid-turn.
//!
//! This is the fallback path next to pre-flight matching; both end up
//! injecting the same `<skill>` envelope, so the shared per-turn set keeps
//! a skill from being injected twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::skills::Skill;

use super::{Tool, ToolResult};

pub struct UseSkillTool {
    skills: Arc<Vec<Skill>>,
    injected: Arc<Mutex<HashSet<String>>>,
}

impl UseSkillTool {
    pub fn new(skills: Arc<Vec<Skill>>, injected: Arc<Mutex<HashSet<String>>>) -> Self {
        Self { skills, injected }
    }
}

#[async_trait]
impl Tool for UseSkillTool {
    fn name(&self) -> &str {
        "use_skill"
    }

    fn description(&self) -> &str {
        "Load the full instructions of a named skill. Use this when the task \
         matches a skill you know about but its instructions are not already \
         in context."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "The skill name to load."
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let name = match input.get("name").and_then(|v| v.as_str()) {
            Some(n) if !n.trim().is_empty() => n.trim(),
            _ => return ToolResult::error("missing required parameter: name"),
        };

        // Model-hidden skills look exactly like unknown ones.
        let found = self
            .skills
            .iter()
            .find(|s| s.name == name && !s.disable_model_invocation);

        let Some(skill) = found else {
            let available: Vec<&str> = self
                .skills
                .iter()
                .filter(|s| !s.disable_model_invocation)
                .map(|s| s.name.as_str())
                .collect();
            return ToolResult::error(format!(
                "skill '{}' not found. Available: {}",
                name,
                available.join(", ")
            ));
        };

        {
            let mut injected = self.injected.lock().expect("injected skill set poisoned");
            if !injected.insert(skill.name.clone()) {
                return ToolResult::success(format!(
                    "skill '{}' is already loaded in this turn",
                    skill.name
                ));
            }
        }

        match skill.envelope() {
            Ok(envelope) => ToolResult::success(envelope),
            Err(e) => ToolResult::error(format!("failed to load skill '{}': {}", skill.name, e)),
        }
    }
}
