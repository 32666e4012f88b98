use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pigo_core::{PigoConfig, PigoError, TokenUsage};
use pigo_hooks::HookRunner;
use pigo_memory::MemoryStore;

use crate::embed::{Embedder, EmbeddingClient};
use crate::pipeline::{turn, AgentDeps, AgentError};
use crate::prompt::build_system_prompt;
use crate::provider::build_provider;
use crate::session::Session;
use crate::skills::load_skills;
use crate::tools::build::build_tools;

/// The assembled agent: provider, tools, hooks, memory, and one session.
pub struct Agent {
    deps: AgentDeps,
    session: Session,
}

impl Agent {
    /// Wire up an agent from resolved configuration.
    ///
    /// A memory store that fails to load is reported once and disabled for
    /// the session; everything else here is fatal.
    pub fn new(config: &PigoConfig) -> Result<Self, PigoError> {
        let provider = build_provider(config);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.embed_model.clone(),
        ));

        let store = match MemoryStore::load(config.memory_path()) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(err = %e, "memory store unavailable; continuing without persistence");
                None
            }
        };

        let hooks = HookRunner::from_config(&config.hooks).map_err(|e| PigoError::ConfigValue {
            field: "hooks",
            value: e.to_string(),
        })?;

        let skills = Arc::new(load_skills(&config.skills_dir));
        let system_prompt = build_system_prompt(config.system_prompt.as_deref(), store.as_deref());
        let session = Session::new(
            &config.model,
            config.api_type,
            system_prompt,
            Arc::clone(&skills),
        );

        let tools = build_tools(
            store.clone(),
            Arc::clone(&embedder),
            skills,
            Arc::clone(&session.injected_skills),
        );

        info!(
            model = %config.model,
            api_type = %config.api_type,
            skills = session.skills.len(),
            tools = tools.len(),
            memory = store.is_some(),
            "agent ready"
        );

        Ok(Self {
            deps: AgentDeps {
                provider,
                embedder,
                store,
                hooks,
                tools,
                max_tokens: config.max_tokens,
                keep_recent: config.keep_recent,
            },
            session,
        })
    }

    /// Run one turn of conversation for the operator's input.
    pub async fn run_turn(
        &mut self,
        input: &str,
        out: &mut (dyn Write + Send),
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        turn::run_turn(&self.deps, &mut self.session, input, out, cancel).await
    }

    pub fn model(&self) -> &str {
        &self.session.model
    }

    /// Swap the chat model; returns the previous id.
    pub fn set_model(&mut self, model: impl Into<String>) -> String {
        std::mem::replace(&mut self.session.model, model.into())
    }

    pub fn usage(&self) -> TokenUsage {
        self.session.usage
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
