use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PigoError, Result};
use crate::types::ApiType;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
/// Messages kept as the recent tail when history is compacted.
pub const DEFAULT_KEEP_RECENT: usize = 10;
/// Per-request completion token cap.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// A single hook declaration from the config file.
///
/// `event` names one of the four lifecycle points (`turn_start`, `turn_end`,
/// `tool_start`, `tool_end`); validation happens when the hook runner is
/// built, since the event vocabulary lives there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEntry {
    pub event: String,
    /// Shell command executed via `sh -c`.
    pub command: String,
    /// Blocking hooks veto the pending tool call on non-zero exit.
    #[serde(default)]
    pub blocking: bool,
}

/// Raw shape of `config.json`. Every field is optional so the file can
/// set any subset; env vars and compiled defaults fill the rest.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    api_type: Option<String>,
    embed_model: Option<String>,
    system_prompt: Option<String>,
    keep_recent: Option<usize>,
    max_tokens: Option<u32>,
    #[serde(default)]
    hooks: Vec<HookEntry>,
    skills_dir: Option<String>,
}

/// Fully resolved configuration. Per option the precedence is
/// config file > environment variable > compiled default.
#[derive(Debug, Clone)]
pub struct PigoConfig {
    pub api_key: String,
    /// Provider endpoint override; `None` means the provider's default.
    pub base_url: Option<String>,
    pub model: String,
    pub api_type: ApiType,
    pub embed_model: String,
    pub system_prompt: Option<String>,
    pub keep_recent: usize,
    pub max_tokens: u32,
    pub hooks: Vec<HookEntry>,
    pub skills_dir: PathBuf,
    /// The pigo home directory (`$PIGO_HOME` or `$HOME/.pigo`).
    pub home: PathBuf,
}

impl PigoConfig {
    /// Resolve the pigo home directory: `$PIGO_HOME` wins, else `$HOME/.pigo`.
    pub fn home_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("PIGO_HOME") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".pigo")
    }

    /// Path of the memory store JSONL file under this config's home.
    pub fn memory_path(&self) -> PathBuf {
        self.home.join("memory").join("memories.jsonl")
    }

    /// Load and resolve configuration.
    ///
    /// `config_path` overrides the default `<home>/config.json`. A missing
    /// file is fine (env + defaults apply); a file that fails to parse is
    /// fatal.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let home = Self::home_dir();
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home.join("config.json"));

        let raw: RawConfig = if path.is_file() {
            debug!(path = %path.display(), "loading config file");
            Figment::new()
                .merge(Json::file(&path))
                .extract()
                .map_err(|e| PigoError::ConfigMalformed(e.to_string()))?
        } else {
            RawConfig::default()
        };

        Self::resolve(raw, home, &|name| std::env::var(name).ok())
    }

    /// Apply env fallback and defaults to a parsed file. The env lookup is
    /// injected so tests don't have to mutate process-global state.
    fn resolve(
        raw: RawConfig,
        home: PathBuf,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

        let api_key = non_empty(raw.api_key)
            .or_else(|| non_empty(env("OPENAI_API_KEY")))
            .ok_or(PigoError::MissingApiKey)?;

        let base_url = non_empty(raw.base_url).or_else(|| non_empty(env("OPENAI_BASE_URL")));

        let model = non_empty(raw.model)
            .or_else(|| non_empty(env("PIGO_MODEL")))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let api_type = match non_empty(raw.api_type).or_else(|| non_empty(env("OPENAI_API_TYPE"))) {
            Some(s) => s.parse::<ApiType>().map_err(|_| PigoError::ConfigValue {
                field: "api_type",
                value: s,
            })?,
            None => ApiType::Chat,
        };

        let embed_model = non_empty(raw.embed_model)
            .or_else(|| non_empty(env("PIGO_EMBED_MODEL")))
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string());

        let skills_dir = non_empty(raw.skills_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("skills"));

        Ok(Self {
            api_key,
            base_url,
            model,
            api_type,
            embed_model,
            system_prompt: non_empty(raw.system_prompt),
            keep_recent: raw.keep_recent.unwrap_or(DEFAULT_KEEP_RECENT),
            max_tokens: raw.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            hooks: raw.hooks,
            skills_dir,
            home,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse_file(json: &str) -> RawConfig {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).expect("write");
        Figment::new()
            .merge(Json::file(&path))
            .extract()
            .expect("extract")
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let err = PigoConfig::resolve(RawConfig::default(), PathBuf::from("/tmp"), &no_env);
        assert!(matches!(err, Err(PigoError::MissingApiKey)));
    }

    #[test]
    fn defaults_apply_when_file_and_env_are_silent() {
        let raw = RawConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let cfg = PigoConfig::resolve(raw, PathBuf::from("/tmp/p"), &no_env).unwrap();
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.api_type, ApiType::Chat);
        assert_eq!(cfg.embed_model, DEFAULT_EMBED_MODEL);
        assert_eq!(cfg.keep_recent, DEFAULT_KEEP_RECENT);
        assert!(cfg.base_url.is_none());
        assert_eq!(cfg.skills_dir, PathBuf::from("/tmp/p/skills"));
    }

    #[test]
    fn env_fills_gaps_left_by_the_file() {
        let raw = RawConfig {
            api_key: Some("sk-file".into()),
            ..Default::default()
        };
        let env = |name: &str| match name {
            "PIGO_MODEL" => Some("gpt-4o-mini".to_string()),
            "OPENAI_API_TYPE" => Some("anthropic".to_string()),
            _ => None,
        };
        let cfg = PigoConfig::resolve(raw, PathBuf::from("/tmp"), &env).unwrap();
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.api_type, ApiType::Anthropic);
    }

    #[test]
    fn file_wins_over_env() {
        let raw = parse_file(
            r#"{"api_key": "sk-file", "model": "file-model", "api_type": "responses"}"#,
        );
        let env = |name: &str| match name {
            "OPENAI_API_KEY" => Some("sk-env".to_string()),
            "PIGO_MODEL" => Some("env-model".to_string()),
            _ => None,
        };
        let cfg = PigoConfig::resolve(raw, PathBuf::from("/tmp"), &env).unwrap();
        assert_eq!(cfg.api_key, "sk-file");
        assert_eq!(cfg.model, "file-model");
        assert_eq!(cfg.api_type, ApiType::Responses);
    }

    #[test]
    fn bad_api_type_is_a_config_error() {
        let raw = RawConfig {
            api_key: Some("sk".into()),
            api_type: Some("grpc".into()),
            ..Default::default()
        };
        let err = PigoConfig::resolve(raw, PathBuf::from("/tmp"), &no_env);
        assert!(matches!(
            err,
            Err(PigoError::ConfigValue { field: "api_type", .. })
        ));
    }

    #[test]
    fn hooks_parse_from_file() {
        let raw = parse_file(
            r#"{
                "api_key": "sk",
                "hooks": [
                    {"event": "tool_start", "command": "echo hi", "blocking": true},
                    {"event": "turn_end", "command": "notify-send done"}
                ]
            }"#,
        );
        let cfg = PigoConfig::resolve(raw, PathBuf::from("/tmp"), &no_env).unwrap();
        assert_eq!(cfg.hooks.len(), 2);
        assert!(cfg.hooks[0].blocking);
        assert!(!cfg.hooks[1].blocking);
    }

    #[test]
    fn malformed_file_fails_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        let err = PigoConfig::load(Some(path.as_path()));
        assert!(matches!(err, Err(PigoError::ConfigMalformed(_))));
    }
}
