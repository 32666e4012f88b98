use thiserror::Error;

#[derive(Debug, Error)]
pub enum PigoError {
    #[error("config file malformed: {0}")]
    ConfigMalformed(String),

    #[error("missing api_key: set `api_key` in config.json or the OPENAI_API_KEY env var")]
    MissingApiKey,

    #[error("invalid config value for `{field}`: {value}")]
    ConfigValue { field: &'static str, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PigoError>;
