use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook event: {0}")]
    UnknownEvent(String),

    #[error("hook spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;
