//! Lifecycle hooks: external commands fired at named points of a turn.
//!
//! Hooks are declared in the config file and invoked as subprocesses with
//! the event context in environment variables plus JSON on stdin. Observers
//! are fire-and-forget; blocking hooks can veto the pending tool call.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::HookRunner;
pub use error::HookError;
pub use types::{HookDecision, HookEvent, HookPayload};
