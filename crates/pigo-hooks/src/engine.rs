use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use pigo_core::config::HookEntry;

use crate::error::{HookError, Result};
use crate::types::{HookCommand, HookDecision, HookEvent, HookPayload};

/// Dispatches lifecycle events to the configured external commands.
///
/// Non-blocking hooks are spawned and forgotten; their failures are logged
/// and never reach the caller. Blocking hooks are awaited in registration
/// order; the first non-zero exit cancels the pending operation.
pub struct HookRunner {
    hooks: Vec<HookCommand>,
}

impl HookRunner {
    pub fn new(hooks: Vec<HookCommand>) -> Self {
        Self { hooks }
    }

    /// Build a runner from config entries, validating event names.
    pub fn from_config(entries: &[HookEntry]) -> Result<Self> {
        let mut hooks = Vec::with_capacity(entries.len());
        for entry in entries {
            let event: HookEvent = entry
                .event
                .parse()
                .map_err(|_| HookError::UnknownEvent(entry.event.clone()))?;
            hooks.push(HookCommand {
                event,
                command: entry.command.clone(),
                blocking: entry.blocking,
            });
        }
        Ok(Self { hooks })
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fire all hooks registered for the payload's event.
    ///
    /// Blocking hooks run first, sequentially; a non-zero exit short-circuits
    /// with `Block`. Observers are then spawned fire-and-forget.
    pub async fn fire(&self, payload: HookPayload) -> HookDecision {
        for hook in self.hooks.iter().filter(|h| h.event == payload.event && h.blocking) {
            match run_hook(hook, &payload).await {
                Ok(status) if status.success() => {
                    debug!(event = %payload.event, command = %hook.command, "blocking hook passed");
                }
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    warn!(event = %payload.event, command = %hook.command, code, "blocking hook vetoed");
                    return HookDecision::Block {
                        reason: format!("hook `{}` exited with status {}", hook.command, code),
                    };
                }
                // A blocking hook that cannot even start still blocks: the
                // operator asked for a gate, not best-effort.
                Err(e) => {
                    warn!(event = %payload.event, command = %hook.command, error = %e, "blocking hook failed to run");
                    return HookDecision::Block {
                        reason: format!("hook `{}` failed to run: {}", hook.command, e),
                    };
                }
            }
        }

        for hook in self.hooks.iter().filter(|h| h.event == payload.event && !h.blocking) {
            let hook = hook.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                match run_hook(&hook, &payload).await {
                    Ok(status) if !status.success() => {
                        warn!(
                            event = %payload.event,
                            command = %hook.command,
                            code = status.code().unwrap_or(-1),
                            "hook exited non-zero"
                        );
                    }
                    Ok(_) => {
                        debug!(event = %payload.event, command = %hook.command, "hook completed");
                    }
                    Err(e) => {
                        warn!(event = %payload.event, command = %hook.command, error = %e, "hook failed to run");
                    }
                }
            });
        }

        HookDecision::Allow
    }
}

/// Spawn one hook command with the event context in env vars and the JSON
/// payload on stdin, and wait for it to exit.
async fn run_hook(hook: &HookCommand, payload: &HookPayload) -> std::io::Result<std::process::ExitStatus> {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&hook.command)
        .env("PIGO_EVENT", payload.event.to_string())
        .env("PIGO_TOOL_NAME", payload.tool_name.as_deref().unwrap_or(""))
        .env(
            "PIGO_TOOL_ARGS_JSON",
            payload.tool_args_json.as_deref().unwrap_or(""),
        )
        .env("PIGO_TURN_INDEX", payload.turn_index.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // The hook may exit without reading stdin; a write error is fine.
        let _ = stdin.write_all(json.as_bytes()).await;
    }

    child.wait().await
}
