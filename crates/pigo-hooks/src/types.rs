use serde::{Deserialize, Serialize};

/// The four lifecycle points hooks can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    TurnStart,
    TurnEnd,
    /// Fired before a tool call runs; blocking hooks can cancel it here.
    ToolStart,
    ToolEnd,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TurnStart => write!(f, "turn_start"),
            Self::TurnEnd => write!(f, "turn_end"),
            Self::ToolStart => write!(f, "tool_start"),
            Self::ToolEnd => write!(f, "tool_end"),
        }
    }
}

impl std::str::FromStr for HookEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "turn_start" => Ok(Self::TurnStart),
            "turn_end" => Ok(Self::TurnEnd),
            "tool_start" => Ok(Self::ToolStart),
            "tool_end" => Ok(Self::ToolEnd),
            other => Err(format!("unknown hook event: {other}")),
        }
    }
}

/// Event context delivered to the subprocess: mirrored into env vars and
/// written as JSON on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    pub event: HookEvent,
    /// Set for tool_start / tool_end.
    pub tool_name: Option<String>,
    /// Raw JSON argument string of the pending/finished tool call.
    pub tool_args_json: Option<String>,
    pub turn_index: u32,
    /// Unix timestamp (ms) when the event was created.
    pub timestamp: u64,
}

impl HookPayload {
    pub fn turn(event: HookEvent, turn_index: u32) -> Self {
        Self {
            event,
            tool_name: None,
            tool_args_json: None,
            turn_index,
            timestamp: now_ms(),
        }
    }

    pub fn tool(event: HookEvent, turn_index: u32, name: &str, args_json: &str) -> Self {
        Self {
            event,
            tool_name: Some(name.to_string()),
            tool_args_json: Some(args_json.to_string()),
            turn_index,
            timestamp: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the runner tells the caller after firing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Proceed with the operation.
    Allow,
    /// A blocking hook exited non-zero; the pending operation is cancelled.
    Block { reason: String },
}

/// A registered hook: which event it watches and the command to run.
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub event: HookEvent,
    /// Executed via `sh -c`.
    pub command: String,
    pub blocking: bool,
}
