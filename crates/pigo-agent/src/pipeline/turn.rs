//! The turn state machine: Idle → skill-match → step → (tools → step)* → Idle.
//!
//! One streamed provider call per step; text deltas reach the operator as
//! they arrive, tool calls run strictly in emission order afterwards. A
//! context-overflow error hands off to compaction and retries with a
//! shrinking tail.

use std::io::Write;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pigo_hooks::{HookDecision, HookEvent, HookPayload};

use crate::matcher;
use crate::provider::{
    is_context_overflow, send_stream_with_retry, ChatOutcome, ChatRequest, Message, ProviderError,
    ToolCall,
};
use crate::session::Session;
use crate::stream::StreamEvent;
use crate::tools::{self, ToolResult};

use super::compact::{self, CompactError};
use super::extract;
use super::{AgentDeps, AgentError};

const STREAM_CHANNEL_CAPACITY: usize = 64;
/// Steps per turn, to stop a runaway tool loop.
const MAX_STEPS: usize = 50;

/// Run one full turn for `input`, writing streamed text and tool summaries
/// to `out`. Returns to Idle on success, cancellation, or a recoverable
/// failure already surfaced in the transcript.
pub async fn run_turn(
    deps: &AgentDeps,
    session: &mut Session,
    input: &str,
    out: &mut (dyn Write + Send),
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    session.begin_turn();
    deps.hooks
        .fire(HookPayload::turn(HookEvent::TurnStart, session.turn_index))
        .await;

    inject_matched_skills(deps, session, input).await;
    session.push(Message::user(input));

    let mut keep_recent = deps.keep_recent;
    let mut result = Ok(());

    for step in 0.. {
        if step >= MAX_STEPS {
            warn!(max_steps = MAX_STEPS, "turn hit maximum steps");
            break;
        }

        let outcome = match stream_step(deps, session, out, cancel).await {
            StepResult::Complete(outcome) => outcome,
            StepResult::Cancelled { partial } => {
                preserve_partial(session, partial, out);
                break;
            }
            StepResult::Failed(err) if is_context_overflow(&err) => {
                match recover_from_overflow(deps, session, &mut keep_recent, err).await {
                    Ok(()) => continue,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            StepResult::Failed(err) => {
                result = Err(AgentError::Provider(err));
                break;
            }
        };

        session.usage.add(&outcome.usage);
        if !outcome.content.is_empty() {
            let _ = writeln!(out);
        }
        session.push(Message::assistant_with_calls(
            outcome.content.clone(),
            outcome.tool_calls.clone(),
        ));

        if outcome.tool_calls.is_empty() {
            debug!(
                finish_reason = %outcome.finish_reason,
                steps = step + 1,
                "turn complete"
            );
            break;
        }

        run_tool_calls(deps, session, &outcome.tool_calls, out, cancel).await;
        if cancel.is_cancelled() {
            break;
        }
    }

    deps.hooks
        .fire(HookPayload::turn(HookEvent::TurnEnd, session.turn_index))
        .await;
    result
}

/// Pre-flight skill matching: inject the bodies of matched skills as system
/// messages before the first provider call of the turn.
async fn inject_matched_skills(deps: &AgentDeps, session: &mut Session, input: &str) {
    if session.visible_skills.is_empty() {
        return;
    }

    let visible = session.visible_skill_refs();
    let matched = matcher::match_skills(&*deps.provider, &session.model, input, &visible).await;
    if matched.is_empty() {
        return;
    }

    for name in matched {
        let already = session
            .injected_skills
            .lock()
            .expect("injected skill set poisoned")
            .contains(&name);
        if already {
            continue;
        }
        let Some(skill) = session.find_skill(&name) else {
            continue;
        };
        match skill.envelope() {
            Ok(envelope) => {
                info!(skill = %name, "pre-flight skill injected");
                session.push(Message::system(envelope));
                session
                    .injected_skills
                    .lock()
                    .expect("injected skill set poisoned")
                    .insert(name);
            }
            Err(e) => warn!(skill = %name, err = %e, "failed to load matched skill"),
        }
    }
}

/// Execute one assistant message's tool calls sequentially, in the order the
/// model emitted them. Each result is appended before the next call starts,
/// so transcript numbering always matches emission order.
async fn run_tool_calls(
    deps: &AgentDeps,
    session: &mut Session,
    calls: &[ToolCall],
    out: &mut (dyn Write + Send),
    cancel: &CancellationToken,
) {
    session.pending_tool_calls = calls.to_vec();

    for call in calls {
        let start = HookPayload::tool(
            HookEvent::ToolStart,
            session.turn_index,
            &call.name,
            &call.arguments,
        );

        let result = match deps.hooks.fire(start).await {
            HookDecision::Block { reason } => {
                warn!(tool = %call.name, reason = %reason, "tool call blocked by hook");
                ToolResult::error(format!("tool call blocked by hook: {reason}"))
            }
            HookDecision::Allow if cancel.is_cancelled() => ToolResult::error("[cancelled]"),
            HookDecision::Allow => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ToolResult::error("[cancelled]"),
                    result = tools::dispatch(&deps.tools, call) => result,
                }
            }
        };

        if let Some(display) = &result.for_user {
            let _ = writeln!(out, "{display}");
            let _ = out.flush();
        }
        session.push(Message::tool(&call.id, result.for_llm));
        session.pending_tool_calls.retain(|c| c.id != call.id);

        deps.hooks
            .fire(HookPayload::tool(
                HookEvent::ToolEnd,
                session.turn_index,
                &call.name,
                &call.arguments,
            ))
            .await;
    }
}

/// Cancellation mid-stream: keep whatever arrived. The assistant message
/// carries the partial text and only the tool calls that completed; each of
/// those is closed with a cancelled result so the pairing invariant holds.
fn preserve_partial(session: &mut Session, partial: ChatOutcome, out: &mut (dyn Write + Send)) {
    info!("turn cancelled by operator");
    let _ = writeln!(out);
    if partial.content.is_empty() && partial.tool_calls.is_empty() {
        return;
    }
    session.usage.add(&partial.usage);
    session.push(Message::assistant_with_calls(
        partial.content,
        partial.tool_calls.clone(),
    ));
    for call in &partial.tool_calls {
        session.push(Message::tool(&call.id, "[cancelled]"));
    }
}

/// Compact history and run extraction, shrinking the tail for the next
/// attempt. The original error surfaces when there is nothing to compact.
async fn recover_from_overflow(
    deps: &AgentDeps,
    session: &mut Session,
    keep_recent: &mut usize,
    original: ProviderError,
) -> Result<(), AgentError> {
    if *keep_recent == 0 {
        return Err(AgentError::IrrecoverableOverflow);
    }

    info!(keep_recent = *keep_recent, "context overflow, compacting");

    let compaction = match compact::compact(
        &*deps.provider,
        &session.model,
        &mut session.messages,
        *keep_recent,
    )
    .await
    {
        Ok(c) => c,
        Err(CompactError::NothingToCompact) => return Err(AgentError::Provider(original)),
        Err(CompactError::Provider(e)) => return Err(AgentError::Provider(e)),
    };

    // Extraction runs synchronously before the retry: the synopsis and the
    // memory store update together from the operator's point of view.
    if let Some(store) = &deps.store {
        extract::extract_memories(
            &*deps.provider,
            &session.model,
            &*deps.embedder,
            store,
            &compaction.discarded,
        )
        .await;
    }

    *keep_recent /= 2;
    Ok(())
}

enum StepResult {
    Complete(ChatOutcome),
    Cancelled { partial: ChatOutcome },
    Failed(ProviderError),
}

/// One streamed provider call. Text deltas go straight to `out` (flushed per
/// delta); tool calls and usage accumulate into the returned outcome.
async fn stream_step(
    deps: &AgentDeps,
    session: &Session,
    out: &mut (dyn Write + Send),
    cancel: &CancellationToken,
) -> StepResult {
    let req = ChatRequest {
        model: session.model.clone(),
        messages: session.messages.clone(),
        tools: tools::to_definitions(&deps.tools),
        max_tokens: deps.max_tokens,
        json_mode: false,
    };

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let provider = std::sync::Arc::clone(&deps.provider);
    let task = tokio::spawn(async move { send_stream_with_retry(&*provider, &req, tx).await });

    let mut outcome = ChatOutcome::default();
    let mut stream_error: Option<ProviderError> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                return StepResult::Cancelled { partial: outcome };
            }
            event = rx.recv() => match event {
                Some(StreamEvent::TextDelta { text }) => {
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                    outcome.content.push_str(&text);
                }
                Some(StreamEvent::ToolUse { id, name, arguments }) => {
                    outcome.tool_calls.push(ToolCall { id, name, arguments });
                }
                Some(StreamEvent::Done { finish_reason, usage }) => {
                    outcome.finish_reason = finish_reason;
                    outcome.usage = usage;
                }
                Some(StreamEvent::Error { message }) => {
                    stream_error = Some(ProviderError::Unavailable(message));
                }
                None => break, // sender dropped: the provider call returned
            }
        }
    }

    match task.await {
        Ok(Ok(())) => match stream_error {
            Some(err) => StepResult::Failed(err),
            None => StepResult::Complete(outcome),
        },
        Ok(Err(err)) => StepResult::Failed(err),
        Err(join_err) => StepResult::Failed(ProviderError::Unavailable(join_err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedder;
    use crate::provider::{ChatProvider, Role};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use pigo_core::{ApiType, TokenUsage};
    use pigo_hooks::HookRunner;
    use pigo_memory::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    enum ScriptStep {
        Reply(ChatOutcome),
        Fail(ProviderError),
    }

    /// Replays a script of responses; panics on unexpected extra calls so
    /// tests notice stray provider traffic. `send_stream` goes through the
    /// trait's default fallback, exercising the event plumbing.
    struct Script {
        steps: Mutex<VecDeque<ScriptStep>>,
    }

    impl Script {
        fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for Script {
        fn name(&self) -> &str {
            "script"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
            match self.steps.lock().unwrap().pop_front() {
                Some(ScriptStep::Reply(outcome)) => Ok(outcome),
                Some(ScriptStep::Fail(err)) => Err(err),
                None => panic!("unexpected extra provider call"),
            }
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Unavailable("no embeddings in tests".into()))
        }
    }

    fn reply(content: &str) -> ScriptStep {
        ScriptStep::Reply(ChatOutcome {
            content: content.into(),
            finish_reason: "stop".into(),
            usage: TokenUsage::new(10, 5),
            ..Default::default()
        })
    }

    fn tool_reply(calls: Vec<ToolCall>) -> ScriptStep {
        ScriptStep::Reply(ChatOutcome {
            content: String::new(),
            tool_calls: calls,
            finish_reason: "tool_calls".into(),
            usage: TokenUsage::new(10, 5),
        })
    }

    fn overflow() -> ScriptStep {
        ScriptStep::Fail(ProviderError::Api {
            status: 400,
            message: "maximum context length exceeded, too many tokens".into(),
        })
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: "{}".into(),
        }
    }

    /// Test tool that records invocations and returns a fixed result.
    struct FakeTool {
        tool_name: &'static str,
        result: ToolResult,
        invocations: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
        delay: Option<std::time::Duration>,
        cancel_on_run: Option<CancellationToken>,
    }

    impl FakeTool {
        fn named(tool_name: &'static str, result: ToolResult) -> Self {
            Self {
                tool_name,
                result,
                invocations: Arc::new(AtomicUsize::new(0)),
                order: Arc::new(Mutex::new(Vec::new())),
                delay: None,
                cancel_on_run: None,
            }
        }
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.tool_name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.tool_name.to_string());
            if let Some(token) = &self.cancel_on_run {
                token.cancel();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }
    }

    fn deps_with(
        provider: Arc<dyn ChatProvider>,
        tools: Vec<Box<dyn Tool>>,
        store: Option<Arc<MemoryStore>>,
        hooks: HookRunner,
    ) -> AgentDeps {
        AgentDeps {
            provider,
            embedder: Arc::new(NullEmbedder),
            store,
            hooks,
            tools,
            max_tokens: 1024,
            keep_recent: 10,
        }
    }

    fn no_hooks() -> HookRunner {
        HookRunner::new(Vec::new())
    }

    fn session() -> Session {
        Session::new("test-model", ApiType::Chat, "be terse", Arc::new(Vec::new()))
    }

    async fn run(deps: &AgentDeps, session: &mut Session, input: &str) -> (Vec<u8>, Result<(), AgentError>) {
        let mut out = Vec::new();
        let cancel = CancellationToken::new();
        let result = run_turn(deps, session, input, &mut out, &cancel).await;
        (out, result)
    }

    // happy-path single turn
    #[tokio::test]
    async fn happy_path_single_turn() {
        let provider = Script::new(vec![reply("hello")]);
        let deps = deps_with(provider, vec![], None, no_hooks());
        let mut session = session();

        let (out, result) = run(&deps, &mut session, "hi").await;
        assert!(result.is_ok());
        assert!(String::from_utf8(out).unwrap().contains("hello"));

        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(session.messages[2].content, "hello");
        assert_eq!(session.usage.total, 15);
    }

    // one round of tool use, transcript order
    #[tokio::test]
    async fn one_round_of_tool_use() {
        let provider = Script::new(vec![
            tool_reply(vec![call("c1", "read_file")]),
            reply("done"),
        ]);
        let tool = FakeTool::named("read_file", ToolResult::success("contents=42"));
        let deps = deps_with(provider, vec![Box::new(tool)], None, no_hooks());
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "read /tmp/x").await;
        assert!(result.is_ok());

        let tail = &session.messages[1..];
        assert_eq!(tail[0].role, Role::User);
        assert_eq!(tail[1].role, Role::Assistant);
        assert_eq!(tail[1].tool_calls[0].id, "c1");
        assert_eq!(tail[2].role, Role::Tool);
        assert_eq!(tail[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tail[2].content, "contents=42");
        assert_eq!(tail[3].role, Role::Assistant);
        assert_eq!(tail[3].content, "done");
        assert_eq!(session.usage.total, 30, "usage summed across both steps");
    }

    // tool errors are conversational
    #[tokio::test]
    async fn tool_error_recovery() {
        let provider = Script::new(vec![
            tool_reply(vec![call("c1", "write_file")]),
            reply("sorry, cannot write"),
        ]);
        let tool = FakeTool::named("write_file", ToolResult::error("permission denied"));
        let deps = deps_with(provider, vec![Box::new(tool)], None, no_hooks());
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "write it").await;
        assert!(result.is_ok(), "tool errors must not abort the session");
        let tool_msg = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.content, "permission denied");
        assert_eq!(session.messages.last().unwrap().content, "sorry, cannot write");
    }

    // Ordering guarantee: emission order, result appended before next call
    #[tokio::test]
    async fn tool_calls_run_sequentially_in_emission_order() {
        let provider = Script::new(vec![
            tool_reply(vec![call("c1", "first"), call("c2", "second")]),
            reply("done"),
        ]);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut t1 = FakeTool::named("first", ToolResult::success("r1"));
        t1.order = Arc::clone(&order);
        let mut t2 = FakeTool::named("second", ToolResult::success("r2"));
        t2.order = Arc::clone(&order);
        let deps = deps_with(provider, vec![Box::new(t1), Box::new(t2)], None, no_hooks());
        let mut session = session();

        run(&deps, &mut session, "go").await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        let ids: Vec<Option<&str>> = session
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec![Some("c1"), Some("c2")]);
    }

    // Unknown tool names feed a correctable error back to the model
    #[tokio::test]
    async fn hallucinated_tool_yields_error_result() {
        let provider = Script::new(vec![
            tool_reply(vec![call("c1", "made_up_tool")]),
            reply("my mistake"),
        ]);
        let deps = deps_with(provider, vec![], None, no_hooks());
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "go").await;
        assert!(result.is_ok());
        let tool_msg = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("unknown tool"));
    }

    // compaction on overflow, then successful retry
    #[tokio::test]
    async fn overflow_triggers_compaction_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("memories.jsonl");
        let store = Arc::new(MemoryStore::new(&store_path));

        let provider = Script::new(vec![
            overflow(),
            reply("the earlier conversation covered setup"), // summariser
            ScriptStep::Reply(ChatOutcome {
                // extractor
                content: r#"[{"category":"events","abstract":"Set up the project","overview":"","content":""}]"#.into(),
                finish_reason: "stop".into(),
                ..Default::default()
            }),
            reply("recovered"), // retried step
        ]);
        let deps = deps_with(provider, vec![], Some(Arc::clone(&store)), no_hooks());

        let mut session = session();
        for i in 0..28 {
            if i % 2 == 0 {
                session.push(Message::user(format!("q{i}")));
            } else {
                session.push(Message::assistant(format!("a{i}")));
            }
        }

        let (_, result) = run(&deps, &mut session, "one more thing").await;
        assert!(result.is_ok());

        // system prefix intact, synopsis in place
        assert_eq!(session.messages[0].role, Role::System);
        assert!(session.messages[1].content.starts_with("[Conversation summary:"));

        // extraction persisted to the JSONL file before the retry finished
        assert!(store_path.is_file());
        let reloaded = MemoryStore::load(&store_path).unwrap();
        assert_eq!(reloaded.len(), 1);

        assert_eq!(session.messages.last().unwrap().content, "recovered");
    }

    // Repeated overflow halves the tail until it fails for good
    #[tokio::test]
    async fn irrecoverable_overflow_after_halving_to_zero() {
        let provider = Script::new(vec![
            overflow(),
            reply("s1"), // compact with keep=2
            overflow(),
            reply("s2"), // compact with keep=1
            overflow(),
            reply("s3"), // compact with keep=0 → never reached; keep hits 0 first
        ]);
        let mut deps = deps_with(provider, vec![], None, no_hooks());
        deps.keep_recent = 2;

        let mut session = session();
        for i in 0..20 {
            session.push(Message::user(format!("filler {i}")));
        }

        let (_, result) = run(&deps, &mut session, "go").await;
        assert!(matches!(result, Err(AgentError::IrrecoverableOverflow)));
    }

    // Overflow with nothing left to discard surfaces the original error
    #[tokio::test]
    async fn overflow_with_empty_discard_surfaces_original_error() {
        let provider = Script::new(vec![overflow()]);
        let deps = deps_with(provider, vec![], None, no_hooks());
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "hi").await;
        match result {
            Err(AgentError::Provider(e)) => assert!(is_context_overflow(&e)),
            other => panic!("expected the original overflow error, got {other:?}"),
        }
    }

    // Blocking tool_start hook cancels the call with an error tool message
    #[tokio::test]
    async fn blocking_hook_vetoes_the_tool_call() {
        let provider = Script::new(vec![
            tool_reply(vec![call("c1", "write_file")]),
            reply("understood"),
        ]);
        let tool = FakeTool::named("write_file", ToolResult::success("should not run"));
        let invocations = Arc::clone(&tool.invocations);

        let hooks = HookRunner::from_config(&[pigo_core::config::HookEntry {
            event: "tool_start".into(),
            command: "exit 7".into(),
            blocking: true,
        }])
        .expect("valid hook config");

        let deps = deps_with(provider, vec![Box::new(tool)], None, hooks);
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "write").await;
        assert!(result.is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 0, "tool must not run");
        let tool_msg = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("blocked by hook"));
    }

    // Cancellation during tool execution: history kept, pairs closed
    #[tokio::test]
    async fn cancellation_mid_tools_preserves_history() {
        let provider = Script::new(vec![tool_reply(vec![
            call("c1", "slow"),
            call("c2", "never"),
        ])]);

        let cancel = CancellationToken::new();
        let mut slow = FakeTool::named("slow", ToolResult::success("finished"));
        slow.cancel_on_run = Some(cancel.clone());
        slow.delay = Some(std::time::Duration::from_secs(60));
        let never = FakeTool::named("never", ToolResult::success("nope"));
        let never_count = Arc::clone(&never.invocations);

        let deps = deps_with(provider, vec![Box::new(slow), Box::new(never)], None, no_hooks());
        let mut session = session();
        let mut out = Vec::new();

        let result = run_turn(&deps, &mut session, "go", &mut out, &cancel).await;
        assert!(result.is_ok(), "cancellation is not a failure");
        assert_eq!(never_count.load(Ordering::SeqCst), 0);

        // Both calls have tool replies so the transcript stays paired.
        let ids: Vec<Option<&str>> = session
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec![Some("c1"), Some("c2")]);
        for msg in session.messages.iter().filter(|m| m.role == Role::Tool) {
            assert_eq!(msg.content, "[cancelled]");
        }
    }

    // Auth failure ends the turn with the transcript preserved
    #[tokio::test]
    async fn provider_auth_failure_surfaces() {
        let provider = Script::new(vec![ScriptStep::Fail(ProviderError::Auth {
            status: 401,
            message: "bad key".into(),
        })]);
        let deps = deps_with(provider, vec![], None, no_hooks());
        let mut session = session();

        let (_, result) = run(&deps, &mut session, "hi").await;
        assert!(matches!(
            result,
            Err(AgentError::Provider(ProviderError::Auth { .. }))
        ));
        // The user message stays in history.
        assert_eq!(session.messages.last().unwrap().role, Role::User);
    }
}
