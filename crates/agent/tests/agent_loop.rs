//! End-to-end runs through the agent loop with a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbot_agent::{AgentLoop, AgentSettings, RunAbort, RunState, SessionRouter};
use nimbot_bus::MessageBus;
use nimbot_core::context::StaticContext;
use nimbot_core::error::{ProviderError, SessionError, ToolError};
use nimbot_core::event::{InboundMessage, SessionKey, SourceKind};
use nimbot_core::message::{Message, Role};
use nimbot_core::provider::{ChatRequest, ChatResponse, Provider};
use nimbot_core::session::SessionStore;
use nimbot_core::tool::{Tool, ToolCall, ToolContext, ToolRegistry};
use nimbot_session::InMemorySessionStore;
use nimbot_tools::{Workspace, WriteFileTool};
use serde_json::json;
use tokio_util::sync::CancellationToken;

type Script = dyn Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError> + Send + Sync;

/// A model whose every answer comes from a closure over the request and
/// the 1-based call number.
struct ScriptedProvider {
    script: Box<Script>,
    delay: Box<dyn Fn(&ChatRequest) -> Option<Duration> + Send + Sync>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(
        script: impl Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(script, |_| None)
    }

    /// Like `new`, but each call first sleeps for whatever `delay` returns.
    fn with_delay(
        script: impl Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError> + Send + Sync + 'static,
        delay: impl Fn(&ChatRequest) -> Option<Duration> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay: Box::new(delay),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = (self.delay)(&request) {
            tokio::time::sleep(delay).await;
        }
        (self.script)(&request, n)
    }
}

/// Sleeps, then echoes its `value` argument.
struct SlowEcho;

#[async_trait]
impl Tool for SlowEcho {
    fn name(&self) -> &str {
        "slow_echo"
    }

    fn description(&self) -> &str {
        "Echo a value after a delay"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "value": { "type": "string" },
                "delay_ms": { "type": "integer", "minimum": 0 }
            },
            "required": ["value"]
        })
    }

    async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let delay = args["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(args["value"].as_str().unwrap_or_default().to_string())
    }
}

/// An in-memory store whose `fail_on`-th append (1-based) fails once.
struct FlakyStore {
    inner: InMemorySessionStore,
    appends: AtomicUsize,
    fail_on: usize,
}

impl FlakyStore {
    fn new(fail_on: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemorySessionStore::new(),
            appends: AtomicUsize::new(0),
            fail_on,
        })
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn load(&self, key: &SessionKey) -> Result<Vec<Message>, SessionError> {
        self.inner.load(key).await
    }

    async fn append(&self, key: &SessionKey, message: Message) -> Result<(), SessionError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(SessionError::Storage("disk full".into()));
        }
        self.inner.append(key, message).await
    }

    async fn list_keys(&self) -> Result<Vec<SessionKey>, SessionError> {
        self.inner.list_keys().await
    }

    async fn clear(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.inner.clear(key).await
    }
}

fn last_is_tool_result(request: &ChatRequest) -> bool {
    request.messages.last().is_some_and(|m| m.role == Role::Tool)
}

fn first_user(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

fn agent(
    provider: Arc<ScriptedProvider>,
    sessions: Arc<InMemorySessionStore>,
    tools: ToolRegistry,
    bus: &MessageBus,
) -> AgentLoop {
    AgentLoop::new(
        provider,
        sessions,
        Arc::new(StaticContext::new("You are a test assistant.")),
        tools,
        bus.clone(),
    )
}

fn cli_message(text: &str) -> InboundMessage {
    InboundMessage::user(SessionKey::new("cli", "direct"), "user", text)
}

#[tokio::test]
async fn tool_call_then_answer() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WriteFileTool::new(Workspace::new(dir.path(), true))));

    let provider = ScriptedProvider::new(|req, _| {
        if last_is_tool_result(req) {
            Ok(ChatResponse::text("2+2 is 4. I saved it to result.txt."))
        } else {
            Ok(ChatResponse::tools(vec![ToolCall::new(
                "c1",
                "write_file",
                json!({ "path": "result.txt", "content": "4" }),
            )]))
        }
    });
    let sessions = Arc::new(InMemorySessionStore::new());
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = agent(provider.clone(), sessions.clone(), tools, &bus);

    let msg = cli_message("What is 2+2? Save the answer to result.txt");
    let report = agent.process(msg.clone(), CancellationToken::new()).await;

    assert!(report.is_done());
    assert_eq!(report.iterations, 2);
    assert_eq!(
        report.states,
        vec![
            RunState::Start,
            RunState::BuildContext,
            RunState::CallModel,
            RunState::ExecuteTools,
            RunState::CallModel,
            RunState::Respond,
            RunState::Done,
        ]
    );
    assert_eq!(std::fs::read_to_string(dir.path().join("result.txt")).unwrap(), "4");

    let reply = outbound.recv().await.unwrap();
    assert_eq!(reply.in_reply_to, msg.id);
    assert!(reply.content.contains('4'));

    let history = sessions.load(&msg.session_key).await.unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(history[2].metadata["success"], json!(true));
}

#[tokio::test]
async fn system_prompt_leads_and_tools_are_offered() {
    let provider = ScriptedProvider::new(|req, _| {
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].content, "You are a test assistant.");
        assert_eq!(req.messages.last().unwrap().content, "hello");
        assert!(req.tools.iter().any(|t| t.name == "spawn"));
        Ok(ChatResponse::text("hi"))
    });
    let bus = MessageBus::new(16);
    let agent = agent(provider, Arc::new(InMemorySessionStore::new()), ToolRegistry::new(), &bus);

    let report = agent.process(cli_message("hello"), CancellationToken::new()).await;
    assert!(report.is_done());
    assert_eq!(report.response.as_deref(), Some("hi"));
}

#[tokio::test]
async fn iteration_ceiling_aborts_with_one_notice() {
    let provider = ScriptedProvider::new(|_, n| {
        Ok(ChatResponse::tools(vec![ToolCall::new(
            format!("c{n}"),
            "slow_echo",
            json!({ "value": "again" }),
        )]))
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = agent(provider.clone(), Arc::new(InMemorySessionStore::new()), tools, &bus)
        .with_settings(AgentSettings {
            max_iterations: 3,
            ..AgentSettings::default()
        });

    let report = agent.process(cli_message("loop forever"), CancellationToken::new()).await;

    assert_eq!(report.final_state(), RunState::Aborted);
    assert!(matches!(report.abort, Some(RunAbort::IterationLimitExceeded { limit: 3 })));
    assert_eq!(report.iterations, 3);
    assert_eq!(provider.calls(), 3);

    let notice = outbound.recv().await.unwrap();
    assert!(notice.content.contains("3 steps"));
    assert!(outbound.try_recv().is_none());
}

#[tokio::test]
async fn provider_failure_aborts_with_apology() {
    let provider = ScriptedProvider::new(|_, _| {
        Err(ProviderError::ApiError {
            status_code: 500,
            message: "upstream down".into(),
        })
    });
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = agent(provider, Arc::new(InMemorySessionStore::new()), ToolRegistry::new(), &bus);

    let report = agent.process(cli_message("hi"), CancellationToken::new()).await;
    assert!(matches!(report.abort, Some(RunAbort::Provider(_))));
    assert!(outbound.recv().await.unwrap().content.starts_with("Sorry"));
}

#[tokio::test]
async fn invalid_arguments_reach_the_model_as_results() {
    let provider = ScriptedProvider::new(|req, _| {
        if last_is_tool_result(req) {
            let result = req.messages.last().unwrap();
            assert!(result.content.contains("invalid arguments"));
            Ok(ChatResponse::text("I called the tool wrong."))
        } else {
            Ok(ChatResponse::tools(vec![ToolCall::new("c1", "slow_echo", json!({ "delay_ms": 1 }))]))
        }
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let sessions = Arc::new(InMemorySessionStore::new());
    let bus = MessageBus::new(16);
    let agent = agent(provider, sessions.clone(), tools, &bus);

    let msg = cli_message("echo nothing");
    let report = agent.process(msg.clone(), CancellationToken::new()).await;
    assert!(report.is_done());

    let history = sessions.load(&msg.session_key).await.unwrap();
    assert_eq!(history[2].metadata["error"], json!("validation"));
}

#[tokio::test]
async fn concurrent_tool_results_keep_call_order() {
    let provider = ScriptedProvider::new(|req, _| {
        if last_is_tool_result(req) {
            let results: Vec<&Message> = req.messages.iter().filter(|m| m.role == Role::Tool).collect();
            let ids: Vec<_> = results.iter().map(|m| m.tool_call_id.clone().unwrap()).collect();
            assert_eq!(ids, vec!["slow", "fast"]);
            assert_eq!(results[0].content, "first");
            Ok(ChatResponse::text("both done"))
        } else {
            Ok(ChatResponse::tools(vec![
                ToolCall::new("slow", "slow_echo", json!({ "value": "first", "delay_ms": 200 })),
                ToolCall::new("fast", "slow_echo", json!({ "value": "second" })),
            ]))
        }
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let bus = MessageBus::new(16);
    let agent = agent(provider, Arc::new(InMemorySessionStore::new()), tools, &bus);

    let started = tokio::time::Instant::now();
    let report = agent.process(cli_message("run both"), CancellationToken::new()).await;
    assert!(report.is_done());
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn cancellation_marks_running_tools_cancelled() {
    let provider = ScriptedProvider::new(|_, _| {
        Ok(ChatResponse::tools(vec![ToolCall::new(
            "c1",
            "slow_echo",
            json!({ "value": "never", "delay_ms": 10_000 }),
        )]))
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let sessions = Arc::new(InMemorySessionStore::new());
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = agent(provider, sessions.clone(), tools, &bus);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let msg = cli_message("take forever");
    let report = agent.process(msg.clone(), cancel).await;
    assert!(matches!(report.abort, Some(RunAbort::Cancelled)));
    assert!(outbound.try_recv().is_none());

    let history = sessions.load(&msg.session_key).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.metadata["error"], json!("cancelled"));
    assert!(!agent.locks().is_locked(&msg.session_key));
}

#[tokio::test]
async fn router_serializes_a_session_in_arrival_order() {
    let provider = ScriptedProvider::new(|req, _| {
        let last = req.messages.last().unwrap().content.clone();
        Ok(ChatResponse::text(format!("re: {last}")))
    });
    let sessions = Arc::new(InMemorySessionStore::new());
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = Arc::new(agent(provider, sessions.clone(), ToolRegistry::new(), &bus));

    let shutdown = CancellationToken::new();
    let router = SessionRouter::new(agent).spawn(shutdown.clone()).unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let msg = cli_message(&format!("m{i}"));
        ids.push(msg.id.clone());
        bus.publish_inbound(msg).await.unwrap();
    }

    for (i, id) in ids.iter().enumerate() {
        let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply.in_reply_to, id);
        assert_eq!(reply.content, format!("re: m{i}"));
    }

    let history = sessions.load(&SessionKey::new("cli", "direct")).await.unwrap();
    let users: Vec<_> = history.iter().filter(|m| m.role == Role::User).map(|m| m.content.as_str()).collect();
    assert_eq!(users, vec!["m0", "m1", "m2", "m3", "m4"]);

    bus.close();
    router.await.unwrap();
    drop(shutdown);
}

#[tokio::test]
async fn spawned_task_reports_back_to_parent() {
    let provider = ScriptedProvider::with_delay(
        |req, _| {
            let opener = first_user(req);
            let last = req.messages.last().unwrap();

            if opener == "count the files" {
                // The sub-agent's own run: no spawn tool offered.
                assert!(req.tools.iter().all(|t| t.name != "spawn" && t.name != "message"));
                return Ok(ChatResponse::text("There are 3 files."));
            }
            if last.role == Role::Tool {
                return Ok(ChatResponse::text("Started counting in the background."));
            }
            if last.content.starts_with("[Background task") {
                assert!(last.content.contains("There are 3 files."));
                return Ok(ChatResponse::text("The count is done: 3 files."));
            }
            Ok(ChatResponse::tools(vec![ToolCall::new(
                "s1",
                "spawn",
                json!({ "task": "count the files", "label": "count" }),
            )]))
        },
        // Keep the sub-agent busy until the parent run has replied.
        |req| (first_user(req) == "count the files").then(|| Duration::from_millis(300)),
    );
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let agent = Arc::new(agent(provider, Arc::new(InMemorySessionStore::new()), ToolRegistry::new(), &bus));

    let shutdown = CancellationToken::new();
    let router = SessionRouter::new(agent.clone()).spawn(shutdown.clone()).unwrap();

    let msg = cli_message("please count my files");
    bus.publish_inbound(msg.clone()).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.in_reply_to, msg.id);
    assert_eq!(first.content, "Started counting in the background.");

    let second = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.session_key, msg.session_key);
    assert_eq!(second.content, "The count is done: 3 files.");
    assert_eq!(agent.subagents().active_count(), 0);

    shutdown.cancel();
    router.await.unwrap();
}

#[tokio::test]
async fn unknown_subagent_session_is_ignored() {
    let provider = ScriptedProvider::new(|_, _| Ok(ChatResponse::text("unused")));
    let bus = MessageBus::new(16);
    let agent = agent(provider.clone(), Arc::new(InMemorySessionStore::new()), ToolRegistry::new(), &bus);

    let handle = nimbot_core::event::TaskHandle::new();
    let msg = InboundMessage::subagent(SessionKey::subagent(&handle), handle, "orphan");
    assert_eq!(msg.source, SourceKind::Subagent);

    let report = agent.process(msg, CancellationToken::new()).await;
    assert!(matches!(report.abort, Some(RunAbort::UnknownTask(_))));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn failed_result_write_still_records_the_rest() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::<ChatRequest>::new()));
    let log = seen.clone();
    let provider = ScriptedProvider::new(move |req, n| {
        log.lock().unwrap().push(req.clone());
        match n {
            1 => Ok(ChatResponse::tools(vec![
                ToolCall::new("a", "slow_echo", json!({ "value": "first" })),
                ToolCall::new("b", "slow_echo", json!({ "value": "second" })),
            ])),
            _ => Ok(ChatResponse::text("Recovered.")),
        }
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let bus = MessageBus::new(16);
    let _outbound = bus.subscribe_outbound(|_| true).unwrap();
    // Appends: user, assistant, result a (fails), result b.
    let store = FlakyStore::new(3);
    let agent = AgentLoop::new(
        provider.clone(),
        store.clone(),
        Arc::new(StaticContext::new("You are a test assistant.")),
        tools,
        bus.clone(),
    );
    let key = SessionKey::new("cli", "direct");

    let report = agent.process(cli_message("run both"), CancellationToken::new()).await;
    assert!(matches!(report.abort, Some(RunAbort::Session(_))));

    let history = store.load(&key).await.unwrap();
    let recorded: Vec<_> = history.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
    assert_eq!(recorded, vec!["b"]);

    // The next run still answers every call the model made.
    let report = agent.process(cli_message("try again"), CancellationToken::new()).await;
    assert!(report.is_done());
    let requests = seen.lock().unwrap();
    let answered: Vec<_> = requests[1]
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(answered, vec!["b", "a"]);
}

#[tokio::test]
async fn result_arriving_mid_run_joins_the_parent_run() {
    let provider = ScriptedProvider::new(|req, _| {
        let last = req.messages.last().unwrap();

        if first_user(req) == "count the files" {
            return Ok(ChatResponse::text("There are 3 files."));
        }
        if req.messages.iter().any(|m| m.content.starts_with("[Background task")) {
            assert_eq!(last.role, Role::User);
            assert!(last.content.contains("There are 3 files."));
            return Ok(ChatResponse::text("Counted: 3 files."));
        }
        match last.tool_call_id.as_deref() {
            // Keep the parent busy while the sub-agent works.
            Some("s1") => Ok(ChatResponse::tools(vec![ToolCall::new(
                "w1",
                "slow_echo",
                json!({ "value": "waited", "delay_ms": 300 }),
            )])),
            Some(_) => Ok(ChatResponse::text("No report arrived.")),
            None => Ok(ChatResponse::tools(vec![ToolCall::new(
                "s1",
                "spawn",
                json!({ "task": "count the files", "label": "count" }),
            )])),
        }
    });
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowEcho));
    let bus = MessageBus::new(16);
    let mut outbound = bus.subscribe_outbound(|_| true).unwrap();
    let parent = SessionKey::new("cli", "direct");
    let watched = parent.clone();
    let mut redelivered = bus
        .subscribe_inbound(move |m| m.session_key == watched && m.source == SourceKind::Subagent)
        .unwrap();
    let agent = Arc::new(agent(provider.clone(), Arc::new(InMemorySessionStore::new()), tools, &bus));

    let shutdown = CancellationToken::new();
    let router = SessionRouter::new(agent.clone()).spawn(shutdown.clone()).unwrap();

    let msg = cli_message("please count my files");
    bus.publish_inbound(msg.clone()).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.in_reply_to, msg.id);
    assert_eq!(reply.content, "Counted: 3 files.");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(outbound.try_recv().is_none());
    assert!(redelivered.try_recv().is_none());
    assert_eq!(agent.subagents().active_count(), 0);
    // Parent: spawn, wait, answer. Sub-agent: one call.
    assert_eq!(provider.calls(), 4);

    shutdown.cancel();
    router.await.unwrap();
}
