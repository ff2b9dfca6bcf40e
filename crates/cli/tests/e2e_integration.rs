//! End-to-end tests for the PocketCode session pipeline.
//!
//! These drive a full session from user prompt to rendered answer against a
//! scripted streaming provider, the built-in project tools and the
//! filesystem file applier on a temporary project.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use pocketcode_agent::{Session, SessionConfig, ToolCoordinator, TurnOutcome};
use pocketcode_core::error::ProviderError;
use pocketcode_core::event::{DomainEvent, EventBus};
use pocketcode_core::parser::parse_response;
use pocketcode_core::provider::{ModelInfo, ProviderClient};
use pocketcode_core::stream::{StreamHandle, StreamRequest, Usage, stream_channel};
use pocketcode_core::surface::{DisplayKind, MessageLog};
use pocketcode_core::{AgentMode, ToolStatus};
use pocketcode_tools::{ProjectFileApplier, Sandbox, default_registry};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

// ── Scripted Provider ────────────────────────────────────────────────────

/// A streaming provider that replays scripted replies in sequence. Each
/// reply is delivered as the given delta chunks, then parsed.
#[derive(Default)]
struct ScriptedProvider {
    replies: Mutex<VecDeque<Vec<String>>>,
    requests: Mutex<Vec<StreamRequest>>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Vec<&str>>) -> Arc<Self> {
        let replies = replies
            .into_iter()
            .map(|chunks| chunks.into_iter().map(String::from).collect())
            .collect();
        Arc::new(Self {
            replies: Mutex::new(replies),
            ..Default::default()
        })
    }

    fn replies(raw: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(raw.into_iter().map(|r| vec![r]).collect()),
            ..Default::default()
        })
    }

    fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle {
        let chunks = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!("ScriptedProvider exhausted at request {}", request.request_id)
        });
        let (mut sink, handle) = stream_channel(request.request_id.clone());
        let active = Arc::clone(&self.active);
        active
            .lock()
            .unwrap()
            .insert(request.request_id.clone(), sink.cancellation());
        let request_id = request.request_id.clone();
        self.requests.lock().unwrap().push(request);

        tokio::spawn(async move {
            sink.started().await;
            for chunk in &chunks {
                sink.delta(chunk.clone(), false).await;
            }
            sink.usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
            })
            .await;
            active.lock().unwrap().remove(&request_id);
            sink.complete(parse_response(&chunks.concat())).await;
        });
        handle
    }

    fn cancel_streaming(&self, request_id: &str) -> bool {
        match self.active.lock().unwrap().remove(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn active_requests(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["mock".into()])
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("src/main.rs"),
        "fn main() {\n    println!(\"Hello\");\n}\n",
    )
    .unwrap();
    dir
}

fn session(
    provider: Arc<ScriptedProvider>,
    dir: &tempfile::TempDir,
    mode: AgentMode,
) -> Session<MessageLog> {
    let tools = ToolCoordinator::new(default_registry(dir.path()), 4);
    let applier = Arc::new(ProjectFileApplier::new(Sandbox::new(dir.path())));
    Session::new(
        provider,
        ModelInfo::new("mock", "e2e_mock"),
        tools,
        applier,
        MessageLog::new(),
    )
    .with_config(SessionConfig {
        mode,
        ..Default::default()
    })
}

fn continuation(request: &StreamRequest) -> Value {
    serde_json::from_str(&request.user_message).expect("continuation is JSON")
}

// ── E2E: Streaming ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_hello_world_accumulates_deltas() {
    let dir = project();
    let provider = ScriptedProvider::new(vec![vec!["Hello", " ", "world"]]);
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let mut s = session(provider, &dir, AgentMode::Copilot).with_event_bus(Arc::clone(&bus));

    assert!(matches!(s.send("say hi").await, TurnOutcome::Answered));

    let log = s.surface();
    assert_eq!(log.messages.len(), 2);
    assert_eq!(log.messages[1].content, "Hello world");
    assert_eq!(log.messages[1].kind, DisplayKind::Text);
    assert!(!log.messages[1].streaming);

    let mut tokens = None;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::ResponseCompleted { tokens_used, .. } = event.as_ref() {
            tokens = Some(*tokens_used);
        }
    }
    assert_eq!(tokens, Some(15));
}

// ── E2E: Tool Continuations ──────────────────────────────────────────────

#[tokio::test]
async fn e2e_list_files_scenario() {
    let dir = project();
    let provider = ScriptedProvider::replies(vec![
        r#"[{"name":"listFiles","args":{"path":"."}}]"#.into(),
        "The project has a Cargo.toml and a src directory.".into(),
    ]);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Copilot);

    assert!(matches!(
        s.send("what is in this project?").await,
        TurnOutcome::Answered
    ));

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    // tool definitions are advertised
    assert!(requests[0].tools.iter().any(|t| t.name == "listFiles"));

    let payload = continuation(&requests[1]);
    assert_eq!(payload["action"], "tool_result");
    let results = payload["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["toolName"], "listFiles");
    assert_eq!(results[0]["result"]["ok"], true);
    let files = results[0]["result"]["files"].as_array().unwrap();
    assert!(files.contains(&json!("Cargo.toml")));
    assert!(files.contains(&json!("src/")));

    let answer = s.surface().last().unwrap();
    assert_eq!(answer.content, "The project has a Cargo.toml and a src directory.");
    assert_eq!(answer.tool_usages.len(), 1);
    assert_eq!(answer.tool_usages[0].status, ToolStatus::Completed);
    assert_eq!(answer.tool_usages[0].file_path.as_deref(), Some("."));
}

#[tokio::test]
async fn e2e_tool_results_keep_request_order_with_failures() {
    let dir = project();
    let calls = json!([
        {"name": "readFile", "args": {"path": "src/main.rs"}},
        {"name": "deployToProd", "args": {}},
        {"name": "readFile", "args": {"path": "../outside.txt"}},
        {"name": "searchFiles", "args": {"query": "println"}}
    ])
    .to_string();
    let provider = ScriptedProvider::replies(vec![calls, "Done.".into()]);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Copilot);

    s.send("look around").await;

    let payload = continuation(&provider.requests()[1]);
    let results = payload["results"].as_array().unwrap();
    let names: Vec<&str> = results.iter().map(|r| r["toolName"].as_str().unwrap()).collect();
    assert_eq!(names, ["readFile", "deployToProd", "readFile", "searchFiles"]);

    assert_eq!(results[0]["result"]["ok"], true);
    assert!(results[0]["result"]["content"].as_str().unwrap().contains("Hello"));
    assert_eq!(results[1]["result"]["ok"], false);
    assert_eq!(results[2]["result"]["ok"], false);
    assert_eq!(results[3]["result"]["ok"], true);
    assert_eq!(results[3]["result"]["matches"][0]["path"], "src/main.rs");

    let usages = &s.surface().last().unwrap().tool_usages;
    assert_eq!(usages.len(), 4);
    assert_eq!(usages[1].status, ToolStatus::Failed);
}

#[tokio::test]
async fn e2e_tool_calls_win_over_file_changes() {
    let dir = project();
    let mixed = json!({
        "action": "file_changes",
        "files": [{"operation": "delete", "path": "src/main.rs"}],
        "tool_calls": [{"name": "readFile", "args": {"path": "src/main.rs"}}]
    })
    .to_string();
    let provider = ScriptedProvider::replies(vec![mixed, "Read it.".into()]);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Agent);

    assert!(matches!(s.send("check main").await, TurnOutcome::Answered));
    assert_eq!(provider.requests().len(), 2);
    assert!(dir.path().join("src/main.rs").exists());
}

// ── E2E: File Changes ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_agent_mode_writes_files() {
    let dir = project();
    let reply = json!({
        "action": "file_changes",
        "explanation": "Adding a greeting module.",
        "files": [{"operation": "create", "path": "src/greet.rs", "content": "pub fn greet() {}\n"}]
    })
    .to_string();
    let provider = ScriptedProvider::replies(vec![reply]);
    let mut s = session(provider, &dir, AgentMode::Agent);

    match s.send("add a greet module").await {
        TurnOutcome::ChangesApplied { outcomes } => assert!(outcomes[0].is_ok()),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/greet.rs")).unwrap(),
        "pub fn greet() {}\n"
    );
}

#[tokio::test]
async fn e2e_copilot_patch_waits_for_acceptance() {
    let dir = project();
    let diff = "--- a/src/main.rs\n+++ b/src/main.rs\n@@ -1,3 +1,3 @@\n fn main() {\n-    println!(\"Hello\");\n+    println!(\"Hello, world\");\n }\n";
    let reply = format!(
        "Here is the change:\n```json\n{}\n```",
        json!({
            "action": "file_changes",
            "files": [{"operation": "patch", "path": "src/main.rs", "diff": diff}]
        })
    );
    let provider = ScriptedProvider::replies(vec![reply]);
    let mut s = session(provider, &dir, AgentMode::Copilot);

    assert!(matches!(
        s.send("greet the world").await,
        TurnOutcome::ChangesPending { count: 1 }
    ));
    let main = dir.path().join("src/main.rs");
    assert!(std::fs::read_to_string(&main).unwrap().contains("\"Hello\""));

    let outcomes = s.accept_pending_changes().await;
    assert!(outcomes[0].is_ok(), "{:?}", outcomes[0]);
    assert_eq!(
        std::fs::read_to_string(&main).unwrap(),
        "fn main() {\n    println!(\"Hello, world\");\n}\n"
    );
}

// ── E2E: Plans ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_plan_runs_step_by_step() {
    let dir = project();
    let plan = json!({
        "explanation": "Split main into a library.",
        "steps": ["Create the library", "Use it from main"]
    })
    .to_string();
    let step_one = json!({
        "action": "file_changes",
        "files": [{"operation": "create", "path": "src/lib.rs", "content": "pub fn hello() {}\n"}]
    })
    .to_string();
    let step_two = json!({
        "action": "file_changes",
        "files": [{
            "operation": "update",
            "path": "src/main.rs",
            "old_content": "println!(\"Hello\");",
            "content": "demo::hello();"
        }]
    })
    .to_string();
    let provider = ScriptedProvider::replies(vec![plan, step_one, step_two]);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Copilot);

    assert!(matches!(
        s.send("split into a library").await,
        TurnOutcome::PlanReview { index: 0 }
    ));
    assert!(!dir.path().join("src/lib.rs").exists());

    assert!(matches!(
        s.accept_plan_step().await.unwrap(),
        TurnOutcome::PlanReview { index: 1 }
    ));
    assert!(dir.path().join("src/lib.rs").exists());

    assert!(matches!(
        s.accept_plan_step().await.unwrap(),
        TurnOutcome::PlanCompleted
    ));
    assert!(
        std::fs::read_to_string(dir.path().join("src/main.rs"))
            .unwrap()
            .contains("demo::hello();")
    );
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(s.surface().last().unwrap().content, "Plan completed");
}

#[tokio::test]
async fn e2e_agent_mode_plan_applies_every_step() {
    let dir = project();
    let plan = json!({
        "explanation": "Add two modules.",
        "steps": [
            {"description": "Create a", "files": [{"operation": "create", "path": "src/a.rs", "content": "pub fn a() {}\n"}]},
            "Create b"
        ]
    })
    .to_string();
    let step_two = json!({
        "action": "file_changes",
        "files": [{"operation": "create", "path": "src/b.rs", "content": "pub fn b() {}\n"}]
    })
    .to_string();
    let provider = ScriptedProvider::replies(vec![plan, step_two]);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Agent);

    assert!(matches!(s.send("add a and b").await, TurnOutcome::PlanCompleted));
    assert!(dir.path().join("src/a.rs").exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/b.rs")).unwrap(),
        "pub fn b() {}\n"
    );
    // the attached step needs no request, the second one does
    assert_eq!(provider.requests().len(), 2);
    assert!(provider.requests()[1].user_message.contains("step 2 of 2"));
}

// ── E2E: History ─────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_single_round_model_sees_last_twelve_messages() {
    let dir = project();
    let replies = (0..10).map(|i| format!("reply {i}")).collect();
    let provider = ScriptedProvider::replies(replies);
    let mut s = session(Arc::clone(&provider), &dir, AgentMode::Copilot);
    s.set_model(ModelInfo::new("mock", "e2e_mock").single_round(true));

    for i in 0..10 {
        s.send(format!("question {i}")).await;
    }

    let requests = provider.requests();
    assert_eq!(requests[3].history.len(), 6);
    let last = requests.last().unwrap();
    assert_eq!(last.history.len(), 12);
    assert_eq!(last.history[0].content, "question 3");
    assert_eq!(last.user_message, "question 9");
}
