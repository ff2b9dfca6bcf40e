//! Conversation session.
//!
//! A [`Session`] drives one prompt at a time through the provider: it streams
//! the reply into a placeholder on the chat surface, runs requested tools and
//! feeds their results back as continuation turns, holds or applies proposed
//! file changes, and walks multi-step plans. All surface mutations happen on
//! the task that owns the session.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use pocketcode_config::AgentSettings;
use pocketcode_core::agent::AgentMode;
use pocketcode_core::error::{ErrorClass, PlanError};
use pocketcode_core::event::{DomainEvent, EventBus};
use pocketcode_core::message::Message;
use pocketcode_core::provider::{ModelInfo, ProviderClient};
use pocketcode_core::response::{ActionKind, FileChangeProposal, ParsedResponse};
use pocketcode_core::stream::{StreamEvent, StreamRequest};
use pocketcode_core::surface::{ChatSurface, DisplayKind, DisplayMessage};
use pocketcode_core::tool::ToolUsage;
use pocketcode_core::workspace::{ApplyOutcome, FileApplier, summarize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::history::{DEFAULT_HISTORY_WINDOW, window_history};
use crate::plan::{PlanExecutor, PlanProgress, PlanState};
use crate::tool_coordinator::{ToolBatch, ToolCoordinator};

pub const DEFAULT_MAX_CONTINUATIONS: u32 = 10;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are PocketCode, a coding assistant working inside the user's project.
Answer in plain text, or reply with JSON when you need to act:
- To call tools: [{\"name\": \"<tool>\", \"args\": {...}}]. Results come back as {\"action\": \"tool_result\", \"results\": [...]}.
- To change files: {\"action\": \"file_changes\", \"explanation\": \"...\", \"files\": [{\"operation\": \"create|update|delete|rename|patch\", \"path\": \"...\", \"content\": \"...\"}]}.
- For larger work: {\"explanation\": \"...\", \"steps\": [\"first step\", \"second step\"]}.
Only use the tools listed below.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: AgentMode,
    pub max_continuations: u32,
    pub history_window: usize,
    pub system_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::default(),
            max_continuations: DEFAULT_MAX_CONTINUATIONS,
            history_window: DEFAULT_HISTORY_WINDOW,
            system_prompt: None,
        }
    }
}

impl From<&AgentSettings> for SessionConfig {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            mode: settings.mode,
            max_continuations: settings.max_continuations,
            history_window: settings.history_window,
            system_prompt: settings.system_prompt.clone(),
        }
    }
}

/// Per-turn conversation state. Reset at the start of every turn.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    /// Surface position of the streaming placeholder.
    pub streaming_position: Option<usize>,
    /// Surface position of the running-tools placeholder.
    pub tools_position: Option<usize>,
    /// Usages of the last batch, attached to the next assistant message.
    pub last_tool_usages: Vec<ToolUsage>,
    pub continuation_depth: u32,
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Answered,
    /// Co-pilot mode: changes wait for `accept_pending_changes`.
    ChangesPending { count: usize },
    /// Agent mode: changes were applied as soon as they arrived.
    ChangesApplied { outcomes: Vec<ApplyOutcome> },
    /// A plan step waits for `accept_plan_step` or `discard_plan_step`.
    PlanReview { index: usize },
    PlanCompleted,
    PlanHalted { index: usize, reason: String },
    ContinuationLimit,
    Failed { code: String, message: String },
    Cancelled,
}

/// Text sent to the model for one request.
#[derive(Debug, Clone)]
struct Prompt {
    text: String,
    /// Tool results and plan instructions are not typed by the user.
    machine: bool,
}

impl Prompt {
    fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            machine: false,
        }
    }

    fn machine(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            machine: true,
        }
    }

    fn to_message(&self) -> Message {
        if self.machine {
            Message::continuation(&self.text)
        } else {
            Message::user(&self.text)
        }
    }
}

enum StreamResult {
    Completed(ParsedResponse),
    Failed { code: String, message: String },
    Cancelled,
}

#[derive(Debug)]
struct ActiveTurn {
    request_id: Option<String>,
    token: CancellationToken,
}

impl Default for ActiveTurn {
    // no turn is running until one begins
    fn default() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            request_id: None,
            token,
        }
    }
}

/// Cancels the session's current turn from another task.
#[derive(Clone)]
pub struct SessionCanceller {
    provider: Arc<dyn ProviderClient>,
    active: Arc<Mutex<ActiveTurn>>,
}

impl SessionCanceller {
    /// Cancel the in-flight request and drop any pending continuation.
    /// Returns whether a turn was running.
    pub fn cancel(&self) -> bool {
        let Ok(active) = self.active.lock() else {
            return false;
        };
        let was_running = !active.token.is_cancelled();
        active.token.cancel();
        if let Some(id) = &active.request_id {
            self.provider.cancel_streaming(id);
        }
        was_running
    }
}

pub struct Session<S: ChatSurface> {
    provider: Arc<dyn ProviderClient>,
    model: ModelInfo,
    tools: ToolCoordinator,
    applier: Arc<dyn FileApplier>,
    surface: S,
    config: SessionConfig,
    event_bus: Arc<EventBus>,
    history: Vec<Message>,
    turn: TurnState,
    pending_changes: Vec<FileChangeProposal>,
    plan: Option<PlanExecutor>,
    last_prompt: Option<Prompt>,
    active: Arc<Mutex<ActiveTurn>>,
}

impl<S: ChatSurface> Session<S> {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        model: ModelInfo,
        tools: ToolCoordinator,
        applier: Arc<dyn FileApplier>,
        surface: S,
    ) -> Self {
        Self {
            provider,
            model,
            tools,
            applier,
            surface,
            config: SessionConfig::default(),
            event_bus: Arc::new(EventBus::default()),
            history: Vec::new(),
            turn: TurnState::default(),
            pending_changes: Vec::new(),
            plan: None,
            last_prompt: None,
            active: Arc::new(Mutex::new(ActiveTurn::default())),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    /// Switch models. History is kept.
    pub fn set_model(&mut self, model: ModelInfo) {
        self.model = model;
    }

    pub fn mode(&self) -> AgentMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: AgentMode) {
        self.config.mode = mode;
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn turn_state(&self) -> &TurnState {
        &self.turn
    }

    pub fn pending_changes(&self) -> &[FileChangeProposal] {
        &self.pending_changes
    }

    pub fn plan(&self) -> Option<&PlanExecutor> {
        self.plan.as_ref()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            provider: Arc::clone(&self.provider),
            active: Arc::clone(&self.active),
        }
    }

    /// Send a user prompt and drive it to the end of the turn.
    pub async fn send(&mut self, text: impl Into<String>) -> TurnOutcome {
        let text = text.into();
        // a step whose request failed is abandoned by a fresh prompt
        if let Some(plan) = self.plan.as_mut()
            && matches!(plan.state(), PlanState::StepRunning { .. })
            && let Some(progress) = plan.fail_current("superseded by a new prompt")
        {
            let _ = self.on_plan_progress(progress);
        }
        self.surface.add_message(DisplayMessage::user(&text));
        self.run_turn(Prompt::user(text)).await
    }

    /// Re-send the last prompt. `None` when nothing was sent yet.
    pub async fn retry(&mut self) -> Option<TurnOutcome> {
        let prompt = self.last_prompt.clone()?;
        info!(machine = prompt.machine, "Retrying last prompt");
        Some(self.run_turn(prompt).await)
    }

    /// Cancel the current turn. Equivalent to [`SessionCanceller::cancel`].
    pub fn cancel(&self) -> bool {
        self.canceller().cancel()
    }

    /// Apply the changes held in co-pilot mode.
    pub async fn accept_pending_changes(&mut self) -> Vec<ApplyOutcome> {
        let changes = std::mem::take(&mut self.pending_changes);
        if changes.is_empty() {
            return Vec::new();
        }
        let outcomes = self.applier.apply(&changes).await;
        self.surface
            .add_message(DisplayMessage::notice(summarize(&outcomes)));
        outcomes
    }

    /// Drop the held changes. Returns how many were dropped.
    pub fn reject_pending_changes(&mut self) -> usize {
        let count = self.pending_changes.len();
        self.pending_changes.clear();
        if count > 0 {
            self.surface.add_message(DisplayMessage::notice(format!(
                "Discarded {count} proposed change(s)"
            )));
        }
        count
    }

    /// Apply the current plan step and run the next one.
    pub async fn accept_plan_step(&mut self) -> Result<TurnOutcome, PlanError> {
        let applier = Arc::clone(&self.applier);
        let plan = self.plan.as_mut().ok_or(PlanError::NoActivePlan)?;
        let accepted = plan.current().map(|(index, _)| index);
        let progress = plan.accept(applier.as_ref()).await?;
        if let Some(index) = accepted {
            self.publish_step(index);
        }

        Ok(match self.advance_plan(progress).await {
            ControlFlow::Continue(prompt) => self.run_turn(prompt).await,
            ControlFlow::Break(outcome) => outcome,
        })
    }

    /// Discard the current plan step. The plan halts.
    pub fn discard_plan_step(&mut self) -> Result<TurnOutcome, PlanError> {
        let plan = self.plan.as_mut().ok_or(PlanError::NoActivePlan)?;
        let PlanProgress::Halted { index, reason } = plan.discard()? else {
            return Err(PlanError::NoActivePlan);
        };
        let _ = self.on_plan_progress(PlanProgress::Halted {
            index,
            reason: reason.clone(),
        });
        Ok(TurnOutcome::PlanHalted { index, reason })
    }

    async fn run_turn(&mut self, first: Prompt) -> TurnOutcome {
        self.turn = TurnState::default();
        let token = self.begin_turn();
        let mut prompt = first;

        loop {
            if token.is_cancelled() {
                return self.on_cancelled();
            }

            let parsed = match self.stream_once(&prompt, &token).await {
                StreamResult::Completed(parsed) => parsed,
                StreamResult::Failed { code, message } => {
                    return self.on_stream_error(code, message);
                }
                StreamResult::Cancelled => return self.on_cancelled(),
            };

            self.surface.hide_thinking_message();
            self.history.push(prompt.to_message());
            self.history.push(Message::assistant(reply_text(&parsed)));

            let step_running = self
                .plan
                .as_ref()
                .is_some_and(|p| matches!(p.state(), PlanState::StepRunning { .. }));

            let flow = match parsed.action {
                ActionKind::ToolCalls => self.run_tools(parsed, &token).await,
                _ if step_running => self.finish_plan_step(parsed).await,
                ActionKind::FileChanges => ControlFlow::Break(self.on_file_changes(parsed).await),
                ActionKind::Plan => self.start_plan(parsed).await,
                ActionKind::Answer => {
                    self.render_final(&parsed);
                    ControlFlow::Break(TurnOutcome::Answered)
                }
            };

            match flow {
                ControlFlow::Continue(next) => prompt = next,
                ControlFlow::Break(outcome) => {
                    self.end_turn();
                    return outcome;
                }
            }
        }
    }

    /// Stream one request into the placeholder.
    async fn stream_once(&mut self, prompt: &Prompt, token: &CancellationToken) -> StreamResult {
        self.last_prompt = Some(prompt.clone());

        let history = window_history(
            &self.history,
            self.model.single_round,
            self.config.history_window,
        );
        let request = StreamRequest::new(self.model.clone(), prompt.text.clone())
            .with_history(history)
            .with_thinking(self.model.thinking)
            .with_system_prompt(self.system_prompt())
            .with_tools(self.tools.registry().definitions());
        let request_id = request.request_id.clone();
        if let Ok(mut active) = self.active.lock() {
            active.request_id = Some(request_id.clone());
        }

        debug!(
            request_id = %request_id,
            model = %self.model.id,
            depth = self.turn.continuation_depth,
            machine = prompt.machine,
            "Submitting request"
        );
        self.event_bus.publish(DomainEvent::StreamStarted {
            request_id: request_id.clone(),
            model: self.model.id.clone(),
            continuation_depth: self.turn.continuation_depth,
            timestamp: Utc::now(),
        });

        let mut handle = self.provider.send_message_streaming(request);
        let mut text = String::new();
        let mut thinking = String::new();
        let mut tokens_used = 0;

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                event = handle.next() => event,
            };
            match event {
                Some(StreamEvent::Started) => self.ensure_placeholder(),
                Some(StreamEvent::Delta { text: chunk, is_thinking }) => {
                    if is_thinking {
                        thinking.push_str(&chunk);
                    } else {
                        text.push_str(&chunk);
                    }
                    self.render_streaming(&text, &thinking);
                }
                Some(StreamEvent::Usage(usage)) => tokens_used = usage.total(),
                Some(StreamEvent::Error { message, code }) => {
                    break StreamResult::Failed { code, message };
                }
                Some(StreamEvent::Completed(parsed)) => {
                    self.event_bus.publish(DomainEvent::ResponseCompleted {
                        request_id: request_id.clone(),
                        action: parsed.action,
                        is_valid: parsed.is_valid,
                        tokens_used,
                        timestamp: Utc::now(),
                    });
                    break StreamResult::Completed(parsed);
                }
                None if token.is_cancelled() || handle.is_cancelled() => {
                    break StreamResult::Cancelled;
                }
                None => {
                    break StreamResult::Failed {
                        code: "stream_interrupted".into(),
                        message: "stream ended without a result".into(),
                    };
                }
            }
        };

        if let Ok(mut active) = self.active.lock() {
            active.request_id = None;
        }
        result
    }

    async fn run_tools(
        &mut self,
        parsed: ParsedResponse,
        token: &CancellationToken,
    ) -> ControlFlow<TurnOutcome, Prompt> {
        if self.turn.continuation_depth >= self.config.max_continuations {
            warn!(
                depth = self.turn.continuation_depth,
                "Continuation limit reached, not running tools"
            );
            self.render_final(&parsed);
            self.surface.add_message(DisplayMessage::notice(format!(
                "Stopped after {} tool rounds",
                self.config.max_continuations
            )));
            return ControlFlow::Break(TurnOutcome::ContinuationLimit);
        }

        let mut batch = ToolBatch::new(parsed.tool_calls);
        batch.mark_running();
        let position = self.place(running_message(&parsed.explanation, batch.usages()));
        self.turn.tools_position = Some(position);

        info!(tools = batch.len(), depth = self.turn.continuation_depth, "Running tool batch");
        self.tools.execute(&mut batch).await;
        self.surface
            .update_message(position, running_message(&parsed.explanation, batch.usages()));

        if token.is_cancelled() {
            debug!("Session cancelled during tool batch, dropping continuation");
            return ControlFlow::Break(self.on_cancelled());
        }
        let Some(payload) = batch.take_continuation() else {
            return ControlFlow::Break(self.on_stream_error(
                "internal".into(),
                "tool batch did not complete".into(),
            ));
        };

        self.turn.last_tool_usages = batch.usages().to_vec();
        self.turn.continuation_depth += 1;
        ControlFlow::Continue(Prompt::machine(payload.to_prompt()))
    }

    async fn on_file_changes(&mut self, parsed: ParsedResponse) -> TurnOutcome {
        self.render_final(&parsed);
        let changes = parsed.file_changes;

        if self.config.mode.auto_apply() {
            let outcomes = self.applier.apply(&changes).await;
            info!(changes = changes.len(), "Applied changes in agent mode");
            self.surface
                .add_message(DisplayMessage::notice(summarize(&outcomes)));
            return TurnOutcome::ChangesApplied { outcomes };
        }

        let count = changes.len();
        debug!(count, "Holding changes for review");
        self.pending_changes = changes;
        TurnOutcome::ChangesPending { count }
    }

    async fn start_plan(&mut self, parsed: ParsedResponse) -> ControlFlow<TurnOutcome, Prompt> {
        self.render_final(&parsed);
        let mut plan = PlanExecutor::new(parsed.plan_steps);
        let progress = plan.start();
        self.plan = Some(plan);
        match progress {
            Ok(progress) => self.advance_plan(progress).await,
            Err(e) => ControlFlow::Break(plan_failure(&e)),
        }
    }

    async fn finish_plan_step(
        &mut self,
        parsed: ParsedResponse,
    ) -> ControlFlow<TurnOutcome, Prompt> {
        self.render_final(&parsed);
        let Some(plan) = self.plan.as_mut() else {
            return ControlFlow::Break(TurnOutcome::Answered);
        };
        match plan.on_step_execution_result(parsed) {
            Ok(progress) => self.advance_plan(progress).await,
            Err(e) => ControlFlow::Break(plan_failure(&e)),
        }
    }

    /// Like [`Self::on_plan_progress`], except that agent mode accepts a
    /// step under review without waiting for the user.
    async fn advance_plan(&mut self, mut progress: PlanProgress) -> ControlFlow<TurnOutcome, Prompt> {
        loop {
            let index = match progress {
                PlanProgress::Review { index } if self.config.mode.auto_apply() => index,
                other => return self.on_plan_progress(other),
            };
            self.show_step(index);
            let applier = Arc::clone(&self.applier);
            let Some(plan) = self.plan.as_mut() else {
                return ControlFlow::Break(TurnOutcome::Answered);
            };
            progress = match plan.accept(applier.as_ref()).await {
                Ok(next) => next,
                Err(e) => return ControlFlow::Break(plan_failure(&e)),
            };
            info!(index, "Accepted plan step in agent mode");
            self.publish_step(index);
        }
    }

    /// Render plan progress. `Continue` carries the next step's prompt.
    fn on_plan_progress(&mut self, progress: PlanProgress) -> ControlFlow<TurnOutcome, Prompt> {
        match progress {
            PlanProgress::Execute { index, prompt } => {
                self.publish_step(index);
                self.turn.continuation_depth = 0;
                ControlFlow::Continue(Prompt::machine(prompt))
            }
            PlanProgress::Review { index } => {
                self.show_step(index);
                ControlFlow::Break(TurnOutcome::PlanReview { index })
            }
            PlanProgress::Completed => {
                self.surface
                    .add_message(DisplayMessage::notice("Plan completed"));
                ControlFlow::Break(TurnOutcome::PlanCompleted)
            }
            PlanProgress::Halted { index, reason } => {
                self.publish_step(index);
                self.event_bus.publish(DomainEvent::ErrorOccurred {
                    class: ErrorClass::PlanHalt,
                    context: format!("plan step {}", index + 1),
                    error_message: reason.clone(),
                    timestamp: Utc::now(),
                });
                self.surface.add_message(DisplayMessage::notice(format!(
                    "Plan halted at step {}: {reason}",
                    index + 1
                )));
                ControlFlow::Break(TurnOutcome::PlanHalted { index, reason })
            }
        }
    }

    fn show_step(&mut self, index: usize) {
        self.publish_step(index);
        if let Some(plan) = &self.plan
            && let Some(step) = plan.steps().get(index)
        {
            self.surface
                .add_message(DisplayMessage::plan_step(index, plan.len(), step));
        }
    }

    fn on_stream_error(&mut self, code: String, message: String) -> TurnOutcome {
        warn!(%code, %message, "Turn failed");
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            class: ErrorClass::NetworkFailure,
            context: format!("model {}", self.model.id),
            error_message: message.clone(),
            timestamp: Utc::now(),
        });

        let retry = self.last_prompt.as_ref().map(|p| p.text.clone());
        let error = DisplayMessage::error(format!("Error: {message}"), retry);
        match self.placeholder() {
            Some(position) => self.surface.update_message(position, error),
            None => {
                self.surface.add_message(error);
            }
        }
        self.end_turn();
        TurnOutcome::Failed { code, message }
    }

    fn on_cancelled(&mut self) -> TurnOutcome {
        info!("Turn cancelled");
        if let Some(position) = self.placeholder() {
            let mut message = self
                .surface
                .get_message_at(position)
                .unwrap_or_else(DisplayMessage::streaming_placeholder);
            message.streaming = false;
            if message.content.is_empty() {
                message = DisplayMessage::notice("Cancelled");
            }
            self.surface.update_message(position, message);
        }
        self.end_turn();
        TurnOutcome::Cancelled
    }

    fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut active) = self.active.lock() {
            active.token = token.clone();
            active.request_id = None;
        }
        token
    }

    fn end_turn(&mut self) {
        self.turn.streaming_position = None;
        self.turn.tools_position = None;
        if let Ok(active) = self.active.lock() {
            active.token.cancel();
        }
    }

    fn placeholder(&self) -> Option<usize> {
        self.turn.streaming_position.or(self.turn.tools_position)
    }

    fn ensure_placeholder(&mut self) {
        if self.placeholder().is_none() {
            let position = self
                .surface
                .add_message(DisplayMessage::streaming_placeholder());
            self.turn.streaming_position = Some(position);
        }
    }

    /// Streamed text goes into the placeholder. After a tool round the
    /// running-tools message becomes the streaming placeholder.
    fn render_streaming(&mut self, text: &str, thinking: &str) {
        let mut message = DisplayMessage::streaming_placeholder();
        message.content = text.to_string();
        message.thinking = thinking.to_string();
        message.tool_usages = self.turn.last_tool_usages.clone();
        if text.is_empty() && !thinking.is_empty() {
            message.kind = DisplayKind::Thinking;
        }
        let position = self.place(message);
        self.turn.streaming_position = Some(position);
    }

    /// Replace whichever placeholder exists, or append.
    fn place(&mut self, message: DisplayMessage) -> usize {
        match self
            .turn
            .streaming_position
            .take()
            .or(self.turn.tools_position.take())
        {
            Some(position) => {
                self.surface.update_message(position, message);
                position
            }
            None => self.surface.add_message(message),
        }
    }

    fn render_final(&mut self, parsed: &ParsedResponse) {
        let mut message = DisplayMessage::assistant(display_text(parsed));
        message.thinking = parsed.thinking.clone();
        message.tool_usages = std::mem::take(&mut self.turn.last_tool_usages);
        message.file_changes = parsed.file_changes.clone();
        self.place(message);
    }

    fn system_prompt(&self) -> String {
        let base = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let definitions = self.tools.registry().definitions();
        if definitions.is_empty() {
            return base.to_string();
        }
        let tools: Vec<String> = definitions
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect();
        format!("{base}\n\nTools:\n{}", tools.join("\n"))
    }

    fn publish_step(&self, index: usize) {
        let Some(step) = self.plan.as_ref().and_then(|p| p.steps().get(index)) else {
            return;
        };
        self.event_bus.publish(DomainEvent::PlanStepChanged {
            index,
            status: step.status,
            timestamp: Utc::now(),
        });
    }
}

fn plan_failure(error: &PlanError) -> TurnOutcome {
    TurnOutcome::Failed {
        code: "plan".into(),
        message: error.to_string(),
    }
}

fn running_message(explanation: &str, usages: &[ToolUsage]) -> DisplayMessage {
    let mut message = DisplayMessage::running_tools(usages.to_vec());
    if !explanation.is_empty() {
        message.content = format!("{explanation}\n{}", message.content);
    }
    message
}

fn reply_text(parsed: &ParsedResponse) -> String {
    if parsed.raw_response.is_empty() {
        parsed.explanation.clone()
    } else {
        parsed.raw_response.clone()
    }
}

fn display_text(parsed: &ParsedResponse) -> String {
    let mut text = parsed.explanation.clone();
    if parsed.action == ActionKind::Plan {
        for (i, step) in parsed.plan_steps.iter().enumerate() {
            text.push_str(&format!("\n{}. {}", i + 1, step.description));
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pocketcode_core::error::{ProviderError, ToolError};
    use pocketcode_core::parser::parse_response;
    use pocketcode_core::response::StepStatus;
    use pocketcode_core::stream::stream_channel;
    use pocketcode_core::surface::MessageLog;
    use pocketcode_core::tool::{Tool, ToolRegistry, ToolStatus};
    use pocketcode_core::stream::StreamHandle;
    use serde_json::{Map, Value, json};
    use std::collections::{HashMap, VecDeque};

    enum Script {
        Reply(String),
        Fail(ProviderError),
        /// Stream one delta, then wait to be cancelled.
        Hang,
    }

    /// Plays scripted replies in order, one per request.
    #[derive(Default)]
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
        active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn send_message_streaming(&self, request: StreamRequest) -> StreamHandle {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted reply left");
            let (mut sink, handle) = stream_channel(request.request_id.clone());
            self.active
                .lock()
                .unwrap()
                .insert(request.request_id.clone(), sink.cancellation());
            self.requests.lock().unwrap().push(request);

            tokio::spawn(async move {
                sink.started().await;
                match script {
                    Script::Reply(raw) => {
                        for chunk in raw.as_bytes().chunks(7) {
                            sink.delta(String::from_utf8_lossy(chunk), false).await;
                        }
                        sink.complete(parse_response(&raw)).await;
                    }
                    Script::Fail(err) => sink.fail(&err).await,
                    Script::Hang => {
                        sink.delta("partial", false).await;
                        sink.cancellation().cancelled().await;
                    }
                }
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
            Ok(vec!["scripted-model".into()])
        }
    }

    struct ListTool;

    #[async_trait]
    impl Tool for ListTool {
        fn name(&self) -> &str {
            "listFiles"
        }
        fn description(&self) -> &str {
            "List files"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Map<String, Value>) -> Result<Value, ToolError> {
            Ok(json!({"files": ["main.rs"]}))
        }
    }

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileApplier for RecordingApplier {
        async fn apply(&self, changes: &[FileChangeProposal]) -> Vec<ApplyOutcome> {
            let mut applied = self.applied.lock().unwrap();
            changes
                .iter()
                .map(|c| {
                    applied.push(c.path.clone());
                    ApplyOutcome::ok(&c.path)
                })
                .collect()
        }
    }

    fn session(
        provider: Arc<ScriptedProvider>,
        applier: Arc<RecordingApplier>,
    ) -> Session<MessageLog> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ListTool));
        Session::new(
            provider,
            ModelInfo::new("scripted-model", "scripted"),
            ToolCoordinator::new(registry, 4),
            applier,
            MessageLog::new(),
        )
    }

    fn file_changes_reply() -> String {
        json!({
            "action": "file_changes",
            "explanation": "Adding a module",
            "files": [{"operation": "create", "path": "src/m.rs", "content": "pub fn m() {}"}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn plain_answer_replaces_placeholder() {
        let provider = ScriptedProvider::new(vec![Script::Reply("Hello world".into())]);
        let mut s = session(Arc::clone(&provider), Arc::default());

        assert!(matches!(s.send("hi").await, TurnOutcome::Answered));

        let log = s.surface();
        assert_eq!(log.messages.len(), 2);
        assert_eq!(log.messages[1].content, "Hello world");
        assert!(!log.messages[1].streaming);
        assert_eq!(log.thinking_hidden, 1);
        assert_eq!(s.history().len(), 2);
        assert!(provider.requests()[0].system_prompt.as_deref().unwrap().contains("listFiles"));
    }

    #[tokio::test]
    async fn tool_calls_continue_with_results() {
        let provider = ScriptedProvider::new(vec![
            Script::Reply(r#"[{"name":"listFiles","args":{"path":"."}}]"#.into()),
            Script::Reply("There is one file.".into()),
        ]);
        let mut s = session(Arc::clone(&provider), Arc::default());

        assert!(matches!(s.send("what files?").await, TurnOutcome::Answered));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let payload: Value = serde_json::from_str(&requests[1].user_message).unwrap();
        assert_eq!(payload["action"], "tool_result");
        assert_eq!(payload["results"][0]["toolName"], "listFiles");
        assert_eq!(payload["results"][0]["result"]["ok"], true);
        // the continuation sees the tool-call exchange
        assert_eq!(requests[1].history.len(), 2);
        assert!(s.history()[2].is_machine_generated());

        let log = s.surface();
        // user, then the tools placeholder replaced in place by the answer
        assert_eq!(log.messages.len(), 2);
        let last = log.last().unwrap();
        assert_eq!(last.content, "There is one file.");
        assert_eq!(last.tool_usages.len(), 1);
        assert_eq!(last.tool_usages[0].status, ToolStatus::Completed);
        assert!(s.turn_state().last_tool_usages.is_empty());
    }

    #[tokio::test]
    async fn continuation_depth_is_capped() {
        let call = r#"[{"name":"listFiles","args":{}}]"#;
        let provider = ScriptedProvider::new(vec![
            Script::Reply(call.into()),
            Script::Reply(call.into()),
            Script::Reply(call.into()),
        ]);
        let mut s = session(Arc::clone(&provider), Arc::default()).with_config(SessionConfig {
            max_continuations: 2,
            ..Default::default()
        });

        assert!(matches!(s.send("loop").await, TurnOutcome::ContinuationLimit));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(s.turn_state().continuation_depth, 2);
        assert!(s.surface().last().unwrap().content.contains("Stopped after 2"));
    }

    #[tokio::test]
    async fn copilot_holds_changes_until_accepted() {
        let provider = ScriptedProvider::new(vec![Script::Reply(file_changes_reply())]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(provider, Arc::clone(&applier));

        assert!(matches!(
            s.send("add a module").await,
            TurnOutcome::ChangesPending { count: 1 }
        ));
        assert!(applier.applied.lock().unwrap().is_empty());
        assert_eq!(s.surface().last().unwrap().file_changes.len(), 1);

        let outcomes = s.accept_pending_changes().await;
        assert!(outcomes.iter().all(ApplyOutcome::is_ok));
        assert_eq!(*applier.applied.lock().unwrap(), vec!["src/m.rs"]);
        assert!(s.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn agent_mode_applies_immediately() {
        let provider = ScriptedProvider::new(vec![Script::Reply(file_changes_reply())]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(provider, Arc::clone(&applier)).with_config(SessionConfig {
            mode: AgentMode::Agent,
            ..Default::default()
        });

        assert!(matches!(
            s.send("add a module").await,
            TurnOutcome::ChangesApplied { .. }
        ));
        assert_eq!(applier.applied.lock().unwrap().len(), 1);
        assert_eq!(s.surface().last().unwrap().content, "Applied 1 change(s)");
    }

    #[tokio::test]
    async fn rejected_changes_are_dropped() {
        let provider = ScriptedProvider::new(vec![Script::Reply(file_changes_reply())]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(provider, Arc::clone(&applier));
        s.send("add").await;

        assert_eq!(s.reject_pending_changes(), 1);
        assert!(s.accept_pending_changes().await.is_empty());
        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_error_becomes_inline_error_with_retry() {
        let provider = ScriptedProvider::new(vec![
            Script::Fail(ProviderError::RateLimited { retry_after_secs: 1 }),
            Script::Reply("Recovered".into()),
        ]);
        let mut s = session(Arc::clone(&provider), Arc::default());

        match s.send("hello").await {
            TurnOutcome::Failed { code, .. } => assert_eq!(code, "rate_limited"),
            other => panic!("unexpected {other:?}"),
        }
        let error = s.surface().last().unwrap().clone();
        assert_eq!(
            error.kind,
            DisplayKind::Error {
                retry_prompt: Some("hello".into())
            }
        );
        // the failed exchange is not part of the history
        assert!(s.history().is_empty());

        assert!(matches!(s.retry().await, Some(TurnOutcome::Answered)));
        assert_eq!(provider.requests()[1].user_message, "hello");
        assert_eq!(s.surface().last().unwrap().content, "Recovered");
    }

    #[tokio::test]
    async fn cancel_stops_a_hanging_stream() {
        let provider = ScriptedProvider::new(vec![Script::Hang]);
        let mut s = session(Arc::clone(&provider), Arc::default());
        let canceller = s.canceller();

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel()
        });
        assert!(matches!(s.send("long task").await, TurnOutcome::Cancelled));
        assert!(cancel.await.unwrap());
        assert_eq!(provider.active_requests(), 0);

        // the partial text stays, no longer streaming
        let last = s.surface().last().unwrap();
        assert_eq!(last.content, "partial");
        assert!(!last.streaming);
        assert!(!s.cancel());
    }

    #[tokio::test]
    async fn plan_steps_execute_and_wait_for_decisions() {
        let plan = json!({
            "explanation": "Two steps",
            "steps": ["Create module", "Wire it up"]
        })
        .to_string();
        let step_one = json!({
            "action": "file_changes",
            "files": [{"operation": "create", "path": "m.rs", "content": "pub fn m() {}"}]
        })
        .to_string();
        let step_two = json!({
            "action": "file_changes",
            "files": [{"operation": "create", "path": "lib.rs", "content": "mod m;"}]
        })
        .to_string();
        let provider = ScriptedProvider::new(vec![
            Script::Reply(plan),
            Script::Reply(step_one),
            Script::Reply(step_two),
        ]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(Arc::clone(&provider), Arc::clone(&applier));
        let mut events = s.event_bus().subscribe();

        assert!(matches!(
            s.send("add a module").await,
            TurnOutcome::PlanReview { index: 0 }
        ));
        assert!(provider.requests()[1].user_message.contains("step 1 of 2"));
        // routed to the plan, not held as pending changes
        assert!(s.pending_changes().is_empty());
        assert_eq!(
            s.surface().last().unwrap().kind,
            DisplayKind::PlanStep { index: 0, total: 2 }
        );

        assert!(matches!(
            s.accept_plan_step().await.unwrap(),
            TurnOutcome::PlanReview { index: 1 }
        ));
        assert!(matches!(
            s.accept_plan_step().await.unwrap(),
            TurnOutcome::PlanCompleted
        ));
        assert_eq!(*applier.applied.lock().unwrap(), vec!["m.rs", "lib.rs"]);
        assert_eq!(s.plan().unwrap().state(), PlanState::Completed);

        let mut accepted = 0;
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::PlanStepChanged {
                status: StepStatus::Accepted,
                ..
            } = event.as_ref()
            {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn discarding_a_step_halts_the_plan() {
        let plan = json!({
            "steps": [
                {"description": "Remove old file", "files": [{"operation": "delete", "path": "old.rs"}]},
                "Never reached"
            ]
        })
        .to_string();
        let provider = ScriptedProvider::new(vec![Script::Reply(plan)]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(Arc::clone(&provider), Arc::clone(&applier));

        // attached changes are reviewed without another request
        assert!(matches!(
            s.send("clean up").await,
            TurnOutcome::PlanReview { index: 0 }
        ));
        assert_eq!(provider.requests().len(), 1);

        assert!(matches!(
            s.discard_plan_step().unwrap(),
            TurnOutcome::PlanHalted { index: 0, .. }
        ));
        assert_eq!(
            s.accept_plan_step().await.unwrap_err(),
            PlanError::Halted { index: 0 }
        );
        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_mode_accepts_plan_steps_without_review() {
        let plan = json!({
            "explanation": "Two files",
            "steps": [
                {"description": "Create a", "files": [{"operation": "create", "path": "a.rs", "content": "a"}]},
                {"description": "Create b", "files": [{"operation": "create", "path": "b.rs", "content": "b"}]}
            ]
        })
        .to_string();
        let provider = ScriptedProvider::new(vec![Script::Reply(plan)]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(Arc::clone(&provider), Arc::clone(&applier)).with_config(SessionConfig {
            mode: AgentMode::Agent,
            ..Default::default()
        });

        assert!(matches!(s.send("do it").await, TurnOutcome::PlanCompleted));
        assert_eq!(*applier.applied.lock().unwrap(), vec!["a.rs", "b.rs"]);
        assert_eq!(provider.requests().len(), 1);
        let plan = s.plan().unwrap();
        assert_eq!(plan.state(), PlanState::Completed);
        assert!(plan.steps().iter().all(|st| st.status == StepStatus::Accepted));
        assert_eq!(s.surface().last().unwrap().content, "Plan completed");
    }

    #[tokio::test]
    async fn agent_mode_executes_and_applies_each_step() {
        let plan = json!({"steps": ["Create module", "Wire it up"]}).to_string();
        let step = |path: &str| {
            json!({
                "action": "file_changes",
                "files": [{"operation": "create", "path": path, "content": "x"}]
            })
            .to_string()
        };
        let provider = ScriptedProvider::new(vec![
            Script::Reply(plan),
            Script::Reply(step("m.rs")),
            Script::Reply(step("lib.rs")),
        ]);
        let applier = Arc::new(RecordingApplier::default());
        let mut s = session(Arc::clone(&provider), Arc::clone(&applier)).with_config(SessionConfig {
            mode: AgentMode::Agent,
            ..Default::default()
        });

        assert!(matches!(s.send("add a module").await, TurnOutcome::PlanCompleted));
        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].user_message.contains("step 2 of 2"));
        assert_eq!(*applier.applied.lock().unwrap(), vec!["m.rs", "lib.rs"]);
        assert!(s.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn single_round_models_get_windowed_history() {
        let scripts = (0..8).map(|i| Script::Reply(format!("answer {i}"))).collect();
        let provider = ScriptedProvider::new(scripts);
        let mut s = session(Arc::clone(&provider), Arc::default()).with_config(SessionConfig {
            history_window: 4,
            ..Default::default()
        });
        s.set_model(ModelInfo::new("small", "scripted").single_round(true));

        for i in 0..8 {
            s.send(format!("question {i}")).await;
        }
        let last = provider.requests().pop().unwrap();
        assert_eq!(last.history.len(), 4);
        assert_eq!(last.history[3].content, "answer 6");
        assert_eq!(s.history().len(), 16);
    }
}
