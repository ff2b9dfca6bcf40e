//! Plan executor. Walks a multi-step plan strictly in order, one active
//! step at a time, with an accept/discard decision per step.

use std::fmt;

use pocketcode_core::error::PlanError;
use pocketcode_core::response::{ParsedResponse, PlanStep, StepStatus};
use pocketcode_core::workspace::{FileApplier, summarize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    NotStarted,
    /// The step is being executed by the model.
    StepRunning { index: usize },
    /// The step has changes and waits for accept or discard.
    AwaitingDecision { index: usize },
    Halted { index: usize },
    Completed,
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::StepRunning { index } => write!(f, "step {} running", index + 1),
            Self::AwaitingDecision { index } => write!(f, "step {} awaiting decision", index + 1),
            Self::Halted { index } => write!(f, "halted at step {}", index + 1),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanProgress {
    /// Ask the model to carry out this step.
    Execute { index: usize, prompt: String },
    /// Show this step's changes for a decision.
    Review { index: usize },
    /// Every step was accepted.
    Completed,
    /// The plan stopped at `index`.
    Halted { index: usize, reason: String },
}

#[derive(Debug, Clone)]
pub struct PlanExecutor {
    steps: Vec<PlanStep>,
    state: PlanState,
}

impl PlanExecutor {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            state: PlanState::NotStarted,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether parsed responses should be routed here.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            PlanState::StepRunning { .. } | PlanState::AwaitingDecision { .. }
        )
    }

    /// The step currently running or awaiting a decision.
    pub fn current(&self) -> Option<(usize, &PlanStep)> {
        match self.state {
            PlanState::StepRunning { index } | PlanState::AwaitingDecision { index } => {
                self.steps.get(index).map(|s| (index, s))
            }
            _ => None,
        }
    }

    pub fn start(&mut self) -> Result<PlanProgress, PlanError> {
        if self.state != PlanState::NotStarted {
            return Err(self.invalid("start"));
        }
        info!(steps = self.steps.len(), "Starting plan");
        Ok(self.begin_step(0))
    }

    /// Feed the model's answer for the running step.
    pub fn on_step_execution_result(
        &mut self,
        parsed: ParsedResponse,
    ) -> Result<PlanProgress, PlanError> {
        let PlanState::StepRunning { index } = self.state else {
            return Err(self.invalid("record a step result"));
        };
        let step = &mut self.steps[index];
        step.file_changes.extend(parsed.file_changes);
        // a step with no changes still needs a decision
        self.state = PlanState::AwaitingDecision { index };
        debug!(index, changes = step.file_changes.len(), "Step ready for review");
        Ok(PlanProgress::Review { index })
    }

    /// Apply the current step's changes and move on. A failed apply marks
    /// the step failed and halts the plan.
    pub async fn accept(&mut self, applier: &dyn FileApplier) -> Result<PlanProgress, PlanError> {
        let PlanState::AwaitingDecision { index } = self.state else {
            return Err(self.not_awaiting());
        };

        let outcomes = applier.apply(&self.steps[index].file_changes).await;
        if outcomes.iter().any(|o| !o.is_ok()) {
            let reason = summarize(&outcomes);
            warn!(index, %reason, "Plan step failed to apply");
            self.steps[index].status = StepStatus::Failed;
            self.state = PlanState::Halted { index };
            return Ok(PlanProgress::Halted { index, reason });
        }

        self.steps[index].status = StepStatus::Accepted;
        Ok(self.begin_step(index + 1))
    }

    /// Discard the current step. The plan halts.
    pub fn discard(&mut self) -> Result<PlanProgress, PlanError> {
        let index = match self.state {
            PlanState::AwaitingDecision { index } | PlanState::StepRunning { index } => index,
            _ => return Err(self.not_awaiting()),
        };
        self.steps[index].status = StepStatus::Discarded;
        self.state = PlanState::Halted { index };
        info!(index, "Plan step discarded, plan halted");
        Ok(PlanProgress::Halted {
            index,
            reason: "step discarded".into(),
        })
    }

    /// Mark the running step failed (the model request errored).
    pub fn fail_current(&mut self, reason: impl Into<String>) -> Option<PlanProgress> {
        let (PlanState::StepRunning { index } | PlanState::AwaitingDecision { index }) = self.state
        else {
            return None;
        };
        self.steps[index].status = StepStatus::Failed;
        self.state = PlanState::Halted { index };
        Some(PlanProgress::Halted {
            index,
            reason: reason.into(),
        })
    }

    fn begin_step(&mut self, index: usize) -> PlanProgress {
        let total = self.steps.len();
        let Some(step) = self.steps.get_mut(index) else {
            self.state = PlanState::Completed;
            info!(steps = total, "Plan completed");
            return PlanProgress::Completed;
        };
        step.status = StepStatus::Running;

        if step.file_changes.is_empty() {
            self.state = PlanState::StepRunning { index };
            PlanProgress::Execute {
                index,
                prompt: format!(
                    "Execute step {} of {} of the plan: {}\nRespond with the file changes for this step only.",
                    index + 1,
                    total,
                    step.description
                ),
            }
        } else {
            // changes came with the plan, review them directly
            self.state = PlanState::AwaitingDecision { index };
            PlanProgress::Review { index }
        }
    }

    fn invalid(&self, action: &'static str) -> PlanError {
        PlanError::InvalidTransition {
            action,
            state: self.state.to_string(),
        }
    }

    fn not_awaiting(&self) -> PlanError {
        match self.state {
            PlanState::Halted { index } => PlanError::Halted { index },
            PlanState::NotStarted | PlanState::Completed => PlanError::NoActivePlan,
            PlanState::StepRunning { index } | PlanState::AwaitingDecision { index } => {
                PlanError::NotAwaitingDecision {
                    index,
                    state: self.state.to_string(),
                }
            }
        }
    }
}
