//! The agent loop for PocketCode.
//!
//! A [`Session`] turns one user prompt into a finished turn:
//!
//! 1. **Stream** the prompt (plus windowed history) to the selected model
//! 2. **If tool calls**: run them in parallel, feed the ordered results back
//!    as a continuation turn, and loop to step 1
//! 3. **If file changes**: apply them (agent mode) or hold them for review
//!    (co-pilot mode)
//! 4. **If a plan**: execute its steps one at a time, each waiting for an
//!    accept or discard decision
//!
//! The continuation chain is capped by `max_continuations`.

pub mod history;
pub mod plan;
pub mod session;
pub mod tool_coordinator;

pub use history::{DEFAULT_HISTORY_WINDOW, window_history};
pub use plan::{PlanExecutor, PlanProgress, PlanState};
pub use session::{
    DEFAULT_MAX_CONTINUATIONS, DEFAULT_SYSTEM_PROMPT, Session, SessionCanceller, SessionConfig,
    TurnOutcome, TurnState,
};
pub use tool_coordinator::{BatchState, ContinuationPayload, ToolBatch, ToolCoordinator, ToolResultEntry};
