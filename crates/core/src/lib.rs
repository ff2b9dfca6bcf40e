//! # PocketCode Core
//!
//! Domain types, traits, and error definitions for the PocketCode assistant.
//! This crate defines the model every other crate implements against: the
//! provider streaming contract, the response parser, tools, the chat surface
//! and the file applier.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. Implementations live in their
//! respective crates, which keeps the dependency graph pointing inward and
//! lets tests swap in scripted providers and in-memory surfaces.

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod parser;
pub mod provider;
pub mod response;
pub mod stream;
pub mod surface;
pub mod tool;
pub mod workspace;

// Re-export key types at crate root for ergonomics
pub use agent::AgentMode;
pub use error::{ApplyError, Error, ErrorClass, PlanError, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, Origin, Role};
pub use parser::parse_response;
pub use provider::{ModelInfo, ProviderClient};
pub use response::{ActionKind, FileChangeProposal, FileOperation, ParsedResponse, PlanStep, StepStatus};
pub use stream::{StreamEvent, StreamHandle, StreamRequest, StreamSink, Usage, stream_channel};
pub use surface::{ChatSurface, DisplayKind, DisplayMessage, MessageLog};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolRegistry, ToolStatus, ToolUsage};
pub use workspace::{ApplyOutcome, FileApplier};
