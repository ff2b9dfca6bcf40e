//! Domain event system: decoupled observation of session activity.
//!
//! The session publishes events as it streams, runs tools and walks plans.
//! Observers (logging, the CLI status line, tests) subscribe without the
//! session knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorClass;
use crate::response::{ActionKind, StepStatus};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A streaming request was submitted to a provider
    StreamStarted {
        request_id: String,
        model: String,
        continuation_depth: u32,
        timestamp: DateTime<Utc>,
    },

    /// A stream completed and was parsed
    ResponseCompleted {
        request_id: String,
        action: ActionKind,
        is_valid: bool,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A plan step changed status
    PlanStepChanged {
        index: usize,
        status: StepStatus,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        class: ErrorClass,
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Short event name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamStarted { .. } => "stream_started",
            Self::ResponseCompleted { .. } => "response_completed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::PlanStepChanged { .. } => "plan_step_changed",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StreamStarted { timestamp, .. }
            | Self::ResponseCompleted { timestamp, .. }
            | Self::ToolExecuted { timestamp, .. }
            | Self::PlanStepChanged { timestamp, .. }
            | Self::ErrorOccurred { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of session events. Slow observers lag and lose the oldest
/// events; the session never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many observers received the event.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    pub fn observers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_event(name: &str) -> DomainEvent {
        DomainEvent::ToolExecuted {
            tool_name: name.into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn observers_see_events_in_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.observers(), 1);

        assert_eq!(bus.publish(tool_event("listFiles")), 1);
        bus.publish(DomainEvent::PlanStepChanged {
            index: 0,
            status: StepStatus::Accepted,
            timestamp: Utc::now(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "tool_executed");
        match first.as_ref() {
            DomainEvent::ToolExecuted { tool_name, .. } => assert_eq!(tool_name, "listFiles"),
            other => panic!("unexpected {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name(), "plan_step_changed");
        assert!(second.timestamp() >= first.timestamp());
    }

    #[test]
    fn publishing_without_observers_is_a_no_op() {
        let bus = EventBus::default();
        let delivered = bus.publish(DomainEvent::ErrorOccurred {
            class: ErrorClass::NetworkFailure,
            context: "stream".into(),
            error_message: "connection reset".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn slow_observer_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for name in ["a", "b", "c"] {
            bus.publish(tool_event(name));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().name(), "tool_executed");
    }
}
