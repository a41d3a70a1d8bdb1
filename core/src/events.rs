//! Audit trail for tool invocations, guardrail verdicts, and router
//! decisions — every tool call is logged, and each router logs its
//! decision along with its reasoning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::Phase;

/// One audit-logged occurrence in a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Event {
    /// A tool call was made. `arguments`/`result` must already be redacted
    /// per the security guardrail rules before reaching this event.
    ToolInvocation {
        tool: String,
        operation: String,
        arguments: serde_json::Value,
        result: serde_json::Value,
        ok: bool,
    },
    /// A guardrail stage produced a verdict.
    GuardrailVerdict {
        guardrail: String,
        task_id: String,
        verdict: String,
        message: String,
    },
    /// A router decided the next phase.
    RouterDecision {
        phase: Phase,
        next_phase: Phase,
        reasoning: String,
    },
    /// Free-form diagnostic not covered by the other variants.
    Diagnostic { scope: String, message: String },
}

/// An [`Event`] with its emission timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub when: DateTime<Utc>,
    pub event: Event,
}

/// Broadcast-based event bus. Multiple subscribers (a CLI progress view, a
/// persistence sink, a test harness) can each drain their own receiver;
/// slow subscribers drop the oldest events rather than back-pressuring
/// emission.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TimestampedEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Silently drops it if there are no subscribers —
    /// an orchestrator run must never block or fail because nobody is
    /// watching its audit trail.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(TimestampedEvent {
            when: Utc::now(),
            event,
        });
    }

    pub fn diagnostic(&self, scope: impl Into<String>, message: impl Into<String>) {
        self.emit(Event::Diagnostic {
            scope: scope.into(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.diagnostic("test", "hello");
        let received = rx.recv().await.unwrap();
        assert!(matches!(received.event, Event::Diagnostic { .. }));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.diagnostic("test", "no one is listening");
    }
}
