//! The orchestrator's event vocabulary and fire-and-forget sinks.
//!
//! Events are observational: sinks must never fail into the orchestrator.
//! The [`ChannelSink`] feeds a tokio channel for tests and UIs; the
//! [`TracingSink`] turns events into structured log lines.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Everything the orchestrator reports about a run.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    TicketStart { ticket_id: String },
    TicketPlanGenerated { ticket_id: String, plan: String },
    TicketApproved { ticket_id: String },
    TicketRejected { ticket_id: String, reason: Option<String> },
    TicketExecuting { ticket_id: String },
    TicketCompleted { ticket_id: String, cost_usd: Option<f64> },
    TicketFailed { ticket_id: String, error: String },
    TicketSkipped { ticket_id: String, reason: String },
    TicketOutput { ticket_id: String, chunk: String },
    TicketEvent { ticket_id: String, payload: serde_json::Value },
    Question { ticket_id: String, question_id: String, text: String },
    QueueStart { total: usize },
    QueueComplete { completed: usize, failed: usize, skipped: usize },
    QueuePaused,
    Error { message: String },
}

impl OrchestratorEvent {
    /// The wire name of this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TicketStart { .. } => "ticket:start",
            Self::TicketPlanGenerated { .. } => "ticket:plan-generated",
            Self::TicketApproved { .. } => "ticket:approved",
            Self::TicketRejected { .. } => "ticket:rejected",
            Self::TicketExecuting { .. } => "ticket:executing",
            Self::TicketCompleted { .. } => "ticket:completed",
            Self::TicketFailed { .. } => "ticket:failed",
            Self::TicketSkipped { .. } => "ticket:skipped",
            Self::TicketOutput { .. } => "ticket:output",
            Self::TicketEvent { .. } => "ticket:event",
            Self::Question { .. } => "question",
            Self::QueueStart { .. } => "queue:start",
            Self::QueueComplete { .. } => "queue:complete",
            Self::QueuePaused => "queue:paused",
            Self::Error { .. } => "error",
        }
    }

    /// The ticket this event concerns, when it concerns one.
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            Self::TicketStart { ticket_id }
            | Self::TicketPlanGenerated { ticket_id, .. }
            | Self::TicketApproved { ticket_id }
            | Self::TicketRejected { ticket_id, .. }
            | Self::TicketExecuting { ticket_id }
            | Self::TicketCompleted { ticket_id, .. }
            | Self::TicketFailed { ticket_id, .. }
            | Self::TicketSkipped { ticket_id, .. }
            | Self::TicketOutput { ticket_id, .. }
            | Self::TicketEvent { ticket_id, .. }
            | Self::Question { ticket_id, .. } => Some(ticket_id),
            _ => None,
        }
    }
}

/// Fire-and-forget event observer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Forwards events into an unbounded channel. Send failures (receiver
/// dropped) are ignored.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }
}

/// Logs every event through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: OrchestratorEvent) {
        match &event {
            OrchestratorEvent::Error { message } => {
                tracing::error!(event = event.name(), message = %message, "orchestrator event");
            }
            OrchestratorEvent::TicketFailed { ticket_id, error } => {
                tracing::warn!(
                    event = event.name(),
                    ticket_id = %ticket_id,
                    error = %error,
                    "orchestrator event"
                );
            }
            OrchestratorEvent::TicketOutput { .. } | OrchestratorEvent::TicketEvent { .. } => {
                // High-volume stream events stay at debug.
                tracing::debug!(event = event.name(), ticket_id = ?event.ticket_id(), "orchestrator event");
            }
            _ => {
                tracing::info!(event = event.name(), ticket_id = ?event.ticket_id(), "orchestrator event");
            }
        }
    }
}

/// Broadcasts each event to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: OrchestratorEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_vocabulary() {
        let cases: Vec<(OrchestratorEvent, &str)> = vec![
            (
                OrchestratorEvent::TicketStart { ticket_id: "T1".into() },
                "ticket:start",
            ),
            (
                OrchestratorEvent::TicketPlanGenerated {
                    ticket_id: "T1".into(),
                    plan: "p".into(),
                },
                "ticket:plan-generated",
            ),
            (OrchestratorEvent::QueuePaused, "queue:paused"),
            (
                OrchestratorEvent::QueueComplete { completed: 1, failed: 0, skipped: 0 },
                "queue:complete",
            ),
            (
                OrchestratorEvent::Error { message: "boom".into() },
                "error",
            ),
        ];
        for (event, name) in cases {
            assert_eq!(event.name(), name);
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(OrchestratorEvent::QueueStart { total: 2 });
        sink.emit(OrchestratorEvent::TicketStart { ticket_id: "T1".into() });
        assert_eq!(rx.recv().await.unwrap().name(), "queue:start");
        assert_eq!(rx.recv().await.unwrap().name(), "ticket:start");
    }

    #[tokio::test]
    async fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic.
        sink.emit(OrchestratorEvent::QueuePaused);
    }
}
