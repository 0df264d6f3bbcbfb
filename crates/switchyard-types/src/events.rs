//! Orchestrator telemetry events and sinks.
//!
//! Sinks are fire-and-forget: `emit` never blocks and never fails from the
//! caller's point of view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::money::Usd;
use crate::run::RunStatus;
use crate::trigger::AssemblyRequest;

/// Everything the core reports about assembly and run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    #[serde(rename = "orchestrator.context_assembled")]
    ContextAssembled {
        run_id: String,
        project_id: String,
        domain: String,
        agents: Vec<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.assembly_failed")]
    AssemblyFailed {
        code: String,
        reason: String,
        trigger: AssemblyRequest,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.validation_passed")]
    ValidationPassed {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.validation_failed")]
    ValidationFailed {
        run_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.step_started")]
    StepStarted {
        run_id: String,
        step: usize,
        agent: String,
        input: Value,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.step_completed")]
    StepCompleted {
        run_id: String,
        step: usize,
        agent: String,
        output: Value,
        duration_ms: u64,
        tokens: u64,
        cost_usd: Usd,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.step_skipped")]
    StepSkipped {
        run_id: String,
        step: usize,
        agent: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.step_retry")]
    StepRetry {
        run_id: String,
        step: usize,
        agent: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "orchestrator.state_transition")]
    StateTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "run.completed")]
    RunCompleted {
        run_id: String,
        total_cost_usd: Usd,
        total_duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "run.failed")]
    RunFailed {
        run_id: String,
        error: String,
        failed_step: usize,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContextAssembled { .. } => "orchestrator.context_assembled",
            Self::AssemblyFailed { .. } => "orchestrator.assembly_failed",
            Self::ValidationPassed { .. } => "orchestrator.validation_passed",
            Self::ValidationFailed { .. } => "orchestrator.validation_failed",
            Self::StepStarted { .. } => "orchestrator.step_started",
            Self::StepCompleted { .. } => "orchestrator.step_completed",
            Self::StepSkipped { .. } => "orchestrator.step_skipped",
            Self::StepRetry { .. } => "orchestrator.step_retry",
            Self::StateTransition { .. } => "orchestrator.state_transition",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
        }
    }

    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::AssemblyFailed { .. } => None,
            Self::ContextAssembled { run_id, .. }
            | Self::ValidationPassed { run_id, .. }
            | Self::ValidationFailed { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::StepRetry { run_id, .. }
            | Self::StateTransition { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => Some(run_id),
        }
    }
}

/// Receiver of orchestrator events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        let name = event.name();
        match &event {
            OrchestratorEvent::AssemblyFailed { code, reason, .. } => {
                tracing::warn!(event = name, code = %code, reason = %reason, "assembly failed");
            }
            OrchestratorEvent::ValidationFailed { run_id, reason, .. } => {
                tracing::warn!(event = name, run_id = %run_id, reason = %reason, "validation failed");
            }
            OrchestratorEvent::StepRetry {
                run_id,
                step,
                attempt,
                error,
                ..
            } => {
                tracing::warn!(event = name, run_id = %run_id, step, attempt, error = %error, "step retry");
            }
            OrchestratorEvent::StateTransition {
                run_id,
                from,
                to,
                reason,
                ..
            } => {
                tracing::info!(
                    event = name,
                    run_id = %run_id,
                    from = %from,
                    to = %to,
                    reason = reason.as_deref().unwrap_or(""),
                    "state transition"
                );
            }
            OrchestratorEvent::RunFailed { run_id, error, .. } => {
                tracing::error!(event = name, run_id = %run_id, error = %error, "run failed");
            }
            other => {
                tracing::debug!(event = name, run_id = other.run_id().unwrap_or(""), "orchestrator event");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Pushes events onto an unbounded channel. Events are dropped once the
/// receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().clone()
    }

    /// Wire names of recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }

    /// Recorded `(from, to)` pairs for one run.
    pub fn transitions(&self, run_id: &str) -> Vec<(RunStatus, RunStatus)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::StateTransition {
                    run_id: id,
                    from,
                    to,
                    ..
                } if id == run_id => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        self.events.lock().push(event);
    }
}

/// Sends each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(run_id: &str, from: RunStatus, to: RunStatus) -> OrchestratorEvent {
        OrchestratorEvent::StateTransition {
            run_id: run_id.into(),
            from,
            to,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_wire_tag() {
        let value = serde_json::to_value(transition("r1", RunStatus::Pending, RunStatus::Running)).unwrap();
        assert_eq!(value["type"], "orchestrator.state_transition");
        assert_eq!(value["from"], "PENDING");
        assert_eq!(value["to"], "RUNNING");
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn test_run_completed_name() {
        let event = OrchestratorEvent::RunCompleted {
            run_id: "r1".into(),
            total_cost_usd: Usd::from_dollars(0.3),
            total_duration_ms: 10,
            timestamp: Utc::now(),
        };
        assert_eq!(event.name(), "run.completed");
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "run.completed");
    }

    #[test]
    fn test_recording_sink_transitions() {
        let sink = RecordingEventSink::new();
        sink.emit(transition("r1", RunStatus::Pending, RunStatus::Running));
        sink.emit(transition("r2", RunStatus::Pending, RunStatus::Running));
        sink.emit(transition("r1", RunStatus::Running, RunStatus::Completed));
        assert_eq!(
            sink.transitions("r1"),
            vec![
                (RunStatus::Pending, RunStatus::Running),
                (RunStatus::Running, RunStatus::Completed)
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_and_survives_closed_receiver() {
        let (sink, mut rx) = ChannelEventSink::channel();
        sink.emit(transition("r1", RunStatus::Pending, RunStatus::Running));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id(), Some("r1"));

        drop(rx);
        sink.emit(transition("r1", RunStatus::Running, RunStatus::Completed));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingEventSink::new());
        let b = Arc::new(RecordingEventSink::new());
        let fanout = FanoutEventSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(NullEventSink));
        fanout.emit(transition("r1", RunStatus::Pending, RunStatus::Running));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
