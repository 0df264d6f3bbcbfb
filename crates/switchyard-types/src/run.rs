//! Runs, their lifecycle states and the typed per-run state store.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::money::Usd;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    WaitingApproval,
    Paused,
    Retrying,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Paused => "PAUSED",
            Self::Retrying => "RETRYING",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "WAITING_APPROVAL" => Self::WaitingApproval,
            "PAUSED" => Self::Paused,
            "RETRYING" => Self::Retrying,
            "CANCELLED" => Self::Cancelled,
            "TIMED_OUT" => Self::TimedOut,
            _ => return None,
        })
    }

    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// States in which a run sits idle until `resume`.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::WaitingApproval | Self::Paused)
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        if to == Cancelled {
            return true;
        }
        match self {
            Pending => matches!(to, Running),
            Running => matches!(
                to,
                Running | Completed | WaitingApproval | Retrying | Paused | Failed | TimedOut
            ),
            Retrying => matches!(to, Running | WaitingApproval | Failed | Paused | TimedOut),
            WaitingApproval | Paused => matches!(to, Running),
            Completed | Failed | Cancelled | TimedOut => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Why a run is waiting for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingKind {
    /// The step is gated by `requires_approval`.
    Approval,
    /// Retries were exhausted and the policy escalated to a human.
    Escalation { error: String },
}

/// A suspended step awaiting `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step: usize,
    #[serde(flatten)]
    pub kind: PendingKind,
}

/// Mutable progress of a run.
///
/// Step outputs are addressed by the step's declared output key; everything
/// else goes through the accessors below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    cursor: usize,
    steps_completed: u32,
    total_tokens: u64,
    total_cost_usd: Usd,
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
    /// Failed attempts of the step at `cursor`.
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    approvals: BTreeMap<usize, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<PendingApproval>,
    #[serde(default)]
    active_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_output: Option<Value>,
}

impl RunState {
    /// Index of the next step to execute.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn steps_completed(&self) -> u32 {
        self.steps_completed
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn total_cost(&self) -> Usd {
        self.total_cost_usd
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn last_output(&self) -> Option<&Value> {
        self.last_output.as_ref()
    }

    /// Record a successful step and move past it.
    pub fn record_success(&mut self, key: &str, output: Value, tokens: u64, cost: Usd) {
        self.steps_completed += 1;
        self.total_tokens += tokens;
        self.total_cost_usd += cost;
        self.write_output(key, output);
    }

    /// Record a step that did not run (false condition or skip fallback).
    pub fn record_skipped(&mut self, key: &str) {
        self.outputs.insert(key.to_string(), Value::Null);
        self.advance();
    }

    fn write_output(&mut self, key: &str, output: Value) {
        self.outputs.insert(key.to_string(), output.clone());
        self.last_output = Some(output);
        self.advance();
    }

    fn advance(&mut self) {
        self.cursor += 1;
        self.attempts = 0;
    }

    /// Failed attempts so far for the current step.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one more failed attempt and return the new total.
    pub fn bump_attempts(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    pub fn approval(&self, step: usize) -> Option<&Value> {
        self.approvals.get(&step)
    }

    pub fn approve(&mut self, step: usize, input: Value) {
        self.approvals.insert(step, input);
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    pub fn suspend(&mut self, step: usize, kind: PendingKind) {
        self.pending = Some(PendingApproval { step, kind });
    }

    pub fn take_pending(&mut self) -> Option<PendingApproval> {
        self.pending.take()
    }

    /// Use a human-supplied value as the output of the current step.
    pub fn record_manual_output(&mut self, key: &str, output: Value) {
        self.write_output(key, output);
    }

    /// Execution time accumulated across drive sessions.
    pub fn active(&self) -> Duration {
        Duration::from_millis(self.active_ms)
    }

    pub fn add_active(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.active_ms = self.active_ms.saturating_add(ms);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// The persisted record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub state: RunState,
    pub context: ExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// A fresh PENDING run for `context`.
    pub fn new(context: ExecutionContext) -> Self {
        let now = Utc::now();
        Self {
            id: context.run_id.clone(),
            project_id: context.project.id.clone(),
            workflow_id: context.workflow.id.clone(),
            status: RunStatus::Pending,
            state: RunState::default(),
            context,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn result(&self) -> RunResult {
        RunResult {
            run_id: self.id.clone(),
            status: self.status,
            output: self.state.last_output().cloned(),
            error: self.error.clone(),
            steps_completed: self.state.steps_completed(),
            total_tokens: self.state.total_tokens(),
            total_cost_usd: self.state.total_cost(),
        }
    }
}

/// A selective update of a stored run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub state: Option<RunState>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<String>>,
}

impl RunPatch {
    /// A patch carrying the full mutable part of `run`.
    pub fn from_run(run: &Run) -> Self {
        Self {
            status: Some(run.status),
            state: Some(run.state.clone()),
            error: Some(run.error.clone()),
        }
    }

    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply the patch in place and bump `updated_at`.
    pub fn apply(self, run: &mut Run, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(state) = self.state {
            run.state = state;
        }
        if let Some(error) = self.error {
            run.error = error;
        }
        run.updated_at = now;
    }
}

/// What callers of the engine see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps_completed: u32,
    pub total_tokens: u64,
    pub total_cost_usd: Usd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_value(RunStatus::WaitingApproval).unwrap(),
            json!("WAITING_APPROVAL")
        );
        assert_eq!(RunStatus::parse("TIMED_OUT"), Some(RunStatus::TimedOut));
        assert_eq!(RunStatus::parse("nope"), None);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(RunStatus::Running));
            assert!(!status.can_transition_to(RunStatus::Cancelled));
        }
    }

    #[test]
    fn test_waiting_approval_only_resumes_or_cancels() {
        let from = RunStatus::WaitingApproval;
        assert!(from.can_transition_to(RunStatus::Running));
        assert!(from.can_transition_to(RunStatus::Cancelled));
        assert!(!from.can_transition_to(RunStatus::Paused));
        assert!(!from.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_retrying_transitions() {
        let from = RunStatus::Retrying;
        assert!(from.can_transition_to(RunStatus::Running));
        assert!(from.can_transition_to(RunStatus::WaitingApproval));
        assert!(from.can_transition_to(RunStatus::Failed));
        assert!(from.can_transition_to(RunStatus::TimedOut));
        assert!(!from.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_pending_only_starts() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_state_accounting() {
        let mut state = RunState::default();
        state.record_success("label", json!("billing"), 120, Usd::from_dollars(0.10));
        state.record_skipped("extra");
        state.record_success("reply", json!({"text": "ok"}), 80, Usd::from_dollars(0.20));

        assert_eq!(state.cursor(), 3);
        assert_eq!(state.steps_completed(), 2);
        assert_eq!(state.total_tokens(), 200);
        assert_eq!(state.total_cost(), Usd::from_dollars(0.30));
        assert_eq!(state.output("extra"), Some(&Value::Null));
        assert_eq!(state.last_output(), Some(&json!({"text": "ok"})));
    }

    #[test]
    fn test_attempts_reset_on_advance() {
        let mut state = RunState::default();
        assert_eq!(state.bump_attempts(), 1);
        assert_eq!(state.bump_attempts(), 2);
        state.record_skipped("x");
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn test_pending_serde_shape() {
        let mut state = RunState::default();
        state.suspend(
            1,
            PendingKind::Escalation {
                error: "tool down".into(),
            },
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["pending"]["step"], 1);
        assert_eq!(value["pending"]["kind"], "escalation");
        let back: RunState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_active_time_accumulates() {
        let mut state = RunState::default();
        state.add_active(Duration::from_millis(1500));
        state.add_active(Duration::from_millis(500));
        assert_eq!(state.active(), Duration::from_secs(2));
    }
}
