//! The run engine: public entry points and per-run exclusivity.
//!
//! Every operation on a run takes that run's async mutex before touching its
//! record, so `execute`, `resume`, `pause` and `cancel` on the same run
//! serialize. The mutex is held only while a drive session is active; a run
//! suspended in WAITING_APPROVAL or PAUSED holds nothing. `pause` and
//! `cancel` signal the active session before queueing on the mutex so that
//! they are observed at the next step boundary or immediately, respectively.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use switchyard_types::{
    EventSink, ExecutionContext, OrchestratorEvent, PendingApproval, PendingKind, Run, RunPatch,
    RunResult, RunStatus, RunStore, StoreError,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::BudgetLedger;
use crate::config::EngineConfig;
use crate::driver;
use crate::error::{EngineError, Result};
use crate::invoker::AgentInvoker;

/// Signals shared between a run's active drive session and callers.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    pub(crate) lock: tokio::sync::Mutex<()>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pause: AtomicBool,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) invoker: Arc<dyn AgentInvoker>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) ledger: Arc<BudgetLedger>,
    pub(crate) config: EngineConfig,
    pub(crate) slots: Semaphore,
    controls: parking_lot::Mutex<HashMap<String, Arc<RunControl>>>,
}

impl EngineInner {
    fn control(&self, run_id: &str) -> Arc<RunControl> {
        Arc::clone(self.controls.lock().entry(run_id.to_string()).or_default())
    }

    /// Drop the control of a terminal run once `control` is its only user.
    /// A control that another operation still holds stays registered, so a
    /// run never has two locks.
    fn forget(&self, run: &Run, control: &Arc<RunControl>) {
        if !run.status.is_terminal() {
            return;
        }
        let mut controls = self.controls.lock();
        // Clones are only handed out under this mutex: the map and the caller.
        let unshared = controls
            .get(&run.id)
            .is_some_and(|current| Arc::ptr_eq(current, control) && Arc::strong_count(current) == 2);
        if unshared {
            controls.remove(&run.id);
        }
    }

    fn load(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        self.events.emit(event);
    }

    /// Persist the mutable part of `run`.
    pub(crate) fn persist(&self, run: &mut Run) -> Result<()> {
        *run = self.store.update_run(&run.id, RunPatch::from_run(run))?;
        Ok(())
    }

    /// Move `run` to `to`, persist it and report the transition.
    pub(crate) fn transition(
        &self,
        run: &mut Run,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let from = run.status;
        if from != to && !from.can_transition_to(to) {
            return Err(EngineError::invalid(&run.id, from, "transition"));
        }
        run.status = to;
        self.persist(run)?;

        if from != to {
            debug!(
                run_id = %run.id,
                %from,
                %to,
                reason = reason.as_deref().unwrap_or(""),
                "Run state transition"
            );
            self.emit(OrchestratorEvent::StateTransition {
                run_id: run.id.clone(),
                from,
                to,
                reason,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    pub(crate) fn finish_cancelled(&self, run: &mut Run) -> Result<()> {
        info!(
            run_id = %run.id,
            steps_completed = run.state.steps_completed(),
            "Run cancelled"
        );
        self.transition(run, RunStatus::Cancelled, Some("cancelled by request".into()))
    }
}

/// An operation on the engine, for hosts that drive it from a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Execute(Box<ExecutionContext>),
    Resume { run_id: String, input: Option<Value> },
    Pause { run_id: String },
    Cancel { run_id: String },
}

/// Drives runs through their workflow.
///
/// Cheap to clone; clones share stores, ledger, concurrency slots and run
/// controls.
#[derive(Clone)]
pub struct RunEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RunEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        invoker: Arc<dyn AgentInvoker>,
        events: Arc<dyn EventSink>,
        ledger: Arc<BudgetLedger>,
        config: EngineConfig,
    ) -> Self {
        let slots = Semaphore::new(config.max_concurrent_runs.max(1));
        Self {
            inner: Arc::new(EngineInner {
                store,
                invoker,
                events,
                ledger,
                config,
                slots,
                controls: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The ledger runs reserve their step costs against.
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.inner.ledger
    }

    /// Current record of a run.
    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.inner.load(run_id)
    }

    /// Validate `context`, create its run and drive it until it finishes or
    /// suspends.
    pub async fn execute(&self, context: ExecutionContext) -> Result<RunResult> {
        let run_id = context.run_id.clone();
        if let Err(violation) = context.validate() {
            warn!(run_id = %run_id, error = %violation, "Execution context rejected");
            self.inner.emit(OrchestratorEvent::ValidationFailed {
                run_id: run_id.clone(),
                reason: violation.to_string(),
                timestamp: Utc::now(),
            });
            return Err(EngineError::InvalidContext {
                run_id,
                reason: violation.to_string(),
            });
        }
        self.inner.emit(OrchestratorEvent::ValidationPassed {
            run_id: run_id.clone(),
            timestamp: Utc::now(),
        });

        // The lock is taken before the record exists, so no other operation
        // can act on the run between its creation and the first transition.
        let control = self.inner.control(&run_id);
        let _guard = control.lock.lock().await;

        let run = Run::new(context);
        self.inner.store.create_run(&run)?;
        info!(
            run_id = %run_id,
            project_id = %run.project_id,
            workflow = %run.workflow_id,
            steps = run.context.workflow.steps.len(),
            "Run created"
        );

        let run = driver::drive(&self.inner, &control, run, "run started").await?;
        self.inner.forget(&run, &control);
        Ok(run.result())
    }

    /// Continue a run suspended in WAITING_APPROVAL or PAUSED.
    ///
    /// For an approval gate, `input` (or `true`) is recorded as the step's
    /// approval and the step runs. For an escalated failure, `Some(input)`
    /// becomes the step's output while `None` retries the step with a fresh
    /// retry budget.
    pub async fn resume(&self, run_id: &str, input: Option<Value>) -> Result<RunResult> {
        let status = self.inner.load(run_id)?.status;
        if !status.is_suspended() {
            return Err(EngineError::invalid(run_id, status, "resume"));
        }

        let control = self.inner.control(run_id);
        let _guard = control.lock.lock().await;
        let mut run = self.inner.load(run_id)?;
        if !run.status.is_suspended() {
            return Err(EngineError::invalid(run_id, run.status, "resume"));
        }

        let reason = match run.status {
            RunStatus::WaitingApproval => apply_human_input(&mut run, input)?,
            _ => "resumed".to_string(),
        };
        info!(run_id, from = %run.status, reason = %reason, "Resuming run");

        let run = driver::drive(&self.inner, &control, run, &reason).await?;
        self.inner.forget(&run, &control);
        Ok(run.result())
    }

    /// Halt a RUNNING or RETRYING run before its next step.
    ///
    /// Returns once the run is PAUSED. If the run completes, fails or reaches
    /// an approval gate first, the pause is rejected.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        let status = self.inner.load(run_id)?.status;
        if !matches!(status, RunStatus::Running | RunStatus::Retrying) {
            return Err(EngineError::invalid(run_id, status, "pause"));
        }

        let control = self.inner.control(run_id);
        control.pause.store(true, Ordering::SeqCst);
        let _guard = control.lock.lock().await;
        control.pause.store(false, Ordering::SeqCst);
        // A session that started after the flag went up ignores it.

        let mut run = self.inner.load(run_id)?;
        match run.status {
            RunStatus::Paused => Ok(()),
            // Nothing is driving the run; pause it in place.
            RunStatus::Running | RunStatus::Retrying => {
                self.inner
                    .transition(&mut run, RunStatus::Paused, Some("pause requested".into()))
            }
            other => Err(EngineError::invalid(run_id, other, "pause")),
        }
    }

    /// Stop a run. An in-flight step is abandoned and its result discarded.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let status = self.inner.load(run_id)?.status;
        if status.is_terminal() {
            return Err(EngineError::invalid(run_id, status, "cancel"));
        }

        let control = self.inner.control(run_id);
        control.cancel.cancel();
        let _guard = control.lock.lock().await;

        let mut run = self.inner.load(run_id)?;
        let outcome = match run.status {
            RunStatus::Cancelled => Ok(()),
            other if other.is_terminal() => Err(EngineError::invalid(run_id, other, "cancel")),
            _ => self.inner.finish_cancelled(&mut run),
        };
        self.inner.forget(&run, &control);
        outcome
    }

    /// Apply a queued command.
    pub async fn handle(&self, command: EngineCommand) -> Result<Option<RunResult>> {
        match command {
            EngineCommand::Execute(context) => self.execute(*context).await.map(Some),
            EngineCommand::Resume { run_id, input } => self.resume(&run_id, input).await.map(Some),
            EngineCommand::Pause { run_id } => self.pause(&run_id).await.map(|()| None),
            EngineCommand::Cancel { run_id } => self.cancel(&run_id).await.map(|()| None),
        }
    }
}

/// Fold human input into a run waiting on a person. Returns the resume reason.
fn apply_human_input(run: &mut Run, input: Option<Value>) -> Result<String> {
    let Some(PendingApproval { step, kind }) = run.state.take_pending() else {
        return Ok("resumed".to_string());
    };

    match kind {
        PendingKind::Approval => {
            run.state.approve(step, input.unwrap_or(Value::Bool(true)));
            Ok(format!("step {step} approved"))
        }
        PendingKind::Escalation { .. } => match input {
            Some(output) => {
                let key = run
                    .context
                    .workflow
                    .steps
                    .get(step)
                    .map(|s| s.output.clone())
                    .ok_or_else(|| StoreError::Corrupt {
                        id: run.id.clone(),
                        reason: format!("pending step {step} is outside the workflow"),
                    })?;
                run.state.record_manual_output(&key, output);
                Ok(format!("step {step} resolved with human input"))
            }
            None => {
                run.state.reset_attempts();
                Ok(format!("step {step} retried after escalation"))
            }
        },
    }
}
