//! One drive session: the step loop of a run.
//!
//! A session starts when `execute` or `resume` moves a run to RUNNING and
//! ends when the run completes, fails, times out, is cancelled or suspends.
//! State is persisted after every step and on every transition, so a later
//! session picks up exactly at the step cursor.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use switchyard_types::{
    AgentFallback, BudgetLimitAction, OrchestratorEvent, PendingKind, ResolvedAgent, Run,
    RunStatus, ToolDefinition, ToolFallback, Usd, WorkflowStep,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::budget::Reservation;
use crate::condition;
use crate::engine::{EngineInner, RunControl};
use crate::error::{EngineError, Result};
use crate::invoker::{InvocationError, InvocationRequest};
use crate::resolve::Scope;

/// Whether the loop continues with the next step.
enum Flow {
    Next,
    Halt,
}

/// External events that end a session mid-step.
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Drive `run` from its current state, entering RUNNING with `reason`.
pub(crate) async fn drive(
    inner: &EngineInner,
    control: &RunControl,
    mut run: Run,
    reason: &str,
) -> Result<Run> {
    // Pause requests only apply to the session they were raised against.
    control.pause.store(false, Ordering::SeqCst);

    let permit = tokio::select! {
        biased;
        _ = control.cancel.cancelled() => None,
        permit = inner.slots.acquire() => Some(permit.map_err(|_| EngineError::ShuttingDown)?),
    };
    let Some(_permit) = permit else {
        inner.finish_cancelled(&mut run)?;
        return Ok(run);
    };

    let now = Instant::now();
    let allowance = inner.config.run_timeout.saturating_sub(run.state.active());
    let mut session = Session {
        inner,
        control,
        run,
        mark: now,
        deadline: now.checked_add(allowance).unwrap_or_else(|| far_future(now)),
    };
    session.transition(RunStatus::Running, Some(reason.to_string()))?;
    session.step_loop().await?;
    Ok(session.run)
}

/// Deadline used when the configured timeout does not fit in an `Instant`.
fn far_future(now: Instant) -> Instant {
    const THIRTY_YEARS: Duration = Duration::from_secs(86_400 * 365 * 30);
    now.checked_add(THIRTY_YEARS).unwrap_or(now)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct Session<'a> {
    inner: &'a EngineInner,
    control: &'a RunControl,
    run: Run,
    /// Start of the active time not yet added to the run state.
    mark: Instant,
    deadline: Instant,
}

impl Session<'_> {
    async fn step_loop(&mut self) -> Result<()> {
        while self.run.status == RunStatus::Running {
            if self.control.cancel.is_cancelled() {
                return self.interrupted(Interrupt::Cancelled);
            }
            if Instant::now() >= self.deadline {
                return self.interrupted(Interrupt::TimedOut);
            }

            let index = self.run.state.cursor();
            let Some(step) = self.run.context.workflow.steps.get(index).cloned() else {
                return self.complete();
            };

            if self.control.pause.swap(false, Ordering::SeqCst) {
                return self.transition(RunStatus::Paused, Some("pause requested".into()));
            }

            if let Flow::Halt = self.run_step(index, &step).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, index: usize, step: &WorkflowStep) -> Result<Flow> {
        let scope = Scope::for_step(&self.run.context, &self.run.state);

        if let Some(source) = &step.condition {
            match condition::evaluate(source, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    self.skip(index, step, format!("condition '{source}' is false"))?;
                    return Ok(Flow::Next);
                }
                Err(err) => {
                    self.fail(index, format!("step {index} ({}): {err}", step.agent))?;
                    return Ok(Flow::Halt);
                }
            }
        }

        if step.requires_approval && self.run.state.approval(index).is_none() {
            info!(run_id = %self.run.id, step = index, agent = %step.agent, "Step awaiting approval");
            self.run.state.suspend(index, PendingKind::Approval);
            self.transition(
                RunStatus::WaitingApproval,
                Some(format!("step {index} requires approval")),
            )?;
            return Ok(Flow::Halt);
        }

        let input = match scope.resolve_input(&step.input) {
            Ok(input) => input,
            Err(err) => {
                self.fail(index, format!("step {index} ({}): {err}", step.agent))?;
                return Ok(Flow::Halt);
            }
        };
        let Some(agent) = self.run.context.agent(&step.agent).cloned() else {
            self.fail(
                index,
                format!("step {index}: agent '{}' is not in the context", step.agent),
            )?;
            return Ok(Flow::Halt);
        };
        let tools = self.granted_tools(&agent, &scope);

        let inner = self.inner;
        let control = self.control;
        let estimate = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::TimedOut),
            estimate = inner.invoker.estimate_cost(&agent, &input) => Ok(estimate),
        };
        let estimate = match estimate {
            Ok(estimate) => estimate,
            Err(interrupt) => {
                self.interrupted(interrupt)?;
                return Ok(Flow::Halt);
            }
        };
        let reservation = match self.reserve(estimate) {
            Ok(reservation) => reservation,
            Err(reason) => return self.budget_exceeded(index, reason),
        };

        self.attempt(index, step, agent, input, tools, reservation)
            .await
    }

    /// Invoke the step until it succeeds or its retries run out.
    async fn attempt(
        &mut self,
        index: usize,
        step: &WorkflowStep,
        agent: ResolvedAgent,
        input: Value,
        tools: Vec<ToolDefinition>,
        reservation: Reservation,
    ) -> Result<Flow> {
        let inner = self.inner;
        let control = self.control;
        let approval = self.run.state.approval(index).cloned();

        loop {
            let attempt = self.run.state.attempts() + 1;
            self.emit(OrchestratorEvent::StepStarted {
                run_id: self.run.id.clone(),
                step: index,
                agent: agent.name.clone(),
                input: input.clone(),
                attempt,
                timestamp: Utc::now(),
            });
            debug!(run_id = %self.run.id, step = index, agent = %agent.name, attempt, "Invoking agent");

            let request = InvocationRequest {
                run_id: self.run.id.clone(),
                step: index,
                attempt,
                agent: agent.clone(),
                input: input.clone(),
                tools: tools.clone(),
                approval: approval.clone(),
            };
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::TimedOut),
                result = inner.invoker.invoke(request) => Ok(result),
            };
            let result = match result {
                Ok(result) => result,
                Err(interrupt) => {
                    drop(reservation);
                    self.interrupted(interrupt)?;
                    return Ok(Flow::Halt);
                }
            };

            let err = match result {
                Ok(outcome) => {
                    reservation.commit(outcome.cost);
                    let duration_ms = millis(started.elapsed());
                    self.run.state.record_success(
                        &step.output,
                        outcome.output.clone(),
                        outcome.tokens,
                        outcome.cost,
                    );
                    info!(
                        run_id = %self.run.id,
                        step = index,
                        agent = %agent.name,
                        tokens = outcome.tokens,
                        cost = %outcome.cost,
                        duration_ms,
                        "Step completed"
                    );
                    self.emit(OrchestratorEvent::StepCompleted {
                        run_id: self.run.id.clone(),
                        step: index,
                        agent: agent.name.clone(),
                        output: outcome.output,
                        duration_ms,
                        tokens: outcome.tokens,
                        cost_usd: outcome.cost,
                        timestamp: Utc::now(),
                    });
                    self.back_to_running("retry succeeded")?;
                    return Ok(Flow::Next);
                }
                Err(err) => err,
            };

            let failures = self.run.state.bump_attempts();
            let policy = &self.run.context.workflow.error_policy;
            let max_retries = if err.is_tool_failure() {
                policy.on_tool_failure.retry
            } else {
                policy.on_agent_failure.retry
            };

            if failures > max_retries {
                drop(reservation);
                return self.exhausted(index, step, &agent, err, failures);
            }

            let backoff = inner.config.backoff.delay(failures);
            let backoff_ms = millis(backoff);
            warn!(
                run_id = %self.run.id,
                step = index,
                agent = %agent.name,
                attempt = failures,
                max_retries,
                backoff_ms,
                error = %err,
                "Step failed, retrying"
            );
            self.emit(OrchestratorEvent::StepRetry {
                run_id: self.run.id.clone(),
                step: index,
                agent: agent.name.clone(),
                attempt: failures,
                delay_ms: backoff_ms,
                error: err.to_string(),
                timestamp: Utc::now(),
            });
            if self.run.status == RunStatus::Running {
                self.transition(RunStatus::Retrying, Some(err.to_string()))?;
            } else {
                self.persist()?;
            }

            let waited = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::TimedOut),
                _ = tokio::time::sleep(backoff) => Ok(()),
            };
            if let Err(interrupt) = waited {
                drop(reservation);
                self.interrupted(interrupt)?;
                return Ok(Flow::Halt);
            }
            if control.pause.swap(false, Ordering::SeqCst) {
                drop(reservation);
                self.transition(RunStatus::Paused, Some("pause requested".into()))?;
                return Ok(Flow::Halt);
            }
        }
    }

    /// Apply the workflow's fallback once a step has no retries left.
    fn exhausted(
        &mut self,
        index: usize,
        step: &WorkflowStep,
        agent: &ResolvedAgent,
        err: InvocationError,
        failures: u32,
    ) -> Result<Flow> {
        let message = format!(
            "step {index} ({}) failed after {failures} attempt(s): {err}",
            agent.name
        );
        let policy = self.run.context.workflow.error_policy.clone();

        match &err {
            InvocationError::Tool { .. } => match policy.on_tool_failure.fallback {
                ToolFallback::NotifyHuman => self.escalate(index, message),
                ToolFallback::Skip => {
                    self.skip(index, step, message)?;
                    Ok(Flow::Next)
                }
                ToolFallback::Abort => {
                    self.fail(index, message)?;
                    Ok(Flow::Halt)
                }
            },
            InvocationError::Agent { .. } => match policy.on_agent_failure.fallback {
                AgentFallback::NotifyHuman => self.escalate(index, message),
                AgentFallback::Abort => {
                    self.fail(index, message)?;
                    Ok(Flow::Halt)
                }
            },
        }
    }

    fn escalate(&mut self, index: usize, message: String) -> Result<Flow> {
        warn!(run_id = %self.run.id, step = index, error = %message, "Escalating to a human");
        self.run.state.suspend(
            index,
            PendingKind::Escalation {
                error: message.clone(),
            },
        );
        self.transition(RunStatus::WaitingApproval, Some(message))?;
        Ok(Flow::Halt)
    }

    fn skip(&mut self, index: usize, step: &WorkflowStep, reason: String) -> Result<()> {
        debug!(run_id = %self.run.id, step = index, agent = %step.agent, reason = %reason, "Step skipped");
        self.run.state.record_skipped(&step.output);
        self.emit(OrchestratorEvent::StepSkipped {
            run_id: self.run.id.clone(),
            step: index,
            agent: step.agent.clone(),
            reason,
            timestamp: Utc::now(),
        });
        self.back_to_running("step skipped")
    }

    /// Persist progress, leaving RETRYING if a retry was in flight.
    fn back_to_running(&mut self, reason: &str) -> Result<()> {
        if self.run.status == RunStatus::Retrying {
            self.transition(RunStatus::Running, Some(reason.to_string()))
        } else {
            self.persist()
        }
    }

    // ── Budget ──────────────────────────────────────────────────────

    /// Check the run's caps and hold `estimate` against the project's month.
    fn reserve(&self, estimate: Usd) -> std::result::Result<Reservation, String> {
        let budget = &self.run.context.project.budget;
        let spent = self.run.state.total_cost();
        if !budget.allows(spent, estimate) {
            return Err(format!(
                "run has spent {spent} and the next step is estimated at {estimate} (per run cap {}, remaining at assembly {})",
                cap(budget.per_run_usd),
                cap(budget.remaining_usd)
            ));
        }
        self.inner
            .ledger
            .reserve(&self.run.project_id, budget.monthly_usd, estimate)
            .map_err(|denied| denied.to_string())
    }

    fn budget_exceeded(&mut self, index: usize, reason: String) -> Result<Flow> {
        warn!(run_id = %self.run.id, step = index, reason = %reason, "Budget limit reached");
        let action = self.run.context.workflow.error_policy.budget_limit_action;
        match action {
            BudgetLimitAction::Pause => {
                self.transition(RunStatus::Paused, Some(format!("budget limit: {reason}")))?
            }
            BudgetLimitAction::Abort => self.fail(index, format!("budget limit: {reason}"))?,
        }
        Ok(Flow::Halt)
    }

    // ── Tools ───────────────────────────────────────────────────────

    /// Tools the agent may use for this step. Conditional grants are
    /// evaluated against the step's scope; a malformed condition withholds
    /// the tool.
    fn granted_tools(&self, agent: &ResolvedAgent, scope: &Scope) -> Vec<ToolDefinition> {
        agent
            .tool_grants
            .iter()
            .filter(|grant| match (&grant.condition, grant.always) {
                (_, true) | (None, _) => true,
                (Some(source), false) => condition::evaluate(source, scope).unwrap_or_else(|err| {
                    warn!(agent = %agent.name, tool = %grant.name, error = %err, "Tool condition withheld tool");
                    false
                }),
            })
            .filter_map(|grant| self.run.context.tools.get(&grant.name).cloned())
            .collect()
    }

    // ── Endings ─────────────────────────────────────────────────────

    fn complete(&mut self) -> Result<()> {
        self.transition(RunStatus::Completed, None)?;
        let total_duration_ms = millis(self.run.state.active());
        info!(
            run_id = %self.run.id,
            steps_completed = self.run.state.steps_completed(),
            total_cost = %self.run.state.total_cost(),
            total_duration_ms,
            "Run completed"
        );
        self.emit(OrchestratorEvent::RunCompleted {
            run_id: self.run.id.clone(),
            total_cost_usd: self.run.state.total_cost(),
            total_duration_ms,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn fail(&mut self, index: usize, message: String) -> Result<()> {
        error!(run_id = %self.run.id, step = index, error = %message, "Run failed");
        self.run.error = Some(message.clone());
        self.transition(RunStatus::Failed, Some(message.clone()))?;
        self.emit(OrchestratorEvent::RunFailed {
            run_id: self.run.id.clone(),
            error: message,
            failed_step: index,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn interrupted(&mut self, interrupt: Interrupt) -> Result<()> {
        self.account();
        match interrupt {
            Interrupt::Cancelled => self.inner.finish_cancelled(&mut self.run),
            Interrupt::TimedOut => {
                let limit = self.inner.config.run_timeout;
                let message = format!("run exceeded its active time limit of {limit:?}");
                warn!(run_id = %self.run.id, step = self.run.state.cursor(), "Run timed out");
                self.run.error = Some(message.clone());
                self.transition(RunStatus::TimedOut, Some(message))
            }
        }
    }

    // ── Plumbing ────────────────────────────────────────────────────

    /// Add the active time since the last mark to the run state.
    fn account(&mut self) {
        let now = Instant::now();
        self.run.state.add_active(now.duration_since(self.mark));
        self.mark = now;
    }

    fn persist(&mut self) -> Result<()> {
        self.account();
        self.inner.persist(&mut self.run)
    }

    fn transition(&mut self, to: RunStatus, reason: Option<String>) -> Result<()> {
        self.account();
        self.inner.transition(&mut self.run, to, reason)
    }

    fn emit(&self, event: OrchestratorEvent) {
        self.inner.emit(event);
    }
}

fn cap(amount: Option<Usd>) -> String {
    amount.map_or_else(|| "none".to_string(), |a| a.to_string())
}
