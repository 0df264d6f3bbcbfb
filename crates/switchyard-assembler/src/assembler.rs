//! Context assembly: turning a trigger into an `ExecutionContext`.
//!
//! Resolution runs in a fixed order and stops at the first failure:
//!
//! ```text
//! project → domain/version → workflow → agents (+ overlays) → tools → budget
//! ```
//!
//! Assembly only reads from its collaborators, so a failed or abandoned
//! attempt can simply be retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use switchyard_types::{
    AssemblyRequest, BudgetSnapshot, ConfigStore, DomainDefinition, DomainRef, EventSink,
    ExecutionContext, OrchestratorEvent, ProjectRecord, ProjectSnapshot, ResolvedAgent,
    RunStore, ScheduleBinding, SpendTracker, StoreError, ToolDefinition, TriggerSource, Usd,
    WorkflowDefinition, WorkflowSnapshot, new_run_id, parse_domain_version,
};
use tracing::{debug, info, warn};

use crate::error::{AssemblerError, AssemblyError, AssemblyFailure, Result};
use crate::overlay;

/// Short-circuit reasons inside a single assembly attempt.
enum Abort {
    Failure(AssemblyFailure),
    Store(StoreError),
}

impl From<AssemblyFailure> for Abort {
    fn from(failure: AssemblyFailure) -> Self {
        Abort::Failure(failure)
    }
}

impl From<StoreError> for Abort {
    fn from(err: StoreError) -> Self {
        Abort::Store(err)
    }
}

type Attempt<T> = std::result::Result<T, Abort>;

/// Resolves triggers into execution contexts.
pub struct ContextAssembler {
    config: Arc<dyn ConfigStore>,
    runs: Arc<dyn RunStore>,
    spend: Arc<dyn SpendTracker>,
    events: Arc<dyn EventSink>,
}

impl ContextAssembler {
    /// `runs` is only read, to find the project of a chained parent run.
    pub fn new(
        config: Arc<dyn ConfigStore>,
        runs: Arc<dyn RunStore>,
        spend: Arc<dyn SpendTracker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            runs,
            spend,
            events,
        }
    }

    /// Resolve `request` into a fully validated execution context.
    ///
    /// Emits `orchestrator.context_assembled` on success and
    /// `orchestrator.assembly_failed` otherwise.
    pub fn assemble(&self, request: AssemblyRequest) -> Result<ExecutionContext> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        match self.build(&request, &mut warnings) {
            Ok(context) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                info!(
                    run_id = %context.run_id,
                    project_id = %context.project.id,
                    domain = %context.domain.id,
                    workflow = %context.workflow.id,
                    agents = context.agents.len(),
                    warnings = context.assembly_warnings.len(),
                    duration_ms,
                    "Context assembled"
                );
                self.events.emit(OrchestratorEvent::ContextAssembled {
                    run_id: context.run_id.clone(),
                    project_id: context.project.id.clone(),
                    domain: context.domain.id.clone(),
                    agents: context.agents.keys().cloned().collect(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(context)
            }
            Err(Abort::Failure(failure)) => {
                warn!(code = failure.code(), trigger = request.source.kind(), error = %failure, "Assembly rejected");
                self.emit_failed(failure.code(), failure.to_string(), &request);
                Err(AssemblyError::new(failure, request).into())
            }
            Err(Abort::Store(err)) => {
                warn!(trigger = request.source.kind(), error = %err, "Assembly hit a store failure");
                self.emit_failed("STORE_UNAVAILABLE", err.to_string(), &request);
                Err(AssemblerError::Infrastructure(err))
            }
        }
    }

    fn emit_failed(&self, code: &str, reason: String, request: &AssemblyRequest) {
        self.events.emit(OrchestratorEvent::AssemblyFailed {
            code: code.to_string(),
            reason,
            trigger: request.clone(),
            timestamp: Utc::now(),
        });
    }

    fn build(&self, request: &AssemblyRequest, warnings: &mut Vec<String>) -> Attempt<ExecutionContext> {
        let (project, schedule) = self.resolve_project(request)?;
        let (domain, domain_ref) = self.resolve_domain(request, &project, warnings)?;
        let (workflow_id, workflow) =
            self.resolve_workflow(request, schedule.as_ref(), &domain, &domain_ref)?;
        let agents = self.resolve_agents(&workflow, &project, &domain_ref.id, warnings)?;
        let tools = self.resolve_tools(&agents, warnings)?;
        let budget = self.snapshot_budget(&project)?;

        for warning in warnings.iter() {
            warn!(project_id = %project.id, warning = %warning, "Assembly warning");
        }

        Ok(ExecutionContext {
            run_id: new_run_id(),
            trigger: request.clone(),
            project: ProjectSnapshot {
                id: project.id,
                name: project.name,
                owner: project.owner,
                budget,
                context: project.context,
            },
            domain: domain_ref,
            workflow: WorkflowSnapshot {
                id: workflow_id,
                error_policy: workflow.effective_policy(),
                steps: workflow.steps,
            },
            agents,
            tools,
            assembled_at: Utc::now(),
            assembly_warnings: warnings.clone(),
        })
    }

    // ── 1. Project ──────────────────────────────────────────────────────

    fn resolve_project(
        &self,
        request: &AssemblyRequest,
    ) -> Attempt<(ProjectRecord, Option<ScheduleBinding>)> {
        let mut schedule = None;
        let project_id = match (&request.project_id, &request.source) {
            (Some(id), _) => id.clone(),
            (None, TriggerSource::Api { project_id, .. }) => project_id.clone(),
            (None, TriggerSource::Discord { channel_id, .. }) => self
                .config
                .project_for_channel(channel_id)?
                .ok_or_else(|| not_found(format!("channel:{channel_id}")))?,
            (None, TriggerSource::Schedule { schedule_id }) => {
                let binding = self
                    .config
                    .get_schedule(schedule_id)?
                    .ok_or_else(|| not_found(format!("schedule:{schedule_id}")))?;
                let id = binding.project_id.clone();
                schedule = Some(binding);
                id
            }
            (None, TriggerSource::Chain { parent_run_id, .. }) => self
                .runs
                .get_run(parent_run_id)?
                .map(|run| run.project_id)
                .ok_or_else(|| not_found(format!("run:{parent_run_id}")))?,
        };

        // An explicit project still honours a schedule's bound workflow.
        if schedule.is_none()
            && let TriggerSource::Schedule { schedule_id } = &request.source
        {
            schedule = self.config.get_schedule(schedule_id)?;
        }

        let project = self
            .config
            .get_project(&project_id)?
            .filter(ProjectRecord::is_active)
            .ok_or_else(|| not_found(project_id.clone()))?;
        debug!(project_id = %project.id, trigger = request.source.kind(), "Resolved project");
        Ok((project, schedule))
    }

    // ── 2. Domain ───────────────────────────────────────────────────────

    fn resolve_domain(
        &self,
        request: &AssemblyRequest,
        project: &ProjectRecord,
        warnings: &mut Vec<String>,
    ) -> Attempt<(DomainDefinition, DomainRef)> {
        let (domain_id, requested) = match &request.domain_id {
            Some(id) => (id.clone(), request.domain_version.clone()),
            None => (
                project.domain.clone(),
                request
                    .domain_version
                    .clone()
                    .or_else(|| project.domain_version.clone()),
            ),
        };

        let version_missing = || AssemblyFailure::DomainVersionNotFound {
            domain: domain_id.clone(),
            version: requested.clone().unwrap_or_else(|| "current".to_string()),
        };

        let current = self
            .config
            .get_domain(&domain_id, None)?
            .ok_or_else(version_missing)?;
        let domain = match &requested {
            Some(version) => self
                .config
                .get_domain(&domain_id, Some(version))?
                .ok_or_else(version_missing)?,
            None => current.clone(),
        };

        let minimum = current
            .min_compatible_version
            .as_ref()
            .or(domain.min_compatible_version.as_ref());
        if let Some(minimum) = minimum {
            match (
                parse_domain_version(&domain.version),
                parse_domain_version(minimum),
            ) {
                (Some(have), Some(min)) if have < min => {
                    return Err(AssemblyFailure::DomainMinVersionViolation {
                        domain: domain_id,
                        requested: domain.version.clone(),
                        minimum: minimum.clone(),
                    }
                    .into());
                }
                (Some(_), Some(_)) => {}
                _ => warnings.push(format!(
                    "domain '{domain_id}': cannot compare version '{}' with minimum '{minimum}'",
                    domain.version
                )),
            }
        }

        if domain.deprecated {
            warnings.push(format!(
                "domain '{domain_id}' version {} is deprecated",
                domain.version
            ));
        }

        debug!(domain = %domain_id, version = %domain.version, "Resolved domain");
        let domain_ref = DomainRef {
            id: domain_id,
            version: domain.version.clone(),
        };
        Ok((domain, domain_ref))
    }

    // ── 3. Workflow ─────────────────────────────────────────────────────

    fn resolve_workflow(
        &self,
        request: &AssemblyRequest,
        schedule: Option<&ScheduleBinding>,
        domain: &DomainDefinition,
        domain_ref: &DomainRef,
    ) -> Attempt<(String, WorkflowDefinition)> {
        let workflow_id = request
            .workflow_id
            .clone()
            .or_else(|| schedule.and_then(|s| s.workflow_id.clone()))
            .or_else(|| domain.default_workflow.clone())
            .ok_or_else(|| AssemblyFailure::WorkflowNotFound {
                domain: domain_ref.id.clone(),
                workflow: "<default>".to_string(),
            })?;

        let workflow = self
            .config
            .get_workflow(&domain_ref.id, &workflow_id)?
            .ok_or_else(|| AssemblyFailure::WorkflowNotFound {
                domain: domain_ref.id.clone(),
                workflow: workflow_id.clone(),
            })?;
        debug!(workflow = %workflow_id, steps = workflow.steps.len(), "Resolved workflow");
        Ok((workflow_id, workflow))
    }

    // ── 4. Agents ───────────────────────────────────────────────────────

    fn resolve_agents(
        &self,
        workflow: &WorkflowDefinition,
        project: &ProjectRecord,
        domain_id: &str,
        warnings: &mut Vec<String>,
    ) -> Attempt<BTreeMap<String, ResolvedAgent>> {
        let mut agents = BTreeMap::new();
        for name in workflow.agent_names() {
            let core = self
                .config
                .get_agent(name)?
                .ok_or_else(|| AssemblyFailure::AgentNotFound {
                    agent: name.to_string(),
                })?;

            if !core.serves(domain_id) {
                return Err(AssemblyFailure::AgentOutOfScope {
                    agent: name.to_string(),
                    domain: domain_id.to_string(),
                }
                .into());
            }

            let overlay = self.config.get_agent_overlay(&project.id, name)?;
            if overlay.is_none() && project.overlays.iter().any(|o| o == name) {
                warnings.push(format!(
                    "project '{}' declares an overlay for agent '{name}' but none was found; using core definition",
                    project.id
                ));
            }

            let resolved = overlay::resolve(&core, overlay.as_ref())?;
            if !resolved.serves(domain_id) {
                return Err(AssemblyFailure::AgentOutOfScope {
                    agent: name.to_string(),
                    domain: domain_id.to_string(),
                }
                .into());
            }
            debug!(agent = name, overlay = resolved.overlay_applied, "Resolved agent");
            agents.insert(name.to_string(), resolved);
        }
        Ok(agents)
    }

    // ── 5. Tools ────────────────────────────────────────────────────────

    fn resolve_tools(
        &self,
        agents: &BTreeMap<String, ResolvedAgent>,
        warnings: &mut Vec<String>,
    ) -> Attempt<BTreeMap<String, ToolDefinition>> {
        let catalog = self.config.get_tool_catalog()?;
        let mut tools = BTreeMap::new();

        for agent in agents.values() {
            for grant in &agent.tool_grants {
                let tool = catalog
                    .get(&grant.name)
                    .ok_or_else(|| AssemblyFailure::ToolNotFound {
                        agent: agent.name.clone(),
                        tool: grant.name.clone(),
                    })?;
                if grant.is_conditional() {
                    warnings.push(format!(
                        "tool '{}' of agent '{}' is conditional ({}) and may not apply to every step",
                        grant.name,
                        agent.name,
                        grant.condition.as_deref().unwrap_or("no condition")
                    ));
                }
                tools.insert(grant.name.clone(), tool.clone());
            }
        }
        Ok(tools)
    }

    // ── 6. Budget ───────────────────────────────────────────────────────

    fn snapshot_budget(&self, project: &ProjectRecord) -> Attempt<BudgetSnapshot> {
        let spent = self.spend.spent_this_period(&project.id)?;
        let monthly = project.budget.monthly_usd;
        let per_run = project.budget.per_run_usd;
        let remaining = monthly.map(|cap| cap - spent);

        let exceeded = |reason: String| AssemblyFailure::BudgetExceeded {
            project_id: project.id.clone(),
            remaining_usd: remaining,
            per_run_usd: per_run,
            reason,
        };
        if let Some(remaining) = remaining
            && remaining <= Usd::ZERO
        {
            return Err(exceeded(format!("remaining monthly budget is {remaining}")).into());
        }
        if let Some(per_run) = per_run
            && per_run <= Usd::ZERO
        {
            return Err(exceeded(format!("per-run budget is {per_run}")).into());
        }

        Ok(BudgetSnapshot {
            monthly_usd: monthly,
            per_run_usd: per_run,
            remaining_usd: remaining,
        })
    }
}

fn not_found(project_id: String) -> AssemblyFailure {
    AssemblyFailure::ProjectNotFound { project_id }
}
