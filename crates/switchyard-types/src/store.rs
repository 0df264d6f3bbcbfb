//! Contracts of the external stores the core reads from and writes to.
//!
//! ```text
//! ConfigStore (trait)   - read-only projects, domains, workflows, agents, tools
//!     └── MemoryConfigStore   (switchyard-assembler)
//! RunStore (trait)      - run rows owned by the engine
//!     └── MemoryRunStore      (switchyard-engine)
//!     └── SqliteRunStore      (switchyard-engine)
//! SpendTracker (trait)  - month-to-date spend per project
//!     └── BudgetLedger        (switchyard-engine)
//! ```
//!
//! All lookups follow return-or-not-found semantics: `Ok(None)` is a domain
//! miss, `Err` is an infrastructure failure.

use std::collections::BTreeMap;

use crate::agent::{AgentConfig, OverlayConfig, ToolDefinition};
use crate::error::StoreResult;
use crate::money::Usd;
use crate::project::{DomainDefinition, ProjectRecord, ScheduleBinding};
use crate::run::{Run, RunPatch};
use crate::workflow::WorkflowDefinition;

/// Read-only provider of configuration.
pub trait ConfigStore: Send + Sync {
    fn get_project(&self, id: &str) -> StoreResult<Option<ProjectRecord>>;

    /// Project bound to a chat channel.
    fn project_for_channel(&self, channel_id: &str) -> StoreResult<Option<String>>;

    fn get_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleBinding>>;

    /// A domain at `version`, or its current version when `None`.
    fn get_domain(&self, id: &str, version: Option<&str>) -> StoreResult<Option<DomainDefinition>>;

    fn get_workflow(&self, domain: &str, id: &str) -> StoreResult<Option<WorkflowDefinition>>;

    fn get_agent(&self, name: &str) -> StoreResult<Option<AgentConfig>>;

    fn get_agent_overlay(&self, project_id: &str, name: &str) -> StoreResult<Option<OverlayConfig>>;

    fn get_tool_catalog(&self) -> StoreResult<BTreeMap<String, ToolDefinition>>;
}

/// Persistence for runs.
///
/// Callers serialize access per run id; the store itself only guarantees
/// atomicity of individual calls.
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `Conflict` if the id exists.
    fn create_run(&self, run: &Run) -> StoreResult<()>;

    fn get_run(&self, id: &str) -> StoreResult<Option<Run>>;

    /// Apply `patch` and return the updated run. Fails with `Missing` for an
    /// unknown id.
    fn update_run(&self, id: &str, patch: RunPatch) -> StoreResult<Run>;
}

/// Month-to-date spend of a project.
pub trait SpendTracker: Send + Sync {
    fn spent_this_period(&self, project_id: &str) -> StoreResult<Usd>;
}

/// A tracker that reports no spend, for setups without a ledger.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpend;

impl SpendTracker for NoSpend {
    fn spent_this_period(&self, _project_id: &str) -> StoreResult<Usd> {
        Ok(Usd::ZERO)
    }
}
