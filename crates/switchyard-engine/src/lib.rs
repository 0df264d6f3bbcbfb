//! Run engine for the Switchyard run orchestrator.
//!
//! Takes an assembled [`ExecutionContext`](switchyard_types::ExecutionContext)
//! and drives its workflow step by step through the run lifecycle:
//!
//! ```text
//! PENDING → RUNNING ⇄ RETRYING
//!              ↓ ↑        ↓
//!   WAITING_APPROVAL / PAUSED
//!              ↓
//!   COMPLETED | FAILED | CANCELLED | TIMED_OUT
//! ```
//!
//! Steps are handed to an [`AgentInvoker`]; failures are retried with
//! exponential backoff and then handled by the workflow's error policy. Step
//! costs are reserved against a shared [`BudgetLedger`] before each step.
//! Runs are persisted through a [`RunStore`](switchyard_types::RunStore):
//! [`MemoryRunStore`] or [`SqliteRunStore`].

pub mod budget;
pub mod condition;
pub mod config;
mod driver;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod resolve;
pub mod retry;
pub mod store;

pub use budget::{BudgetDenied, BudgetLedger, Reservation};
pub use condition::{Condition, ConditionError};
pub use config::EngineConfig;
pub use engine::{EngineCommand, RunEngine};
pub use error::{EngineError, Result};
pub use invoker::{
    AgentInvoker, InvocationError, InvocationOutcome, InvocationRequest, MockInvoker, MockResponse,
};
pub use resolve::{ResolveError, Scope};
pub use retry::BackoffPolicy;
pub use store::{MemoryRunStore, SqliteRunStore, open_run_store};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use serde_json::{Map, Value};
    use switchyard_types::{
        AgentConfig, AssemblyRequest, BudgetSnapshot, DomainRef, ErrorPolicy, ExecutionContext,
        ProjectSnapshot, ResolvedAgent, WorkflowSnapshot, WorkflowStep, new_run_id,
    };

    /// A one-step context triggered through the API with `payload`.
    pub fn context(payload: Value) -> ExecutionContext {
        let agent = ResolvedAgent::from_core(&AgentConfig::new("classifier", "small"));
        ExecutionContext {
            run_id: new_run_id(),
            trigger: AssemblyRequest::api("p1", payload),
            project: ProjectSnapshot {
                id: "p1".into(),
                name: "Support".into(),
                owner: "ops".into(),
                budget: BudgetSnapshot::default(),
                context: Map::new(),
            },
            domain: DomainRef {
                id: "support".into(),
                version: "1.0".into(),
            },
            workflow: WorkflowSnapshot {
                id: "triage".into(),
                steps: vec![WorkflowStep::new("classifier", "trigger", "classification")],
                error_policy: ErrorPolicy::default(),
            },
            agents: BTreeMap::from([(agent.name.clone(), agent)]),
            tools: BTreeMap::new(),
            assembled_at: Utc::now(),
            assembly_warnings: Vec::new(),
        }
    }
}
