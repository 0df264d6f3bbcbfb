//! Shared types for the Switchyard run orchestrator.
//!
//! Holds the data model passed between the context assembler and the run
//! engine, and the contracts of the collaborators both depend on: config and
//! run stores, spend tracking and the event sink.

pub mod agent;
pub mod context;
pub mod error;
pub mod events;
pub mod money;
pub mod project;
pub mod run;
pub mod store;
pub mod trigger;
pub mod version;
pub mod workflow;

pub use agent::{AgentCapabilities, AgentConfig, OverlayConfig, ResolvedAgent, ToolDefinition, ToolGrant};
pub use context::{ContextViolation, ExecutionContext, WorkflowSnapshot, new_run_id};
pub use error::{StoreError, StoreResult};
pub use events::{
    ChannelEventSink, EventSink, FanoutEventSink, NullEventSink, OrchestratorEvent,
    RecordingEventSink, TracingEventSink,
};
pub use money::Usd;
pub use project::{
    BudgetConfig, BudgetSnapshot, DomainDefinition, DomainRef, ProjectRecord, ProjectSnapshot,
    ProjectStatus, ScheduleBinding,
};
pub use run::{PendingApproval, PendingKind, Run, RunPatch, RunResult, RunState, RunStatus};
pub use store::{ConfigStore, NoSpend, RunStore, SpendTracker};
pub use trigger::{AssemblyRequest, TriggerSource};
pub use version::{parse_domain_version, versions_equal};
pub use workflow::{
    AgentFailurePolicy, AgentFallback, BudgetLimitAction, ErrorPolicy, ToolFailurePolicy,
    ToolFallback, WorkflowDefinition, WorkflowStep,
};
