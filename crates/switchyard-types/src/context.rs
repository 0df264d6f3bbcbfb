//! The resolved execution context handed from assembly to the run engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agent::{ResolvedAgent, ToolDefinition};
use crate::project::{DomainRef, ProjectSnapshot};
use crate::trigger::AssemblyRequest;
use crate::workflow::{ErrorPolicy, WorkflowStep};

/// A fresh run identifier.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// The workflow as pinned into a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub steps: Vec<WorkflowStep>,
    pub error_policy: ErrorPolicy,
}

/// Everything a run needs, resolved once and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: String,
    pub trigger: AssemblyRequest,
    pub project: ProjectSnapshot,
    pub domain: DomainRef,
    pub workflow: WorkflowSnapshot,
    pub agents: BTreeMap<String, ResolvedAgent>,
    pub tools: BTreeMap<String, ToolDefinition>,
    pub assembled_at: DateTime<Utc>,
    #[serde(default)]
    pub assembly_warnings: Vec<String>,
}

/// A broken context invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextViolation {
    #[error("step {step} references agent '{agent}' which is not in the context")]
    MissingAgent { step: usize, agent: String },

    #[error("agent '{agent}' grants tool '{tool}' which is not in the context")]
    MissingTool { agent: String, tool: String },

    #[error("run id is empty")]
    EmptyRunId,
}

impl ExecutionContext {
    /// Check that every step agent and every agent tool is present.
    pub fn validate(&self) -> Result<(), ContextViolation> {
        if self.run_id.is_empty() {
            return Err(ContextViolation::EmptyRunId);
        }
        for (index, step) in self.workflow.steps.iter().enumerate() {
            if !self.agents.contains_key(&step.agent) {
                return Err(ContextViolation::MissingAgent {
                    step: index,
                    agent: step.agent.clone(),
                });
            }
        }
        for agent in self.agents.values() {
            if let Some(tool) = agent.tools.iter().find(|t| !self.tools.contains_key(*t)) {
                return Err(ContextViolation::MissingTool {
                    agent: agent.name.clone(),
                    tool: tool.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&ResolvedAgent> {
        self.agents.get(name)
    }
}
