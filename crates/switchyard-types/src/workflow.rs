//! Workflow definitions and error policy.

use serde::{Deserialize, Serialize};

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub agent: String,
    /// Reference to the step input (a path into run state or a `{{template}}`).
    pub input: String,
    /// Key under which the step output is stored in run state.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl WorkflowStep {
    pub fn new(agent: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            input: input.into(),
            output: output.into(),
            condition: None,
            requires_approval: false,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// A named, optionally versioned sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            version: None,
            steps,
            error_policy: None,
        }
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// The declared policy, or the default one.
    pub fn effective_policy(&self) -> ErrorPolicy {
        self.error_policy.clone().unwrap_or_default()
    }

    /// Distinct agent names in first-use order.
    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.agent.as_str()) {
                names.push(&step.agent);
            }
        }
        names
    }
}

/// Fallback after tool-failure retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFallback {
    NotifyHuman,
    Skip,
    Abort,
}

/// Fallback after agent-failure retries are exhausted. There is no skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFallback {
    NotifyHuman,
    Abort,
}

/// What to do when a step would exceed the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimitAction {
    #[default]
    Pause,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailurePolicy {
    pub retry: u32,
    pub fallback: ToolFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailurePolicy {
    pub retry: u32,
    pub fallback: AgentFallback,
}

/// Per-workflow retry and fallback rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    pub on_tool_failure: ToolFailurePolicy,
    pub on_agent_failure: AgentFailurePolicy,
    pub budget_limit_action: BudgetLimitAction,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            on_tool_failure: ToolFailurePolicy {
                retry: 3,
                fallback: ToolFallback::NotifyHuman,
            },
            on_agent_failure: AgentFailurePolicy {
                retry: 1,
                fallback: AgentFallback::Abort,
            },
            budget_limit_action: BudgetLimitAction::Pause,
        }
    }
}

impl ErrorPolicy {
    pub fn with_tool_failure(mut self, retry: u32, fallback: ToolFallback) -> Self {
        self.on_tool_failure = ToolFailurePolicy { retry, fallback };
        self
    }

    pub fn with_agent_failure(mut self, retry: u32, fallback: AgentFallback) -> Self {
        self.on_agent_failure = AgentFailurePolicy { retry, fallback };
        self
    }

    pub fn with_budget_action(mut self, action: BudgetLimitAction) -> Self {
        self.budget_limit_action = action;
        self
    }
}
