//! Projects, domains and connector bindings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::money::Usd;

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
}

/// Configured spending caps for a project. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_usd: Option<Usd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_run_usd: Option<Usd>,
}

/// A project row as held by the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub status: ProjectStatus,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_version: Option<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Free-form project data exposed to workflows under `project`.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Agents for which this project declares an overlay.
    #[serde(default)]
    pub overlays: Vec<String>,
}

impl ProjectRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            status: ProjectStatus::Active,
            domain: domain.into(),
            domain_version: None,
            budget: BudgetConfig::default(),
            context: Map::new(),
            overlays: Vec::new(),
        }
    }

    pub fn with_domain_version(mut self, version: impl Into<String>) -> Self {
        self.domain_version = Some(version.into());
        self
    }

    pub fn with_budget(mut self, monthly_usd: Option<Usd>, per_run_usd: Option<Usd>) -> Self {
        self.budget = BudgetConfig {
            monthly_usd,
            per_run_usd,
        };
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_overlay(mut self, agent: impl Into<String>) -> Self {
        self.overlays.push(agent.into());
        self
    }

    pub fn archived(mut self) -> Self {
        self.status = ProjectStatus::Archived;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ProjectStatus::Active
    }
}

/// The three budget figures captured at assembly time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub monthly_usd: Option<Usd>,
    pub per_run_usd: Option<Usd>,
    pub remaining_usd: Option<Usd>,
}

impl BudgetSnapshot {
    /// True when `spent + next` stays within both the per-run and remaining caps.
    pub fn allows(&self, spent: Usd, next: Usd) -> bool {
        let total = spent + next;
        self.per_run_usd.is_none_or(|cap| total <= cap)
            && self.remaining_usd.is_none_or(|cap| total <= cap)
    }
}

/// Project data embedded in an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub budget: BudgetSnapshot,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A versioned domain definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDefinition {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_compatible_version: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_workflow: Option<String>,
}

impl DomainDefinition {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            min_compatible_version: None,
            deprecated: false,
            default_workflow: None,
        }
    }

    pub fn with_default_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.default_workflow = Some(workflow.into());
        self
    }

    pub fn with_min_compatible(mut self, version: impl Into<String>) -> Self {
        self.min_compatible_version = Some(version.into());
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// Identifies the resolved domain of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    pub id: String,
    pub version: String,
}

/// A schedule registered with the scheduler connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBinding {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}
