//! Agent definitions, project overlays and the tool catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tool an agent may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolGrant {
    pub name: String,
    /// Expression over run state deciding whether the tool applies to a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub always: bool,
}

impl ToolGrant {
    pub fn always(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            always: true,
        }
    }

    pub fn when(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: Some(condition.into()),
            always: false,
        }
    }

    /// A grant that is not unconditionally available.
    pub fn is_conditional(&self) -> bool {
        !self.always
    }
}

/// Capability declaration of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub tools: Vec<ToolGrant>,
}

/// A shared (core) agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub version: String,
    pub model: String,
    #[serde(default)]
    pub domain_scope: Vec<String>,
    #[serde(default)]
    pub input_schema: String,
    #[serde(default)]
    pub output_schema: String,
    #[serde(default)]
    pub prompt: String,
    /// Free-form behaviour parameters (temperature, tone, limits...).
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Fields a project overlay is allowed to change.
    #[serde(default)]
    pub overridable_fields: Vec<String>,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            model: model.into(),
            domain_scope: Vec::new(),
            input_schema: String::new(),
            output_schema: String::new(),
            prompt: String::new(),
            params: Map::new(),
            overridable_fields: Vec::new(),
            capabilities: AgentCapabilities::default(),
        }
    }

    pub fn with_scope(mut self, domain: impl Into<String>) -> Self {
        self.domain_scope.push(domain.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_overridable(mut self, field: impl Into<String>) -> Self {
        self.overridable_fields.push(field.into());
        self
    }

    pub fn with_tool(mut self, grant: ToolGrant) -> Self {
        self.capabilities.tools.push(grant);
        self
    }

    /// Whether this agent may serve the given domain.
    pub fn serves(&self, domain: &str) -> bool {
        in_scope(&self.domain_scope, domain)
    }
}

fn in_scope(scope: &[String], domain: &str) -> bool {
    scope.iter().any(|d| d == domain || d == "*")
}

/// A project-specific partial override of a core agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Name of the core agent being extended.
    pub extends: String,
    #[serde(default)]
    pub overrides: Map<String, Value>,
    /// Where the overlay was loaded from, recorded for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl OverlayConfig {
    pub fn new(extends: impl Into<String>) -> Self {
        Self {
            extends: extends.into(),
            overrides: Map::new(),
            source: None,
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(field.into(), value);
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A core agent merged with its optional project overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAgent {
    pub name: String,
    pub version: String,
    pub model: String,
    pub domain_scope: Vec<String>,
    pub input_schema: String,
    pub output_schema: String,
    pub prompt: String,
    /// Names of every tool the agent may use.
    pub tools: Vec<String>,
    /// The grants behind `tools`, kept for per-step condition checks.
    pub tool_grants: Vec<ToolGrant>,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub overlay_applied: bool,
    pub overlay_source: Option<String>,
}

impl ResolvedAgent {
    /// Build a resolved agent carrying the core definition unchanged.
    pub fn from_core(core: &AgentConfig) -> Self {
        Self {
            name: core.name.clone(),
            version: core.version.clone(),
            model: core.model.clone(),
            domain_scope: core.domain_scope.clone(),
            input_schema: core.input_schema.clone(),
            output_schema: core.output_schema.clone(),
            prompt: core.prompt.clone(),
            tools: core
                .capabilities
                .tools
                .iter()
                .map(|t| t.name.clone())
                .collect(),
            tool_grants: core.capabilities.tools.clone(),
            params: core.params.clone(),
            overlay_applied: false,
            overlay_source: None,
        }
    }

    /// Whether the (possibly overlaid) scope covers `domain`.
    pub fn serves(&self, domain: &str) -> bool {
        in_scope(&self.domain_scope, domain)
    }
}

/// A tool catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: Value::Null,
            output_schema: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
