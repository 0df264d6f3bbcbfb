//! Error types for context assembly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use switchyard_types::{AssemblyRequest, StoreError, Usd};
use thiserror::Error;

/// Result type for assembler operations.
pub type Result<T> = std::result::Result<T, AssemblerError>;

/// Why a request could not be turned into an execution context.
///
/// Terminal for the request; a caller may resubmit.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssemblyFailure {
    #[error("Project not found: {project_id}")]
    ProjectNotFound { project_id: String },

    #[error("Domain '{domain}' has no version '{version}'")]
    DomainVersionNotFound { domain: String, version: String },

    #[error("Domain '{domain}' requires at least version {minimum}, requested {requested}")]
    DomainMinVersionViolation {
        domain: String,
        requested: String,
        minimum: String,
    },

    #[error("Workflow '{workflow}' not found in domain '{domain}'")]
    WorkflowNotFound { domain: String, workflow: String },

    #[error("Agent not found: {agent}")]
    AgentNotFound { agent: String },

    #[error("Agent '{agent}' is not scoped to domain '{domain}'")]
    AgentOutOfScope { agent: String, domain: String },

    #[error("Overlay for agent '{agent}' overrides forbidden field '{field}'")]
    OverlayForbiddenField { agent: String, field: String },

    #[error("Overlay extends '{extends}' but was applied to agent '{agent}'")]
    OverlayExtendsMismatch { agent: String, extends: String },

    #[error("Overlay for agent '{agent}' sets '{field}' to an invalid value: {reason}")]
    OverlayInvalidValue {
        agent: String,
        field: String,
        reason: String,
    },

    #[error("Tool '{tool}' required by agent '{agent}' is not in the tool catalog")]
    ToolNotFound { agent: String, tool: String },

    #[error("Budget exceeded for project '{project_id}': {reason}")]
    BudgetExceeded {
        project_id: String,
        remaining_usd: Option<Usd>,
        per_run_usd: Option<Usd>,
        reason: String,
    },
}

impl AssemblyFailure {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProjectNotFound { .. } => "PROJECT_NOT_FOUND",
            Self::DomainVersionNotFound { .. } => "DOMAIN_VERSION_NOT_FOUND",
            Self::DomainMinVersionViolation { .. } => "DOMAIN_MIN_VERSION_VIOLATION",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            Self::AgentOutOfScope { .. } => "AGENT_OUT_OF_SCOPE",
            Self::OverlayForbiddenField { .. } => "OVERLAY_FORBIDDEN_FIELD",
            Self::OverlayExtendsMismatch { .. } => "OVERLAY_EXTENDS_MISMATCH",
            Self::OverlayInvalidValue { .. } => "OVERLAY_INVALID_VALUE",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
        }
    }
}

/// A failure together with the request that caused it.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {failure}", code = .failure.code())]
pub struct AssemblyError {
    pub failure: AssemblyFailure,
    pub trigger: AssemblyRequest,
    pub timestamp: DateTime<Utc>,
}

impl AssemblyError {
    pub fn new(failure: AssemblyFailure, trigger: AssemblyRequest) -> Self {
        Self {
            failure,
            trigger,
            timestamp: Utc::now(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.failure.code()
    }
}

/// Errors returned by the assembler.
#[derive(Debug, Error)]
pub enum AssemblerError {
    /// The request cannot be assembled as given.
    #[error(transparent)]
    Rejected(Box<AssemblyError>),

    /// A store could not be reached; the caller may retry.
    #[error("Infrastructure failure during assembly: {0}")]
    Infrastructure(#[from] StoreError),
}

impl AssemblerError {
    /// The domain failure, if this is one.
    pub fn rejection(&self) -> Option<&AssemblyError> {
        match self {
            Self::Rejected(err) => Some(err),
            Self::Infrastructure(_) => None,
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        self.rejection().map(AssemblyError::code)
    }
}

impl From<AssemblyError> for AssemblerError {
    fn from(err: AssemblyError) -> Self {
        Self::Rejected(Box::new(err))
    }
}
