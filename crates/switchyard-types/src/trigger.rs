//! Trigger origins and assembly requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The event that started context assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSource {
    /// A chat message arriving on a bound channel.
    Discord {
        channel_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// A direct API submission naming its project.
    Api {
        project_id: String,
        #[serde(default)]
        payload: Value,
    },
    /// A scheduler tick for a registered schedule.
    Schedule { schedule_id: String },
    /// Output of a previous run fed into a new one.
    Chain {
        parent_run_id: String,
        #[serde(default)]
        output: Value,
    },
}

impl TriggerSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discord { .. } => "discord",
            Self::Api { .. } => "api",
            Self::Schedule { .. } => "schedule",
            Self::Chain { .. } => "chain",
        }
    }

    /// The data a workflow sees under the `trigger` root.
    ///
    /// Discord messages expose `message`, `channel_id` and `user_id`; API calls
    /// expose their payload; chains expose the parent output.
    pub fn payload(&self) -> Value {
        match self {
            Self::Discord {
                channel_id,
                message,
                user_id,
            } => serde_json::json!({
                "channel_id": channel_id,
                "message": message,
                "user_id": user_id,
            }),
            Self::Api { payload, .. } => payload.clone(),
            Self::Schedule { schedule_id } => serde_json::json!({ "schedule_id": schedule_id }),
            Self::Chain {
                parent_run_id,
                output,
            } => serde_json::json!({
                "parent_run_id": parent_run_id,
                "output": output,
            }),
        }
    }
}

/// A request to resolve a trigger into an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub source: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    /// Explicit domain version; only meaningful together with a domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

impl AssemblyRequest {
    pub fn new(source: TriggerSource) -> Self {
        Self {
            source,
            project_id: None,
            domain_id: None,
            domain_version: None,
            workflow_id: None,
        }
    }

    /// Shorthand for an API trigger.
    pub fn api(project_id: impl Into<String>, payload: Value) -> Self {
        Self::new(TriggerSource::Api {
            project_id: project_id.into(),
            payload,
        })
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_domain(mut self, domain_id: impl Into<String>, version: Option<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self.domain_version = version;
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}
