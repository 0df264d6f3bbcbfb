//! The agent invocation seam.
//!
//! The engine never talks to a model or a tool itself. Each step is handed to
//! an [`AgentInvoker`] together with the resolved agent, the step input and
//! the tools the agent may use for this step.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use switchyard_types::{ResolvedAgent, ToolDefinition, Usd};
use thiserror::Error;

/// One step invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub run_id: String,
    pub step: usize,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    pub agent: ResolvedAgent,
    pub input: Value,
    /// Tools granted for this step, conditional grants already evaluated.
    pub tools: Vec<ToolDefinition>,
    /// Human input recorded when the step was approved.
    pub approval: Option<Value>,
}

/// What a successful invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub output: Value,
    pub tokens: u64,
    pub cost: Usd,
}

impl InvocationOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            tokens: 0,
            cost: Usd::ZERO,
        }
    }

    pub fn with_usage(mut self, tokens: u64, cost: Usd) -> Self {
        self.tokens = tokens;
        self.cost = cost;
        self
    }
}

/// A failed invocation, classified for the workflow's error policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// A tool the agent called failed.
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// The agent itself failed (model error, invalid output, ...).
    #[error("Agent failed: {message}")]
    Agent { message: String },
}

impl InvocationError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }

    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }
}

/// Runs a single workflow step.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationOutcome, InvocationError>;

    /// Expected cost of running `agent` on `input`, checked against the budget
    /// before the step starts.
    async fn estimate_cost(&self, _agent: &ResolvedAgent, _input: &Value) -> Usd {
        Usd::ZERO
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Invoker
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted response of the [`MockInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    Reply(InvocationOutcome),
    Fail(InvocationError),
}

#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<MockResponse>,
    fallback: Option<MockResponse>,
    estimate: Option<Usd>,
    estimate_delay: Option<Duration>,
    delay: Option<Duration>,
}

/// Invoker with per-agent scripted responses, for testing.
///
/// Queued responses are returned in order; once an agent's queue is empty its
/// `always` response is repeated. Without either an error is returned.
#[derive(Debug, Default)]
pub struct MockInvoker {
    scripts: Mutex<HashMap<String, Script>>,
    request_log: Mutex<Vec<InvocationRequest>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, agent: impl Into<String>, f: impl FnOnce(&mut Script)) {
        f(self.scripts.lock().entry(agent.into()).or_default());
    }

    /// Queue one response for `agent`.
    pub fn then(self, agent: impl Into<String>, response: MockResponse) -> Self {
        self.script(agent, |s| s.queued.push_back(response));
        self
    }

    /// Queue a successful reply.
    pub fn reply(self, agent: impl Into<String>, output: Value, cost: Usd) -> Self {
        self.then(
            agent,
            MockResponse::Reply(InvocationOutcome::new(output).with_usage(100, cost)),
        )
    }

    /// Queue a tool failure.
    pub fn fail_tool(self, agent: impl Into<String>, tool: &str, message: &str) -> Self {
        self.then(agent, MockResponse::Fail(InvocationError::tool(tool, message)))
    }

    /// Respond with `response` whenever the queue for `agent` is empty.
    pub fn always(self, agent: impl Into<String>, response: MockResponse) -> Self {
        self.script(agent, |s| s.fallback = Some(response));
        self
    }

    /// Cost reported by `estimate_cost` for `agent`.
    pub fn estimate(self, agent: impl Into<String>, cost: Usd) -> Self {
        self.script(agent, |s| s.estimate = Some(cost));
        self
    }

    /// Delay every cost estimate for `agent`.
    pub fn estimate_delay(self, agent: impl Into<String>, delay: Duration) -> Self {
        self.script(agent, |s| s.estimate_delay = Some(delay));
        self
    }

    /// Delay every response of `agent`.
    pub fn delay(self, agent: impl Into<String>, delay: Duration) -> Self {
        self.script(agent, |s| s.delay = Some(delay));
        self
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.request_log.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    /// Requests received for one agent.
    pub fn call_count(&self, agent: &str) -> usize {
        self.request_log
            .lock()
            .iter()
            .filter(|r| r.agent.name == agent)
            .count()
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationOutcome, InvocationError> {
        let agent = request.agent.name.clone();
        self.request_log.lock().push(request);

        let (response, delay) = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&agent) {
                Some(script) => (
                    script.queued.pop_front().or_else(|| script.fallback.clone()),
                    script.delay,
                ),
                None => (None, None),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match response {
            Some(MockResponse::Reply(outcome)) => Ok(outcome),
            Some(MockResponse::Fail(err)) => Err(err),
            None => Err(InvocationError::agent(format!(
                "MockInvoker: no response scripted for agent '{agent}'"
            ))),
        }
    }

    async fn estimate_cost(&self, agent: &ResolvedAgent, _input: &Value) -> Usd {
        let (estimate, delay) = self
            .scripts
            .lock()
            .get(&agent.name)
            .map(|s| (s.estimate, s.estimate_delay))
            .unwrap_or_default();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        estimate.unwrap_or(Usd::ZERO)
    }
}
