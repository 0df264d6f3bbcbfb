//! In-memory `ConfigStore` for tests and embedded setups.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use switchyard_types::{
    AgentConfig, ConfigStore, DomainDefinition, OverlayConfig, ProjectRecord, ScheduleBinding,
    StoreError, StoreResult, ToolDefinition, WorkflowDefinition, parse_domain_version,
    versions_equal,
};

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<String, ProjectRecord>,
    channels: HashMap<String, String>,
    schedules: HashMap<String, ScheduleBinding>,
    domains: HashMap<String, Vec<DomainDefinition>>,
    workflows: HashMap<(String, String), WorkflowDefinition>,
    agents: HashMap<String, AgentConfig>,
    overlays: HashMap<(String, String), OverlayConfig>,
    tools: BTreeMap<String, ToolDefinition>,
    unavailable: Option<String>,
}

/// Config store backed by hash maps.
///
/// Built with the `with_*` methods; `set_unavailable` makes every lookup fail
/// with `StoreError::Unavailable`.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    inner: RwLock<Inner>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: ProjectRecord) -> Self {
        self.inner.write().projects.insert(project.id.clone(), project);
        self
    }

    pub fn with_channel(self, channel_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        self.inner
            .write()
            .channels
            .insert(channel_id.into(), project_id.into());
        self
    }

    pub fn with_schedule(self, schedule_id: impl Into<String>, binding: ScheduleBinding) -> Self {
        self.inner.write().schedules.insert(schedule_id.into(), binding);
        self
    }

    pub fn with_domain(self, domain: DomainDefinition) -> Self {
        self.inner
            .write()
            .domains
            .entry(domain.id.clone())
            .or_default()
            .push(domain);
        self
    }

    pub fn with_workflow(self, domain: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        self.inner
            .write()
            .workflows
            .insert((domain.into(), workflow.name.clone()), workflow);
        self
    }

    pub fn with_agent(self, agent: AgentConfig) -> Self {
        self.inner.write().agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_overlay(self, project_id: impl Into<String>, overlay: OverlayConfig) -> Self {
        self.inner
            .write()
            .overlays
            .insert((project_id.into(), overlay.extends.clone()), overlay);
        self
    }

    pub fn with_tool(self, tool: ToolDefinition) -> Self {
        self.inner.write().tools.insert(tool.name.clone(), tool);
        self
    }

    /// Replace or insert a project after construction.
    pub fn put_project(&self, project: ProjectRecord) {
        self.inner.write().projects.insert(project.id.clone(), project);
    }

    /// Simulate an outage (`Some`) or recover from one (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.write().unavailable = reason.map(str::to_string);
    }

    fn read(&self) -> StoreResult<parking_lot::RwLockReadGuard<'_, Inner>> {
        let inner = self.inner.read();
        if let Some(reason) = &inner.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        Ok(inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_project(&self, id: &str) -> StoreResult<Option<ProjectRecord>> {
        Ok(self.read()?.projects.get(id).cloned())
    }

    fn project_for_channel(&self, channel_id: &str) -> StoreResult<Option<String>> {
        Ok(self.read()?.channels.get(channel_id).cloned())
    }

    fn get_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleBinding>> {
        Ok(self.read()?.schedules.get(schedule_id).cloned())
    }

    fn get_domain(&self, id: &str, version: Option<&str>) -> StoreResult<Option<DomainDefinition>> {
        let inner = self.read()?;
        let Some(versions) = inner.domains.get(id) else {
            return Ok(None);
        };
        let found = match version {
            Some(wanted) => versions.iter().find(|d| versions_equal(&d.version, wanted)),
            None => versions
                .iter()
                .max_by_key(|d| parse_domain_version(&d.version)),
        };
        Ok(found.cloned())
    }

    fn get_workflow(&self, domain: &str, id: &str) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self
            .read()?
            .workflows
            .get(&(domain.to_string(), id.to_string()))
            .cloned())
    }

    fn get_agent(&self, name: &str) -> StoreResult<Option<AgentConfig>> {
        Ok(self.read()?.agents.get(name).cloned())
    }

    fn get_agent_overlay(&self, project_id: &str, name: &str) -> StoreResult<Option<OverlayConfig>> {
        Ok(self
            .read()?
            .overlays
            .get(&(project_id.to_string(), name.to_string()))
            .cloned())
    }

    fn get_tool_catalog(&self) -> StoreResult<BTreeMap<String, ToolDefinition>> {
        Ok(self.read()?.tools.clone())
    }
}
