//! Integration tests for ContextAssembler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use switchyard_assembler::{AssemblerError, ContextAssembler, MemoryConfigStore};
use switchyard_types::{
    AgentConfig, AssemblyRequest, DomainDefinition, ExecutionContext, OrchestratorEvent,
    OverlayConfig, ProjectRecord, RecordingEventSink, Run, RunPatch, RunStore, SpendTracker,
    StoreError, StoreResult, ToolDefinition, ToolGrant, TriggerSource, Usd, WorkflowDefinition,
    WorkflowStep,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FixedSpend(Mutex<HashMap<String, Usd>>);

impl FixedSpend {
    fn with(project: &str, spent: f64) -> Self {
        let spend = Self::default();
        spend.0.lock().insert(project.to_string(), Usd::from_dollars(spent));
        spend
    }
}

impl SpendTracker for FixedSpend {
    fn spent_this_period(&self, project_id: &str) -> StoreResult<Usd> {
        Ok(self.0.lock().get(project_id).copied().unwrap_or(Usd::ZERO))
    }
}

#[derive(Default)]
struct Runs(Mutex<HashMap<String, Run>>);

impl RunStore for Runs {
    fn create_run(&self, run: &Run) -> StoreResult<()> {
        self.0.lock().insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, id: &str) -> StoreResult<Option<Run>> {
        Ok(self.0.lock().get(id).cloned())
    }

    fn update_run(&self, id: &str, _patch: RunPatch) -> StoreResult<Run> {
        Err(StoreError::Missing(id.to_string()))
    }
}

fn support_store() -> MemoryConfigStore {
    MemoryConfigStore::new()
        .with_project(
            ProjectRecord::new("p1", "Support Desk", "ops-team", "support")
                .with_domain_version("1.0")
                .with_budget(Some(Usd::from_dollars(5.0)), Some(Usd::from_dollars(1.0)))
                .with_context("tier", json!("gold")),
        )
        .with_domain(DomainDefinition::new("support", "1.0").with_default_workflow("triage"))
        .with_workflow(
            "support",
            WorkflowDefinition::new(
                "triage",
                vec![
                    WorkflowStep::new("classifier", "trigger.text", "classification"),
                    WorkflowStep::new("responder", "classification", "reply"),
                ],
            ),
        )
        .with_agent(
            AgentConfig::new("classifier", "small-model")
                .with_scope("support")
                .with_tool(ToolGrant::always("kb_search")),
        )
        .with_agent(
            AgentConfig::new("responder", "large-model")
                .with_scope("support")
                .with_overridable("model")
                .with_tool(ToolGrant::when("refund", "classification.label == 'billing'")),
        )
        .with_tool(ToolDefinition::new("kb_search").with_description("Search the knowledge base"))
        .with_tool(ToolDefinition::new("refund"))
        .with_channel("chan-42", "p1")
}

struct Harness {
    assembler: ContextAssembler,
    events: Arc<RecordingEventSink>,
    runs: Arc<Runs>,
}

fn harness(store: MemoryConfigStore, spend: FixedSpend) -> Harness {
    let events = Arc::new(RecordingEventSink::new());
    let runs = Arc::new(Runs::default());
    let assembler = ContextAssembler::new(
        Arc::new(store),
        runs.clone(),
        Arc::new(spend),
        events.clone(),
    );
    Harness {
        assembler,
        events,
        runs,
    }
}

fn code(result: Result<ExecutionContext, AssemblerError>) -> &'static str {
    result
        .expect_err("assembly should fail")
        .code()
        .expect("domain failure expected")
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy paths
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_api_trigger_assembles_full_context() {
    let h = harness(support_store(), FixedSpend::default());
    let ctx = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({"text": "refund please"})))
        .unwrap();

    assert_eq!(ctx.project.name, "Support Desk");
    assert_eq!(ctx.project.owner, "ops-team");
    assert_eq!(ctx.project.context["tier"], "gold");
    assert_eq!(ctx.domain.id, "support");
    assert_eq!(ctx.domain.version, "1.0");
    assert_eq!(ctx.workflow.steps.len(), 2);
    assert_eq!(ctx.agents.len(), 2);
    assert!(ctx.tools.contains_key("kb_search"));
    assert!(ctx.tools.contains_key("refund"));
    assert_eq!(ctx.project.budget.remaining_usd, Some(Usd::from_dollars(5.0)));
    assert_eq!(ctx.project.budget.per_run_usd, Some(Usd::from_dollars(1.0)));
    assert!(ctx.validate().is_ok());

    // The conditional refund tool is flagged.
    assert_eq!(ctx.assembly_warnings.len(), 1);
    assert!(ctx.assembly_warnings[0].contains("refund"));

    match &h.events.events()[..] {
        [OrchestratorEvent::ContextAssembled { run_id, agents, .. }] => {
            assert_eq!(run_id, &ctx.run_id);
            assert_eq!(agents, &vec!["classifier".to_string(), "responder".to_string()]);
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[test]
fn test_each_assembly_gets_a_fresh_run_id() {
    let h = harness(support_store(), FixedSpend::default());
    let a = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    let b = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.agents, b.agents);
}

#[test]
fn test_discord_channel_resolves_project() {
    let h = harness(support_store(), FixedSpend::default());
    let ctx = h
        .assembler
        .assemble(AssemblyRequest::new(TriggerSource::Discord {
            channel_id: "chan-42".into(),
            message: "hello".into(),
            user_id: Some("u1".into()),
        }))
        .unwrap();
    assert_eq!(ctx.project.id, "p1");
}

#[test]
fn test_discord_unknown_channel() {
    let h = harness(support_store(), FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::new(TriggerSource::Discord {
        channel_id: "nowhere".into(),
        message: "hello".into(),
        user_id: None,
    }));
    assert_eq!(code(result), "PROJECT_NOT_FOUND");
}

#[test]
fn test_chain_trigger_uses_parent_project() {
    let h = harness(support_store(), FixedSpend::default());
    let parent = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    h.runs.create_run(&Run::new(parent.clone())).unwrap();

    let ctx = h
        .assembler
        .assemble(AssemblyRequest::new(TriggerSource::Chain {
            parent_run_id: parent.run_id.clone(),
            output: json!({"reply": "done"}),
        }))
        .unwrap();
    assert_eq!(ctx.project.id, "p1");
    assert_ne!(ctx.run_id, parent.run_id);
}

#[test]
fn test_overlay_applied() {
    let store = support_store()
        .with_overlay(
            "p1",
            OverlayConfig::new("responder")
                .set("model", json!("tuned-model"))
                .from_source("projects/p1/agents/responder.overlay.toml"),
        );
    let h = harness(store, FixedSpend::default());
    let ctx = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();

    let responder = &ctx.agents["responder"];
    assert_eq!(responder.model, "tuned-model");
    assert!(responder.overlay_applied);
    assert!(!ctx.agents["classifier"].overlay_applied);
}

#[test]
fn test_declared_overlay_missing_is_a_warning() {
    let store = support_store();
    store.put_project(
        ProjectRecord::new("p1", "Support Desk", "ops-team", "support")
            .with_budget(Some(Usd::from_dollars(5.0)), None)
            .with_overlay("classifier"),
    );
    let h = harness(store, FixedSpend::default());
    let ctx = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    assert!(
        ctx.assembly_warnings
            .iter()
            .any(|w| w.contains("overlay for agent 'classifier'"))
    );
    assert!(!ctx.agents["classifier"].overlay_applied);
}

#[test]
fn test_deprecated_domain_is_a_warning() {
    let store = MemoryConfigStore::new()
        .with_project(ProjectRecord::new("p1", "P", "o", "support"))
        .with_domain(
            DomainDefinition::new("support", "1.0")
                .with_default_workflow("triage")
                .deprecated(),
        )
        .with_workflow("support", WorkflowDefinition::new("triage", vec![]));
    let h = harness(store, FixedSpend::default());
    let ctx = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    assert!(ctx.assembly_warnings[0].contains("deprecated"));
    assert_eq!(ctx.project.budget.remaining_usd, None);
}

#[test]
fn test_explicit_overrides_win() {
    let store = support_store()
        .with_domain(DomainDefinition::new("support", "2.0").with_default_workflow("triage"))
        .with_workflow(
            "support",
            WorkflowDefinition::new(
                "escalate",
                vec![WorkflowStep::new("responder", "trigger", "reply")],
            ),
        );
    let h = harness(store, FixedSpend::default());
    let ctx = h
        .assembler
        .assemble(
            AssemblyRequest::api("p1", json!({}))
                .with_domain("support", Some("2.0".into()))
                .with_workflow("escalate"),
        )
        .unwrap();
    assert_eq!(ctx.domain.version, "2.0");
    assert_eq!(ctx.workflow.id, "escalate");
    assert_eq!(ctx.agents.len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures and their ordering
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_project_wins_over_invalid_workflow() {
    let h = harness(support_store(), FixedSpend::default());
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("nope", json!({})).with_workflow("does-not-exist"));
    let err = result.unwrap_err();
    assert_eq!(err.code(), Some("PROJECT_NOT_FOUND"));

    let rejection = err.rejection().unwrap();
    assert_eq!(rejection.trigger.workflow_id.as_deref(), Some("does-not-exist"));
    assert_eq!(h.events.names(), vec!["orchestrator.assembly_failed"]);
}

#[test]
fn test_missing_domain_version() {
    let h = harness(support_store(), FixedSpend::default());
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({})).with_domain("support", Some("9.9".into())));
    assert_eq!(code(result), "DOMAIN_VERSION_NOT_FOUND");
}

#[test]
fn test_min_version_violation() {
    let store = support_store().with_domain(
        DomainDefinition::new("support", "2.0")
            .with_default_workflow("triage")
            .with_min_compatible("1.5"),
    );
    let h = harness(store, FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "DOMAIN_MIN_VERSION_VIOLATION");
}

#[test]
fn test_missing_workflow() {
    let h = harness(support_store(), FixedSpend::default());
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({})).with_workflow("ghost"));
    assert_eq!(code(result), "WORKFLOW_NOT_FOUND");
}

#[test]
fn test_missing_agent() {
    let store = support_store().with_workflow(
        "support",
        WorkflowDefinition::new("broken", vec![WorkflowStep::new("ghost", "trigger", "x")]),
    );
    let h = harness(store, FixedSpend::default());
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({})).with_workflow("broken"));
    assert_eq!(code(result), "AGENT_NOT_FOUND");
}

#[test]
fn test_agent_out_of_scope() {
    let store = support_store()
        .with_agent(AgentConfig::new("auditor", "m").with_scope("billing"))
        .with_workflow(
            "support",
            WorkflowDefinition::new("audit", vec![WorkflowStep::new("auditor", "trigger", "x")]),
        );
    let h = harness(store, FixedSpend::default());
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({})).with_workflow("audit"));
    assert_eq!(code(result), "AGENT_OUT_OF_SCOPE");
}

#[test]
fn test_overlay_cannot_move_agent_out_of_scope() {
    let store = support_store()
        .with_agent(
            AgentConfig::new("responder", "large-model")
                .with_scope("support")
                .with_overridable("domain_scope"),
        )
        .with_overlay(
            "p1",
            OverlayConfig::new("responder").set("domain_scope", json!(["billing"])),
        );
    let h = harness(store, FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "AGENT_OUT_OF_SCOPE");
    assert_eq!(h.events.names(), vec!["orchestrator.assembly_failed"]);
}

#[test]
fn test_overlay_may_widen_scope() {
    let store = support_store()
        .with_agent(
            AgentConfig::new("responder", "large-model")
                .with_scope("support")
                .with_overridable("domain_scope"),
        )
        .with_overlay(
            "p1",
            OverlayConfig::new("responder").set("domain_scope", json!(["support", "billing"])),
        );
    let h = harness(store, FixedSpend::default());
    let ctx = h.assembler.assemble(AssemblyRequest::api("p1", json!({}))).unwrap();
    assert_eq!(ctx.agents["responder"].domain_scope, vec!["support", "billing"]);
}

#[test]
fn test_overlay_forbidden_field_propagates() {
    let store = support_store().with_overlay(
        "p1",
        OverlayConfig::new("responder").set("domain_scope", json!(["billing"])),
    );
    let h = harness(store, FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "OVERLAY_FORBIDDEN_FIELD");
}

#[test]
fn test_missing_tool() {
    let store = support_store().with_agent(
        AgentConfig::new("classifier", "small-model")
            .with_scope("support")
            .with_tool(ToolGrant::always("web_fetch")),
    );
    let h = harness(store, FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "TOOL_NOT_FOUND");
}

#[test]
fn test_budget_exhausted() {
    let h = harness(support_store(), FixedSpend::with("p1", 5.0));
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "BUDGET_EXCEEDED");
}

#[test]
fn test_zero_per_run_budget() {
    let store = support_store();
    store.put_project(
        ProjectRecord::new("p1", "Support Desk", "ops-team", "support")
            .with_budget(None, Some(Usd::ZERO)),
    );
    let h = harness(store, FixedSpend::default());
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "BUDGET_EXCEEDED");
}

#[test]
fn test_budget_checked_after_agent_resolution() {
    let store = support_store().with_workflow(
        "support",
        WorkflowDefinition::new("broken", vec![WorkflowStep::new("ghost", "trigger", "x")]),
    );
    let h = harness(store, FixedSpend::with("p1", 5.0));
    let result = h
        .assembler
        .assemble(AssemblyRequest::api("p1", json!({})).with_workflow("broken"));
    assert_eq!(code(result), "AGENT_NOT_FOUND");
}

#[test]
fn test_budget_checked_after_tool_resolution() {
    let store = support_store().with_agent(
        AgentConfig::new("classifier", "small-model")
            .with_scope("support")
            .with_tool(ToolGrant::always("web_fetch")),
    );
    let h = harness(store, FixedSpend::with("p1", 5.0));
    let result = h.assembler.assemble(AssemblyRequest::api("p1", json!({})));
    assert_eq!(code(result), "TOOL_NOT_FOUND");
}

#[test]
fn test_assembly_is_retryable_after_outage() {
    let store = Arc::new(support_store());
    let events = Arc::new(RecordingEventSink::new());
    let assembler = ContextAssembler::new(
        store.clone(),
        Arc::new(Runs::default()),
        Arc::new(FixedSpend::default()),
        events.clone(),
    );

    store.set_unavailable(Some("connection reset"));
    let err = assembler
        .assemble(AssemblyRequest::api("p1", json!({})))
        .unwrap_err();
    assert!(matches!(
        err,
        AssemblerError::Infrastructure(StoreError::Unavailable(_))
    ));

    store.set_unavailable(None);
    assert!(assembler.assemble(AssemblyRequest::api("p1", json!({}))).is_ok());
    assert_eq!(
        events.names(),
        vec![
            "orchestrator.assembly_failed",
            "orchestrator.context_assembled"
        ]
    );
}
