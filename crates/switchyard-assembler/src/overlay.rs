//! Overlay resolution: merging a project overlay into a core agent.
//!
//! Only keys listed in the core's `overridable_fields` may appear in an
//! overlay. Typed fields of the core are replaced wholesale after a type
//! check; `params` and any key that is not a typed field land in the
//! agent's free-form parameters, where mapping values merge one level deep.
//!
//! Resolution is a pure function of its inputs.

use serde_json::{Map, Value};
use switchyard_types::{AgentCapabilities, AgentConfig, OverlayConfig, ResolvedAgent};

use crate::error::AssemblyFailure;

/// Fields that describe identity or policy and can never be overlaid.
const STRUCTURAL_FIELDS: &[&str] = &["name", "overridable_fields"];

/// Merge `core` with an optional project `overlay`.
pub fn resolve(
    core: &AgentConfig,
    overlay: Option<&OverlayConfig>,
) -> Result<ResolvedAgent, AssemblyFailure> {
    let mut resolved = ResolvedAgent::from_core(core);
    let Some(overlay) = overlay else {
        return Ok(resolved);
    };

    if overlay.extends != core.name {
        return Err(AssemblyFailure::OverlayExtendsMismatch {
            agent: core.name.clone(),
            extends: overlay.extends.clone(),
        });
    }

    // Every key is permission-checked before any is applied.
    if let Some(field) = overlay
        .overrides
        .keys()
        .find(|key| !core.overridable_fields.iter().any(|f| f == *key))
    {
        return Err(AssemblyFailure::OverlayForbiddenField {
            agent: core.name.clone(),
            field: field.clone(),
        });
    }

    for (field, value) in &overlay.overrides {
        apply_override(&mut resolved, &core.name, field, value)?;
    }

    resolved.overlay_applied = true;
    resolved.overlay_source = Some(
        overlay
            .source
            .clone()
            .unwrap_or_else(|| format!("overlay:{}", overlay.extends)),
    );
    Ok(resolved)
}

fn apply_override(
    agent: &mut ResolvedAgent,
    name: &str,
    field: &str,
    value: &Value,
) -> Result<(), AssemblyFailure> {
    let invalid = |reason: &str| AssemblyFailure::OverlayInvalidValue {
        agent: name.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    };

    match field {
        f if STRUCTURAL_FIELDS.contains(&f) => {
            return Err(invalid("structural fields cannot be overridden"));
        }
        "model" => agent.model = expect_string(value).ok_or_else(|| invalid("expected a string"))?,
        "version" => agent.version = expect_string(value).ok_or_else(|| invalid("expected a string"))?,
        "prompt" => agent.prompt = expect_string(value).ok_or_else(|| invalid("expected a string"))?,
        "input_schema" => {
            agent.input_schema = expect_string(value).ok_or_else(|| invalid("expected a string"))?
        }
        "output_schema" => {
            agent.output_schema = expect_string(value).ok_or_else(|| invalid("expected a string"))?
        }
        "domain_scope" => {
            agent.domain_scope = serde_json::from_value::<Vec<String>>(value.clone())
                .map_err(|_| invalid("expected a list of domain names"))?;
        }
        "capabilities" => {
            let capabilities = serde_json::from_value::<AgentCapabilities>(value.clone())
                .map_err(|e| invalid(&e.to_string()))?;
            agent.tools = capabilities.tools.iter().map(|t| t.name.clone()).collect();
            agent.tool_grants = capabilities.tools;
        }
        "params" => {
            let Value::Object(overrides) = value else {
                return Err(invalid("expected a mapping"));
            };
            for (key, value) in overrides {
                merge_param(&mut agent.params, key, value);
            }
        }
        _ => merge_param(&mut agent.params, field, value),
    }
    Ok(())
}

fn expect_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Insert `value` under `key`, merging one level deep when both sides are
/// mappings.
fn merge_param(params: &mut Map<String, Value>, key: &str, value: &Value) {
    match (params.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => {
            params.insert(key.to_string(), value.clone());
        }
    }
}
