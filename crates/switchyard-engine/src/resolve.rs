//! Step input resolution against the run scope.
//!
//! The scope is a flat map of root names to JSON values:
//!
//! - `trigger`: the payload of the trigger that started the run
//! - `project`: the project's context map
//! - `approval`: the human input recorded for the current step, or null
//! - every output key written by an earlier step
//!
//! A step input is either a bare path (`classification.label`,
//! `trigger.items[0]`) or a string containing `{{path}}` templates. A string
//! that is exactly one template keeps the JSON type of what it points at;
//! mixed text is interpolated as a string. The empty string resolves to null.

use std::collections::BTreeMap;

use serde_json::Value;
use switchyard_types::{ExecutionContext, RunState};
use thiserror::Error;

/// Scope roots that step outputs cannot shadow.
pub const RESERVED_ROOTS: &[&str] = &["trigger", "project", "approval"];

/// An input reference that does not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Empty path in reference '{0}'")]
    EmptyPath(String),

    #[error("Reference '{path}': unknown root '{root}'")]
    UnknownRoot { path: String, root: String },

    #[error("Reference '{path}': cannot resolve segment '{segment}'")]
    MissingSegment { path: String, segment: String },
}

/// The values visible to a step's input and condition.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    roots: BTreeMap<String, Value>,
}

impl Scope {
    /// Build the scope for the step at the state's cursor.
    pub fn for_step(context: &ExecutionContext, state: &RunState) -> Self {
        let mut roots: BTreeMap<String, Value> = state
            .outputs()
            .iter()
            .filter(|(key, _)| !RESERVED_ROOTS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        roots.insert("trigger".into(), context.trigger.source.payload());
        roots.insert(
            "project".into(),
            Value::Object(context.project.context.clone()),
        );
        roots.insert(
            "approval".into(),
            state.approval(state.cursor()).cloned().unwrap_or(Value::Null),
        );
        Self { roots }
    }

    /// A scope over arbitrary roots.
    pub fn from_roots(roots: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// Resolve a step input reference.
    pub fn resolve_input(&self, reference: &str) -> Result<Value, ResolveError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(Value::Null);
        }
        if reference.contains("{{") {
            return self.resolve_template(reference);
        }
        self.resolve_path(reference)
    }

    /// Look a path up, treating anything unresolvable as absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        self.walk(path).ok()
    }

    /// Resolve one dot-separated path.
    pub fn resolve_path(&self, path: &str) -> Result<Value, ResolveError> {
        self.walk(path).cloned()
    }

    fn walk(&self, path: &str) -> Result<&Value, ResolveError> {
        let segments = parse_path_segments(path);
        let Some((root, rest)) = segments.split_first() else {
            return Err(ResolveError::EmptyPath(path.to_string()));
        };
        if root.name.is_empty() {
            return Err(ResolveError::EmptyPath(path.to_string()));
        }

        let mut current =
            self.roots
                .get(root.name.as_str())
                .ok_or_else(|| ResolveError::UnknownRoot {
                    path: path.to_string(),
                    root: root.name.clone(),
                })?;
        if let Some(index) = root.index {
            current = current
                .get(index)
                .ok_or_else(|| missing(path, root))?;
        }
        for segment in rest {
            current = navigate_segment(current, segment).ok_or_else(|| missing(path, segment))?;
        }
        Ok(current)
    }

    fn resolve_template(&self, s: &str) -> Result<Value, ResolveError> {
        let expressions = parse_template_expressions(s);
        if expressions.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        if expressions.len() == 1 && expressions[0].full_match == s {
            return self.resolve_path(&expressions[0].path);
        }

        let mut result = s.to_string();
        for expr in &expressions {
            let resolved = self.resolve_path(&expr.path)?;
            result = result.replace(&expr.full_match, &value_to_string(&resolved));
        }
        Ok(Value::String(result))
    }
}

fn missing(path: &str, segment: &PathSegment) -> ResolveError {
    ResolveError::MissingSegment {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Template expressions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TemplateExpression {
    /// Including braces, e.g. `{{classify.label}}`.
    full_match: String,
    path: String,
}

fn parse_template_expressions(s: &str) -> Vec<TemplateExpression> {
    let mut results = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("{{") {
        let Some(end) = remaining[start..].find("}}") else {
            break;
        };
        let full_end = start + end + 2;
        let inner = remaining[start + 2..start + end].trim();
        if !inner.is_empty() {
            results.push(TemplateExpression {
                full_match: remaining[start..full_end].to_string(),
                path: inner.to_string(),
            });
        }
        remaining = &remaining[full_end..];
    }

    results
}

// ─────────────────────────────────────────────────────────────────────────────
// Path navigation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PathSegment {
    name: String,
    index: Option<usize>,
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// `"triage.items[0].name"` → `[triage, items[0], name]`
fn parse_path_segments(path: &str) -> Vec<PathSegment> {
    path.trim()
        .split('.')
        .map(|part| {
            if let Some(open) = part.find('[')
                && let Some(close) = part.find(']')
                && open < close
            {
                return PathSegment {
                    name: part[..open].to_string(),
                    index: part[open + 1..close].parse::<usize>().ok(),
                };
            }
            PathSegment {
                name: part.to_string(),
                index: None,
            }
        })
        .collect()
}

fn navigate_segment<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    let field = if segment.name.is_empty() {
        value
    } else {
        value.get(&segment.name)?
    };
    match segment.index {
        Some(i) => field.get(i),
        None => Some(field),
    }
}

/// String form used when interpolating into mixed text.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::from_roots([
            (
                "trigger".to_string(),
                json!({"message": "refund please", "items": [{"sku": "A1"}, {"sku": "B2"}]}),
            ),
            ("project".to_string(), json!({"tier": "gold"})),
            ("approval".to_string(), Value::Null),
            (
                "classification".to_string(),
                json!({"label": "billing", "confidence": 0.92}),
            ),
        ])
    }

    #[test]
    fn test_bare_path_keeps_type() {
        let scope = scope();
        assert_eq!(scope.resolve_input("classification.confidence").unwrap(), json!(0.92));
        assert_eq!(
            scope.resolve_input("classification").unwrap(),
            json!({"label": "billing", "confidence": 0.92})
        );
    }

    #[test]
    fn test_array_index() {
        let scope = scope();
        assert_eq!(scope.resolve_input("trigger.items[1].sku").unwrap(), json!("B2"));
    }

    #[test]
    fn test_single_template_keeps_type() {
        let scope = scope();
        assert_eq!(scope.resolve_input("{{ trigger.items }}").unwrap()[0]["sku"], "A1");
    }

    #[test]
    fn test_mixed_template_interpolates() {
        let scope = scope();
        assert_eq!(
            scope
                .resolve_input("{{project.tier}} customer: {{trigger.message}}")
                .unwrap(),
            json!("gold customer: refund please")
        );
    }

    #[test]
    fn test_empty_input_is_null() {
        assert_eq!(scope().resolve_input("  ").unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_root() {
        let err = scope().resolve_input("nope.field").unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownRoot {
                path: "nope.field".into(),
                root: "nope".into()
            }
        );
    }

    #[test]
    fn test_missing_segment() {
        let err = scope().resolve_input("classification.reason").unwrap_err();
        assert!(err.to_string().contains("cannot resolve segment 'reason'"));
        assert!(scope().lookup("classification.reason").is_none());
    }

    #[test]
    fn test_index_out_of_bounds() {
        assert!(scope().resolve_input("trigger.items[5]").is_err());
    }

    #[test]
    fn test_unclosed_template_is_literal() {
        assert_eq!(
            scope().resolve_input("{{trigger.message").unwrap(),
            json!("{{trigger.message")
        );
    }

    #[test]
    fn test_outputs_cannot_shadow_reserved_roots() {
        use switchyard_types::Usd;

        let mut state = RunState::default();
        state.record_success("trigger", json!("shadow"), 0, Usd::ZERO);
        state.record_success("label", json!("billing"), 0, Usd::ZERO);
        let context = crate::testing::context(json!({"message": "hi"}));
        let scope = Scope::for_step(&context, &state);
        assert_eq!(scope.resolve_input("trigger.message").unwrap(), json!("hi"));
        assert_eq!(scope.resolve_input("label").unwrap(), json!("billing"));
        assert_eq!(scope.resolve_input("approval").unwrap(), Value::Null);
    }
}
