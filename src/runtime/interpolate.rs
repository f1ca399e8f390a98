/// Step input interpolation
///
/// Step inputs may reference earlier step outputs with `{{steps.<stepId>.<path>}}`
/// and the trigger payload with `{{trigger.<path>}}`. Path segments are object keys
/// or array indices separated by dots.

use crate::error::EngineError;
use serde_json::{Map, Value};

/// Values a step's inputs may reference
#[derive(Debug, Clone, Copy)]
pub struct RunScope<'a> {
    pub trigger: &'a Value,
    /// Outputs of the steps that already ran, keyed by step id
    pub steps: &'a Map<String, Value>,
}

/// Resolves template references in raw step inputs
pub trait InputInterpolator: Send + Sync {
    fn interpolate(
        &self,
        inputs: &Map<String, Value>,
        scope: RunScope<'_>,
    ) -> Result<Map<String, Value>, EngineError>;
}

/// `{{...}}` template resolution over JSON values
///
/// A string that is exactly one token takes the referenced value with its JSON
/// type intact. Tokens embedded in longer strings are rendered as text. Missing
/// references resolve to null (or the empty string when embedded). Tokens with an
/// unknown root are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateInterpolator;

impl InputInterpolator for TemplateInterpolator {
    fn interpolate(
        &self,
        inputs: &Map<String, Value>,
        scope: RunScope<'_>,
    ) -> Result<Map<String, Value>, EngineError> {
        Ok(inputs
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(value, scope)))
            .collect())
    }
}

fn resolve_value(value: &Value, scope: RunScope<'_>) -> Value {
    match value {
        Value::String(text) => resolve_string(text, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(text: &str, scope: RunScope<'_>) -> Value {
    // Whole-string token keeps the referenced value's type
    if let Some(expr) = sole_token(text) {
        if let Some(resolved) = lookup(expr, scope) {
            return resolved.unwrap_or(Value::Null);
        }
        return Value::String(text.to_string());
    }

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let token = &rest[open..open + 2 + close + 2];
        let expr = rest[open + 2..open + 2 + close].trim();

        rendered.push_str(&rest[..open]);
        match lookup(expr, scope) {
            Some(Some(Value::String(s))) => rendered.push_str(&s),
            Some(Some(Value::Null)) | Some(None) => {}
            Some(Some(other)) => rendered.push_str(&other.to_string()),
            None => rendered.push_str(token),
        }
        rest = &rest[open + 2 + close + 2..];
    }
    rendered.push_str(rest);
    Value::String(rendered)
}

/// Expression inside `text` if the whole string is a single `{{...}}` token
fn sole_token(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// `None` for an unknown root, `Some(None)` for a missing path
fn lookup(expr: &str, scope: RunScope<'_>) -> Option<Option<Value>> {
    let mut segments = expr.split('.');
    let root = match segments.next()? {
        "trigger" => scope.trigger,
        "steps" => {
            let step_id = segments.next()?;
            match scope.steps.get(step_id) {
                Some(output) => output,
                None => return Some(None),
            }
        }
        _ => return None,
    };

    let mut current = root;
    for segment in segments {
        let next = match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Some(None),
        }
    }
    Some(Some(current.clone()))
}
