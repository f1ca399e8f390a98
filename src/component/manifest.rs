/// Component manifests
///
/// A manifest declares a component's identity, the interpreter its code runs
/// under and its input/output schema. Manifests are validated structurally
/// before anything is cached.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Where a component comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Shipped on disk next to the host, loaded eagerly at start
    Local,
    /// Authored by users, stored in the document store, loaded lazily
    User,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Local => "local",
            Namespace::User => "user",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Namespace::Local),
            "user" => Ok(Namespace::User),
            other => Err(format!("unknown component namespace '{}'", other)),
        }
    }
}

/// Declared component interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Interpreter the code file is handed to (e.g. "sh", "python3", "node")
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Code file name inside the component directory
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<Value>,
}

/// One entry of a component's input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    /// Applied when an optional input is absent or null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_runtime() -> String {
    "sh".to_string()
}

fn default_entry() -> String {
    "main".to_string()
}

impl ComponentManifest {
    /// Parse and structurally validate raw manifest JSON
    ///
    /// `origin` names the manifest in errors (directory or store path).
    pub fn parse(raw: &str, origin: &str) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidManifest {
            component: origin.to_string(),
            reason,
        };

        let value: Value =
            serde_json::from_str(raw).map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
        let fields = value
            .as_object()
            .ok_or_else(|| invalid("manifest must be a JSON object".to_string()))?;

        match fields.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {}
            _ => return Err(invalid("missing 'name'".to_string())),
        }
        for key in ["inputs", "outputs"] {
            if let Some(field) = fields.get(key) {
                if !field.is_array() {
                    return Err(invalid(format!("'{}' must be a list", key)));
                }
            }
        }

        let manifest: ComponentManifest =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        if !is_safe_name(&manifest.entry) {
            return Err(invalid(format!("entry '{}' is not a plain file name", manifest.entry)));
        }
        Ok(manifest)
    }
}

/// Names usable as a single path segment
pub(crate) fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}
