//! Workflow definition as read from and written back to the engine

use crate::digest::{DigestError, StateDigest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step (node) of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Engine step identifier
    pub id: String,
    /// Display name, unique within the workflow
    pub name: String,
    /// Step type, e.g. `n8n-nodes-base.httpRequest`
    #[serde(rename = "type")]
    pub step_type: String,
    /// Step parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Credential references by credential kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, Value>>,
    /// Canvas position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[i64; 2]>,
}

impl Step {
    /// Create a step with no parameters
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type: step_type.into(),
            parameters: Map::new(),
            credentials: None,
            position: None,
        }
    }

    /// Set a parameter
    #[inline]
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Whether the step type contains `pattern`, ignoring case
    #[must_use]
    pub fn type_matches(&self, pattern: &str) -> bool {
        self.step_type
            .to_lowercase()
            .contains(&pattern.to_lowercase())
    }

    /// Read a dotted parameter path such as `options.timeout`
    #[must_use]
    pub fn parameter_at(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.parameters.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Write a dotted parameter path, creating intermediate objects
    ///
    /// Returns the previous value. Non-object intermediates are replaced.
    pub fn set_parameter_at(&mut self, path: &str, value: Value) -> Option<Value> {
        let mut parts: Vec<&str> = path.split('.').collect();
        let leaf = parts.pop()?;
        let mut map = &mut self.parameters;
        for part in parts {
            let entry = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = entry.as_object_mut()?;
        }
        map.insert(leaf.to_string(), value)
    }
}

/// Full workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Workflow name
    pub name: String,
    /// Whether the workflow is enabled
    #[serde(default)]
    pub active: bool,
    /// Steps in definition order
    #[serde(default, rename = "nodes")]
    pub steps: Vec<Step>,
    /// Step wiring, opaque to the loop
    #[serde(default)]
    pub connections: Value,
    /// Workflow-level settings
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
}

impl TargetState {
    /// Create an empty workflow
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            steps: Vec::new(),
            connections: Value::Object(Map::new()),
            settings: Map::new(),
        }
    }

    /// Append a step
    #[inline]
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Look up a step by display name
    #[must_use]
    pub fn step_named(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Canonical digest of the whole definition
    ///
    /// # Errors
    /// Returns error if the state cannot be serialized
    pub fn digest(&self) -> Result<StateDigest, DigestError> {
        StateDigest::of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_parameter_paths() {
        let mut step = Step::new("1", "HTTP", "n8n-nodes-base.httpRequest");
        assert!(step.parameter_at("options.timeout").is_none());

        let prev = step.set_parameter_at("options.timeout", json!(30000));
        assert!(prev.is_none());
        assert_eq!(step.parameter_at("options.timeout"), Some(&json!(30000)));

        let prev = step.set_parameter_at("options.timeout", json!(60000));
        assert_eq!(prev, Some(json!(30000)));
    }

    #[test]
    fn engine_json_shape() {
        let raw = json!({
            "name": "Chat",
            "active": true,
            "nodes": [{
                "id": "a",
                "name": "Memory",
                "type": "@n8n/n8n-nodes-langchain.memoryBufferWindow",
                "parameters": {}
            }],
            "connections": {}
        });
        let state: TargetState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.steps.len(), 1);
        assert!(state.steps[0].type_matches("MEMORYBUFFER"));
        assert!(state.step_named("Memory").is_some());
    }

    #[test]
    fn digest_changes_with_content() {
        let a = TargetState::new("wf");
        let b = a.clone().with_step(Step::new("1", "Code", "n8n-nodes-base.code"));
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
