//! Deterministic per-kind transforms
//!
//! Each [`StrategyKind`] has exactly one transform. [`plan`] applies it to a
//! copy of the workflow and reports every concrete change; the input state
//! is never touched. Transforms are idempotent: a second application finds
//! nothing left to change and fails with
//! [`RepairError::NoQualifyingStep`].
//!
//! Step selection, in order of precedence:
//! - `step` parameter: only the step with that name
//! - `step_pattern` parameter: steps whose type contains the pattern
//! - the kind's default pattern, if any
//! - otherwise every step

use crate::error::RepairError;
use crate::strategy::{RepairStrategy, StrategyKind};
use mend_model::{Step, TargetState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const VALIDATION_MARKER: &str = "// mend:input-validation";
const ERROR_HANDLING_MARKER: &str = "// mend:error-handling";

/// One concrete modification to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Modified step id
    pub step_id: String,
    /// Modified step name
    pub step_name: String,
    /// Dotted path within the step (`type`, `credentials.x`, or a parameter path)
    pub path: String,
    /// Previous value, if any
    pub before: Option<Value>,
    /// New value
    pub after: Value,
}

/// Compute the mutated state and its change list
///
/// # Errors
/// - [`RepairError::MissingParameter`] if the strategy lacks a required parameter
/// - [`RepairError::NoQualifyingStep`] if nothing would change
pub fn plan(
    state: &TargetState,
    strategy: &RepairStrategy,
) -> Result<(TargetState, Vec<Change>), RepairError> {
    let mut next = state.clone();
    let mut changes = Vec::new();
    let kind = strategy.kind;

    match kind {
        StrategyKind::AddParameter => {
            let parameter = required_str(strategy, "parameter")?;
            let value = required(strategy, "value")?;
            for step in next.steps.iter_mut().filter(|s| selects(s, strategy, None)) {
                if step.parameter_at(parameter).is_none() {
                    set_param(step, parameter, value.clone(), &mut changes);
                }
            }
        }
        StrategyKind::UpdateParameter => {
            let parameter = required_str(strategy, "parameter")?;
            let value = required(strategy, "value")?;
            for step in next.steps.iter_mut().filter(|s| selects(s, strategy, None)) {
                if step.parameter_at(parameter).is_some_and(|v| v != &value) {
                    set_param(step, parameter, value.clone(), &mut changes);
                }
            }
        }
        StrategyKind::FixCredentialReference => {
            let credential_type = required_str(strategy, "credential_type")?;
            let credential_id = required_str(strategy, "credential_id")?;
            let name = strategy.param_str("credential_name").unwrap_or(credential_id);
            let reference = json!({ "id": credential_id, "name": name });
            let explicit = strategy.param("step").is_some() || strategy.param("step_pattern").is_some();
            for step in next.steps.iter_mut() {
                let uses_type = step
                    .credentials
                    .as_ref()
                    .is_some_and(|c| c.contains_key(credential_type));
                let chosen = if explicit {
                    selects(step, strategy, None)
                } else {
                    uses_type
                };
                if !chosen {
                    continue;
                }
                let creds = step.credentials.get_or_insert_with(Map::new);
                if creds.get(credential_type) != Some(&reference) {
                    let before = creds.insert(credential_type.to_string(), reference.clone());
                    changes.push(Change {
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        path: format!("credentials.{credential_type}"),
                        before,
                        after: reference.clone(),
                    });
                }
            }
        }
        StrategyKind::IncreaseTimeout => {
            let timeout = strategy
                .param_u64("timeout")
                .ok_or_else(|| RepairError::missing(kind, "timeout"))?;
            let field = strategy.param_str("field").unwrap_or("options.timeout");
            for step in next
                .steps
                .iter_mut()
                .filter(|s| selects(s, strategy, Some("httpRequest")))
            {
                let current = step.parameter_at(field).and_then(Value::as_u64);
                if current.map_or(true, |c| c < timeout) {
                    set_param(step, field, json!(timeout), &mut changes);
                }
            }
        }
        StrategyKind::AddRetry => {
            let mut retry = json!({
                "enabled": true,
                "maxRetries": strategy.param_u64("max_retries").unwrap_or(3),
                "backoffFactor": strategy.param("backoff_factor").cloned().unwrap_or(json!(2)),
            });
            if let (Some(codes), Some(obj)) = (strategy.param("status_codes"), retry.as_object_mut()) {
                obj.insert("statusCodes".into(), codes.clone());
            }
            upsert_where_different(&mut next, strategy, Some("httpRequest"), "options.retry", &retry, &mut changes);
        }
        StrategyKind::AddCircuitBreaker => {
            let breaker = json!({
                "enabled": true,
                "failureThreshold": strategy.param_u64("failure_threshold").unwrap_or(5),
                "recoveryTimeout": strategy.param_u64("recovery_timeout").unwrap_or(60),
            });
            upsert_where_different(
                &mut next,
                strategy,
                Some("httpRequest"),
                "options.circuitBreaker",
                &breaker,
                &mut changes,
            );
        }
        StrategyKind::AddInputValidation => {
            rewrite_code(&mut next, strategy, VALIDATION_MARKER, &mut changes, |code| {
                format!(
                    "{VALIDATION_MARKER}\nconst validItems = $input.all().filter((item) => item && item.json != null);\nif (validItems.length === 0) {{\n  return [];\n}}\n{code}"
                )
            });
        }
        StrategyKind::AddErrorHandling => {
            rewrite_code(&mut next, strategy, ERROR_HANDLING_MARKER, &mut changes, |code| {
                let body: String = code.lines().map(|l| format!("  {l}\n")).collect();
                format!(
                    "{ERROR_HANDLING_MARKER}\ntry {{\n{body}}} catch (error) {{\n  return [{{ json: {{ error: error.message, recovered: true }} }}];\n}}"
                )
            });
        }
        StrategyKind::ReplaceStep => {
            let name = required_str(strategy, "step")?;
            let replacement = strategy
                .param_str("replacement_type")
                .unwrap_or("n8n-nodes-base.set");
            if let Some(step) = next.steps.iter_mut().find(|s| s.name == name) {
                if step.step_type != replacement {
                    let before = std::mem::replace(&mut step.step_type, replacement.to_string());
                    step.parameters = Map::new();
                    changes.push(Change {
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        path: "type".into(),
                        before: Some(Value::String(before)),
                        after: Value::String(replacement.to_string()),
                    });
                }
            }
        }
        StrategyKind::UpdateMapping => {
            let field = required_str(strategy, "field")?;
            let expression = strategy
                .param("expression")
                .cloned()
                .unwrap_or_else(|| Value::String(format!("={{{{ $json.{field} ?? null }}}}")));
            let path = format!("values.{field}");
            upsert_where_different(&mut next, strategy, Some("set"), &path, &expression, &mut changes);
        }
    }

    if changes.is_empty() {
        return Err(RepairError::NoQualifyingStep { kind });
    }
    Ok((next, changes))
}

fn selects(step: &Step, strategy: &RepairStrategy, default_pattern: Option<&str>) -> bool {
    if let Some(name) = strategy.param_str("step") {
        return step.name == name;
    }
    match strategy.param_str("step_pattern").or(default_pattern) {
        Some(pattern) => step.type_matches(pattern),
        None => true,
    }
}

fn required(strategy: &RepairStrategy, key: &str) -> Result<Value, RepairError> {
    strategy
        .param(key)
        .cloned()
        .ok_or_else(|| RepairError::missing(strategy.kind, key))
}

fn required_str<'a>(strategy: &'a RepairStrategy, key: &str) -> Result<&'a str, RepairError> {
    strategy
        .param_str(key)
        .ok_or_else(|| RepairError::missing(strategy.kind, key))
}

fn set_param(step: &mut Step, path: &str, value: Value, changes: &mut Vec<Change>) {
    let before = step.set_parameter_at(path, value.clone());
    changes.push(Change {
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        path: path.to_string(),
        before,
        after: value,
    });
}

fn upsert_where_different(
    state: &mut TargetState,
    strategy: &RepairStrategy,
    default_pattern: Option<&str>,
    path: &str,
    value: &Value,
    changes: &mut Vec<Change>,
) {
    for step in state
        .steps
        .iter_mut()
        .filter(|s| selects(s, strategy, default_pattern))
    {
        if step.parameter_at(path) != Some(value) {
            set_param(step, path, value.clone(), changes);
        }
    }
}

fn rewrite_code(
    state: &mut TargetState,
    strategy: &RepairStrategy,
    marker: &str,
    changes: &mut Vec<Change>,
    rewrite: impl Fn(&str) -> String,
) {
    let field = strategy.param_str("code_field").unwrap_or("jsCode");
    for step in state
        .steps
        .iter_mut()
        .filter(|s| selects(s, strategy, Some("code")))
    {
        let Some(code) = step.parameter_at(field).and_then(Value::as_str) else {
            continue;
        };
        if code.contains(marker) {
            continue;
        }
        let updated = Value::String(rewrite(code));
        set_param(step, field, updated, changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RiskTier;
    use pretty_assertions::assert_eq;

    fn workflow() -> TargetState {
        TargetState::new("wf")
            .with_step(Step::new(
                "m",
                "Memory",
                "@n8n/n8n-nodes-langchain.memoryBufferWindow",
            ))
            .with_step(
                Step::new("h", "Fetch", "n8n-nodes-base.httpRequest")
                    .with_parameter("options", json!({ "timeout": 10_000 })),
            )
            .with_step(
                Step::new("c", "Transform", "n8n-nodes-base.code")
                    .with_parameter("jsCode", json!("return items;")),
            )
    }

    fn strategy(kind: StrategyKind) -> RepairStrategy {
        RepairStrategy::new(kind, "test", 0.5, RiskTier::Low)
    }

    #[test]
    fn add_parameter_targets_matching_steps_lacking_it() {
        let s = strategy(StrategyKind::AddParameter)
            .with_param("parameter", "sessionIdExpression")
            .with_param("value", "={{ $workflow.executionId }}")
            .with_param("step_pattern", "memory");
        let (next, changes) = plan(&workflow(), &s).unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].step_name, "Memory");
        assert_eq!(
            next.steps[0].parameter_at("sessionIdExpression"),
            Some(&json!("={{ $workflow.executionId }}"))
        );

        let again = plan(&next, &s).unwrap_err();
        assert!(matches!(again, RepairError::NoQualifyingStep { .. }));
    }

    #[test]
    fn increase_timeout_never_lowers() {
        let raise = strategy(StrategyKind::IncreaseTimeout).with_param("timeout", 60_000);
        let (next, changes) = plan(&workflow(), &raise).unwrap();
        assert_eq!(changes[0].before, Some(json!(10_000)));
        assert_eq!(next.steps[1].parameter_at("options.timeout"), Some(&json!(60_000)));

        let lower = strategy(StrategyKind::IncreaseTimeout).with_param("timeout", 5_000);
        assert!(plan(&workflow(), &lower).is_err());
    }

    #[test]
    fn retry_settings_nest_under_options() {
        let s = strategy(StrategyKind::AddRetry)
            .with_param("max_retries", 3)
            .with_param("backoff_factor", 2);
        let (next, _) = plan(&workflow(), &s).unwrap();
        let http = &next.steps[1];
        assert_eq!(http.parameter_at("options.retry.maxRetries"), Some(&json!(3)));
        assert_eq!(http.parameter_at("options.timeout"), Some(&json!(10_000)));
    }

    #[test]
    fn code_rewrites_are_marked_and_idempotent() {
        let s = strategy(StrategyKind::AddErrorHandling);
        let (next, _) = plan(&workflow(), &s).unwrap();
        let code = next.steps[2].parameter_at("jsCode").and_then(Value::as_str).unwrap();
        assert!(code.starts_with(ERROR_HANDLING_MARKER));
        assert!(code.contains("  return items;"));
        assert!(plan(&next, &s).is_err());

        let v = strategy(StrategyKind::AddInputValidation);
        let (validated, _) = plan(&next, &v).unwrap();
        let code = validated.steps[2].parameter_at("jsCode").and_then(Value::as_str).unwrap();
        assert!(code.starts_with(VALIDATION_MARKER));
    }

    #[test]
    fn replace_step_only_touches_named_step() {
        let s = strategy(StrategyKind::ReplaceStep)
            .with_param("step", "Transform")
            .with_param("replacement_type", "n8n-nodes-base.set");
        let (next, changes) = plan(&workflow(), &s).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(next.steps[2].step_type, "n8n-nodes-base.set");
        assert!(next.steps[2].parameters.is_empty());
        assert_eq!(next.steps[1], workflow().steps[1]);
    }

    #[test]
    fn credential_reference_requires_id() {
        let s = strategy(StrategyKind::FixCredentialReference).with_param("credential_type", "openRouterApi");
        assert!(matches!(
            plan(&workflow(), &s),
            Err(RepairError::MissingParameter { .. })
        ));

        let s = s
            .with_param("credential_id", "cred-7")
            .with_param("step", "Fetch");
        let (next, changes) = plan(&workflow(), &s).unwrap();
        assert_eq!(changes[0].path, "credentials.openRouterApi");
        let creds = next.steps[1].credentials.as_ref().unwrap();
        assert_eq!(creds["openRouterApi"]["id"], json!("cred-7"));
    }

    #[test]
    fn update_parameter_requires_existing_value() {
        let s = strategy(StrategyKind::UpdateParameter)
            .with_param("parameter", "options.timeout")
            .with_param("value", 20_000);
        let (_, changes) = plan(&workflow(), &s).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].step_name, "Fetch");
    }

    #[test]
    fn update_mapping_writes_null_safe_expression() {
        let state = workflow().with_step(Step::new("s", "Shape", "n8n-nodes-base.set"));
        let s = strategy(StrategyKind::UpdateMapping).with_param("field", "email");
        let (next, _) = plan(&state, &s).unwrap();
        assert_eq!(
            next.steps[3].parameter_at("values.email"),
            Some(&json!("={{ $json.email ?? null }}"))
        );
    }

    #[test]
    fn input_is_left_untouched() {
        let before = workflow();
        let s = strategy(StrategyKind::AddCircuitBreaker);
        let _ = plan(&before, &s).unwrap();
        assert_eq!(before, workflow());
    }
}
