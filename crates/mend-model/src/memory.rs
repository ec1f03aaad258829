//! In-memory [`TargetSystem`]
//!
//! Backs the daemon's fixture mode and the test suites. Verification runs
//! can be scripted per target, writes can be made to fail, and the whole
//! engine can be marked unreachable.

use crate::execution::{ExecutionInfo, ExecutionStatus, StepError};
use crate::ids::{ExecutionId, TargetId};
use crate::state::TargetState;
use crate::target::{TargetError, TargetSystem};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

/// Serializable seed data for a [`MemoryTarget`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFixture {
    /// Workflow definitions
    #[serde(default)]
    pub targets: BTreeMap<TargetId, TargetState>,
    /// Execution history
    #[serde(default)]
    pub executions: Vec<ExecutionInfo>,
    /// Step errors per execution
    #[serde(default)]
    pub errors: BTreeMap<ExecutionId, Vec<StepError>>,
}

impl MemoryFixture {
    /// Load a fixture from a `.json`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// Returns [`TargetError::InvalidPayload`] if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, TargetError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TargetError::InvalidPayload(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&raw)
                .map_err(|e| TargetError::InvalidPayload(e.to_string())),
            _ => serde_json::from_str(&raw).map_err(|e| TargetError::InvalidPayload(e.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<TargetId, TargetState>,
    executions: Vec<ExecutionInfo>,
    errors: HashMap<ExecutionId, Vec<StepError>>,
    verification: HashMap<TargetId, VecDeque<Option<StepError>>>,
    running_polls: HashMap<ExecutionId, u32>,
    verification_pending_polls: u32,
    unreachable: bool,
    fail_updates: bool,
    updates: HashMap<TargetId, u32>,
    runs: HashMap<TargetId, u32>,
    next_id: u64,
}

impl Inner {
    fn mint_id(&mut self, prefix: &str) -> ExecutionId {
        self.next_id += 1;
        ExecutionId::new(format!("{prefix}-{}", self.next_id))
    }

    fn ensure_reachable(&self) -> Result<(), TargetError> {
        if self.unreachable {
            Err(TargetError::Unreachable("memory target offline".into()))
        } else {
            Ok(())
        }
    }
}

/// Workflow engine held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryTarget {
    inner: Mutex<Inner>,
}

impl MemoryTarget {
    /// Empty engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine seeded from a fixture
    #[must_use]
    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let inner = Inner {
            states: fixture.targets.into_iter().collect(),
            executions: fixture.executions,
            errors: fixture.errors.into_iter().collect(),
            ..Inner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Register or replace a workflow
    pub fn insert_target(&self, id: impl Into<TargetId>, state: TargetState) {
        self.inner.lock().states.insert(id.into(), state);
    }

    /// Append an execution record with its step errors
    pub fn push_execution(&self, info: ExecutionInfo, errors: Vec<StepError>) {
        let mut inner = self.inner.lock();
        if !errors.is_empty() {
            inner.errors.insert(info.id.clone(), errors);
        }
        inner.executions.push(info);
    }

    /// Record a failed production run of `target` that just finished
    pub fn record_failure(&self, target: impl Into<TargetId>, error: StepError) -> ExecutionId {
        let mut inner = self.inner.lock();
        let id = inner.mint_id("exec");
        let now = Utc::now();
        inner.executions.push(ExecutionInfo {
            id: id.clone(),
            target_id: target.into(),
            status: ExecutionStatus::Error,
            finished: true,
            started_at: now,
            stopped_at: Some(now),
        });
        inner.errors.insert(id.clone(), vec![error]);
        id
    }

    /// Queue the outcome of the next verification run of `target`
    ///
    /// `None` means the run succeeds. Unscripted runs succeed.
    pub fn script_verification(&self, target: impl Into<TargetId>, outcome: Option<StepError>) {
        self.inner
            .lock()
            .verification
            .entry(target.into())
            .or_default()
            .push_back(outcome);
    }

    /// Report verification runs as running for this many status checks
    pub fn set_verification_pending_polls(&self, polls: u32) {
        self.inner.lock().verification_pending_polls = polls;
    }

    /// Simulate the engine going offline or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unreachable = !reachable;
    }

    /// Make every workflow write fail
    pub fn set_fail_updates(&self, fail: bool) {
        self.inner.lock().fail_updates = fail;
    }

    /// Current definition of a workflow
    #[must_use]
    pub fn state(&self, target: &TargetId) -> Option<TargetState> {
        self.inner.lock().states.get(target).cloned()
    }

    /// Number of successful writes to a workflow
    #[must_use]
    pub fn update_count(&self, target: &TargetId) -> u32 {
        self.inner.lock().updates.get(target).copied().unwrap_or(0)
    }

    /// Number of runs started through [`TargetSystem::execute_target`]
    #[must_use]
    pub fn run_count(&self, target: &TargetId) -> u32 {
        self.inner.lock().runs.get(target).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TargetSystem for MemoryTarget {
    async fn list_recent_executions(&self, limit: usize) -> Result<Vec<ExecutionInfo>, TargetError> {
        let inner = self.inner.lock();
        inner.ensure_reachable()?;
        let mut all = inner.executions.clone();
        all.sort_by(|a, b| b.observed_at().cmp(&a.observed_at()));
        all.truncate(limit);
        Ok(all)
    }

    async fn get_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<StepError>, TargetError> {
        let inner = self.inner.lock();
        inner.ensure_reachable()?;
        Ok(inner.errors.get(execution_id).cloned().unwrap_or_default())
    }

    async fn get_target_state(&self, target: &TargetId) -> Result<TargetState, TargetError> {
        let inner = self.inner.lock();
        inner.ensure_reachable()?;
        inner
            .states
            .get(target)
            .cloned()
            .ok_or_else(|| TargetError::NotFound(target.to_string()))
    }

    async fn update_target_state(
        &self,
        target: &TargetId,
        state: &TargetState,
    ) -> Result<(), TargetError> {
        let mut inner = self.inner.lock();
        inner.ensure_reachable()?;
        if inner.fail_updates {
            return Err(TargetError::Rejected(format!("write to {target} refused")));
        }
        let slot = inner
            .states
            .get_mut(target)
            .ok_or_else(|| TargetError::NotFound(target.to_string()))?;
        *slot = state.clone();
        *inner.updates.entry(target.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn execute_target(
        &self,
        target: &TargetId,
        _input: &Value,
    ) -> Result<ExecutionId, TargetError> {
        let mut inner = self.inner.lock();
        inner.ensure_reachable()?;
        if !inner.states.contains_key(target) {
            return Err(TargetError::NotFound(target.to_string()));
        }
        let outcome = inner
            .verification
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .flatten();
        let id = inner.mint_id("run");
        let now = Utc::now();
        let status = if outcome.is_some() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Success
        };
        inner.executions.push(ExecutionInfo {
            id: id.clone(),
            target_id: target.clone(),
            status,
            finished: true,
            started_at: now,
            stopped_at: Some(now),
        });
        if let Some(error) = outcome {
            inner.errors.insert(id.clone(), vec![error]);
        }
        let pending = inner.verification_pending_polls;
        if pending > 0 {
            inner.running_polls.insert(id.clone(), pending);
        }
        *inner.runs.entry(target.clone()).or_insert(0) += 1;
        Ok(id)
    }

    async fn set_active(&self, target: &TargetId, active: bool) -> Result<(), TargetError> {
        let mut inner = self.inner.lock();
        inner.ensure_reachable()?;
        let state = inner
            .states
            .get_mut(target)
            .ok_or_else(|| TargetError::NotFound(target.to_string()))?;
        state.active = active;
        Ok(())
    }

    async fn execution_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionInfo, TargetError> {
        let mut inner = self.inner.lock();
        inner.ensure_reachable()?;
        let info = inner
            .executions
            .iter()
            .find(|e| &e.id == execution_id)
            .cloned()
            .ok_or_else(|| TargetError::NotFound(execution_id.to_string()))?;
        if let Some(left) = inner.running_polls.get_mut(execution_id) {
            if *left > 0 {
                *left -= 1;
                return Ok(ExecutionInfo {
                    status: ExecutionStatus::Running,
                    finished: false,
                    stopped_at: None,
                    ..info
                });
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Step;

    fn target() -> MemoryTarget {
        let t = MemoryTarget::new();
        t.insert_target(
            "wf",
            TargetState::new("wf").with_step(Step::new("1", "HTTP", "n8n-nodes-base.httpRequest")),
        );
        t
    }

    #[tokio::test]
    async fn failures_are_listed_newest_first() {
        let t = target();
        let first = t.record_failure("wf", StepError::new("HTTP", "E", "one"));
        let second = t.record_failure("wf", StepError::new("HTTP", "E", "two"));

        let listed = t.list_recent_executions(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|e| e.id == first));
        assert!(listed.iter().any(|e| e.id == second));

        let errors = t.get_execution_errors(&second).await.unwrap();
        assert_eq!(errors[0].error.message, "two");
    }

    #[tokio::test]
    async fn scripted_verification_and_pending_polls() {
        let t = target();
        let wf = TargetId::from("wf");
        t.script_verification("wf", Some(StepError::new("HTTP", "E", "still broken")));
        t.set_verification_pending_polls(1);

        let run = t.execute_target(&wf, &Value::Null).await.unwrap();
        let first = t.execution_status(&run).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Running);
        let second = t.execution_status(&run).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Error);

        let next = t.execute_target(&wf, &Value::Null).await.unwrap();
        assert_eq!(t.execution_status(&next).await.unwrap().status, ExecutionStatus::Running);
        assert_eq!(t.execution_status(&next).await.unwrap().status, ExecutionStatus::Success);
        assert_eq!(t.run_count(&wf), 2);
    }

    #[tokio::test]
    async fn unreachable_and_rejected_writes() {
        let t = target();
        let wf = TargetId::from("wf");
        let state = t.state(&wf).unwrap();

        t.set_fail_updates(true);
        assert!(matches!(
            t.update_target_state(&wf, &state).await,
            Err(TargetError::Rejected(_))
        ));
        assert_eq!(t.update_count(&wf), 0);

        t.set_reachable(false);
        assert!(t.health_check().await.unwrap_err().is_retryable());
    }

    #[test]
    fn fixture_parses_from_json() {
        let raw = r#"{
            "targets": {"wf": {"name": "wf", "nodes": [], "connections": {}}},
            "executions": [],
            "errors": {}
        }"#;
        let fixture: MemoryFixture = serde_json::from_str(raw).unwrap();
        let t = MemoryTarget::from_fixture(fixture);
        assert!(t.state(&TargetId::from("wf")).is_some());
    }
}
