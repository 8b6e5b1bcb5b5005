// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Task records, the lifecycle state machine, and the replicated task
//! registry.
//!
//! The [`TaskManager`] is the authoritative writer for tasks created on this
//! node; every mutation goes through it and is then re-stamped into the
//! [`TaskRegistry`] CRDT for gossip. State machine:
//!
//! ```text
//!                assign(agent)              start
//!    open ─────────────────────────► assigned ──────► in_progress
//!      │            cancel                                  │
//!      │                                                    │ complete / fail
//!      ▼                                                    ▼
//!   cancelled                                    completed  |  failed
//! ```
//!
//! `completed`, `failed`, and `cancelled` are terminal; a task never leaves
//! them. Assignment requires every dependency to be `completed`.

use std::collections::HashMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::lww::{unix_now, CrdtMap};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("invalid transition: task {task_id} is {status}")]
    InvalidTransition { task_id: String, status: TaskStatus },

    #[error("task {task_id} has unmet dependency {dependency}")]
    UnmetDependency { task_id: String, dependency: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Open,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    /// 1 (highest) to 10 (lowest), clamped on ingress.
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// `task_<unix_seconds>_<8 hex>`.
fn new_task_id() -> String {
    let mut suffix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    format!("task_{}_{}", unix_now() as u64, hex::encode(suffix))
}

/// Authoritative task store and state machine for locally-owned tasks.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: HashMap<String, Task>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task.
    ///
    /// Priority is clamped to `1..=10`; dependencies naming unknown tasks are
    /// dropped with a warning. When `assignee` is given the task is assigned
    /// immediately if its dependencies allow it, otherwise it stays `open`.
    pub fn create_task(
        &mut self,
        title: &str,
        description: &str,
        assignee: Option<&str>,
        priority: u8,
        dependencies: Vec<String>,
        metadata: HashMap<String, Value>,
    ) -> Task {
        let dependencies: Vec<String> = dependencies
            .into_iter()
            .filter(|dep| {
                let known = self.tasks.contains_key(dep);
                if !known {
                    tracing::warn!(dependency = %dep, "dependency does not exist, ignoring");
                }
                known
            })
            .collect();

        let now = unix_now();
        let task = Task {
            task_id: new_task_id(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Open,
            assignee: None,
            priority: priority.clamp(1, 10),
            dependencies,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            metadata,
        };
        let task_id = task.task_id.clone();
        tracing::info!(task = %task_id, title = %task.title, priority = task.priority, "created task");
        self.tasks.insert(task_id.clone(), task);

        if let Some(agent) = assignee {
            if let Err(e) = self.assign_task(&task_id, agent) {
                tracing::warn!(task = %task_id, "initial assignment failed: {e}");
            }
        }
        self.tasks[&task_id].clone()
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// List tasks sorted by `(priority asc, created_at asc)`, with status and
    /// assignee filters applied before the limit.
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        assignee: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .filter(|t| assignee.is_none_or(|a| t.assignee.as_deref() == Some(a)))
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.total_cmp(&b.created_at))
        });
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Assign a task. Every dependency must already be `completed`.
    pub fn assign_task(&mut self, task_id: &str, agent_id: &str) -> Result<&Task, TaskError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;

        if !matches!(task.status, TaskStatus::Open | TaskStatus::Assigned) {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        for dep in &task.dependencies {
            let done = self
                .tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed);
            if !done {
                return Err(TaskError::UnmetDependency {
                    task_id: task_id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        let task = self.tasks.get_mut(task_id).unwrap();
        task.assignee = Some(agent_id.to_string());
        task.status = TaskStatus::Assigned;
        task.updated_at = unix_now();
        tracing::info!(task = %task_id, agent = %agent_id, "assigned task");
        Ok(task)
    }

    pub fn start_task(&mut self, task_id: &str) -> Result<&Task, TaskError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        if task.status != TaskStatus::Assigned {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(unix_now());
        task.updated_at = unix_now();
        tracing::info!(task = %task_id, "started task");
        Ok(task)
    }

    pub fn complete_task(
        &mut self,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<&Task, TaskError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        if task.status != TaskStatus::InProgress {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(unix_now());
        task.updated_at = unix_now();
        if let Some(result) = result {
            task.metadata.insert("result".into(), result);
        }
        tracing::info!(task = %task_id, "completed task");
        Ok(task)
    }

    pub fn fail_task(&mut self, task_id: &str, error: Option<&str>) -> Result<&Task, TaskError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        task.status = TaskStatus::Failed;
        task.updated_at = unix_now();
        if let Some(error) = error {
            task.metadata
                .insert("error".into(), Value::String(error.to_string()));
        }
        tracing::warn!(task = %task_id, "task failed: {}", error.unwrap_or("unspecified"));
        Ok(task)
    }

    pub fn cancel_task(&mut self, task_id: &str) -> Result<&Task, TaskError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at = unix_now();
        tracing::info!(task = %task_id, "cancelled task");
        Ok(task)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn get_stats(&self) -> HashMap<String, usize> {
        let mut stats = HashMap::new();
        for status in TaskStatus::ALL {
            stats.insert(
                status.to_string(),
                self.tasks.values().filter(|t| t.status == status).count(),
            );
        }
        stats
    }
}

/// CRDT-backed distributed task registry.
///
/// Task records are full task dictionaries keyed by task id; the local
/// [`TaskManager`] mutates its copy first, then re-stamps the record here.
#[derive(Debug)]
pub struct TaskRegistry {
    crdt: CrdtMap,
}

impl TaskRegistry {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            crdt: CrdtMap::new(node_id),
        }
    }

    pub fn update_task(&mut self, task: &Task) {
        if let Ok(value) = serde_json::to_value(task) {
            self.crdt.set(task.task_id.clone(), value);
        }
    }

    pub fn remove_task(&mut self, task_id: &str) {
        self.crdt.remove(task_id);
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.crdt
            .get(task_id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .crdt
            .items()
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.total_cmp(&b.created_at))
        });
        tasks
    }

    pub fn sync_from_crdt(&mut self, crdt_state: &Value) {
        self.crdt.merge(crdt_state);
    }

    pub fn get_crdt_state(&self) -> Value {
        self.crdt.get_state()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mgr() -> TaskManager {
        TaskManager::new()
    }

    #[test]
    fn task_id_shape() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        let parts: Vec<&str> = t.task_id.splitn(3, '_').collect();
        assert_eq!(parts[0], "task");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn priority_is_clamped() {
        let mut m = mgr();
        assert_eq!(m.create_task("t", "d", None, 0, vec![], HashMap::new()).priority, 1);
        assert_eq!(m.create_task("t", "d", None, 99, vec![], HashMap::new()).priority, 10);
    }

    #[test]
    fn unknown_dependencies_are_dropped() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec!["task_0_dead0000".into()], HashMap::new());
        assert!(t.dependencies.is_empty());
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        let id = t.task_id.clone();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.assignee.is_none());

        m.assign_task(&id, "agent-a").unwrap();
        assert_eq!(m.get_task(&id).unwrap().status, TaskStatus::Assigned);

        m.start_task(&id).unwrap();
        assert!(m.get_task(&id).unwrap().started_at.is_some());

        m.complete_task(&id, Some(json!({"ok": true}))).unwrap();
        let done = m.get_task(&id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.metadata["result"], json!({"ok": true}));
    }

    #[test]
    fn assignment_with_unmet_dependency_fails() {
        let mut m = mgr();
        let t1 = m.create_task("t1", "d", None, 5, vec![], HashMap::new());
        let t2 = m.create_task("t2", "d", None, 5, vec![t1.task_id.clone()], HashMap::new());

        let err = m.assign_task(&t2.task_id, "agent-a").unwrap_err();
        assert!(matches!(err, TaskError::UnmetDependency { .. }));

        // Complete t1, then assignment succeeds.
        m.assign_task(&t1.task_id, "agent-a").unwrap();
        m.start_task(&t1.task_id).unwrap();
        m.complete_task(&t1.task_id, None).unwrap();
        assert_eq!(
            m.assign_task(&t2.task_id, "agent-a").unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[test]
    fn create_with_assignee_and_unmet_deps_stays_open() {
        let mut m = mgr();
        let t1 = m.create_task("t1", "d", None, 5, vec![], HashMap::new());
        let t2 = m.create_task("t2", "d", Some("agent-a"), 5, vec![t1.task_id], HashMap::new());
        assert_eq!(t2.status, TaskStatus::Open);
        assert!(t2.assignee.is_none());
    }

    #[test]
    fn terminal_states_are_never_left() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        let id = t.task_id.clone();
        m.cancel_task(&id).unwrap();

        assert!(m.assign_task(&id, "a").is_err());
        assert!(m.start_task(&id).is_err());
        assert!(m.complete_task(&id, None).is_err());
        assert!(m.fail_task(&id, None).is_err());
        assert!(m.cancel_task(&id).is_err());
        assert_eq!(m.get_task(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn start_requires_assignment() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        assert!(matches!(
            m.start_task(&t.task_id),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fail_records_error_metadata() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        let id = t.task_id.clone();
        m.assign_task(&id, "a").unwrap();
        m.fail_task(&id, Some("disk on fire")).unwrap();
        assert_eq!(
            m.get_task(&id).unwrap().metadata["error"],
            json!("disk on fire")
        );
    }

    #[test]
    fn unknown_task_errors() {
        let mut m = mgr();
        assert!(matches!(
            m.assign_task("task_0_00000000", "a"),
            Err(TaskError::UnknownTask(_))
        ));
    }

    #[test]
    fn list_orders_by_priority_then_created_at() {
        let mut m = mgr();
        let low = m.create_task("low", "d", None, 9, vec![], HashMap::new());
        let high = m.create_task("high", "d", None, 1, vec![], HashMap::new());
        let mid = m.create_task("mid", "d", None, 5, vec![], HashMap::new());

        let ids: Vec<&str> = m
            .list_tasks(None, None, None)
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(ids, vec![&high.task_id[..], &mid.task_id[..], &low.task_id[..]]);
    }

    #[test]
    fn list_filters_apply_before_limit() {
        let mut m = mgr();
        for i in 0..4 {
            let t = m.create_task(&format!("t{i}"), "d", None, 5, vec![], HashMap::new());
            if i % 2 == 0 {
                m.assign_task(&t.task_id, "agent-a").unwrap();
            }
        }
        let assigned = m.list_tasks(Some(TaskStatus::Assigned), Some("agent-a"), Some(1));
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].status, TaskStatus::Assigned);
    }

    #[test]
    fn registry_replicates_records_between_nodes() {
        let mut m = mgr();
        let task = m.create_task("t", "d", None, 3, vec![], HashMap::new());

        let mut reg_a = TaskRegistry::new("node-a");
        reg_a.update_task(&task);

        let mut reg_b = TaskRegistry::new("node-b");
        reg_b.sync_from_crdt(&reg_a.get_crdt_state());

        let replica = reg_b.get_task(&task.task_id).unwrap();
        assert_eq!(replica, task);
        assert_eq!(reg_b.list_tasks().len(), 1);
    }

    #[test]
    fn stats_count_by_status() {
        let mut m = mgr();
        let t = m.create_task("t", "d", None, 5, vec![], HashMap::new());
        m.assign_task(&t.task_id, "a").unwrap();
        let stats = m.get_stats();
        assert_eq!(stats["assigned"], 1);
        assert_eq!(stats["open"], 0);
    }
}
