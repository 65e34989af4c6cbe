// SPDX-License-Identifier: Apache-2.0
//!
//! Task records and the state machine shared by agent tasks and service
//! tasks:
//!
//! ```text
//! pending → in_progress → completed
//!                       ↘ failed
//! pending → failed | cancelled
//! in_progress → cancelled
//! ```
//!
//! Terminal statuses (`completed`, `failed`, `cancelled`) reject any further
//! transition. Every accepted transition is broadcast as a [`TaskEvent`] so
//! the lifecycle notifier can fan it out without polling the registry.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use conclave_ids::{AgentId, ClientId, ServiceId, TaskId};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("cannot transition task {task} from {from:?} to {to:?}: terminal states are immutable")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

fn validate_transition(task: TaskId, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
    use TaskStatus::*;
    let ok = matches!(
        (from, to),
        (Pending, InProgress) | (Pending, Failed) | (Pending, Cancelled)
            | (InProgress, Completed) | (InProgress, Failed) | (InProgress, Cancelled)
    );
    if ok {
        Ok(())
    } else {
        Err(TaskError::InvalidTransition { task, from, to })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Client,
    Agent,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentTask {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub owner_kind: OwnerKind,
    /// The client id or agent id that owns this task, stringified so one
    /// field covers both owner kinds.
    pub owner_id: String,
    pub task_type: String,
    pub input: Value,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(agent_id: AgentId, owner_kind: OwnerKind, owner_id: String, task_type: String, input: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            agent_id,
            owner_kind,
            owner_id,
            task_type,
            input,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceTask {
    pub task_id: TaskId,
    pub service_id: ServiceId,
    /// Service tasks are always owned by an agent (possibly transitively by
    /// a client, tracked by the owning agent task).
    pub owner_agent_id: AgentId,
    pub function_name: String,
    pub params: Value,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ServiceTask {
    pub fn new(service_id: ServiceId, owner_agent_id: AgentId, function_name: String, params: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            service_id,
            owner_agent_id,
            function_name,
            params,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        }
    }
}

/// What changed, for lifecycle-notifier fan-out.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub prev: TaskStatus,
    pub next: TaskStatus,
    pub at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Outcome applied on a status transition: the result payload for a
/// completion, or the error string for a failure.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub result: Option<Value>,
    pub error: Option<String>,
}

trait HasStatus {
    fn task_id(&self) -> TaskId;
    fn status(&self) -> TaskStatus;
    fn apply(&mut self, next: TaskStatus, details: &TransitionDetails);
}

impl HasStatus for AgentTask {
    fn task_id(&self) -> TaskId {
        self.task_id
    }
    fn status(&self) -> TaskStatus {
        self.status
    }
    fn apply(&mut self, next: TaskStatus, details: &TransitionDetails) {
        self.status = next;
        self.last_updated_at = Utc::now();
        if let Some(r) = &details.result {
            self.result = Some(r.clone());
        }
        if let Some(e) = &details.error {
            self.error = Some(e.clone());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

impl HasStatus for ServiceTask {
    fn task_id(&self) -> TaskId {
        self.task_id
    }
    fn status(&self) -> TaskStatus {
        self.status
    }
    fn apply(&mut self, next: TaskStatus, details: &TransitionDetails) {
        self.status = next;
        self.last_updated_at = Utc::now();
        if let Some(r) = &details.result {
            self.result = Some(r.clone());
        }
        if let Some(e) = &details.error {
            self.error = Some(e.clone());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Generic over `AgentTask` and `ServiceTask`: a map from `TaskId` to task
/// record, enforcing the shared state machine and broadcasting
/// [`TaskEvent`]s on every accepted transition.
pub struct TaskRegistry<R> {
    tasks: RwLock<HashMap<TaskId, R>>,
    events: broadcast::Sender<TaskEvent>,
}

impl<R: HasStatus + Clone> Default for TaskRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: HasStatus + Clone> TaskRegistry<R> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub async fn create(&self, task: R) -> TaskId {
        let id = task.task_id();
        self.tasks.write().await.insert(id, task);
        id
    }

    pub async fn get(&self, id: &TaskId) -> Option<R> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn update_status(
        &self,
        id: &TaskId,
        next: TaskStatus,
        details: TransitionDetails,
    ) -> Result<(), TaskError> {
        let mut guard = self.tasks.write().await;
        let task = guard.get_mut(id).ok_or(TaskError::NotFound(*id))?;
        let prev = task.status();
        validate_transition(*id, prev, next)?;
        task.apply(next, &details);
        let _ = self.events.send(TaskEvent {
            task_id: *id,
            prev,
            next,
            at: Utc::now(),
            result: details.result,
            error: details.error,
        });
        Ok(())
    }

    /// Fails every non-terminal task matching `pred` with `error` — used
    /// when the executor behind those tasks disconnects.
    pub async fn fail_matching(&self, pred: impl Fn(&R) -> bool, error: &str) -> Vec<TaskId> {
        let mut guard = self.tasks.write().await;
        let ids: Vec<TaskId> = guard
            .values()
            .filter(|t| !t.status().is_terminal() && pred(t))
            .map(|t| t.task_id())
            .collect();
        let mut failed = Vec::new();
        for id in ids {
            if let Some(task) = guard.get_mut(&id) {
                let prev = task.status();
                if validate_transition(id, prev, TaskStatus::Failed).is_ok() {
                    let details = TransitionDetails { result: None, error: Some(error.to_string()) };
                    task.apply(TaskStatus::Failed, &details);
                    let _ = self.events.send(TaskEvent {
                        task_id: id,
                        prev,
                        next: TaskStatus::Failed,
                        at: Utc::now(),
                        result: None,
                        error: Some(error.to_string()),
                    });
                    failed.push(id);
                }
            }
        }
        failed
    }
}

/// Ensures a completed task always has a result payload, even if completion
/// arrived via `task.status: completed` with no prior `task.result` — the
/// orchestrator still delivers exactly one terminal notification.
pub fn result_or_empty(result: Option<Value>) -> Value {
    result.unwrap_or(Value::Null)
}
