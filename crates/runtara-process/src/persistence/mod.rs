// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runtara-process.
//!
//! The engine talks to storage through [`ProcessStore`]. Runtime state is stored
//! per instance hierarchy (all instances sharing one root); every command loads a
//! hierarchy, mutates it in memory and hands the result back as one
//! [`UnitOfWork`]. Stores apply a unit atomically and reject it with
//! [`EngineError::ConcurrentModification`](crate::error::EngineError::ConcurrentModification)
//! when the hierarchy revision changed since it was loaded.

pub mod memory;

pub use self::memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::{Batch, BatchJob};
use crate::error::Result;
use crate::history::{
    HistoricActivityInstance, HistoricIncident, HistoricProcessInstance, HistoricVariableDetail,
    HistoricVariableInstance, HistoryEvent, ProcessInstanceState, UserOperationLogEntry,
};
use crate::instance::{EventSubscription, Incident, InstanceHierarchy, Job, ProcessInstance, Task};

/// Everything one command writes.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    /// Mutated hierarchy. Its `revision` is the revision it was loaded at; a
    /// hierarchy without live instances is removed.
    pub hierarchy: Option<InstanceHierarchy>,
    /// History buffered by the command.
    pub history: Vec<HistoryEvent>,
    /// Batches to insert or replace.
    pub batches: Vec<Batch>,
    /// New batch jobs.
    pub batch_jobs_created: Vec<BatchJob>,
    /// Ids of finished batch jobs.
    pub batch_jobs_deleted: Vec<String>,
}

impl UnitOfWork {
    /// Unit that only writes history.
    pub fn history(history: Vec<HistoryEvent>) -> Self {
        Self {
            history,
            ..Default::default()
        }
    }
}

/// Filter for running process instances.
#[derive(Debug, Clone, Default)]
pub struct ProcessInstanceQuery {
    /// Only instances of this definition.
    pub process_definition_id: Option<String>,
    /// Only instances with this business key.
    pub business_key: Option<String>,
    /// Only suspended (`true`) or active (`false`) instances.
    pub suspended: Option<bool>,
    /// Only instances of this call hierarchy.
    pub root_process_instance_id: Option<String>,
}

impl ProcessInstanceQuery {
    /// Whether `instance` passes the filter.
    pub fn matches(&self, instance: &ProcessInstance) -> bool {
        self.process_definition_id
            .as_ref()
            .is_none_or(|d| &instance.definition_id == d)
            && self
                .business_key
                .as_ref()
                .is_none_or(|k| instance.business_key.as_ref() == Some(k))
            && self.suspended.is_none_or(|s| instance.suspended == s)
            && self
                .root_process_instance_id
                .as_ref()
                .is_none_or(|r| &instance.root_process_instance_id == r)
    }
}

/// Filter for user tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Only this task.
    pub task_id: Option<String>,
    /// Only tasks of this instance.
    pub process_instance_id: Option<String>,
    /// Only tasks of this activity.
    pub activity_id: Option<String>,
}

impl TaskQuery {
    /// Whether `task` passes the filter.
    pub fn matches(&self, task: &Task) -> bool {
        self.task_id.as_ref().is_none_or(|t| &task.id == t)
            && self
                .process_instance_id
                .as_ref()
                .is_none_or(|p| &task.process_instance_id == p)
            && self
                .activity_id
                .as_ref()
                .is_none_or(|a| &task.activity_id == a)
    }
}

/// Filter for jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only this job.
    pub job_id: Option<String>,
    /// Only jobs of this instance.
    pub process_instance_id: Option<String>,
    /// Only jobs with retries left (`true`) or without (`false`).
    pub with_retries_left: Option<bool>,
}

impl JobQuery {
    /// Whether `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.job_id.as_ref().is_none_or(|j| &job.id == j)
            && self
                .process_instance_id
                .as_ref()
                .is_none_or(|p| &job.process_instance_id == p)
            && self
                .with_retries_left
                .is_none_or(|r| (job.retries > 0) == r)
    }
}

/// Filter for message subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionQuery {
    /// Only message subscriptions for this name.
    pub message_name: Option<String>,
    /// Only subscriptions of this instance.
    pub process_instance_id: Option<String>,
}

/// Filter for historic process instances.
#[derive(Debug, Clone, Default)]
pub struct HistoricProcessInstanceQuery {
    /// Only these ids.
    pub process_instance_ids: Option<Vec<String>>,
    /// Only instances of this definition.
    pub process_definition_id: Option<String>,
    /// Only instances in this state.
    pub state: Option<ProcessInstanceState>,
    /// Only finished (`true`) or unfinished (`false`) instances.
    pub finished: Option<bool>,
    /// Only instances restarted from this one.
    pub restarted_process_instance_id: Option<String>,
}

impl HistoricProcessInstanceQuery {
    /// Whether `instance` passes the filter.
    pub fn matches(&self, instance: &HistoricProcessInstance) -> bool {
        self.process_instance_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&instance.id))
            && self
                .process_definition_id
                .as_ref()
                .is_none_or(|d| &instance.definition_id == d)
            && self.state.is_none_or(|s| instance.state == s)
            && self
                .finished
                .is_none_or(|f| instance.state.is_finished() == f)
            && self
                .restarted_process_instance_id
                .as_ref()
                .is_none_or(|r| instance.restarted_process_instance_id.as_ref() == Some(r))
    }
}

/// Filter for the user operation log.
#[derive(Debug, Clone, Default)]
pub struct UserOperationLogQuery {
    /// Only entries of this operation type.
    pub operation_type: Option<String>,
    /// Only entries of this action.
    pub operation_id: Option<String>,
    /// Only entries for this property.
    pub property: Option<String>,
    /// Only entries about this instance.
    pub process_instance_id: Option<String>,
    /// Only entries about this batch.
    pub batch_id: Option<String>,
}

impl UserOperationLogQuery {
    /// Whether `entry` passes the filter.
    pub fn matches(&self, entry: &UserOperationLogEntry) -> bool {
        self.operation_type
            .as_ref()
            .is_none_or(|t| &entry.operation_type == t)
            && self
                .operation_id
                .as_ref()
                .is_none_or(|o| &entry.operation_id == o)
            && self
                .property
                .as_ref()
                .is_none_or(|p| entry.property.as_ref() == Some(p))
            && self
                .process_instance_id
                .as_ref()
                .is_none_or(|p| entry.process_instance_id.as_ref() == Some(p))
            && self
                .batch_id
                .as_ref()
                .is_none_or(|b| entry.batch_id.as_ref() == Some(b))
    }
}

/// A job ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueJob {
    /// Owning instance.
    pub process_instance_id: String,
    /// Job id.
    pub job_id: String,
}

/// Storage used by the engine.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Load the hierarchy rooted at `root_process_instance_id`.
    async fn load_hierarchy(&self, root_process_instance_id: &str) -> Result<Option<InstanceHierarchy>>;

    /// Root of the hierarchy a running instance belongs to.
    async fn root_of(&self, process_instance_id: &str) -> Result<Option<String>>;

    /// Apply a unit of work atomically.
    async fn commit(&self, unit: UnitOfWork) -> Result<()>;

    /// Running process instances.
    async fn process_instances(&self, query: &ProcessInstanceQuery) -> Result<Vec<ProcessInstance>>;

    /// Open user tasks.
    async fn tasks(&self, query: &TaskQuery) -> Result<Vec<Task>>;

    /// Instance jobs.
    async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Event subscriptions.
    async fn subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<EventSubscription>>;

    /// Open incidents of an instance.
    async fn incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<Incident>>;

    /// Jobs due at `now` on active instances, oldest due date first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DueJob>>;

    /// Historic process instance by id.
    async fn historic_process_instance(&self, id: &str) -> Result<Option<HistoricProcessInstance>>;

    /// Historic process instances.
    async fn historic_process_instances(
        &self,
        query: &HistoricProcessInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>>;

    /// Historic activity instances of an instance in start order.
    async fn historic_activity_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricActivityInstance>>;

    /// Latest variable values of an instance.
    async fn historic_variable_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableInstance>>;

    /// Variable writes of an instance in write order.
    async fn historic_variable_details(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableDetail>>;

    /// Historic incidents, optionally of one instance.
    async fn historic_incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<HistoricIncident>>;

    /// User operation log entries in write order.
    async fn user_operations(&self, query: &UserOperationLogQuery) -> Result<Vec<UserOperationLogEntry>>;

    /// Batch by id.
    async fn batch(&self, id: &str) -> Result<Option<Batch>>;

    /// All batches.
    async fn batches(&self) -> Result<Vec<Batch>>;

    /// Pending batch jobs, optionally of one batch, in creation order.
    async fn batch_jobs(&self, batch_id: Option<&str>) -> Result<Vec<BatchJob>>;

    /// Whether the store is reachable.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
