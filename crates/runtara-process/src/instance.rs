// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime state of process instances.
//!
//! A [`ProcessInstance`] owns its execution tree plus everything attached to
//! executions: user tasks, event subscriptions, jobs and incidents. Instances
//! started by call activities share a root and are loaded, mutated and committed
//! together as one [`InstanceHierarchy`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compensation::CompensationState;
use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::execution::{Execution, ExecutionTree, Replacement};

/// A user task waiting for completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: String,
    /// Activity the task belongs to.
    pub activity_id: String,
    /// Activity instance the task belongs to.
    pub activity_instance_id: String,
    /// Execution waiting on the task.
    pub execution_id: String,
    /// Owning process instance.
    pub process_instance_id: String,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

/// What an event subscription waits for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// A correlated message.
    Message {
        /// Message name.
        name: String,
    },
    /// A compensation trigger for a completed activity.
    Compensate {
        /// Completed activity instance to compensate.
        compensated_activity_instance_id: String,
        /// Lifecycle state of the compensation.
        state: CompensationState,
    },
}

/// An event subscription owned by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Unique id.
    pub id: String,
    /// Subscription kind.
    pub kind: SubscriptionKind,
    /// Owning execution.
    pub execution_id: String,
    /// Activity started when the subscription fires (boundary/catch event or compensation handler).
    pub activity_id: String,
    /// Owning process instance.
    pub process_instance_id: String,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Enter `activity_id` (asynchronous continuation before the activity).
    AsyncContinuation {
        /// Activity to enter.
        activity_id: String,
    },
    /// Fire the timer event `activity_id`.
    Timer {
        /// Timer catch or boundary event.
        activity_id: String,
    },
}

impl JobKind {
    /// Job type name used as incident configuration context.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AsyncContinuation { .. } => "async-continuation",
            Self::Timer { .. } => "timer-transition",
        }
    }

    /// Activity the job acts on.
    pub fn activity_id(&self) -> &str {
        match self {
            Self::AsyncContinuation { activity_id } | Self::Timer { activity_id } => activity_id,
        }
    }
}

/// A job owned by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: String,
    /// What the job does.
    pub kind: JobKind,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Owning execution.
    pub execution_id: String,
    /// Earliest execution time.
    pub due_date: DateTime<Utc>,
    /// Remaining attempts. Zero means the job is not acquired anymore.
    pub retries: u32,
    /// Message of the last failure.
    pub exception_message: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Executor holding the job.
    #[serde(default)]
    pub lock_owner: Option<String>,
    /// End of the executor's lock.
    #[serde(default)]
    pub lock_expiration: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job may be executed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retries > 0 && self.due_date <= now && !self.is_locked(now)
    }

    /// Whether an executor holds the job at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiration.is_some_and(|until| until > now)
    }

    /// Drop the executor lock.
    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

/// An open incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Unique id.
    pub id: String,
    /// Handler type, e.g. `failedJob`.
    pub incident_type: String,
    /// Handler specific configuration (the job id for failed jobs).
    pub configuration: Option<String>,
    /// Failure message.
    pub message: Option<String>,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Execution the incident is attached to.
    pub execution_id: String,
    /// Activity the execution was at.
    pub activity_id: Option<String>,
    /// When the incident was created.
    pub created_at: DateTime<Utc>,
}

/// A process instance with its execution tree and attached runtime entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Process instance id (also the root execution id).
    pub id: String,
    /// Definition the instance runs.
    pub definition_id: String,
    /// Key of that definition.
    pub definition_key: String,
    /// Business key.
    pub business_key: Option<String>,
    /// Case instance id (opaque).
    pub case_instance_id: Option<String>,
    /// Calling process instance.
    pub super_process_instance_id: Option<String>,
    /// Calling execution (the one at the call activity).
    pub super_execution_id: Option<String>,
    /// Top-most process instance of the call hierarchy.
    pub root_process_instance_id: String,
    /// Suspension flag.
    pub suspended: bool,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// First activity the instance was started at.
    pub start_activity_id: Option<String>,
    /// Executions.
    pub tree: ExecutionTree,
    /// Open user tasks by id.
    pub tasks: BTreeMap<String, Task>,
    /// Event subscriptions by id.
    pub subscriptions: BTreeMap<String, EventSubscription>,
    /// Jobs by id.
    pub jobs: BTreeMap<String, Job>,
    /// Open incidents by id.
    pub incidents: BTreeMap<String, Incident>,
}

impl ProcessInstance {
    /// Fresh instance of `definition` with an unpositioned root execution.
    pub fn new(
        id: &str,
        definition: &ProcessDefinition,
        root_process_instance_id: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            definition_id: definition.id().to_string(),
            definition_key: definition.key().to_string(),
            business_key: None,
            case_instance_id: None,
            super_process_instance_id: None,
            super_execution_id: None,
            root_process_instance_id: root_process_instance_id.to_string(),
            suspended: false,
            start_time,
            start_activity_id: None,
            tree: ExecutionTree::new(Execution::root(id, root_process_instance_id)),
            tasks: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            incidents: BTreeMap::new(),
        }
    }

    /// Whether the root execution was removed.
    pub fn is_ended(&self) -> bool {
        self.tree.root().is_ended
    }

    /// Fail with [`EngineError::Suspended`] if the instance is suspended.
    pub fn ensure_active(&self) -> Result<()> {
        if self.suspended {
            return Err(EngineError::Suspended {
                process_instance_id: self.id.clone(),
            });
        }
        if self.is_ended() {
            return Err(EngineError::not_found("Process instance", &self.id));
        }
        Ok(())
    }

    /// Tasks owned by `execution_id`.
    pub fn tasks_of(&self, execution_id: &str) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Subscriptions owned by `execution_id`.
    pub fn subscriptions_of(&self, execution_id: &str) -> Vec<String> {
        self.subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Jobs owned by `execution_id`.
    pub fn jobs_of(&self, execution_id: &str) -> Vec<String> {
        self.jobs
            .values()
            .filter(|j| j.execution_id == execution_id)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Incidents attached to `execution_id`.
    pub fn incidents_of(&self, execution_id: &str) -> Vec<String> {
        self.incidents
            .values()
            .filter(|i| i.execution_id == execution_id)
            .map(|i| i.id.clone())
            .collect()
    }

    fn reassign(&mut self, replacement: &Replacement) {
        let Replacement { from, to } = replacement;
        for task in self.tasks.values_mut().filter(|t| &t.execution_id == from) {
            task.execution_id = to.clone();
        }
        for sub in self
            .subscriptions
            .values_mut()
            .filter(|s| &s.execution_id == from)
        {
            sub.execution_id = to.clone();
        }
        for job in self.jobs.values_mut().filter(|j| &j.execution_id == from) {
            job.execution_id = to.clone();
        }
        for incident in self
            .incidents
            .values_mut()
            .filter(|i| &i.execution_id == from)
        {
            incident.execution_id = to.clone();
        }
    }
}

/// All process instances sharing one root, loaded and committed as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHierarchy {
    /// Id of the top-most process instance.
    pub root_process_instance_id: String,
    /// Store revision the snapshot was loaded at, `None` for a new hierarchy.
    pub revision: Option<u64>,
    /// Live instances by id.
    pub instances: BTreeMap<String, ProcessInstance>,
}

impl InstanceHierarchy {
    /// Hierarchy holding a new root instance.
    pub fn new(root: ProcessInstance) -> Self {
        let mut instances = BTreeMap::new();
        let root_id = root.id.clone();
        instances.insert(root_id.clone(), root);
        Self {
            root_process_instance_id: root_id,
            revision: None,
            instances,
        }
    }

    /// Look up an instance.
    pub fn get(&self, id: &str) -> Option<&ProcessInstance> {
        self.instances.get(id)
    }

    /// Look up an instance or fail with [`EngineError::NotFound`].
    pub fn require(&self, id: &str) -> Result<&ProcessInstance> {
        self.instances
            .get(id)
            .ok_or_else(|| EngineError::not_found("Process instance", id))
    }

    /// Mutable lookup or [`EngineError::NotFound`].
    pub fn require_mut(&mut self, id: &str) -> Result<&mut ProcessInstance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("Process instance", id))
    }

    /// Instance called from `super_execution_id` of `instance_id`, if any.
    pub fn called_instance(&self, instance_id: &str, super_execution_id: &str) -> Option<&ProcessInstance> {
        self.instances.values().find(|i| {
            i.super_process_instance_id.as_deref() == Some(instance_id)
                && i.super_execution_id.as_deref() == Some(super_execution_id)
        })
    }

    /// Instances directly called from `instance_id`.
    pub fn called_instances(&self, instance_id: &str) -> Vec<String> {
        self.instances
            .values()
            .filter(|i| i.super_process_instance_id.as_deref() == Some(instance_id))
            .map(|i| i.id.clone())
            .collect()
    }

    /// Calling instances of `instance_id`, nearest first.
    pub fn super_instances(&self, instance_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = self
            .instances
            .get(instance_id)
            .and_then(|i| i.super_process_instance_id.clone());
        while let Some(id) = current {
            current = self
                .instances
                .get(&id)
                .and_then(|i| i.super_process_instance_id.clone());
            out.push(id);
        }
        out
    }

    /// Move ownership after a fork or collapse in `instance_id`.
    pub fn apply_replacement(&mut self, instance_id: &str, replacement: &Replacement) -> Result<()> {
        self.require_mut(instance_id)?.reassign(replacement);
        for called in self.instances.values_mut().filter(|i| {
            i.super_process_instance_id.as_deref() == Some(instance_id)
                && i.super_execution_id.as_deref() == Some(replacement.from.as_str())
        }) {
            called.super_execution_id = Some(replacement.to.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Execution;

    fn instance(id: &str, root: &str, super_instance: Option<(&str, &str)>) -> ProcessInstance {
        ProcessInstance {
            id: id.to_string(),
            definition_id: "p:1".to_string(),
            definition_key: "p".to_string(),
            business_key: None,
            case_instance_id: None,
            super_process_instance_id: super_instance.map(|(i, _)| i.to_string()),
            super_execution_id: super_instance.map(|(_, e)| e.to_string()),
            root_process_instance_id: root.to_string(),
            suspended: false,
            start_time: Utc::now(),
            start_activity_id: None,
            tree: ExecutionTree::new(Execution::root(id, root)),
            tasks: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            incidents: BTreeMap::new(),
        }
    }

    #[test]
    fn test_super_instances_nearest_first() {
        let mut hierarchy = InstanceHierarchy::new(instance("a", "a", None));
        hierarchy
            .instances
            .insert("b".into(), instance("b", "a", Some(("a", "a"))));
        hierarchy
            .instances
            .insert("c".into(), instance("c", "a", Some(("b", "b"))));

        assert_eq!(hierarchy.super_instances("c"), vec!["b", "a"]);
        assert_eq!(hierarchy.called_instances("a"), vec!["b"]);
        assert!(hierarchy.called_instance("b", "b").is_some());
    }

    #[test]
    fn test_replacement_moves_tasks_and_super_execution() {
        let mut root = instance("a", "a", None);
        root.tasks.insert(
            "t1".into(),
            Task {
                id: "t1".into(),
                activity_id: "task".into(),
                activity_instance_id: "task:1".into(),
                execution_id: "x".into(),
                process_instance_id: "a".into(),
                created_at: Utc::now(),
            },
        );
        let mut hierarchy = InstanceHierarchy::new(root);
        hierarchy
            .instances
            .insert("b".into(), instance("b", "a", Some(("a", "x"))));

        hierarchy
            .apply_replacement(
                "a",
                &Replacement {
                    from: "x".into(),
                    to: "y".into(),
                },
            )
            .unwrap();

        assert_eq!(hierarchy.get("a").unwrap().tasks["t1"].execution_id, "y");
        assert_eq!(hierarchy.get("b").unwrap().super_execution_id.as_deref(), Some("y"));
    }

    #[test]
    fn test_suspended_instance_is_not_active() {
        let mut pi = instance("a", "a", None);
        pi.suspended = true;
        let err = pi.ensure_active().unwrap_err();
        assert_eq!(err.error_code(), "SUSPENDED");
    }
}
