// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::batch::{Batch, BatchJob};
use crate::error::{EngineError, Result};
use crate::history::{
    HistoricActivityInstance, HistoricIncident, HistoricProcessInstance, HistoricVariableDetail,
    HistoricVariableInstance, HistoryEvent, UserOperationLogEntry,
};
use crate::instance::{EventSubscription, Incident, InstanceHierarchy, Job, ProcessInstance, SubscriptionKind, Task};

use super::{
    DueJob, HistoricProcessInstanceQuery, JobQuery, ProcessInstanceQuery, ProcessStore,
    SubscriptionQuery, TaskQuery, UnitOfWork, UserOperationLogQuery,
};

#[derive(Debug, Default)]
struct State {
    hierarchies: BTreeMap<String, InstanceHierarchy>,
    revisions: HashMap<String, u64>,
    roots: HashMap<String, String>,
    process_instances: Vec<HistoricProcessInstance>,
    activity_instances: Vec<HistoricActivityInstance>,
    variable_instances: Vec<HistoricVariableInstance>,
    variable_details: Vec<HistoricVariableDetail>,
    incidents: Vec<HistoricIncident>,
    user_operations: Vec<UserOperationLogEntry>,
    batches: BTreeMap<String, Batch>,
    batch_jobs: Vec<BatchJob>,
}

impl State {
    fn live_instances(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.hierarchies.values().flat_map(|h| h.instances.values())
    }

    fn store_hierarchy(&mut self, mut hierarchy: InstanceHierarchy) -> Result<()> {
        let root = hierarchy.root_process_instance_id.clone();
        let current = self.revisions.get(&root).copied();
        if current != hierarchy.revision {
            return Err(EngineError::ConcurrentModification {
                root_process_instance_id: root,
                expected_revision: hierarchy.revision.unwrap_or(0),
                actual_revision: current,
            });
        }

        self.roots.retain(|_, r| r != &root);
        if hierarchy.instances.is_empty() {
            self.hierarchies.remove(&root);
            self.revisions.remove(&root);
            debug!(root_process_instance_id = %root, "Hierarchy removed");
            return Ok(());
        }

        let revision = current.map(|r| r + 1).unwrap_or(1);
        for id in hierarchy.instances.keys() {
            self.roots.insert(id.clone(), root.clone());
        }
        hierarchy.revision = Some(revision);
        self.revisions.insert(root.clone(), revision);
        self.hierarchies.insert(root, hierarchy);
        Ok(())
    }

    fn apply(&mut self, event: HistoryEvent) {
        match event {
            HistoryEvent::ProcessInstanceStarted(record) => self.process_instances.push(record),
            HistoryEvent::ProcessInstanceStateChanged {
                process_instance_id,
                state,
            } => {
                if let Some(record) = self
                    .process_instances
                    .iter_mut()
                    .find(|p| p.id == process_instance_id)
                {
                    record.state = state;
                }
            }
            HistoryEvent::ProcessInstanceEnded {
                process_instance_id,
                end_time,
                state,
                end_activity_id,
                delete_reason,
            } => {
                if let Some(record) = self
                    .process_instances
                    .iter_mut()
                    .find(|p| p.id == process_instance_id)
                {
                    record.end_time = Some(end_time);
                    record.state = state;
                    record.end_activity_id = end_activity_id;
                    record.delete_reason = delete_reason;
                }
            }
            HistoryEvent::ActivityInstanceStarted(record) => self.activity_instances.push(record),
            HistoryEvent::ActivityInstanceUpdated {
                id,
                called_process_instance_id,
                task_id,
            } => {
                if let Some(record) = self.activity_instances.iter_mut().find(|a| a.id == id) {
                    if called_process_instance_id.is_some() {
                        record.called_process_instance_id = called_process_instance_id;
                    }
                    if task_id.is_some() {
                        record.task_id = task_id;
                    }
                }
            }
            HistoryEvent::ActivityInstanceEnded {
                id,
                end_time,
                canceled,
            } => {
                if let Some(record) = self
                    .activity_instances
                    .iter_mut()
                    .find(|a| a.id == id && a.end_time.is_none())
                {
                    record.end_time = Some(end_time);
                    record.canceled = canceled;
                }
            }
            HistoryEvent::VariableUpdated {
                variable,
                mut detail,
            } => {
                let revision = match self
                    .variable_instances
                    .iter_mut()
                    .find(|v| v.id == variable.id)
                {
                    Some(existing) => {
                        existing.value = variable.value;
                        existing.revision += 1;
                        existing.revision
                    }
                    None => {
                        self.variable_instances.push(variable);
                        0
                    }
                };
                detail.revision = revision;
                self.variable_details.push(detail);
            }
            HistoryEvent::IncidentCreated(record) => self.incidents.push(record),
            HistoryEvent::IncidentEnded { id, end_time, state } => {
                if let Some(record) = self.incidents.iter_mut().find(|i| i.id == id) {
                    record.end_time = Some(end_time);
                    record.state = state;
                }
            }
            HistoryEvent::UserOperation(entry) => self.user_operations.push(entry),
        }
    }
}

/// Store keeping everything in process memory. Used for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn load_hierarchy(&self, root_process_instance_id: &str) -> Result<Option<InstanceHierarchy>> {
        let state = self.state.lock().await;
        Ok(state.hierarchies.get(root_process_instance_id).cloned())
    }

    async fn root_of(&self, process_instance_id: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.roots.get(process_instance_id).cloned())
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<()> {
        let mut state = self.state.lock().await;
        // The revision check comes first so a rejected unit writes nothing.
        if let Some(hierarchy) = unit.hierarchy {
            state.store_hierarchy(hierarchy)?;
        }
        for event in unit.history {
            state.apply(event);
        }
        for batch in unit.batches {
            state.batches.insert(batch.id.clone(), batch);
        }
        state
            .batch_jobs
            .retain(|j| !unit.batch_jobs_deleted.contains(&j.id));
        state.batch_jobs.extend(unit.batch_jobs_created);
        Ok(())
    }

    async fn process_instances(&self, query: &ProcessInstanceQuery) -> Result<Vec<ProcessInstance>> {
        let state = self.state.lock().await;
        let mut instances: Vec<ProcessInstance> = state
            .live_instances()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn tasks(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .live_instances()
            .flat_map(|i| i.tasks.values())
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .live_instances()
            .flat_map(|i| i.jobs.values())
            .filter(|j| query.matches(j))
            .cloned()
            .collect())
    }

    async fn subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<EventSubscription>> {
        let state = self.state.lock().await;
        Ok(state
            .live_instances()
            .filter(|i| {
                query
                    .process_instance_id
                    .as_ref()
                    .is_none_or(|p| &i.id == p)
            })
            .flat_map(|i| i.subscriptions.values())
            .filter(|s| match (&query.message_name, &s.kind) {
                (None, _) => true,
                (Some(wanted), SubscriptionKind::Message { name }) => wanted == name,
                (Some(_), _) => false,
            })
            .cloned()
            .collect())
    }

    async fn incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<Incident>> {
        let state = self.state.lock().await;
        Ok(state
            .live_instances()
            .filter(|i| process_instance_id.is_none_or(|p| i.id == p))
            .flat_map(|i| i.incidents.values())
            .cloned()
            .collect())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DueJob>> {
        let state = self.state.lock().await;
        let mut due: Vec<&Job> = state
            .live_instances()
            .filter(|i| !i.suspended)
            .flat_map(|i| i.jobs.values())
            .filter(|j| j.is_due(now))
            .collect();
        due.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.created_at.cmp(&b.created_at)));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|j| DueJob {
                process_instance_id: j.process_instance_id.clone(),
                job_id: j.id.clone(),
            })
            .collect())
    }

    async fn historic_process_instance(&self, id: &str) -> Result<Option<HistoricProcessInstance>> {
        let state = self.state.lock().await;
        Ok(state.process_instances.iter().find(|p| p.id == id).cloned())
    }

    async fn historic_process_instances(
        &self,
        query: &HistoricProcessInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .process_instances
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect())
    }

    async fn historic_activity_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricActivityInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .activity_instances
            .iter()
            .filter(|a| a.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn historic_variable_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .variable_instances
            .iter()
            .filter(|v| v.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn historic_variable_details(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableDetail>> {
        let state = self.state.lock().await;
        Ok(state
            .variable_details
            .iter()
            .filter(|d| d.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn historic_incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<HistoricIncident>> {
        let state = self.state.lock().await;
        Ok(state
            .incidents
            .iter()
            .filter(|i| process_instance_id.is_none_or(|p| i.process_instance_id == p))
            .cloned()
            .collect())
    }

    async fn user_operations(&self, query: &UserOperationLogQuery) -> Result<Vec<UserOperationLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .user_operations
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }

    async fn batch(&self, id: &str) -> Result<Option<Batch>> {
        let state = self.state.lock().await;
        Ok(state.batches.get(id).cloned())
    }

    async fn batches(&self) -> Result<Vec<Batch>> {
        let state = self.state.lock().await;
        Ok(state.batches.values().cloned().collect())
    }

    async fn batch_jobs(&self, batch_id: Option<&str>) -> Result<Vec<BatchJob>> {
        let state = self.state.lock().await;
        Ok(state
            .batch_jobs
            .iter()
            .filter(|j| batch_id.is_none_or(|b| j.batch_id == b))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessDefinitionBuilder;
    use crate::history::{HistoricVariableDetail, HistoricVariableInstance};
    use serde_json::json;

    fn hierarchy(id: &str) -> InstanceHierarchy {
        let definition = ProcessDefinitionBuilder::new("p")
            .start_event("start")
            .build()
            .unwrap();
        InstanceHierarchy::new(ProcessInstance::new(id, &definition, id, Utc::now()))
    }

    fn variable_update(value: serde_json::Value) -> HistoryEvent {
        HistoryEvent::VariableUpdated {
            variable: HistoricVariableInstance {
                id: "pi:var".into(),
                name: "var".into(),
                value: value.clone(),
                process_instance_id: "pi".into(),
                execution_id: "pi".into(),
                activity_instance_id: Some("pi".into()),
                process_scoped: true,
                created_at: Utc::now(),
                revision: 0,
            },
            detail: HistoricVariableDetail {
                id: format!("d-{}", value),
                variable_instance_id: "pi:var".into(),
                name: "var".into(),
                value,
                process_instance_id: "pi".into(),
                execution_id: "pi".into(),
                activity_instance_id: None,
                initial: false,
                revision: 0,
                time: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_commit_checks_revision() {
        let store = MemoryStore::new();
        store
            .commit(UnitOfWork {
                hierarchy: Some(hierarchy("pi")),
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.load_hierarchy("pi").await.unwrap().unwrap();
        assert_eq!(loaded.revision, Some(1));
        assert_eq!(store.root_of("pi").await.unwrap().as_deref(), Some("pi"));

        store
            .commit(UnitOfWork {
                hierarchy: Some(loaded.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = store
            .commit(UnitOfWork {
                hierarchy: Some(loaded),
                history: vec![variable_update(json!(1))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENT_MODIFICATION");
        assert!(store.historic_variable_details("pi").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_variable_revisions_increment() {
        let store = MemoryStore::new();
        store
            .commit(UnitOfWork::history(vec![
                variable_update(json!("a")),
                variable_update(json!("b")),
            ]))
            .await
            .unwrap();

        let variables = store.historic_variable_instances("pi").await.unwrap();
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].value, json!("b"));
        assert_eq!(variables[0].revision, 1);

        let details = store.historic_variable_details("pi").await.unwrap();
        assert_eq!(details.iter().map(|d| d.revision).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_empty_hierarchy_is_removed() {
        let store = MemoryStore::new();
        store
            .commit(UnitOfWork {
                hierarchy: Some(hierarchy("pi")),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut loaded = store.load_hierarchy("pi").await.unwrap().unwrap();
        loaded.instances.clear();
        store
            .commit(UnitOfWork {
                hierarchy: Some(loaded),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.load_hierarchy("pi").await.unwrap().is_none());
        assert!(store.root_of("pi").await.unwrap().is_none());
        assert!(store
            .process_instances(&ProcessInstanceQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
