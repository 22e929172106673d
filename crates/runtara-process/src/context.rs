// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unit of work.
//!
//! A [`CommandContext`] wraps one loaded [`InstanceHierarchy`] for the duration of
//! a single command. All core algorithms take it explicitly. Mutations happen on
//! the in-memory snapshot and history events are buffered; the engine commits
//! both through the store when the command succeeds and simply drops the context
//! when it fails.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::compensation::CompensationHandler;
use crate::config::EngineConfig;
use crate::definition::{ListenerEvent, ProcessDefinition};
use crate::delegate::{ConditionEvaluator, DelegateExecution, DelegateRegistry, VariableWrite};
use crate::error::{EngineError, Result};
use crate::execution::Removal;
use crate::history::{HistoricVariableDetail, HistoricVariableInstance, HistoryEvent};
use crate::ids::IdGenerator;
use crate::incident::IncidentHandlerRegistry;
use crate::instance::{InstanceHierarchy, ProcessInstance};
use crate::operations::Operation;
use crate::variables::{self, Variables};

#[derive(Debug, Default)]
struct DefinitionIndex {
    by_id: BTreeMap<String, Arc<ProcessDefinition>>,
    latest_by_key: BTreeMap<String, String>,
}

/// Deployed definitions, shared by all units of work.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    inner: RwLock<DefinitionIndex>,
}

impl DefinitionCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; it becomes the latest of its key if its version is higher.
    pub fn insert(&self, definition: Arc<ProcessDefinition>) {
        let mut index = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let is_latest = match index.latest_by_key.get(definition.key()) {
            Some(current) => index
                .by_id
                .get(current)
                .is_none_or(|c| c.version() < definition.version()),
            None => true,
        };
        if is_latest {
            index
                .latest_by_key
                .insert(definition.key().to_string(), definition.id().to_string());
        }
        index
            .by_id
            .insert(definition.id().to_string(), definition);
    }

    /// Definition by id.
    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        let index = self.inner.read().unwrap_or_else(|e| e.into_inner());
        index.by_id.get(id).cloned()
    }

    /// Latest version of `key`.
    pub fn latest(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        let index = self.inner.read().unwrap_or_else(|e| e.into_inner());
        index
            .latest_by_key
            .get(key)
            .and_then(|id| index.by_id.get(id))
            .cloned()
    }

    /// Version the next deployment of `key` gets.
    pub fn next_version(&self, key: &str) -> u32 {
        self.latest(key).map(|d| d.version() + 1).unwrap_or(1)
    }
}

/// Collaborators shared by all units of work.
pub struct EngineServices {
    /// Configuration.
    pub config: EngineConfig,
    /// Deployed definitions.
    pub definitions: DefinitionCache,
    /// Listeners and service task handlers.
    pub delegates: DelegateRegistry,
    /// Incident handlers.
    pub incidents: IncidentHandlerRegistry,
    /// Compensation hook.
    pub compensation: Arc<dyn CompensationHandler>,
    /// Id source.
    pub ids: Arc<dyn IdGenerator>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Expression guards.
    pub conditions: Arc<dyn ConditionEvaluator>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("config", &self.config)
            .field("delegates", &self.delegates)
            .field("incidents", &self.incidents)
            .finish_non_exhaustive()
    }
}

/// Flags of the command currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionFlags {
    /// Do not invoke listeners.
    pub skip_custom_listeners: bool,
    /// Do not apply input/output mappings.
    pub skip_io_mappings: bool,
}

/// Explicit unit of work over one instance hierarchy.
pub struct CommandContext<'s> {
    services: &'s EngineServices,
    hierarchy: InstanceHierarchy,
    finished: BTreeMap<String, ProcessInstance>,
    history: Vec<HistoryEvent>,
    agenda: VecDeque<Operation>,
    flags: ExecutionFlags,
    now: DateTime<Utc>,
    user_id: Option<String>,
    in_flight: Vec<(String, String)>,
    preemption_allowed: bool,
}

impl<'s> CommandContext<'s> {
    /// Open a unit of work over `hierarchy`.
    pub fn new(
        services: &'s EngineServices,
        hierarchy: InstanceHierarchy,
        user_id: Option<String>,
    ) -> Self {
        Self {
            services,
            hierarchy,
            finished: BTreeMap::new(),
            history: Vec::new(),
            agenda: VecDeque::new(),
            flags: ExecutionFlags::default(),
            now: services.clock.now(),
            user_id,
            in_flight: Vec::new(),
            preemption_allowed: false,
        }
    }

    /// Shared collaborators.
    pub fn services(&self) -> &'s EngineServices {
        self.services
    }

    /// Time the unit of work started.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Acting user.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Next generated id.
    pub fn next_id(&self) -> String {
        self.services.ids.next_id()
    }

    /// Next activity instance id for `activity_id`.
    pub fn next_activity_instance_id(&self, activity_id: &str) -> String {
        self.services.ids.activity_instance_id(activity_id)
    }

    /// The loaded hierarchy.
    pub fn hierarchy(&self) -> &InstanceHierarchy {
        &self.hierarchy
    }

    /// Mutable access to the loaded hierarchy.
    pub fn hierarchy_mut(&mut self) -> &mut InstanceHierarchy {
        &mut self.hierarchy
    }

    /// Instances that finished during this unit of work.
    pub fn finished(&self) -> &BTreeMap<String, ProcessInstance> {
        &self.finished
    }

    /// Look up a live instance.
    pub fn instance(&self, id: &str) -> Result<&ProcessInstance> {
        self.hierarchy.require(id)
    }

    /// Look up a live instance mutably.
    pub fn instance_mut(&mut self, id: &str) -> Result<&mut ProcessInstance> {
        self.hierarchy.require_mut(id)
    }

    /// Whether `id` is still live in this unit.
    pub fn is_live(&self, id: &str) -> bool {
        self.hierarchy.get(id).is_some_and(|i| !i.is_ended())
    }

    /// Definition by id.
    pub fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .get(id)
            .ok_or_else(|| EngineError::not_found("Process definition", id))
    }

    /// Latest definition of `key`.
    pub fn latest_definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .latest(key)
            .ok_or_else(|| EngineError::not_found("Process definition with key", key))
    }

    /// Definition run by instance `id`.
    pub fn definition_of(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        let definition_id = self.instance(id)?.definition_id.clone();
        self.definition(&definition_id)
    }

    /// Current flags.
    pub fn flags(&self) -> ExecutionFlags {
        self.flags
    }

    /// Replace the flags, returning the previous ones.
    pub fn set_flags(&mut self, flags: ExecutionFlags) -> ExecutionFlags {
        std::mem::replace(&mut self.flags, flags)
    }

    /// Protect the executions whose jobs an executor currently holds. Removing
    /// one of them fails unless [`Self::allow_preemption`] was called.
    pub(crate) fn protect_locked_jobs(&mut self) {
        let now = self.now;
        self.in_flight = self
            .hierarchy
            .instances
            .values()
            .flat_map(|i| i.jobs.values())
            .filter(|j| j.is_locked(now))
            .map(|j| (j.process_instance_id.clone(), j.execution_id.clone()))
            .collect();
    }

    /// Allow removal of executions owning an in-flight job.
    pub fn allow_preemption(&mut self) {
        self.preemption_allowed = true;
    }

    /// Fail if removing `execution_ids` would preempt an in-flight job.
    pub(crate) fn check_preemption(&self, instance_id: &str, execution_ids: &[String]) -> Result<()> {
        if self.preemption_allowed {
            return Ok(());
        }
        let preempted = self
            .in_flight
            .iter()
            .find(|(instance, execution)| instance == instance_id && execution_ids.contains(execution));
        if let Some((_, execution)) = preempted {
            return Err(EngineError::invalid_state(
                execution,
                "execution owns an asynchronous continuation in flight",
            ));
        }
        Ok(())
    }

    /// Buffer a history event if the configured level records it.
    pub fn record(&mut self, event: HistoryEvent) {
        if event.level() <= self.services.config.history_level {
            self.history.push(event);
        }
    }

    /// Buffered history.
    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Queue an atomic operation.
    pub(crate) fn schedule(&mut self, operation: Operation) {
        self.agenda.push_back(operation);
    }

    pub(crate) fn next_operation(&mut self) -> Option<Operation> {
        self.agenda.pop_front()
    }

    /// Move a finished instance out of the live hierarchy.
    pub(crate) fn retire_instance(&mut self, id: &str) -> Result<()> {
        let instance = self
            .hierarchy
            .instances
            .remove(id)
            .ok_or_else(|| EngineError::not_found("Process instance", id))?;
        debug!(process_instance_id = %id, "Process instance retired from hierarchy");
        self.finished.insert(id.to_string(), instance);
        Ok(())
    }

    /// Remove an execution subtree from the tree and re-home ownership after
    /// fork collapse. Side effects must have been applied before.
    pub(crate) fn detach_execution(&mut self, instance_id: &str, execution_id: &str) -> Result<Removal> {
        let removal = self
            .instance_mut(instance_id)?
            .tree
            .remove_execution(execution_id)?;
        if let Some(replacement) = &removal.replaced {
            self.hierarchy.apply_replacement(instance_id, replacement)?;
        }
        Ok(removal)
    }

    /// Create a concurrent child of `scope_execution_id` and re-home ownership if
    /// the parent's position moved.
    pub(crate) fn fork(&mut self, instance_id: &str, scope_execution_id: &str) -> Result<(String, Option<String>)> {
        let ids = self.services.ids.clone();
        let fork = self
            .instance_mut(instance_id)?
            .tree
            .create_concurrent_child(scope_execution_id, ids.as_ref())?;
        let moved_to = fork.replaced.as_ref().map(|r| r.to.clone());
        if let Some(replacement) = &fork.replaced {
            self.hierarchy.apply_replacement(instance_id, replacement)?;
        }
        Ok((fork.child_id, moved_to))
    }

    /// Write a variable and record it in history.
    pub fn set_variable(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        name: &str,
        value: Value,
        local: bool,
        initial: bool,
    ) -> Result<()> {
        self.write_variable(instance_id, execution_id, name, value, local, initial, true)
    }

    /// Write local variables of an execution that has not started its activity
    /// yet. The details carry no activity instance.
    pub(crate) fn set_variables_before_start(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        variables: &Variables,
    ) -> Result<()> {
        for (name, value) in variables {
            self.write_variable(instance_id, execution_id, name, value.clone(), true, false, false)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_variable(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        name: &str,
        value: Value,
        local: bool,
        initial: bool,
        started: bool,
    ) -> Result<()> {
        let now = self.now;
        let instance = self.hierarchy.require_mut(instance_id)?;
        let assignment = variables::assign(&mut instance.tree, execution_id, name, value.clone(), local)?;
        let activity_instance_id =
            variables::history_activity_instance_id(&instance.tree, &assignment.execution_id);
        let process_scoped = assignment.execution_id == instance.tree.root_id();
        let variable_instance_id = format!("{}:{}", assignment.execution_id, name);

        let variable = HistoricVariableInstance {
            id: variable_instance_id.clone(),
            name: name.to_string(),
            value: value.clone(),
            process_instance_id: instance_id.to_string(),
            execution_id: assignment.execution_id.clone(),
            activity_instance_id: activity_instance_id.clone(),
            process_scoped,
            created_at: now,
            revision: 0,
        };
        let detail = HistoricVariableDetail {
            id: self.services.ids.next_id(),
            variable_instance_id,
            name: name.to_string(),
            value,
            process_instance_id: instance_id.to_string(),
            execution_id: assignment.execution_id,
            activity_instance_id: if process_scoped || !started {
                None
            } else {
                activity_instance_id
            },
            initial,
            revision: 0,
            time: now,
        };
        self.record(HistoryEvent::VariableUpdated { variable, detail });
        Ok(())
    }

    /// Write several variables in map order.
    pub fn set_variables(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        variables: &Variables,
        local: bool,
        initial: bool,
    ) -> Result<()> {
        for (name, value) in variables {
            self.set_variable(instance_id, execution_id, name, value.clone(), local, initial)?;
        }
        Ok(())
    }

    /// Delegate handle for user code running on `execution_id`.
    pub(crate) fn delegate_execution(
        &self,
        instance_id: &str,
        execution_id: &str,
        event: Option<ListenerEvent>,
    ) -> Result<DelegateExecution> {
        let instance = self.instance(instance_id)?;
        let execution = instance.tree.require(execution_id)?;
        Ok(DelegateExecution::new(
            instance_id,
            execution_id,
            instance.business_key.clone(),
            execution.activity_id.clone(),
            execution.activity_instance_id.clone(),
            event,
            variables::visible(&instance.tree, execution_id),
        ))
    }

    /// Apply buffered delegate writes in order.
    pub(crate) fn apply_writes(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        writes: Vec<VariableWrite>,
    ) -> Result<()> {
        for write in writes {
            self.set_variable(instance_id, execution_id, &write.name, write.value, write.local, false)?;
        }
        Ok(())
    }

    /// Invoke named listeners unless listeners are skipped.
    pub(crate) fn fire_listeners(
        &mut self,
        instance_id: &str,
        execution_id: &str,
        names: Vec<String>,
        event: ListenerEvent,
    ) -> Result<()> {
        if self.flags.skip_custom_listeners || names.is_empty() {
            return Ok(());
        }
        for name in names {
            let listener = self.services.delegates.listener(&name)?;
            let mut delegate = self.delegate_execution(instance_id, execution_id, Some(event))?;
            listener.notify(&mut delegate).map_err(|e| {
                EngineError::process_engine(format!(
                    "listener '{}' failed on {}: {}",
                    name,
                    event.as_str(),
                    e
                ))
            })?;
            self.apply_writes(instance_id, execution_id, delegate.into_writes())?;
        }
        Ok(())
    }

    /// Split into the mutated hierarchy, finished instances and buffered history.
    pub fn into_parts(self) -> (InstanceHierarchy, BTreeMap<String, ProcessInstance>, Vec<HistoryEvent>) {
        (self.hierarchy, self.finished, self.history)
    }
}
