// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compiled process graph.
//!
//! A [`ProcessDefinition`] is immutable once built. The runtime only reads it:
//! activities, transitions, flow scopes, boundary events and the hooks
//! (listeners, IO mappings, conditions) attached to them.
//!
//! Definitions are assembled with [`ProcessDefinitionBuilder`]. Activities are
//! added to the innermost open scope; `sub_process`/`transaction` open a scope and
//! `end_scope` closes it.
//!
//! ```rust,ignore
//! let definition = ProcessDefinitionBuilder::new("invoice")
//!     .start_event("start")
//!     .exclusive_gateway("gw")
//!     .user_task("task1")
//!     .user_task("task2")
//!     .end_event("end")
//!     .flow("flow0", "start", "gw")
//!     .conditional_flow("flow1", "gw", "task1", Condition::variable_equals("approved", true))
//!     .flow("flow2", "gw", "task2")
//!     .default_flow("gw", "flow2")
//!     .flow("flow3", "task1", "end")
//!     .flow("flow4", "task2", "end")
//!     .build()?;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Trigger of a catching event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventTrigger {
    /// Waits for a correlated message.
    Message {
        /// Message name used for correlation.
        name: String,
    },
    /// Fires after a fixed delay.
    Timer {
        /// Delay after the event is entered.
        after_seconds: i64,
    },
}

/// Kind of a flow node. Determines the behavior executed when a token enters it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    /// None start event.
    StartEvent,
    /// End event. A terminate end event cancels everything in its flow scope.
    EndEvent {
        /// Terminate end event.
        terminate: bool,
    },
    /// Waits for [`crate::engine::ProcessEngine::complete_task`].
    UserTask,
    /// Runs a registered [`crate::delegate::ServiceTaskHandler`].
    ServiceTask {
        /// Handler name in the delegate registry.
        handler: String,
    },
    /// Pass-through task.
    ManualTask,
    /// Takes the first outgoing flow whose condition holds, or the default flow.
    ExclusiveGateway,
    /// Forks on all outgoing flows and joins all incoming flows.
    ParallelGateway,
    /// Waits for a message or timer.
    IntermediateCatchEvent {
        /// What releases the token.
        trigger: EventTrigger,
    },
    /// Event attached to an activity.
    BoundaryEvent {
        /// The activity the event is attached to.
        attached_to: String,
        /// What fires the event.
        trigger: EventTrigger,
        /// Interrupting events cancel the attached activity.
        cancel_activity: bool,
    },
    /// Embedded sub process.
    SubProcess,
    /// Transaction sub process. Cancelling it hands armed compensation to the compensation hook.
    Transaction,
    /// Starts a child process instance and waits for it.
    CallActivity {
        /// Key of the called process definition (latest version is used).
        called_element: String,
        /// Copy all variables into the child and back out on completion.
        propagate_variables: bool,
    },
}

impl ActivityKind {
    /// Short name used in history records.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartEvent => "startEvent",
            Self::EndEvent { terminate: false } => "noneEndEvent",
            Self::EndEvent { terminate: true } => "terminateEndEvent",
            Self::UserTask => "userTask",
            Self::ServiceTask { .. } => "serviceTask",
            Self::ManualTask => "manualTask",
            Self::ExclusiveGateway => "exclusiveGateway",
            Self::ParallelGateway => "parallelGateway",
            Self::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            Self::BoundaryEvent { .. } => "boundaryEvent",
            Self::SubProcess => "subProcess",
            Self::Transaction => "transaction",
            Self::CallActivity { .. } => "callActivity",
        }
    }
}

/// Lifecycle events listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerEvent {
    /// Activity or process instance started.
    Start,
    /// Activity or process instance ended (completed or cancelled).
    End,
    /// Transition taken.
    Take,
}

impl ListenerEvent {
    /// Returns the string representation of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Take => "take",
        }
    }
}

/// A named listener attached to an activity or the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerBinding {
    /// Event the listener reacts to.
    pub event: ListenerEvent,
    /// Listener name in the delegate registry.
    pub name: String,
}

/// Source of a mapped variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    /// Value of a visible variable (null if undefined).
    Variable(String),
    /// A constant.
    Value(Value),
}

/// Input or output mapping of a scope activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    /// Variable written by the mapping.
    pub target: String,
    /// Where the value comes from.
    pub source: MappingSource,
}

/// Guard on a sequence flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Variable equals the given value.
    VariableEquals {
        /// Variable name.
        name: String,
        /// Expected value.
        value: Value,
    },
    /// Variable is defined and truthy (not null, false, 0 or empty).
    VariableTruthy {
        /// Variable name.
        name: String,
    },
    /// Expression handed to the configured [`crate::delegate::ConditionEvaluator`].
    Expression {
        /// Expression source.
        expression: String,
    },
}

impl Condition {
    /// Condition `name == value`.
    pub fn variable_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::VariableEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Condition on an external expression.
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
        }
    }
}

/// A flow node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Id, unique within the definition.
    pub id: String,
    /// Behavior kind.
    pub kind: ActivityKind,
    /// Enclosing sub process / transaction, `None` for the process level.
    pub flow_scope: Option<String>,
    /// Outgoing transition ids in declaration order.
    pub outgoing: Vec<String>,
    /// Incoming transition ids in declaration order.
    pub incoming: Vec<String>,
    /// Default flow of a gateway.
    pub default_flow: Option<String>,
    /// Enter the activity in a separate job.
    pub async_before: bool,
    /// Activity that compensates this one.
    pub compensation_handler: Option<String>,
    /// This activity only runs as a compensation handler.
    pub is_for_compensation: bool,
    /// Listeners.
    pub listeners: Vec<ListenerBinding>,
    /// Input mappings, applied to the activity's scope execution.
    pub inputs: Vec<VariableMapping>,
    /// Output mappings, applied to the enclosing scope on completion.
    pub outputs: Vec<VariableMapping>,
}

impl Activity {
    fn new(id: &str, kind: ActivityKind, flow_scope: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            kind,
            flow_scope,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            default_flow: None,
            async_before: false,
            compensation_handler: None,
            is_for_compensation: false,
            listeners: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Names of listeners bound to `event`, in declaration order.
    pub fn listeners_for(&self, event: ListenerEvent) -> impl Iterator<Item = &str> {
        self.listeners
            .iter()
            .filter(move |l| l.event == event)
            .map(|l| l.name.as_str())
    }

    /// Whether this is an end event.
    pub fn is_end_event(&self) -> bool {
        matches!(self.kind, ActivityKind::EndEvent { .. })
    }

    /// Whether this activity hosts child activities.
    pub fn is_container(&self) -> bool {
        matches!(self.kind, ActivityKind::SubProcess | ActivityKind::Transaction)
    }
}

/// A sequence flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Id, unique within the definition.
    pub id: String,
    /// Source activity.
    pub source: String,
    /// Target activity.
    pub target: String,
    /// Guard, `None` means always taken.
    pub condition: Option<Condition>,
    /// Take listeners.
    pub listeners: Vec<String>,
}

/// Immutable compiled process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    id: String,
    key: String,
    version: u32,
    name: Option<String>,
    activities: BTreeMap<String, Activity>,
    activity_order: Vec<String>,
    transitions: BTreeMap<String, Transition>,
    listeners: Vec<ListenerBinding>,
}

impl ProcessDefinition {
    /// Unique definition id (`key:version`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Definition key shared by all versions.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Version number.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Display name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self.id = format!("{}:{}", self.key, version);
        self
    }

    /// Look up an activity.
    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.get(id)
    }

    /// Look up an activity or fail with [`EngineError::InvalidTarget`].
    pub fn require_activity(&self, id: &str) -> Result<&Activity> {
        self.activities.get(id).ok_or_else(|| {
            EngineError::invalid_target(
                id,
                format!("element '{}' does not exist in process '{}'", id, self.id),
            )
        })
    }

    /// Look up a transition.
    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Look up a transition or fail with [`EngineError::InvalidTarget`].
    pub fn require_transition(&self, id: &str) -> Result<&Transition> {
        self.transitions.get(id).ok_or_else(|| {
            EngineError::invalid_target(
                id,
                format!("element '{}' does not exist in process '{}'", id, self.id),
            )
        })
    }

    /// Activities in declaration order.
    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activity_order
            .iter()
            .filter_map(|id| self.activities.get(id))
    }

    /// Process-level listeners.
    pub fn listeners_for(&self, event: ListenerEvent) -> impl Iterator<Item = &str> {
        self.listeners
            .iter()
            .filter(move |l| l.event == event)
            .map(|l| l.name.as_str())
    }

    /// Enclosing scope activity of `activity_id`, `None` for the process level.
    ///
    /// Boundary events live in the flow scope of the activity they are attached to.
    pub fn scope_of(&self, activity_id: &str) -> Option<&str> {
        self.activities
            .get(activity_id)
            .and_then(|a| a.flow_scope.as_deref())
    }

    /// Outgoing transitions of an activity in declaration order.
    pub fn outgoing_transitions(&self, activity_id: &str) -> Vec<&Transition> {
        self.activities
            .get(activity_id)
            .map(|a| {
                a.outgoing
                    .iter()
                    .filter_map(|t| self.transitions.get(t))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Boundary events attached to `activity_id`, in declaration order.
    pub fn boundary_events(&self, activity_id: &str) -> Vec<&Activity> {
        self.activities()
            .filter(|a| match &a.kind {
                ActivityKind::BoundaryEvent { attached_to, .. } => attached_to == activity_id,
                _ => false,
            })
            .collect()
    }

    /// Whether entering the activity creates a scope execution.
    ///
    /// Containers are scopes; so is every activity with boundary events or IO mappings.
    pub fn is_scope(&self, activity_id: &str) -> bool {
        match self.activities.get(activity_id) {
            Some(activity) => {
                activity.is_container()
                    || !activity.inputs.is_empty()
                    || !activity.outputs.is_empty()
                    || !self.boundary_events(activity_id).is_empty()
            }
            None => false,
        }
    }

    /// Enclosing scope activities of `activity_id`, innermost first. The process
    /// level is not included.
    pub fn flow_scope_chain(&self, activity_id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.scope_of(activity_id);
        while let Some(scope) = current {
            chain.push(scope.to_string());
            current = self.scope_of(scope);
        }
        chain
    }

    /// Whether `ancestor` encloses `activity_id` (directly or transitively).
    pub fn is_ancestor_scope(&self, ancestor: &str, activity_id: &str) -> bool {
        self.flow_scope_chain(activity_id)
            .iter()
            .any(|scope| scope == ancestor)
    }

    /// None start event of a scope (`None` = process level).
    pub fn initial_activity(&self, scope: Option<&str>) -> Option<&Activity> {
        self.activities().find(|a| {
            a.kind == ActivityKind::StartEvent && a.flow_scope.as_deref() == scope
        })
    }
}

/// Builder for [`ProcessDefinition`].
#[derive(Debug)]
pub struct ProcessDefinitionBuilder {
    key: String,
    version: u32,
    name: Option<String>,
    activities: BTreeMap<String, Activity>,
    activity_order: Vec<String>,
    transitions: Vec<Transition>,
    listeners: Vec<ListenerBinding>,
    scope_stack: Vec<String>,
    compensation_links: Vec<(String, String)>,
    default_flows: Vec<(String, String)>,
    take_listeners: Vec<(String, String)>,
    errors: Vec<String>,
}

impl ProcessDefinitionBuilder {
    /// Start a definition with the given key, version 1.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: 1,
            name: None,
            activities: BTreeMap::new(),
            activity_order: Vec::new(),
            transitions: Vec::new(),
            listeners: Vec::new(),
            scope_stack: Vec::new(),
            compensation_links: Vec::new(),
            default_flows: Vec::new(),
            take_listeners: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Set the version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn add(mut self, id: &str, kind: ActivityKind) -> Self {
        if self.activities.contains_key(id) {
            self.errors.push(format!("duplicate activity id '{}'", id));
            return self;
        }
        let flow_scope = match &kind {
            // Resolved in build(): boundary events share their host's scope.
            ActivityKind::BoundaryEvent { .. } => None,
            _ => self.scope_stack.last().cloned(),
        };
        self.activities
            .insert(id.to_string(), Activity::new(id, kind, flow_scope));
        self.activity_order.push(id.to_string());
        self
    }

    fn update(mut self, id: &str, f: impl FnOnce(&mut Activity)) -> Self {
        match self.activities.get_mut(id) {
            Some(activity) => f(activity),
            None => self.errors.push(format!("unknown activity '{}'", id)),
        }
        self
    }

    /// None start event.
    pub fn start_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::StartEvent)
    }

    /// None end event.
    pub fn end_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::EndEvent { terminate: false })
    }

    /// Terminate end event.
    pub fn terminate_end_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::EndEvent { terminate: true })
    }

    /// User task.
    pub fn user_task(self, id: &str) -> Self {
        self.add(id, ActivityKind::UserTask)
    }

    /// Service task backed by a registered handler.
    pub fn service_task(self, id: &str, handler: &str) -> Self {
        self.add(
            id,
            ActivityKind::ServiceTask {
                handler: handler.to_string(),
            },
        )
    }

    /// Pass-through task.
    pub fn manual_task(self, id: &str) -> Self {
        self.add(id, ActivityKind::ManualTask)
    }

    /// Exclusive gateway.
    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.add(id, ActivityKind::ExclusiveGateway)
    }

    /// Parallel gateway.
    pub fn parallel_gateway(self, id: &str) -> Self {
        self.add(id, ActivityKind::ParallelGateway)
    }

    /// Intermediate message catch event.
    pub fn message_catch_event(self, id: &str, message: &str) -> Self {
        self.add(
            id,
            ActivityKind::IntermediateCatchEvent {
                trigger: EventTrigger::Message {
                    name: message.to_string(),
                },
            },
        )
    }

    /// Intermediate timer catch event.
    pub fn timer_catch_event(self, id: &str, after_seconds: i64) -> Self {
        self.add(
            id,
            ActivityKind::IntermediateCatchEvent {
                trigger: EventTrigger::Timer { after_seconds },
            },
        )
    }

    /// Message boundary event.
    pub fn message_boundary_event(
        self,
        id: &str,
        attached_to: &str,
        message: &str,
        cancel_activity: bool,
    ) -> Self {
        self.add(
            id,
            ActivityKind::BoundaryEvent {
                attached_to: attached_to.to_string(),
                trigger: EventTrigger::Message {
                    name: message.to_string(),
                },
                cancel_activity,
            },
        )
    }

    /// Timer boundary event.
    pub fn timer_boundary_event(
        self,
        id: &str,
        attached_to: &str,
        after_seconds: i64,
        cancel_activity: bool,
    ) -> Self {
        self.add(
            id,
            ActivityKind::BoundaryEvent {
                attached_to: attached_to.to_string(),
                trigger: EventTrigger::Timer { after_seconds },
                cancel_activity,
            },
        )
    }

    /// Open an embedded sub process. Following activities are added to it until [`Self::end_scope`].
    pub fn sub_process(self, id: &str) -> Self {
        let mut builder = self.add(id, ActivityKind::SubProcess);
        builder.scope_stack.push(id.to_string());
        builder
    }

    /// Open a transaction sub process.
    pub fn transaction(self, id: &str) -> Self {
        let mut builder = self.add(id, ActivityKind::Transaction);
        builder.scope_stack.push(id.to_string());
        builder
    }

    /// Close the innermost open scope.
    pub fn end_scope(mut self) -> Self {
        if self.scope_stack.pop().is_none() {
            self.errors.push("end_scope without open scope".to_string());
        }
        self
    }

    /// Call activity starting the latest version of `called_element`.
    pub fn call_activity(self, id: &str, called_element: &str) -> Self {
        self.add(
            id,
            ActivityKind::CallActivity {
                called_element: called_element.to_string(),
                propagate_variables: false,
            },
        )
    }

    /// Copy all variables into and out of the called instance.
    pub fn propagate_variables(self, call_activity: &str) -> Self {
        self.update(call_activity, |a| {
            if let ActivityKind::CallActivity {
                propagate_variables,
                ..
            } = &mut a.kind
            {
                *propagate_variables = true;
            }
        })
    }

    /// Unconditional sequence flow.
    pub fn flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.transitions.push(Transition {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            listeners: Vec::new(),
        });
        self
    }

    /// Guarded sequence flow.
    pub fn conditional_flow(
        mut self,
        id: &str,
        source: &str,
        target: &str,
        condition: Condition,
    ) -> Self {
        self.transitions.push(Transition {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(condition),
            listeners: Vec::new(),
        });
        self
    }

    /// Mark `flow` as default flow of `activity`.
    pub fn default_flow(mut self, activity: &str, flow: &str) -> Self {
        self.default_flows
            .push((activity.to_string(), flow.to_string()));
        self
    }

    /// Enter `activity` in an asynchronous continuation job.
    pub fn async_before(self, activity: &str) -> Self {
        self.update(activity, |a| a.async_before = true)
    }

    /// Register `handler` as compensation handler of `activity`.
    pub fn compensation_handler(mut self, activity: &str, handler: &str) -> Self {
        self.compensation_links
            .push((activity.to_string(), handler.to_string()));
        self
    }

    /// Attach a named listener to an activity.
    pub fn listener(self, activity: &str, event: ListenerEvent, name: &str) -> Self {
        self.update(activity, |a| {
            a.listeners.push(ListenerBinding {
                event,
                name: name.to_string(),
            })
        })
    }

    /// Attach a named listener to the process instance.
    pub fn process_listener(mut self, event: ListenerEvent, name: &str) -> Self {
        self.listeners.push(ListenerBinding {
            event,
            name: name.to_string(),
        });
        self
    }

    /// Attach a take listener to a flow.
    pub fn take_listener(mut self, flow: &str, name: &str) -> Self {
        self.take_listeners
            .push((flow.to_string(), name.to_string()));
        self
    }

    /// Input mapping on a scope activity.
    pub fn input(self, activity: &str, target: &str, source: MappingSource) -> Self {
        self.update(activity, |a| {
            a.inputs.push(VariableMapping {
                target: target.to_string(),
                source,
            })
        })
    }

    /// Output mapping on a scope activity.
    pub fn output(self, activity: &str, target: &str, source: MappingSource) -> Self {
        self.update(activity, |a| {
            a.outputs.push(VariableMapping {
                target: target.to_string(),
                source,
            })
        })
    }

    /// Validate and build the definition.
    pub fn build(mut self) -> Result<ProcessDefinition> {
        if self.key.trim().is_empty() {
            self.errors.push("process key must not be empty".to_string());
        }
        if !self.scope_stack.is_empty() {
            self.errors
                .push(format!("unclosed scopes: {}", self.scope_stack.join(", ")));
        }

        // Boundary events live in their host's flow scope.
        let hosts: Vec<(String, String)> = self
            .activities
            .values()
            .filter_map(|a| match &a.kind {
                ActivityKind::BoundaryEvent { attached_to, .. } => {
                    Some((a.id.clone(), attached_to.clone()))
                }
                _ => None,
            })
            .collect();
        for (boundary, host) in hosts {
            let scope = match self.activities.get(&host) {
                Some(h) => h.flow_scope.clone(),
                None => {
                    self.errors.push(format!(
                        "boundary event '{}' is attached to unknown activity '{}'",
                        boundary, host
                    ));
                    continue;
                }
            };
            if let Some(b) = self.activities.get_mut(&boundary) {
                b.flow_scope = scope;
            }
        }

        let mut transitions = BTreeMap::new();
        for mut transition in std::mem::take(&mut self.transitions) {
            if transitions.contains_key(&transition.id) || self.activities.contains_key(&transition.id)
            {
                self.errors
                    .push(format!("duplicate element id '{}'", transition.id));
                continue;
            }
            let source_scope = self.activities.get(&transition.source).map(|a| a.flow_scope.clone());
            let target_scope = self.activities.get(&transition.target).map(|a| a.flow_scope.clone());
            match (source_scope, target_scope) {
                (Some(s), Some(t)) if s == t => {}
                (Some(_), Some(_)) => {
                    self.errors.push(format!(
                        "flow '{}' crosses a scope boundary",
                        transition.id
                    ));
                    continue;
                }
                _ => {
                    self.errors.push(format!(
                        "flow '{}' references an unknown activity",
                        transition.id
                    ));
                    continue;
                }
            }
            for (flow, name) in &self.take_listeners {
                if flow == &transition.id {
                    transition.listeners.push(name.clone());
                }
            }
            if let Some(source) = self.activities.get_mut(&transition.source) {
                source.outgoing.push(transition.id.clone());
            }
            if let Some(target) = self.activities.get_mut(&transition.target) {
                target.incoming.push(transition.id.clone());
            }
            transitions.insert(transition.id.clone(), transition);
        }

        for (activity, flow) in std::mem::take(&mut self.default_flows) {
            match self.activities.get_mut(&activity) {
                Some(a) if a.outgoing.contains(&flow) => a.default_flow = Some(flow),
                _ => self.errors.push(format!(
                    "default flow '{}' is not an outgoing flow of '{}'",
                    flow, activity
                )),
            }
        }

        for (activity, handler) in std::mem::take(&mut self.compensation_links) {
            if !self.activities.contains_key(&handler) {
                self.errors
                    .push(format!("unknown compensation handler '{}'", handler));
                continue;
            }
            match self.activities.get_mut(&activity) {
                Some(a) => a.compensation_handler = Some(handler.clone()),
                None => {
                    self.errors.push(format!("unknown activity '{}'", activity));
                    continue;
                }
            }
            if let Some(h) = self.activities.get_mut(&handler) {
                h.is_for_compensation = true;
            }
        }

        let declared: BTreeSet<&str> = self.activities.keys().map(String::as_str).collect();
        for activity in self.activities.values() {
            if let ActivityKind::BoundaryEvent { attached_to, .. } = &activity.kind {
                if attached_to == &activity.id || !declared.contains(attached_to.as_str()) {
                    self.errors
                        .push(format!("invalid attachment of '{}'", activity.id));
                }
            }
        }

        if !self.errors.is_empty() {
            return Err(EngineError::bad_request(format!(
                "invalid process definition '{}': {}",
                self.key,
                self.errors.join("; ")
            )));
        }

        Ok(ProcessDefinition {
            id: format!("{}:{}", self.key, self.version),
            key: self.key,
            version: self.version,
            name: self.name,
            activities: self.activities,
            activity_order: self.activity_order,
            transitions,
            listeners: self.listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("nested")
            .start_event("start")
            .sub_process("outer")
            .start_event("outerStart")
            .sub_process("inner")
            .start_event("innerStart")
            .user_task("innerTask")
            .end_event("innerEnd")
            .end_scope()
            .end_event("outerEnd")
            .end_scope()
            .user_task("task")
            .timer_boundary_event("timer", "task", 60, true)
            .end_event("end")
            .flow("f1", "start", "outer")
            .flow("f2", "outer", "task")
            .flow("f3", "task", "end")
            .flow("f4", "outerStart", "inner")
            .flow("f5", "inner", "outerEnd")
            .flow("f6", "innerStart", "innerTask")
            .flow("f7", "innerTask", "innerEnd")
            .flow("f8", "timer", "end")
            .build()
            .unwrap()
    }

    #[test]
    fn test_flow_scope_chain_innermost_first() {
        let def = nested();
        assert_eq!(def.flow_scope_chain("innerTask"), vec!["inner", "outer"]);
        assert!(def.flow_scope_chain("task").is_empty());
        assert!(def.is_ancestor_scope("outer", "innerTask"));
        assert!(!def.is_ancestor_scope("inner", "task"));
    }

    #[test]
    fn test_scope_detection() {
        let def = nested();
        assert!(def.is_scope("outer"));
        assert!(def.is_scope("task"), "boundary events make the host a scope");
        assert!(!def.is_scope("innerTask"));
        assert_eq!(def.scope_of("timer"), None);
    }

    #[test]
    fn test_initial_activity_per_scope() {
        let def = nested();
        assert_eq!(def.initial_activity(None).unwrap().id, "start");
        assert_eq!(def.initial_activity(Some("inner")).unwrap().id, "innerStart");
    }

    #[test]
    fn test_unknown_element_is_invalid_target() {
        let def = nested();
        let err = def.require_activity("nope").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TARGET");
        assert!(err.to_string().contains("element 'nope' does not exist in process 'nested:1'"));
    }

    #[test]
    fn test_build_rejects_cross_scope_flow() {
        let result = ProcessDefinitionBuilder::new("bad")
            .start_event("start")
            .sub_process("sub")
            .user_task("inner")
            .end_scope()
            .flow("f1", "start", "inner")
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("crosses a scope boundary"));
    }

    #[test]
    fn test_build_rejects_foreign_default_flow() {
        let result = ProcessDefinitionBuilder::new("bad")
            .start_event("start")
            .exclusive_gateway("gw")
            .end_event("end")
            .flow("f1", "start", "gw")
            .flow("f2", "gw", "end")
            .default_flow("gw", "f1")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_with_version_rewrites_id() {
        let def = nested().with_version(3);
        assert_eq!(def.id(), "nested:3");
        assert_eq!(def.version(), 3);
    }
}
