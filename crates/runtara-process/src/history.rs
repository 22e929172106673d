// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History and audit records.
//!
//! The runtime never writes history directly. Every unit of work buffers
//! [`HistoryEvent`]s; the store applies them to its historic records when the
//! unit commits, so a rolled back unit leaves no history behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::HistoryLevel;

/// Operation types of the user operation log.
pub mod operation_type {
    /// Process instance modification.
    pub const MODIFY_PROCESS_INSTANCE: &str = "ModifyProcessInstance";
    /// Restart of historic process instances.
    pub const RESTART_PROCESS_INSTANCE: &str = "RestartProcessInstance";
    /// Suspension of process instances.
    pub const SUSPEND: &str = "Suspend";
    /// Activation of process instances.
    pub const ACTIVATE: &str = "Activate";
    /// Deletion of process instances.
    pub const DELETE: &str = "Delete";
    /// Changing job retries.
    pub const SET_JOB_RETRIES: &str = "SetJobRetries";
}

/// Entity type of process instance operations.
pub const ENTITY_TYPE_PROCESS_INSTANCE: &str = "ProcessInstance";
/// Entity type of job operations.
pub const ENTITY_TYPE_JOB: &str = "Job";
/// Category of operator-initiated entries.
pub const CATEGORY_OPERATOR: &str = "Operator";

/// Historic state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceState {
    /// Running.
    Active,
    /// Running but suspended.
    Suspended,
    /// Reached its end.
    Completed,
    /// Deleted by an outside request, or part of a call hierarchy that was.
    ExternallyTerminated,
    /// Ended by the process itself (terminate end event) or emptied by a cancellation.
    InternallyTerminated,
}

impl ProcessInstanceState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::ExternallyTerminated => "EXTERNALLY_TERMINATED",
            Self::InternallyTerminated => "INTERNALLY_TERMINATED",
        }
    }

    /// Whether the instance is finished.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active | Self::Suspended)
    }
}

/// Historic process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    /// Process instance id.
    pub id: String,
    /// Business key.
    pub business_key: Option<String>,
    /// Definition id.
    pub definition_id: String,
    /// Definition key.
    pub definition_key: String,
    /// Top-most instance of the call hierarchy.
    pub root_process_instance_id: String,
    /// Calling instance.
    pub super_process_instance_id: Option<String>,
    /// Case instance id.
    pub case_instance_id: Option<String>,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time, set once the instance finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Current state.
    pub state: ProcessInstanceState,
    /// Activity the instance was started at.
    pub start_activity_id: Option<String>,
    /// Activity the instance ended at.
    pub end_activity_id: Option<String>,
    /// Reason given on deletion.
    pub delete_reason: Option<String>,
    /// Historic instance this one was restarted from.
    pub restarted_process_instance_id: Option<String>,
}

/// Historic activity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivityInstance {
    /// Activity instance id.
    pub id: String,
    /// Activity id.
    pub activity_id: String,
    /// Activity type name.
    pub activity_type: String,
    /// Enclosing activity instance (the process instance id at process level).
    pub parent_activity_instance_id: Option<String>,
    /// Execution that ran the activity.
    pub execution_id: String,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Top-most instance of the call hierarchy.
    pub root_process_instance_id: String,
    /// Instance started by a call activity.
    pub called_process_instance_id: Option<String>,
    /// User task created by the activity.
    pub task_id: Option<String>,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time.
    pub end_time: Option<DateTime<Utc>>,
    /// Ended by cancellation rather than completion.
    pub canceled: bool,
}

/// Latest value of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricVariableInstance {
    /// Variable instance id.
    pub id: String,
    /// Variable name.
    pub name: String,
    /// Latest value.
    pub value: Value,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Execution holding the variable.
    pub execution_id: String,
    /// Activity instance the variable belongs to.
    pub activity_instance_id: Option<String>,
    /// Whether the variable lives on the process instance scope.
    pub process_scoped: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Number of updates.
    pub revision: u32,
}

/// One variable write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricVariableDetail {
    /// Detail id.
    pub id: String,
    /// Variable instance the write belongs to.
    pub variable_instance_id: String,
    /// Variable name.
    pub name: String,
    /// Written value.
    pub value: Value,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Execution holding the variable.
    pub execution_id: String,
    /// Activity instance of the write. `None` for process-scoped writes and for
    /// executions that are not inside an activity instance.
    pub activity_instance_id: Option<String>,
    /// Part of the variables the instance was started with.
    pub initial: bool,
    /// Revision after the write.
    pub revision: u32,
    /// Time of the write.
    pub time: DateTime<Utc>,
}

/// Lifecycle of a historic incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    /// Still open.
    Open,
    /// Resolved (e.g. retries were set again).
    Resolved,
    /// Deleted together with its execution.
    Deleted,
}

/// Historic incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricIncident {
    /// Incident id.
    pub id: String,
    /// Handler type.
    pub incident_type: String,
    /// Handler configuration.
    pub configuration: Option<String>,
    /// Failure message.
    pub message: Option<String>,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Execution.
    pub execution_id: String,
    /// Activity.
    pub activity_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Resolution or deletion time.
    pub end_time: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: IncidentState,
}

/// One property change of an operator action. Entries written for one action share
/// `operation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOperationLogEntry {
    /// Entry id.
    pub id: String,
    /// Shared by all entries of one action.
    pub operation_id: String,
    /// e.g. `ModifyProcessInstance`.
    pub operation_type: String,
    /// e.g. `ProcessInstance`.
    pub entity_type: String,
    /// e.g. `Operator`.
    pub category: String,
    /// Changed property, e.g. `async` or `nrOfInstances`.
    pub property: Option<String>,
    /// Previous value.
    pub org_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
    /// Affected process instance, for single-instance actions.
    pub process_instance_id: Option<String>,
    /// Affected definition.
    pub process_definition_id: Option<String>,
    /// Affected definition key.
    pub process_definition_key: Option<String>,
    /// Batch created by the action.
    pub batch_id: Option<String>,
    /// Acting user.
    pub user_id: Option<String>,
    /// Free text annotation.
    pub annotation: Option<String>,
    /// Time of the action.
    pub timestamp: DateTime<Utc>,
}

/// Context shared by all entries of one operator action.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Affected process instance.
    pub process_instance_id: Option<String>,
    /// Affected definition.
    pub process_definition_id: Option<String>,
    /// Affected definition key.
    pub process_definition_key: Option<String>,
    /// Batch created by the action.
    pub batch_id: Option<String>,
    /// Acting user.
    pub user_id: Option<String>,
    /// Annotation.
    pub annotation: Option<String>,
}

/// A property change for [`operation_entries`].
#[derive(Debug, Clone)]
pub struct PropertyChange {
    /// Property name.
    pub property: String,
    /// Previous value.
    pub org_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

impl PropertyChange {
    /// Change with only a new value.
    pub fn new(property: &str, new_value: impl ToString) -> Self {
        Self {
            property: property.to_string(),
            org_value: None,
            new_value: Some(new_value.to_string()),
        }
    }
}

/// Build the entries of one action. All entries share `operation_id`.
pub fn operation_entries(
    mut next_id: impl FnMut() -> String,
    operation_id: &str,
    operation_type: &str,
    entity_type: &str,
    context: &OperationContext,
    changes: Vec<PropertyChange>,
    timestamp: DateTime<Utc>,
) -> Vec<UserOperationLogEntry> {
    changes
        .into_iter()
        .map(|change| UserOperationLogEntry {
            id: next_id(),
            operation_id: operation_id.to_string(),
            operation_type: operation_type.to_string(),
            entity_type: entity_type.to_string(),
            category: CATEGORY_OPERATOR.to_string(),
            property: Some(change.property),
            org_value: change.org_value,
            new_value: change.new_value,
            process_instance_id: context.process_instance_id.clone(),
            process_definition_id: context.process_definition_id.clone(),
            process_definition_key: context.process_definition_key.clone(),
            batch_id: context.batch_id.clone(),
            user_id: context.user_id.clone(),
            annotation: context.annotation.clone(),
            timestamp,
        })
        .collect()
}

/// Change published by a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// A process instance started.
    ProcessInstanceStarted(HistoricProcessInstance),
    /// Suspension state changed.
    ProcessInstanceStateChanged {
        /// Process instance id.
        process_instance_id: String,
        /// New state.
        state: ProcessInstanceState,
    },
    /// A process instance finished.
    ProcessInstanceEnded {
        /// Process instance id.
        process_instance_id: String,
        /// End time.
        end_time: DateTime<Utc>,
        /// Final state.
        state: ProcessInstanceState,
        /// Activity the instance ended at.
        end_activity_id: Option<String>,
        /// Deletion reason.
        delete_reason: Option<String>,
    },
    /// An activity instance started.
    ActivityInstanceStarted(HistoricActivityInstance),
    /// Late attributes of a running activity instance.
    ActivityInstanceUpdated {
        /// Activity instance id.
        id: String,
        /// Instance started by a call activity.
        called_process_instance_id: Option<String>,
        /// User task created.
        task_id: Option<String>,
    },
    /// An activity instance ended.
    ActivityInstanceEnded {
        /// Activity instance id.
        id: String,
        /// End time.
        end_time: DateTime<Utc>,
        /// Cancelled rather than completed.
        canceled: bool,
    },
    /// A variable was written.
    VariableUpdated {
        /// Variable state after the write.
        variable: HistoricVariableInstance,
        /// The write itself.
        detail: HistoricVariableDetail,
    },
    /// An incident was created.
    IncidentCreated(HistoricIncident),
    /// An incident ended.
    IncidentEnded {
        /// Incident id.
        id: String,
        /// End time.
        end_time: DateTime<Utc>,
        /// Resolved or deleted.
        state: IncidentState,
    },
    /// Operator action.
    UserOperation(UserOperationLogEntry),
}

impl HistoryEvent {
    /// Minimum level at which the event is recorded.
    pub fn level(&self) -> HistoryLevel {
        match self {
            Self::ProcessInstanceStarted(_)
            | Self::ProcessInstanceStateChanged { .. }
            | Self::ProcessInstanceEnded { .. }
            | Self::ActivityInstanceStarted(_)
            | Self::ActivityInstanceUpdated { .. }
            | Self::ActivityInstanceEnded { .. } => HistoryLevel::Activity,
            Self::VariableUpdated { .. }
            | Self::IncidentCreated(_)
            | Self::IncidentEnded { .. }
            | Self::UserOperation(_) => HistoryLevel::Full,
        }
    }
}
