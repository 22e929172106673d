// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart of finished process instances.
//!
//! A restart creates a fresh process instance of the same definition for each
//! historic instance and starts it at the requested activities. Process
//! variables are taken from history: by default the latest value of every
//! process-scoped variable, with [`RestartProcessInstances::initial_set_of_variables`]
//! the variables the historic instance was started with.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::InstanceFailure;
use crate::context::{CommandContext, EngineServices, ExecutionFlags};
use crate::error::{EngineError, Result};
use crate::history::{HistoricProcessInstance, HistoricVariableDetail, HistoricVariableInstance};
use crate::instance::{InstanceHierarchy, ProcessInstance};
use crate::instantiation::{self, StartInstruction, StartOptions};
use crate::operations;
use crate::variables::Variables;

/// Request to restart finished process instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartProcessInstances {
    /// Definition of all instances.
    pub process_definition_id: String,
    /// Historic instances to restart.
    pub process_instance_ids: Vec<String>,
    /// Start steps applied to every new instance.
    pub instructions: Vec<StartInstruction>,
    /// Use the variables the instances were started with.
    #[serde(default)]
    pub initial_set_of_variables: bool,
    /// Do not invoke listeners.
    #[serde(default)]
    pub skip_custom_listeners: bool,
    /// Do not apply input/output mappings.
    #[serde(default)]
    pub skip_io_mappings: bool,
    /// Do not copy the business key.
    #[serde(default)]
    pub without_business_key: bool,
    /// Audit annotation.
    #[serde(default)]
    pub annotation: Option<String>,
}

impl RestartProcessInstances {
    /// Empty request for `process_definition_id`.
    pub fn new(process_definition_id: &str) -> Self {
        Self {
            process_definition_id: process_definition_id.to_string(),
            process_instance_ids: Vec::new(),
            instructions: Vec::new(),
            initial_set_of_variables: false,
            skip_custom_listeners: false,
            skip_io_mappings: false,
            without_business_key: false,
            annotation: None,
        }
    }

    /// Add historic instances.
    pub fn process_instance_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process_instance_ids
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Add a start-before step.
    pub fn start_before_activity(mut self, activity_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartBeforeActivity {
            activity_id: activity_id.to_string(),
        });
        self
    }

    /// Add a start-after step.
    pub fn start_after_activity(mut self, activity_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartAfterActivity {
            activity_id: activity_id.to_string(),
        });
        self
    }

    /// Add a start-transition step.
    pub fn start_transition(mut self, transition_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartTransition {
            transition_id: transition_id.to_string(),
        });
        self
    }

    /// Restore the initial variables instead of the latest ones.
    pub fn initial_set_of_variables(mut self) -> Self {
        self.initial_set_of_variables = true;
        self
    }

    /// Skip listeners.
    pub fn skip_custom_listeners(mut self) -> Self {
        self.skip_custom_listeners = true;
        self
    }

    /// Skip input/output mappings.
    pub fn skip_io_mappings(mut self) -> Self {
        self.skip_io_mappings = true;
        self
    }

    /// Leave the business key empty.
    pub fn without_business_key(mut self) -> Self {
        self.without_business_key = true;
        self
    }

    /// Set the audit annotation.
    pub fn annotation(mut self, annotation: &str) -> Self {
        self.annotation = Some(annotation.to_string());
        self
    }

    /// Check the request before anything is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.process_definition_id.trim().is_empty() {
            return Err(EngineError::bad_request("processDefinitionId is null"));
        }
        if self.process_instance_ids.is_empty() {
            return Err(EngineError::bad_request("processInstanceIds is empty"));
        }
        if self.instructions.is_empty() {
            return Err(EngineError::bad_request(
                "Restart instructions cannot be empty",
            ));
        }
        if self.process_instance_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::bad_request(
                "Process instance ids cannot be null",
            ));
        }
        Ok(())
    }

    /// Check a historic instance against the request.
    pub fn check_historic(&self, historic: &HistoricProcessInstance) -> Result<()> {
        if historic.definition_id != self.process_definition_id {
            return Err(EngineError::bad_request(format!(
                "Its process definition '{}' does not match given process definition '{}'",
                historic.definition_id, self.process_definition_id
            )));
        }
        if !historic.state.is_finished() {
            return Err(EngineError::bad_request(format!(
                "Historic process instance '{}' is still running",
                historic.id
            )));
        }
        Ok(())
    }
}

/// A historic instance with the variables its restart applies.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartSource {
    /// The historic instance.
    pub historic: HistoricProcessInstance,
    /// Variables to apply.
    pub variables: Variables,
    /// Whether the variables are the initial set.
    pub initial: bool,
}

impl RestartSource {
    /// Resolve the variables of `historic` from its variable history.
    ///
    /// Only process-scoped variables are restored. The initial set is empty when
    /// the historic instance had no unique start activity.
    pub fn resolve(
        request: &RestartProcessInstances,
        historic: HistoricProcessInstance,
        variables: &[HistoricVariableInstance],
        details: &[HistoricVariableDetail],
    ) -> Self {
        let resolved = if request.initial_set_of_variables {
            if historic.start_activity_id.is_some() {
                details
                    .iter()
                    .filter(|d| {
                        d.initial
                            && d.process_instance_id == historic.id
                            && d.execution_id == historic.id
                    })
                    .map(|d| (d.name.clone(), d.value.clone()))
                    .collect()
            } else {
                Variables::new()
            }
        } else {
            variables
                .iter()
                .filter(|v| v.process_scoped && v.process_instance_id == historic.id)
                .map(|v| (v.name.clone(), v.value.clone()))
                .collect()
        };
        Self {
            historic,
            variables: resolved,
            initial: request.initial_set_of_variables,
        }
    }
}

/// A restarted instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartedInstance {
    /// Historic instance.
    pub restarted_from: String,
    /// New instance.
    pub process_instance_id: String,
}

/// Outcome of a synchronous restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    /// New instances.
    pub restarted: Vec<RestartedInstance>,
    /// Historic instances that could not be restarted.
    pub failures: Vec<InstanceFailure>,
}

/// Hierarchy holding the new instance for `source`.
pub fn new_hierarchy(
    services: &EngineServices,
    request: &RestartProcessInstances,
    source: &RestartSource,
) -> Result<InstanceHierarchy> {
    let definition = services
        .definitions
        .get(&request.process_definition_id)
        .ok_or_else(|| EngineError::not_found("Process definition", &request.process_definition_id))?;
    let id = services.ids.next_id();
    let mut instance = ProcessInstance::new(&id, &definition, &id, services.clock.now());
    if !request.without_business_key {
        instance.business_key = source.historic.business_key.clone();
    }
    Ok(InstanceHierarchy::new(instance))
}

/// Start the new instance of a hierarchy created with [`new_hierarchy`].
pub fn restart_instance(
    ctx: &mut CommandContext<'_>,
    request: &RestartProcessInstances,
    source: &RestartSource,
) -> Result<String> {
    let instance_id = ctx.hierarchy().root_process_instance_id.clone();
    let start_activity_id = instantiation::unique_start_activity(&request.instructions);

    let previous = ctx.set_flags(ExecutionFlags {
        skip_custom_listeners: request.skip_custom_listeners,
        skip_io_mappings: request.skip_io_mappings,
    });
    let result = start(ctx, &instance_id, request, source, start_activity_id);
    ctx.set_flags(previous);
    result?;

    info!(
        process_instance_id = %instance_id,
        restarted_process_instance_id = %source.historic.id,
        "Process instance restarted"
    );
    Ok(instance_id)
}

fn start(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    request: &RestartProcessInstances,
    source: &RestartSource,
    start_activity_id: Option<String>,
) -> Result<()> {
    operations::begin_instance(
        ctx,
        instance_id,
        start_activity_id,
        Some(source.historic.id.clone()),
    )?;
    ctx.set_variables(instance_id, instance_id, &source.variables, false, source.initial)?;

    for instruction in &request.instructions {
        if !ctx.is_live(instance_id) {
            break;
        }
        instantiation::apply(ctx, instance_id, instruction, StartOptions::default())?;
    }
    operations::run(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ProcessInstanceState;
    use chrono::Utc;
    use serde_json::json;

    fn historic(id: &str, state: ProcessInstanceState) -> HistoricProcessInstance {
        HistoricProcessInstance {
            id: id.to_string(),
            business_key: Some("bk".into()),
            definition_id: "p:1".into(),
            definition_key: "p".into(),
            root_process_instance_id: id.to_string(),
            super_process_instance_id: None,
            case_instance_id: None,
            start_time: Utc::now(),
            end_time: None,
            state,
            start_activity_id: Some("start".into()),
            end_activity_id: None,
            delete_reason: None,
            restarted_process_instance_id: None,
        }
    }

    fn variable(name: &str, value: serde_json::Value, process_scoped: bool) -> HistoricVariableInstance {
        HistoricVariableInstance {
            id: format!("v-{}", name),
            name: name.into(),
            value,
            process_instance_id: "h1".into(),
            execution_id: if process_scoped { "h1".into() } else { "x".into() },
            activity_instance_id: None,
            process_scoped,
            created_at: Utc::now(),
            revision: 1,
        }
    }

    fn detail(name: &str, value: serde_json::Value, initial: bool) -> HistoricVariableDetail {
        HistoricVariableDetail {
            id: format!("d-{}", name),
            variable_instance_id: format!("v-{}", name),
            name: name.into(),
            value,
            process_instance_id: "h1".into(),
            execution_id: "h1".into(),
            activity_instance_id: None,
            initial,
            revision: 0,
            time: Utc::now(),
        }
    }

    #[test]
    fn test_validation_messages() {
        let err = RestartProcessInstances::new("").validate().unwrap_err();
        assert!(err.to_string().contains("processDefinitionId is null"));

        let err = RestartProcessInstances::new("p:1").validate().unwrap_err();
        assert!(err.to_string().contains("processInstanceIds is empty"));

        let err = RestartProcessInstances::new("p:1")
            .process_instance_ids(["a"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Restart instructions cannot be empty"));

        let err = RestartProcessInstances::new("p:1")
            .process_instance_ids(["a", " "])
            .start_before_activity("task")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Process instance ids cannot be null"));
    }

    #[test]
    fn test_check_historic_rejects_mismatch_and_running() {
        let request = RestartProcessInstances::new("p:2")
            .process_instance_ids(["h1"])
            .start_before_activity("task");
        let err = request
            .check_historic(&historic("h1", ProcessInstanceState::ExternallyTerminated))
            .unwrap_err();
        assert!(err.to_string().contains("does not match given process definition 'p:2'"));

        let request = RestartProcessInstances::new("p:1")
            .process_instance_ids(["h1"])
            .start_before_activity("task");
        let err = request
            .check_historic(&historic("h1", ProcessInstanceState::Active))
            .unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");
        assert!(request
            .check_historic(&historic("h1", ProcessInstanceState::Completed))
            .is_ok());
    }

    #[test]
    fn test_latest_values_skip_local_variables() {
        let request = RestartProcessInstances::new("p:1");
        let source = RestartSource::resolve(
            &request,
            historic("h1", ProcessInstanceState::Completed),
            &[variable("var", json!("bar"), true), variable("local", json!("foo"), false)],
            &[],
        );
        assert_eq!(source.variables.len(), 1);
        assert_eq!(source.variables["var"], json!("bar"));
        assert!(!source.initial);
    }

    #[test]
    fn test_initial_set_uses_initial_details() {
        let request = RestartProcessInstances::new("p:1").initial_set_of_variables();
        let details = [detail("var", json!("bar"), true), detail("bar", json!("foo"), false)];
        let source = RestartSource::resolve(
            &request,
            historic("h1", ProcessInstanceState::Completed),
            &[],
            &details,
        );
        assert_eq!(source.variables.len(), 1);
        assert_eq!(source.variables["var"], json!("bar"));
        assert!(source.initial);

        let mut no_start = historic("h1", ProcessInstanceState::Completed);
        no_start.start_activity_id = None;
        let source = RestartSource::resolve(&request, no_start, &[], &details);
        assert!(source.variables.is_empty());
    }
}
