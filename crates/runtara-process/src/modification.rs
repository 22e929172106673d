// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process instance modification.
//!
//! A [`ProcessInstanceModification`] is an ordered list of start and cancel
//! instructions applied to one process instance in a single unit of work. Each
//! instruction sees the state left by the previous ones: cancel instructions
//! re-project the activity instance tree, so ids that an earlier instruction
//! removed fail with `NotFound`. The process instance is kept alive while the
//! instructions run and ended afterwards if nothing is left in it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::cancellation::{self, CancellationSource};
use crate::context::{CommandContext, ExecutionFlags};
use crate::error::{EngineError, Result};
use crate::instantiation::{self, StartOptions};
use crate::operations;
use crate::variables::Variables;

const MODIFICATION_REASON: &str = "process instance modification";

/// One step of a modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModificationInstruction {
    /// Enter an activity.
    StartBeforeActivity {
        /// Activity to enter.
        activity_id: String,
        /// Scope instance to start in.
        #[serde(default)]
        ancestor_activity_instance_id: Option<String>,
        /// Process instance variables.
        #[serde(default)]
        variables: Variables,
        /// Variables local to the started execution.
        #[serde(default)]
        local_variables: Variables,
    },
    /// Take the single outgoing flow of an activity.
    StartAfterActivity {
        /// Activity whose outgoing flow is taken.
        activity_id: String,
        /// Scope instance to start in.
        #[serde(default)]
        ancestor_activity_instance_id: Option<String>,
        /// Process instance variables.
        #[serde(default)]
        variables: Variables,
        /// Variables local to the started execution.
        #[serde(default)]
        local_variables: Variables,
    },
    /// Take a sequence flow.
    StartTransition {
        /// Sequence flow to take.
        transition_id: String,
        /// Scope instance to start in.
        #[serde(default)]
        ancestor_activity_instance_id: Option<String>,
        /// Process instance variables.
        #[serde(default)]
        variables: Variables,
        /// Variables local to the started execution.
        #[serde(default)]
        local_variables: Variables,
    },
    /// Cancel an activity instance.
    CancelActivityInstance {
        /// Activity instance to cancel.
        activity_instance_id: String,
    },
    /// Cancel a transition instance.
    CancelTransitionInstance {
        /// Transition instance to cancel.
        transition_instance_id: String,
    },
    /// Cancel all instances of an activity.
    CancelAllForActivity {
        /// Activity whose instances are cancelled.
        activity_id: String,
    },
}

impl ModificationInstruction {
    /// Start before `activity_id`.
    pub fn start_before(activity_id: &str) -> Self {
        Self::StartBeforeActivity {
            activity_id: activity_id.to_string(),
            ancestor_activity_instance_id: None,
            variables: Variables::new(),
            local_variables: Variables::new(),
        }
    }

    /// Start after `activity_id`.
    pub fn start_after(activity_id: &str) -> Self {
        Self::StartAfterActivity {
            activity_id: activity_id.to_string(),
            ancestor_activity_instance_id: None,
            variables: Variables::new(),
            local_variables: Variables::new(),
        }
    }

    /// Start on `transition_id`.
    pub fn start_transition(transition_id: &str) -> Self {
        Self::StartTransition {
            transition_id: transition_id.to_string(),
            ancestor_activity_instance_id: None,
            variables: Variables::new(),
            local_variables: Variables::new(),
        }
    }

    /// Cancel activity instance `id`.
    pub fn cancel_activity_instance(id: &str) -> Self {
        Self::CancelActivityInstance {
            activity_instance_id: id.to_string(),
        }
    }

    /// Cancel transition instance `id`.
    pub fn cancel_transition_instance(id: &str) -> Self {
        Self::CancelTransitionInstance {
            transition_instance_id: id.to_string(),
        }
    }

    /// Cancel every instance of `activity_id`.
    pub fn cancel_all(activity_id: &str) -> Self {
        Self::CancelAllForActivity {
            activity_id: activity_id.to_string(),
        }
    }

    fn start_parts(&mut self) -> Option<(&mut Option<String>, &mut Variables, &mut Variables)> {
        match self {
            Self::StartBeforeActivity {
                ancestor_activity_instance_id,
                variables,
                local_variables,
                ..
            }
            | Self::StartAfterActivity {
                ancestor_activity_instance_id,
                variables,
                local_variables,
                ..
            }
            | Self::StartTransition {
                ancestor_activity_instance_id,
                variables,
                local_variables,
                ..
            } => Some((ancestor_activity_instance_id, variables, local_variables)),
            _ => None,
        }
    }

    /// Start inside the scope instance `id`. Ignored by cancel instructions.
    pub fn ancestor(mut self, id: &str) -> Self {
        if let Some((ancestor, _, _)) = self.start_parts() {
            *ancestor = Some(id.to_string());
        }
        self
    }

    /// Set a process instance variable. Ignored by cancel instructions.
    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        if let Some((_, variables, _)) = self.start_parts() {
            variables.insert(name.to_string(), value.into());
        }
        self
    }

    /// Set a variable local to the started execution. Ignored by cancel instructions.
    pub fn local_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        if let Some((_, _, locals)) = self.start_parts() {
            locals.insert(name.to_string(), value.into());
        }
        self
    }
}

/// Modification of one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceModification {
    /// Target instance.
    pub process_instance_id: String,
    /// Steps in execution order.
    pub instructions: Vec<ModificationInstruction>,
    /// Do not invoke listeners.
    #[serde(default)]
    pub skip_custom_listeners: bool,
    /// Do not apply input/output mappings.
    #[serde(default)]
    pub skip_io_mappings: bool,
    /// Audit annotation.
    #[serde(default)]
    pub annotation: Option<String>,
    /// Allow removing executions whose job an executor currently holds.
    #[serde(default)]
    pub allow_preemption: bool,
}

impl ProcessInstanceModification {
    /// Empty modification of `process_instance_id`.
    pub fn new(process_instance_id: &str) -> Self {
        Self {
            process_instance_id: process_instance_id.to_string(),
            instructions: Vec::new(),
            skip_custom_listeners: false,
            skip_io_mappings: false,
            annotation: None,
            allow_preemption: false,
        }
    }

    /// Append an instruction.
    pub fn instruction(mut self, instruction: ModificationInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Append a start-before instruction.
    pub fn start_before_activity(self, activity_id: &str) -> Self {
        self.instruction(ModificationInstruction::start_before(activity_id))
    }

    /// Append a start-after instruction.
    pub fn start_after_activity(self, activity_id: &str) -> Self {
        self.instruction(ModificationInstruction::start_after(activity_id))
    }

    /// Append a start-transition instruction.
    pub fn start_transition(self, transition_id: &str) -> Self {
        self.instruction(ModificationInstruction::start_transition(transition_id))
    }

    /// Append a cancel-activity-instance instruction.
    pub fn cancel_activity_instance(self, id: &str) -> Self {
        self.instruction(ModificationInstruction::cancel_activity_instance(id))
    }

    /// Append a cancel-transition-instance instruction.
    pub fn cancel_transition_instance(self, id: &str) -> Self {
        self.instruction(ModificationInstruction::cancel_transition_instance(id))
    }

    /// Append a cancel-all instruction.
    pub fn cancel_all_for_activity(self, activity_id: &str) -> Self {
        self.instruction(ModificationInstruction::cancel_all(activity_id))
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

    /// Audit annotation.
    pub fn annotation(mut self, annotation: &str) -> Self {
        self.annotation = Some(annotation.to_string());
        self
    }

    /// Authorize cancelling executions whose asynchronous continuation is in flight.
    pub fn allow_preemption(mut self) -> Self {
        self.allow_preemption = true;
        self
    }

    /// Check the request before anything is loaded. Without instructions the
    /// modification is a no-op.
    pub fn validate(&self) -> Result<()> {
        if self.process_instance_id.trim().is_empty() {
            return Err(EngineError::bad_request("processInstanceId is null"));
        }
        Ok(())
    }
}

/// The same instructions applied to many process instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkModification {
    /// Definition all instances run.
    pub process_definition_id: String,
    /// Target instances.
    pub process_instance_ids: Vec<String>,
    /// Steps in execution order.
    pub instructions: Vec<ModificationInstruction>,
    /// Do not invoke listeners.
    #[serde(default)]
    pub skip_custom_listeners: bool,
    /// Do not apply input/output mappings.
    #[serde(default)]
    pub skip_io_mappings: bool,
    /// Audit annotation.
    #[serde(default)]
    pub annotation: Option<String>,
}

impl BulkModification {
    /// Check the request before anything is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.process_definition_id.trim().is_empty() {
            return Err(EngineError::bad_request("processDefinitionId is null"));
        }
        if self.process_instance_ids.is_empty() {
            return Err(EngineError::bad_request("Process instance ids is empty"));
        }
        if self.process_instance_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::bad_request(
                "Process instance ids cannot contain null",
            ));
        }
        validate_instructions(&self.instructions)
    }

    /// Modification of one of the instances.
    pub fn for_instance(&self, process_instance_id: &str) -> ProcessInstanceModification {
        ProcessInstanceModification {
            process_instance_id: process_instance_id.to_string(),
            instructions: self.instructions.clone(),
            skip_custom_listeners: self.skip_custom_listeners,
            skip_io_mappings: self.skip_io_mappings,
            annotation: self.annotation.clone(),
            allow_preemption: false,
        }
    }
}

fn validate_instructions(instructions: &[ModificationInstruction]) -> Result<()> {
    if instructions.is_empty() {
        return Err(EngineError::bad_request(
            "Modification instructions cannot be empty",
        ));
    }
    Ok(())
}

/// Apply a modification in the current unit of work.
pub fn execute(ctx: &mut CommandContext<'_>, modification: &ProcessInstanceModification) -> Result<()> {
    modification.validate()?;
    let instance_id = modification.process_instance_id.as_str();
    ctx.instance(instance_id)?.ensure_active()?;
    ctx.protect_locked_jobs();
    if modification.allow_preemption {
        ctx.allow_preemption();
    }

    let previous = ctx.set_flags(ExecutionFlags {
        skip_custom_listeners: modification.skip_custom_listeners,
        skip_io_mappings: modification.skip_io_mappings,
    });
    let result = apply_instructions(ctx, instance_id, &modification.instructions);
    ctx.set_flags(previous);
    result?;

    cancellation::end_if_empty(ctx, instance_id, MODIFICATION_REASON)?;
    operations::run(ctx)?;
    info!(
        process_instance_id = %instance_id,
        instructions = modification.instructions.len(),
        "Process instance modified"
    );
    Ok(())
}

fn apply_instructions(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    instructions: &[ModificationInstruction],
) -> Result<()> {
    for (index, instruction) in instructions.iter().enumerate() {
        if !ctx.is_live(instance_id) {
            return Err(EngineError::not_found("Process instance", instance_id));
        }
        debug!(process_instance_id = %instance_id, step = index, instruction = ?instruction, "Applying modification step");
        apply_instruction(ctx, instance_id, instruction)?;
        operations::run(ctx)?;
    }
    Ok(())
}

fn start_options<'a>(
    ancestor: &'a Option<String>,
    variables: &'a Variables,
    local_variables: &'a Variables,
) -> StartOptions<'a> {
    StartOptions {
        ancestor_activity_instance_id: ancestor.as_deref(),
        variables: Some(variables).filter(|v| !v.is_empty()),
        local_variables: Some(local_variables).filter(|v| !v.is_empty()),
    }
}

fn apply_instruction(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    instruction: &ModificationInstruction,
) -> Result<()> {
    match instruction {
        ModificationInstruction::StartBeforeActivity {
            activity_id,
            ancestor_activity_instance_id,
            variables,
            local_variables,
        } => instantiation::start_before_activity(
            ctx,
            instance_id,
            activity_id,
            start_options(ancestor_activity_instance_id, variables, local_variables),
        ),
        ModificationInstruction::StartAfterActivity {
            activity_id,
            ancestor_activity_instance_id,
            variables,
            local_variables,
        } => instantiation::start_after_activity(
            ctx,
            instance_id,
            activity_id,
            start_options(ancestor_activity_instance_id, variables, local_variables),
        ),
        ModificationInstruction::StartTransition {
            transition_id,
            ancestor_activity_instance_id,
            variables,
            local_variables,
        } => instantiation::start_transition(
            ctx,
            instance_id,
            transition_id,
            start_options(ancestor_activity_instance_id, variables, local_variables),
        ),
        ModificationInstruction::CancelActivityInstance {
            activity_instance_id,
        } => cancellation::cancel_activity_instance(
            ctx,
            instance_id,
            activity_instance_id,
            MODIFICATION_REASON,
            CancellationSource::Internal,
            true,
        ),
        ModificationInstruction::CancelTransitionInstance {
            transition_instance_id,
        } => cancellation::cancel_transition_instance(
            ctx,
            instance_id,
            transition_instance_id,
            MODIFICATION_REASON,
            true,
        ),
        ModificationInstruction::CancelAllForActivity { activity_id } => {
            cancellation::cancel_all_for_activity(ctx, instance_id, activity_id, MODIFICATION_REASON, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instruction_builders() {
        let instruction = ModificationInstruction::start_before("task2")
            .ancestor("sub:1")
            .variable("a", 1)
            .local_variable("b", "x");
        match instruction {
            ModificationInstruction::StartBeforeActivity {
                ancestor_activity_instance_id,
                variables,
                local_variables,
                ..
            } => {
                assert_eq!(ancestor_activity_instance_id.as_deref(), Some("sub:1"));
                assert_eq!(variables.get("a"), Some(&json!(1)));
                assert_eq!(local_variables.get("b"), Some(&json!("x")));
            }
            other => panic!("unexpected instruction {:?}", other),
        }

        let cancel = ModificationInstruction::cancel_all("task1").variable("ignored", 1);
        assert_eq!(cancel, ModificationInstruction::cancel_all("task1"));
    }

    #[test]
    fn test_validation() {
        assert!(ProcessInstanceModification::new("pi").validate().is_ok());
        let blank = ProcessInstanceModification::new(" ");
        assert_eq!(blank.validate().unwrap_err().error_code(), "BAD_REQUEST");

        let no_instructions = BulkModification {
            process_definition_id: "p:1".into(),
            process_instance_ids: vec!["a".into()],
            instructions: Vec::new(),
            skip_custom_listeners: false,
            skip_io_mappings: false,
            annotation: None,
        };
        let err = no_instructions.validate().unwrap_err();
        assert!(err.to_string().contains("instructions cannot be empty"));

        let bulk = BulkModification {
            process_definition_id: "p:1".into(),
            process_instance_ids: vec!["a".into(), " ".into()],
            instructions: vec![ModificationInstruction::start_before("task1")],
            skip_custom_listeners: false,
            skip_io_mappings: false,
            annotation: None,
        };
        let err = bulk.validate().unwrap_err();
        assert!(err.to_string().contains("cannot contain null"));

        let modification = bulk.for_instance("a");
        assert_eq!(modification.instructions.len(), 1);
        assert!(modification.validate().is_ok());
    }

    #[test]
    fn test_instruction_serde_shape() {
        let value = serde_json::to_value(ModificationInstruction::cancel_transition_instance("t1")).unwrap();
        assert_eq!(value["type"], "cancel_transition_instance");
        let back: ModificationInstruction = serde_json::from_value(json!({
            "type": "start_before_activity",
            "activity_id": "task1"
        }))
        .unwrap();
        assert_eq!(back, ModificationInstruction::start_before("task1"));
    }
}
