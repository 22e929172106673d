// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instantiation at arbitrary points of a process.
//!
//! Starting before an activity, after an activity or on a sequence flow works
//! the same way:
//!
//! 1. Resolve the target and the flow scope it lives in.
//! 2. Apply process variables to the process instance.
//! 3. Pick the scope execution to start in: the given ancestor activity
//!    instance, or the innermost flow scope with exactly one instance, or the
//!    process instance itself.
//! 4. Reuse that scope execution when it is idle, otherwise fork a concurrent
//!    child from it.
//! 5. Enter the missing scopes between it and the target, outermost first.
//! 6. Position the execution, apply local variables and let the token flow run.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::CommandContext;
use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::operations;
use crate::projection;
use crate::variables::Variables;

/// Where to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartTarget {
    /// Before the activity (it is entered).
    BeforeActivity(String),
    /// On the single outgoing flow of the activity.
    AfterActivity(String),
    /// On a sequence flow.
    Transition(String),
}

/// A start step of a new or restarted instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartInstruction {
    /// Enter an activity.
    StartBeforeActivity {
        /// Activity to enter.
        activity_id: String,
    },
    /// Take the single outgoing flow of an activity.
    StartAfterActivity {
        /// Activity whose outgoing flow is taken.
        activity_id: String,
    },
    /// Take a sequence flow.
    StartTransition {
        /// Sequence flow to take.
        transition_id: String,
    },
}

impl StartInstruction {
    /// Activity the instance is started at, for start-before steps.
    pub fn start_activity_id(&self) -> Option<&str> {
        match self {
            Self::StartBeforeActivity { activity_id } => Some(activity_id),
            _ => None,
        }
    }

    fn target(&self) -> StartTarget {
        match self {
            Self::StartBeforeActivity { activity_id } => StartTarget::BeforeActivity(activity_id.clone()),
            Self::StartAfterActivity { activity_id } => StartTarget::AfterActivity(activity_id.clone()),
            Self::StartTransition { transition_id } => StartTarget::Transition(transition_id.clone()),
        }
    }
}

/// Options shared by all start variants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions<'a> {
    /// Activity instance of the scope to start in.
    pub ancestor_activity_instance_id: Option<&'a str>,
    /// Process instance variables.
    pub variables: Option<&'a Variables>,
    /// Variables local to the started execution.
    pub local_variables: Option<&'a Variables>,
}

/// Start before `activity_id`.
pub fn start_before_activity(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    activity_id: &str,
    options: StartOptions<'_>,
) -> Result<()> {
    instantiate(ctx, instance_id, &StartTarget::BeforeActivity(activity_id.to_string()), options)
}

/// Start on the single outgoing flow of `activity_id`.
pub fn start_after_activity(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    activity_id: &str,
    options: StartOptions<'_>,
) -> Result<()> {
    instantiate(ctx, instance_id, &StartTarget::AfterActivity(activity_id.to_string()), options)
}

/// Start on the sequence flow `transition_id`.
pub fn start_transition(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    transition_id: &str,
    options: StartOptions<'_>,
) -> Result<()> {
    instantiate(ctx, instance_id, &StartTarget::Transition(transition_id.to_string()), options)
}

/// Start activity of an instance started with `instructions`: the target of a
/// single start-before step, `None` when there is no unique one.
pub fn unique_start_activity(instructions: &[StartInstruction]) -> Option<String> {
    match instructions {
        [only] => only.start_activity_id().map(str::to_string),
        _ => None,
    }
}

/// Apply a start step.
pub fn apply(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    instruction: &StartInstruction,
    options: StartOptions<'_>,
) -> Result<()> {
    instantiate(ctx, instance_id, &instruction.target(), options)
}

/// A target resolved against the definition.
#[derive(Debug)]
enum Resolved {
    Activity { activity_id: String },
    Transition { transition_id: String, source: String },
}

impl Resolved {
    fn element(&self) -> &str {
        match self {
            Self::Activity { activity_id } => activity_id,
            Self::Transition { source, .. } => source,
        }
    }
}

fn resolve(definition: &ProcessDefinition, target: &StartTarget) -> Result<Resolved> {
    match target {
        StartTarget::BeforeActivity(activity_id) => {
            definition.require_activity(activity_id)?;
            Ok(Resolved::Activity {
                activity_id: activity_id.clone(),
            })
        }
        StartTarget::AfterActivity(activity_id) => {
            definition.require_activity(activity_id)?;
            let outgoing = definition.outgoing_transitions(activity_id);
            match outgoing.as_slice() {
                [] => Err(EngineError::invalid_target(
                    activity_id,
                    "activity has no outgoing sequence flow to take",
                )),
                [transition] => Ok(Resolved::Transition {
                    transition_id: transition.id.clone(),
                    source: transition.source.clone(),
                }),
                _ => Err(EngineError::invalid_target(
                    activity_id,
                    "activity has more than one outgoing sequence flow",
                )),
            }
        }
        StartTarget::Transition(transition_id) => {
            let transition = definition.require_transition(transition_id)?;
            Ok(Resolved::Transition {
                transition_id: transition.id.clone(),
                source: transition.source.clone(),
            })
        }
    }
}

/// Scope execution to start in and the scope activity it represents.
fn select_scope_execution(
    ctx: &CommandContext<'_>,
    instance_id: &str,
    definition: &ProcessDefinition,
    element: &str,
    ancestor: Option<&str>,
) -> Result<(String, Option<String>)> {
    let instance = ctx.instance(instance_id)?;
    let chain = definition.flow_scope_chain(element);

    if let Some(ancestor) = ancestor {
        if ancestor == instance_id {
            return Ok((instance.tree.root_id().to_string(), None));
        }
        let projected = projection::project(instance);
        if projected.find(ancestor).is_none() {
            return Err(EngineError::bad_request(format!(
                "Cannot start '{}': ancestor activity instance '{}' does not exist",
                element, ancestor
            )));
        }
        let scope = instance
            .tree
            .iter()
            .into_iter()
            .find(|e| e.is_scope && e.scope_instance_id.as_deref() == Some(ancestor))
            .ok_or_else(|| {
                EngineError::bad_request(format!(
                    "Cannot start '{}': activity instance '{}' is not a scope",
                    element, ancestor
                ))
            })?;
        let scope_activity = scope.scope_activity_id.clone();
        let encloses = scope_activity
            .as_deref()
            .is_none_or(|s| chain.iter().any(|c| c == s));
        if !encloses {
            return Err(EngineError::bad_request(format!(
                "Cannot start '{}': activity instance '{}' is not an ancestor scope of it",
                element, ancestor
            )));
        }
        return Ok((scope.id.clone(), scope_activity));
    }

    for scope_activity in &chain {
        let executions = instance.tree.scope_executions_for(scope_activity);
        match executions.as_slice() {
            [] => continue,
            [only] => return Ok((only.id.clone(), Some(scope_activity.clone()))),
            _ => {
                return Err(EngineError::bad_request(format!(
                    "Cannot start '{}': scope '{}' has more than one instance, an ancestor activity instance id is required",
                    element, scope_activity
                )));
            }
        }
    }
    Ok((instance.tree.root_id().to_string(), None))
}

/// Execution below `scope_execution_id` that carries the new branch.
fn prepare_branch(ctx: &mut CommandContext<'_>, instance_id: &str, scope_execution_id: &str) -> Result<String> {
    let scope = ctx.instance(instance_id)?.tree.require(scope_execution_id)?;
    if scope.children.is_empty() && scope.activity_id.is_none() {
        return Ok(scope_execution_id.to_string());
    }
    let (child, _) = ctx.fork(instance_id, scope_execution_id)?;
    Ok(child)
}

fn instantiate(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    target: &StartTarget,
    options: StartOptions<'_>,
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let resolved = resolve(&definition, target)?;
    let element = resolved.element().to_string();

    if let Some(variables) = options.variables {
        ctx.set_variables(instance_id, instance_id, variables, false, false)?;
    }

    let (scope_execution_id, scope_activity) = select_scope_execution(
        ctx,
        instance_id,
        &definition,
        &element,
        options.ancestor_activity_instance_id,
    )?;

    // Scopes between the chosen scope and the element, outermost first.
    let mut missing: Vec<String> = definition
        .flow_scope_chain(&element)
        .into_iter()
        .take_while(|s| Some(s) != scope_activity.as_ref())
        .collect();
    missing.reverse();

    debug!(
        process_instance_id = %instance_id,
        target = ?target,
        scope_execution_id = %scope_execution_id,
        missing_scopes = ?missing,
        "Instantiating"
    );

    let mut branch = prepare_branch(ctx, instance_id, &scope_execution_id)?;
    for scope in &missing {
        let activity = definition.require_activity(scope)?.clone();
        operations::position_at(ctx, instance_id, &branch, scope)?;
        branch = operations::enter_activity(ctx, instance_id, &branch, &definition, &activity)?;
    }

    match &resolved {
        Resolved::Activity { activity_id } => {
            operations::position_at(ctx, instance_id, &branch, activity_id)?;
            let enters_scope = definition.is_scope(activity_id)
                && !definition.require_activity(activity_id)?.async_before;
            match options.local_variables {
                // Locals belong to the scope execution created on entry.
                Some(locals) if enters_scope => {
                    operations::start_activity_with_locals(ctx, instance_id, &branch, activity_id, locals)?;
                }
                locals => {
                    if let Some(locals) = locals {
                        ctx.set_variables(instance_id, &branch, locals, true, false)?;
                    }
                    operations::schedule_start(ctx, instance_id, &branch, activity_id, false);
                }
            }
        }
        Resolved::Transition {
            transition_id,
            source,
        } => {
            operations::position_at(ctx, instance_id, &branch, source)?;
            if let Some(locals) = options.local_variables {
                ctx.set_variables(instance_id, &branch, locals, true, false)?;
            }
            operations::schedule_take(ctx, instance_id, &branch, transition_id);
        }
    }
    operations::run(ctx)
}
