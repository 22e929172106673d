// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Token flow.
//!
//! Executions move through the process graph by atomic operations queued on the
//! agenda of the [`CommandContext`]:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `StartActivity` | enter an activity (scope creation, history, input mappings, start listeners, boundary triggers) and run its behavior |
//! | `LeaveActivity` | complete the current activity (output mappings, end listeners, compensation) and select outgoing flows |
//! | `TakeTransition` | take listeners, then start the target |
//!
//! Wait states (user tasks, catch events, call activities, async continuations)
//! simply leave the agenda empty. [`run`] drains the agenda and skips operations
//! whose execution was removed in the meantime.

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, info};

use crate::cancellation::{self, CancellationSource};
use crate::compensation::CompensationState;
use crate::context::CommandContext;
use crate::definition::{
    Activity, ActivityKind, EventTrigger, ListenerEvent, MappingSource, ProcessDefinition,
};
use crate::delegate::evaluate_condition;
use crate::error::{EngineError, Result};
use crate::history::{HistoricActivityInstance, HistoricProcessInstance, HistoryEvent, IncidentState, ProcessInstanceState};
use crate::instance::{EventSubscription, Job, JobKind, ProcessInstance, SubscriptionKind, Task};
use crate::variables::{self, Variables};

/// Atomic operation on one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    StartActivity {
        instance_id: String,
        execution_id: String,
        activity_id: String,
        skip_async: bool,
    },
    LeaveActivity {
        instance_id: String,
        execution_id: String,
    },
    TakeTransition {
        instance_id: String,
        execution_id: String,
        transition_id: String,
    },
}

impl Operation {
    fn target(&self) -> (&str, &str) {
        match self {
            Self::StartActivity {
                instance_id,
                execution_id,
                ..
            }
            | Self::LeaveActivity {
                instance_id,
                execution_id,
            }
            | Self::TakeTransition {
                instance_id,
                execution_id,
                ..
            } => (instance_id.as_str(), execution_id.as_str()),
        }
    }
}

/// Queue entering `activity_id` with `execution_id`.
pub(crate) fn schedule_start(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
    skip_async: bool,
) {
    ctx.schedule(Operation::StartActivity {
        instance_id: instance_id.to_string(),
        execution_id: execution_id.to_string(),
        activity_id: activity_id.to_string(),
        skip_async,
    });
}

/// Queue leaving the current activity of `execution_id`.
pub(crate) fn schedule_leave(ctx: &mut CommandContext<'_>, instance_id: &str, execution_id: &str) {
    ctx.schedule(Operation::LeaveActivity {
        instance_id: instance_id.to_string(),
        execution_id: execution_id.to_string(),
    });
}

/// Queue taking `transition_id` with `execution_id`.
pub(crate) fn schedule_take(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    transition_id: &str,
) {
    ctx.schedule(Operation::TakeTransition {
        instance_id: instance_id.to_string(),
        execution_id: execution_id.to_string(),
        transition_id: transition_id.to_string(),
    });
}

/// Drain the agenda.
pub(crate) fn run(ctx: &mut CommandContext<'_>) -> Result<()> {
    while let Some(operation) = ctx.next_operation() {
        let (instance_id, execution_id) = operation.target();
        let live = ctx.is_live(instance_id)
            && ctx
                .instance(instance_id)
                .is_ok_and(|i| i.tree.contains(execution_id));
        if !live {
            debug!(
                process_instance_id = %instance_id,
                execution_id = %execution_id,
                "Skipping operation for removed execution"
            );
            continue;
        }
        match operation {
            Operation::StartActivity {
                instance_id,
                execution_id,
                activity_id,
                skip_async,
            } => start_activity(ctx, &instance_id, &execution_id, &activity_id, skip_async)?,
            Operation::LeaveActivity {
                instance_id,
                execution_id,
            } => leave_activity(ctx, &instance_id, &execution_id)?,
            Operation::TakeTransition {
                instance_id,
                execution_id,
                transition_id,
            } => take_transition(ctx, &instance_id, &execution_id, &transition_id)?,
        }
    }
    Ok(())
}

fn set_active(ctx: &mut CommandContext<'_>, instance_id: &str, execution_id: &str, active: bool) -> Result<()> {
    ctx.instance_mut(instance_id)?
        .tree
        .require_mut(execution_id)?
        .is_active = active;
    Ok(())
}

/// Position `execution_id` at `activity_id` without entering it.
pub(crate) fn position_at(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
) -> Result<()> {
    ctx.instance_mut(instance_id)?
        .tree
        .set_position(execution_id, Some(activity_id.to_string()), None)?;
    set_active(ctx, instance_id, execution_id, true)
}

fn start_activity(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
    skip_async: bool,
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let activity = definition.require_activity(activity_id)?.clone();

    if activity.async_before && !skip_async {
        return create_async_continuation(ctx, instance_id, execution_id, activity_id);
    }

    let execution_id = enter_activity(ctx, instance_id, execution_id, &definition, &activity)?;
    execute_behavior(ctx, instance_id, &execution_id, &definition, &activity)
}

/// Enter `activity_id` now with local variables on the execution that runs it.
/// For a scope activity that is the new scope execution.
pub(crate) fn start_activity_with_locals(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
    locals: &Variables,
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let activity = definition.require_activity(activity_id)?.clone();
    let execution_id =
        enter_activity_with_locals(ctx, instance_id, execution_id, &definition, &activity, Some(locals))?;
    execute_behavior(ctx, instance_id, &execution_id, &definition, &activity)
}

fn create_async_continuation(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
) -> Result<()> {
    position_at(ctx, instance_id, execution_id, activity_id)?;
    let job = Job {
        id: ctx.next_id(),
        kind: JobKind::AsyncContinuation {
            activity_id: activity_id.to_string(),
        },
        process_instance_id: instance_id.to_string(),
        execution_id: execution_id.to_string(),
        due_date: ctx.now(),
        retries: ctx.services().config.default_job_retries,
        exception_message: None,
        created_at: ctx.now(),
        lock_owner: None,
        lock_expiration: None,
    };
    debug!(
        process_instance_id = %instance_id,
        execution_id = %execution_id,
        activity_id = %activity_id,
        job_id = %job.id,
        "Asynchronous continuation created"
    );
    ctx.instance_mut(instance_id)?
        .jobs
        .insert(job.id.clone(), job);
    Ok(())
}

/// Enter `activity` with `execution_id`, creating its scope execution when the
/// activity is a scope. Returns the execution now at the activity.
pub(crate) fn enter_activity(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> Result<String> {
    enter_activity_with_locals(ctx, instance_id, execution_id, definition, activity, None)
}

fn enter_activity_with_locals(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    definition: &ProcessDefinition,
    activity: &Activity,
    locals: Option<&Variables>,
) -> Result<String> {
    let is_scope = definition.is_scope(&activity.id);
    let activity_instance_id = ctx.next_activity_instance_id(&activity.id);

    let target = if is_scope {
        let scope_execution_id = ctx.next_id();
        ctx.instance_mut(instance_id)?.tree.create_scope(
            execution_id,
            scope_execution_id,
            &activity.id,
            activity_instance_id.clone(),
        )?
    } else {
        ctx.instance_mut(instance_id)?.tree.set_position(
            execution_id,
            Some(activity.id.clone()),
            Some(activity_instance_id.clone()),
        )?;
        execution_id.to_string()
    };
    set_active(ctx, instance_id, &target, true)?;
    if let Some(locals) = locals {
        ctx.set_variables_before_start(instance_id, &target, locals)?;
    }

    record_activity_start(ctx, instance_id, &target, activity, &activity_instance_id)?;

    if is_scope && !ctx.flags().skip_io_mappings {
        for mapping in &activity.inputs {
            let value = resolve_mapping(ctx, instance_id, &target, &mapping.source)?;
            ctx.set_variable(instance_id, &target, &mapping.target, value, true, false)?;
        }
    }

    let listeners = activity
        .listeners_for(ListenerEvent::Start)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, &target, listeners, ListenerEvent::Start)?;

    if is_scope {
        create_boundary_triggers(ctx, instance_id, &target, definition, &activity.id)?;
    }
    Ok(target)
}

fn resolve_mapping(
    ctx: &CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    source: &MappingSource,
) -> Result<Value> {
    Ok(match source {
        MappingSource::Value(value) => value.clone(),
        MappingSource::Variable(name) => {
            let tree = &ctx.instance(instance_id)?.tree;
            variables::get(tree, execution_id, name)
                .cloned()
                .unwrap_or(Value::Null)
        }
    })
}

fn record_activity_start(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity: &Activity,
    activity_instance_id: &str,
) -> Result<()> {
    let instance = ctx.instance(instance_id)?;
    let parent_activity_instance_id = instance
        .tree
        .flow_scope_execution(execution_id)?
        .scope_instance_id
        .clone();
    let event = HistoryEvent::ActivityInstanceStarted(HistoricActivityInstance {
        id: activity_instance_id.to_string(),
        activity_id: activity.id.clone(),
        activity_type: activity.kind.type_name().to_string(),
        parent_activity_instance_id,
        execution_id: execution_id.to_string(),
        process_instance_id: instance_id.to_string(),
        root_process_instance_id: instance.root_process_instance_id.clone(),
        called_process_instance_id: None,
        task_id: None,
        start_time: ctx.now(),
        end_time: None,
        canceled: false,
    });
    ctx.record(event);
    Ok(())
}

fn record_activity_end(ctx: &mut CommandContext<'_>, activity_instance_id: Option<&str>, canceled: bool) {
    if let Some(id) = activity_instance_id {
        ctx.record(HistoryEvent::ActivityInstanceEnded {
            id: id.to_string(),
            end_time: ctx.now(),
            canceled,
        });
    }
}

fn create_boundary_triggers(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    scope_execution_id: &str,
    definition: &ProcessDefinition,
    activity_id: &str,
) -> Result<()> {
    for boundary in definition.boundary_events(activity_id) {
        if let ActivityKind::BoundaryEvent { trigger, .. } = &boundary.kind {
            create_trigger(ctx, instance_id, scope_execution_id, &boundary.id, trigger)?;
        }
    }
    Ok(())
}

fn create_trigger(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity_id: &str,
    trigger: &EventTrigger,
) -> Result<()> {
    let now = ctx.now();
    let id = ctx.next_id();
    match trigger {
        EventTrigger::Message { name } => {
            let subscription = EventSubscription {
                id,
                kind: SubscriptionKind::Message { name: name.clone() },
                execution_id: execution_id.to_string(),
                activity_id: activity_id.to_string(),
                process_instance_id: instance_id.to_string(),
                created_at: now,
            };
            ctx.instance_mut(instance_id)?
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }
        EventTrigger::Timer { after_seconds } => {
            let job = Job {
                id,
                kind: JobKind::Timer {
                    activity_id: activity_id.to_string(),
                },
                process_instance_id: instance_id.to_string(),
                execution_id: execution_id.to_string(),
                due_date: now + Duration::seconds(*after_seconds),
                retries: ctx.services().config.default_job_retries,
                exception_message: None,
                created_at: now,
                lock_owner: None,
                lock_expiration: None,
            };
            ctx.instance_mut(instance_id)?.jobs.insert(job.id.clone(), job);
        }
    }
    Ok(())
}

fn execute_behavior(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> Result<()> {
    match &activity.kind {
        ActivityKind::StartEvent
        | ActivityKind::ManualTask
        | ActivityKind::ExclusiveGateway
        | ActivityKind::BoundaryEvent { .. }
        | ActivityKind::EndEvent { terminate: false } => {
            schedule_leave(ctx, instance_id, execution_id);
        }
        ActivityKind::ParallelGateway => {
            if activity.incoming.len() > 1 {
                join(ctx, instance_id, execution_id, activity)?;
            } else {
                schedule_leave(ctx, instance_id, execution_id);
            }
        }
        ActivityKind::EndEvent { terminate: true } => {
            terminate_end_event(ctx, instance_id, execution_id, activity)?;
        }
        ActivityKind::UserTask => create_task(ctx, instance_id, execution_id, activity)?,
        ActivityKind::ServiceTask { handler } => {
            let service = ctx.services().delegates.handler(handler)?;
            let mut delegate = ctx.delegate_execution(instance_id, execution_id, None)?;
            service.execute(&mut delegate).map_err(|e| {
                EngineError::process_engine(format!(
                    "service task '{}' failed: {}",
                    activity.id, e
                ))
            })?;
            ctx.apply_writes(instance_id, execution_id, delegate.into_writes())?;
            schedule_leave(ctx, instance_id, execution_id);
        }
        ActivityKind::IntermediateCatchEvent { trigger } => {
            create_trigger(ctx, instance_id, execution_id, &activity.id, trigger)?;
        }
        ActivityKind::SubProcess | ActivityKind::Transaction => {
            let initial = definition.initial_activity(Some(&activity.id)).ok_or_else(|| {
                EngineError::process_engine(format!(
                    "scope '{}' has no none start event",
                    activity.id
                ))
            })?;
            schedule_start(ctx, instance_id, execution_id, &initial.id, false);
        }
        ActivityKind::CallActivity {
            called_element,
            propagate_variables,
        } => {
            start_called_instance(
                ctx,
                instance_id,
                execution_id,
                called_element,
                *propagate_variables,
            )?;
        }
    }
    Ok(())
}

fn create_task(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity: &Activity,
) -> Result<()> {
    let activity_instance_id = ctx
        .instance(instance_id)?
        .tree
        .require(execution_id)?
        .activity_instance_id
        .clone()
        .ok_or_else(|| EngineError::invalid_state(execution_id, "user task was not entered"))?;
    let task = Task {
        id: ctx.next_id(),
        activity_id: activity.id.clone(),
        activity_instance_id: activity_instance_id.clone(),
        execution_id: execution_id.to_string(),
        process_instance_id: instance_id.to_string(),
        created_at: ctx.now(),
    };
    ctx.record(HistoryEvent::ActivityInstanceUpdated {
        id: activity_instance_id,
        called_process_instance_id: None,
        task_id: Some(task.id.clone()),
    });
    debug!(process_instance_id = %instance_id, task_id = %task.id, activity_id = %activity.id, "User task created");
    ctx.instance_mut(instance_id)?
        .tasks
        .insert(task.id.clone(), task);
    Ok(())
}

/// Parallel join: wait until as many executions as incoming flows arrived.
fn join(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity: &Activity,
) -> Result<()> {
    set_active(ctx, instance_id, execution_id, false)?;
    let tree = &ctx.instance(instance_id)?.tree;
    let scope = tree.flow_scope_execution(execution_id)?;
    let waiting: Vec<String> = if scope.id == execution_id {
        vec![execution_id.to_string()]
    } else {
        tree.children(&scope.id)
            .into_iter()
            .filter(|c| c.activity_id.as_deref() == Some(activity.id.as_str()) && !c.is_active)
            .map(|c| c.id.clone())
            .collect()
    };
    if waiting.len() < activity.incoming.len() {
        debug!(
            process_instance_id = %instance_id,
            activity_id = %activity.id,
            arrived = waiting.len(),
            expected = activity.incoming.len(),
            "Parallel gateway waiting"
        );
        return Ok(());
    }

    let mut survivor = execution_id.to_string();
    let others: Vec<String> = waiting
        .into_iter()
        .filter(|w| w != execution_id)
        .take(activity.incoming.len() - 1)
        .collect();
    for other in others {
        let activity_instance_id = ctx
            .instance(instance_id)?
            .tree
            .require(&other)?
            .activity_instance_id
            .clone();
        record_activity_end(ctx, activity_instance_id.as_deref(), false);
        let removal = ctx.detach_execution(instance_id, &other)?;
        if let Some(replaced) = removal.replaced {
            if replaced.from == survivor {
                survivor = replaced.to;
            }
        }
    }
    set_active(ctx, instance_id, &survivor, true)?;
    schedule_leave(ctx, instance_id, &survivor);
    Ok(())
}

fn terminate_end_event(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    activity: &Activity,
) -> Result<()> {
    let listeners = activity
        .listeners_for(ListenerEvent::End)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, execution_id, listeners, ListenerEvent::End)?;
    let tree = &ctx.instance(instance_id)?.tree;
    let activity_instance_id = tree.require(execution_id)?.activity_instance_id.clone();
    let scope = tree.flow_scope_execution(execution_id)?.clone();
    record_activity_end(ctx, activity_instance_id.as_deref(), false);
    ctx.instance_mut(instance_id)?
        .tree
        .set_position(execution_id, None, None)?;

    let reason = format!("terminate end event '{}'", activity.id);
    if scope.is_root() {
        cancellation::terminate_instance(
            ctx,
            instance_id,
            &reason,
            CancellationSource::Internal,
            Some(activity.id.clone()),
            true,
        )
    } else {
        cancellation::cancel_scope_content(ctx, instance_id, &scope.id, &reason, CancellationSource::Internal)?;
        complete_scope(ctx, instance_id, &scope.id, Some(activity.id.clone()))
    }
}

fn start_called_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    called_element: &str,
    propagate_variables: bool,
) -> Result<()> {
    let called = ctx.latest_definition(called_element)?;
    let caller = ctx.instance(instance_id)?;
    let root_id = caller.root_process_instance_id.clone();
    let activity_instance_id = caller
        .tree
        .require(execution_id)?
        .activity_instance_id
        .clone();
    let visible = variables::visible(&caller.tree, execution_id);

    let sub_id = ctx.next_id();
    let mut sub = ProcessInstance::new(&sub_id, &called, &root_id, ctx.now());
    sub.super_process_instance_id = Some(instance_id.to_string());
    sub.super_execution_id = Some(execution_id.to_string());
    ctx.hierarchy_mut().instances.insert(sub_id.clone(), sub);

    if let Some(id) = activity_instance_id {
        ctx.record(HistoryEvent::ActivityInstanceUpdated {
            id,
            called_process_instance_id: Some(sub_id.clone()),
            task_id: None,
        });
    }
    info!(
        process_instance_id = %instance_id,
        called_process_instance_id = %sub_id,
        called_element = %called_element,
        "Call activity started sub process instance"
    );

    let initial = called
        .initial_activity(None)
        .ok_or_else(|| {
            EngineError::process_engine(format!(
                "process '{}' has no none start event",
                called.id()
            ))
        })?
        .id
        .clone();
    begin_instance(ctx, &sub_id, Some(initial.clone()), None)?;
    if propagate_variables {
        ctx.set_variables(&sub_id, &sub_id, &visible, false, true)?;
    }
    position_at(ctx, &sub_id, &sub_id, &initial)?;
    schedule_start(ctx, &sub_id, &sub_id, &initial, false);
    Ok(())
}

/// Record the start of `instance_id` and fire its process start listeners.
pub(crate) fn begin_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    start_activity_id: Option<String>,
    restarted_process_instance_id: Option<String>,
) -> Result<()> {
    let instance = ctx.instance_mut(instance_id)?;
    instance.start_activity_id = start_activity_id.clone();
    let record = HistoricProcessInstance {
        id: instance.id.clone(),
        business_key: instance.business_key.clone(),
        definition_id: instance.definition_id.clone(),
        definition_key: instance.definition_key.clone(),
        root_process_instance_id: instance.root_process_instance_id.clone(),
        super_process_instance_id: instance.super_process_instance_id.clone(),
        case_instance_id: instance.case_instance_id.clone(),
        start_time: instance.start_time,
        end_time: None,
        state: ProcessInstanceState::Active,
        start_activity_id,
        end_activity_id: None,
        delete_reason: None,
        restarted_process_instance_id,
    };
    ctx.record(HistoryEvent::ProcessInstanceStarted(record));

    let definition = ctx.definition_of(instance_id)?;
    let listeners = definition
        .listeners_for(ListenerEvent::Start)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, instance_id, listeners, ListenerEvent::Start)
}

fn leave_activity(ctx: &mut CommandContext<'_>, instance_id: &str, execution_id: &str) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let execution = ctx.instance(instance_id)?.tree.require(execution_id)?.clone();
    let activity_id = execution
        .activity_id
        .clone()
        .ok_or_else(|| EngineError::invalid_state(execution_id, "execution is not at an activity"))?;
    let activity = definition.require_activity(&activity_id)?.clone();
    let leaf_scope = execution.is_leaf_scope();

    if leaf_scope && !ctx.flags().skip_io_mappings && !activity.outputs.is_empty() {
        let parent_id = execution
            .parent_id
            .clone()
            .ok_or_else(|| EngineError::invalid_state(execution_id, "scope execution without parent"))?;
        for mapping in &activity.outputs {
            let value = resolve_mapping(ctx, instance_id, execution_id, &mapping.source)?;
            ctx.set_variable(instance_id, &parent_id, &mapping.target, value, false, false)?;
        }
    }

    let listeners = activity
        .listeners_for(ListenerEvent::End)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, execution_id, listeners, ListenerEvent::End)?;
    record_activity_end(ctx, execution.activity_instance_id.as_deref(), false);

    let owner = ctx
        .instance(instance_id)?
        .tree
        .flow_scope_execution(execution_id)?
        .id
        .clone();
    if let (Some(_), Some(activity_instance_id)) =
        (&activity.compensation_handler, &execution.activity_instance_id)
    {
        let subscription = EventSubscription {
            id: ctx.next_id(),
            kind: SubscriptionKind::Compensate {
                compensated_activity_instance_id: activity_instance_id.clone(),
                state: CompensationState::Pending,
            },
            execution_id: owner.clone(),
            activity_id: activity.id.clone(),
            process_instance_id: instance_id.to_string(),
            created_at: ctx.now(),
        };
        ctx.instance_mut(instance_id)?
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    let continuing = if leaf_scope {
        let parent_id = execution
            .parent_id
            .clone()
            .ok_or_else(|| EngineError::invalid_state(execution_id, "scope execution without parent"))?;
        let instance = ctx.instance_mut(instance_id)?;
        let owned: Vec<String> = instance.subscriptions_of(execution_id);
        for id in owned {
            let is_compensation = instance
                .subscriptions
                .get(&id)
                .is_some_and(|s| matches!(s.kind, SubscriptionKind::Compensate { .. }));
            if is_compensation {
                if let Some(sub) = instance.subscriptions.get_mut(&id) {
                    sub.execution_id = owner.clone();
                }
            } else {
                instance.subscriptions.remove(&id);
            }
        }
        for id in instance.jobs_of(execution_id) {
            instance.jobs.remove(&id);
        }
        position_at(ctx, instance_id, &parent_id, &activity_id)?;
        ctx.detach_execution(instance_id, execution_id)?;
        parent_id
    } else {
        ctx.instance_mut(instance_id)?
            .tree
            .require_mut(execution_id)?
            .activity_instance_id = None;
        execution_id.to_string()
    };

    take_outgoing(ctx, instance_id, &continuing, &definition, &activity)
}

fn select_outgoing(
    ctx: &CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> Result<Vec<String>> {
    let outgoing = definition.outgoing_transitions(&activity.id);
    if outgoing.is_empty() {
        return Ok(Vec::new());
    }
    if activity.kind == ActivityKind::ParallelGateway {
        return Ok(outgoing.iter().map(|t| t.id.clone()).collect());
    }

    let visible = variables::visible(&ctx.instance(instance_id)?.tree, execution_id);
    let evaluator = ctx.services().conditions.as_ref();
    let mut selected = Vec::new();
    for transition in &outgoing {
        if activity.default_flow.as_deref() == Some(transition.id.as_str()) {
            continue;
        }
        let taken = match &transition.condition {
            Some(condition) => evaluate_condition(condition, &visible, evaluator)?,
            None => true,
        };
        if taken {
            selected.push(transition.id.clone());
            if activity.kind == ActivityKind::ExclusiveGateway {
                break;
            }
        }
    }
    if selected.is_empty() {
        if let Some(default_flow) = &activity.default_flow {
            selected.push(default_flow.clone());
        } else if activity.kind == ActivityKind::ExclusiveGateway {
            return Err(EngineError::process_engine(format!(
                "No outgoing sequence flow for the element with id '{}' could be selected for continuing the process",
                activity.id
            )));
        }
    }
    Ok(selected)
}

fn take_outgoing(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> Result<()> {
    let mut transitions = select_outgoing(ctx, instance_id, execution_id, definition, activity)?.into_iter();
    let Some(first) = transitions.next() else {
        return end_branch(ctx, instance_id, execution_id, Some(activity.id.clone()));
    };
    let rest: Vec<String> = transitions.collect();
    if rest.is_empty() {
        schedule_take(ctx, instance_id, execution_id, &first);
        return Ok(());
    }

    let execution = ctx.instance(instance_id)?.tree.require(execution_id)?.clone();
    let fork_point = if execution.is_concurrent {
        execution
            .parent_id
            .clone()
            .ok_or_else(|| EngineError::invalid_state(execution_id, "concurrent execution without parent"))?
    } else {
        execution_id.to_string()
    };

    let mut first_execution = execution_id.to_string();
    let mut branches = Vec::with_capacity(rest.len());
    for transition in rest {
        let (child, moved_to) = ctx.fork(instance_id, &fork_point)?;
        if let Some(moved_to) = moved_to {
            if first_execution == fork_point {
                first_execution = moved_to;
            }
        }
        position_at(ctx, instance_id, &child, &activity.id)?;
        branches.push((child, transition));
    }
    schedule_take(ctx, instance_id, &first_execution, &first);
    for (child, transition) in branches {
        schedule_take(ctx, instance_id, &child, &transition);
    }
    Ok(())
}

fn take_transition(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    transition_id: &str,
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let transition = definition.require_transition(transition_id)?.clone();
    ctx.fire_listeners(
        instance_id,
        execution_id,
        transition.listeners.clone(),
        ListenerEvent::Take,
    )?;
    position_at(ctx, instance_id, execution_id, &transition.target)?;
    schedule_start(ctx, instance_id, execution_id, &transition.target, false);
    Ok(())
}

/// The branch of `execution_id` has no outgoing flow left.
fn end_branch(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    ended_at: Option<String>,
) -> Result<()> {
    let execution = ctx.instance(instance_id)?.tree.require(execution_id)?.clone();
    if execution.is_concurrent {
        let removal = ctx.detach_execution(instance_id, execution_id)?;
        if let Some(parent_id) = removal.parent_id {
            let parent = ctx.instance(instance_id)?.tree.require(&parent_id)?;
            if parent.children.is_empty() && parent.activity_id.is_none() {
                return complete_scope(ctx, instance_id, &parent_id, ended_at);
            }
        }
        Ok(())
    } else {
        ctx.instance_mut(instance_id)?
            .tree
            .set_position(execution_id, None, None)?;
        complete_scope(ctx, instance_id, execution_id, ended_at)
    }
}

/// All branches of a scope ended: leave the scope activity, or complete the
/// instance when the scope is the process level.
pub(crate) fn complete_scope(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    scope_execution_id: &str,
    ended_at: Option<String>,
) -> Result<()> {
    let scope = ctx.instance(instance_id)?.tree.require(scope_execution_id)?.clone();
    if scope.is_root() {
        return complete_instance(ctx, instance_id, ended_at);
    }
    ctx.instance_mut(instance_id)?.tree.set_position(
        scope_execution_id,
        scope.scope_activity_id.clone(),
        scope.scope_instance_id.clone(),
    )?;
    set_active(ctx, instance_id, scope_execution_id, true)?;
    schedule_leave(ctx, instance_id, scope_execution_id);
    Ok(())
}

fn complete_instance(ctx: &mut CommandContext<'_>, instance_id: &str, ended_at: Option<String>) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let listeners = definition
        .listeners_for(ListenerEvent::End)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, instance_id, listeners, ListenerEvent::End)?;

    let ended = end_instance(ctx, instance_id, ProcessInstanceState::Completed, ended_at, None)?;
    info!(process_instance_id = %instance_id, "Process instance completed");
    if let (Some(super_instance), Some(super_execution)) =
        (ended.super_process_instance_id, ended.super_execution_id)
    {
        resume_super_execution(ctx, &super_instance, &super_execution, instance_id)?;
    }
    Ok(())
}

/// Continue the execution waiting at a call activity whose sub instance ended.
pub(crate) fn resume_super_execution(
    ctx: &mut CommandContext<'_>,
    super_instance_id: &str,
    super_execution_id: &str,
    sub_instance_id: &str,
) -> Result<()> {
    if !ctx.is_live(super_instance_id)
        || !ctx
            .instance(super_instance_id)?
            .tree
            .contains(super_execution_id)
    {
        return Ok(());
    }
    let definition = ctx.definition_of(super_instance_id)?;
    let activity_id = ctx
        .instance(super_instance_id)?
        .tree
        .require(super_execution_id)?
        .activity_id
        .clone()
        .unwrap_or_default();
    let propagate = matches!(
        definition.activity(&activity_id).map(|a| &a.kind),
        Some(ActivityKind::CallActivity {
            propagate_variables: true,
            ..
        })
    );
    if propagate {
        let outputs = ctx
            .finished()
            .get(sub_instance_id)
            .map(|i| i.tree.root().variables.clone())
            .unwrap_or_default();
        ctx.set_variables(super_instance_id, super_execution_id, &outputs, false, false)?;
    }
    schedule_leave(ctx, super_instance_id, super_execution_id);
    Ok(())
}

/// Calling side of an instance that was just ended.
#[derive(Debug, Clone, Default)]
pub(crate) struct EndedInstance {
    pub super_process_instance_id: Option<String>,
    pub super_execution_id: Option<String>,
}

/// Remove everything left on `instance_id`, end its root and record the end.
pub(crate) fn end_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    state: ProcessInstanceState,
    end_activity_id: Option<String>,
    delete_reason: Option<String>,
) -> Result<EndedInstance> {
    let now = ctx.now();
    let instance = ctx.instance_mut(instance_id)?;
    instance.tasks.clear();
    instance.subscriptions.clear();
    instance.jobs.clear();
    let incidents: Vec<String> = instance.incidents.keys().cloned().collect();
    instance.incidents.clear();
    let ended = EndedInstance {
        super_process_instance_id: instance.super_process_instance_id.clone(),
        super_execution_id: instance.super_execution_id.clone(),
    };
    let root = instance.tree.root_id().to_string();
    instance.tree.remove_execution(&root)?;

    for id in incidents {
        ctx.record(HistoryEvent::IncidentEnded {
            id,
            end_time: now,
            state: IncidentState::Deleted,
        });
    }
    ctx.record(HistoryEvent::ProcessInstanceEnded {
        process_instance_id: instance_id.to_string(),
        end_time: now,
        state,
        end_activity_id,
        delete_reason,
    });
    ctx.retire_instance(instance_id)?;
    Ok(ended)
}

/// Fire a message subscription.
pub(crate) fn trigger_subscription(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    subscription_id: &str,
) -> Result<()> {
    let subscription = ctx
        .instance(instance_id)?
        .subscriptions
        .get(subscription_id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("Event subscription", subscription_id))?;
    trigger_event(ctx, instance_id, &subscription.execution_id, &subscription.activity_id, |i| {
        i.subscriptions.remove(subscription_id);
    })
}

/// Run a due instance job: an async continuation or a timer.
pub(crate) fn execute_job(ctx: &mut CommandContext<'_>, instance_id: &str, job_id: &str) -> Result<()> {
    let job = ctx
        .instance(instance_id)?
        .jobs
        .get(job_id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("Job", job_id))?;
    match &job.kind {
        JobKind::AsyncContinuation { activity_id } => {
            ctx.instance_mut(instance_id)?.jobs.remove(job_id);
            schedule_start(ctx, instance_id, &job.execution_id, activity_id, true);
            Ok(())
        }
        JobKind::Timer { activity_id } => {
            trigger_event(ctx, instance_id, &job.execution_id, activity_id, |i| {
                i.jobs.remove(job_id);
            })
        }
    }
}

fn trigger_event(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    event_activity_id: &str,
    consume: impl FnOnce(&mut ProcessInstance),
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let event = definition.require_activity(event_activity_id)?.clone();
    match &event.kind {
        ActivityKind::IntermediateCatchEvent { .. } => {
            consume(ctx.instance_mut(instance_id)?);
            schedule_leave(ctx, instance_id, execution_id);
        }
        ActivityKind::BoundaryEvent {
            cancel_activity: true,
            ..
        } => {
            let parent_id = ctx
                .instance(instance_id)?
                .tree
                .require(execution_id)?
                .parent_id
                .clone()
                .ok_or_else(|| EngineError::invalid_state(execution_id, "boundary event on the root execution"))?;
            consume(ctx.instance_mut(instance_id)?);
            position_at(ctx, instance_id, &parent_id, &event.id)?;
            let reason = format!("interrupted by boundary event '{}'", event.id);
            cancellation::remove_subtree(
                ctx,
                instance_id,
                execution_id,
                &reason,
                CancellationSource::Internal,
            )?;
            schedule_start(ctx, instance_id, &parent_id, &event.id, false);
        }
        ActivityKind::BoundaryEvent { trigger, .. } => {
            if matches!(trigger, EventTrigger::Timer { .. }) {
                consume(ctx.instance_mut(instance_id)?);
            }
            let scope = ctx
                .instance(instance_id)?
                .tree
                .flow_scope_execution(execution_id)?
                .id
                .clone();
            let (child, _) = ctx.fork(instance_id, &scope)?;
            position_at(ctx, instance_id, &child, &event.id)?;
            schedule_start(ctx, instance_id, &child, &event.id, false);
        }
        _ => {
            return Err(EngineError::invalid_state(
                event_activity_id,
                "activity is not a catching event",
            ));
        }
    }
    Ok(())
}

/// Complete a user task.
pub(crate) fn complete_task(ctx: &mut CommandContext<'_>, instance_id: &str, task_id: &str) -> Result<()> {
    let task = ctx
        .instance_mut(instance_id)?
        .tasks
        .remove(task_id)
        .ok_or_else(|| EngineError::not_found("Task", task_id))?;
    schedule_leave(ctx, instance_id, &task.execution_id);
    Ok(())
}
