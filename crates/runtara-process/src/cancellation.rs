// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation.
//!
//! Removes execution subtrees for activity instances, transition instances or
//! whole process instances and applies every side effect of the removal: end
//! listeners, cancelled activity history, tasks, subscriptions, jobs, incidents,
//! armed compensation and called sub instances.
//!
//! The terminated state of ended instances follows the cancellation source:
//!
//! - [`CancellationSource::External`] ends every instance of the call hierarchy
//!   as `ExternallyTerminated`, upward to the root and down into called instances.
//! - [`CancellationSource::Internal`] only marks an instance
//!   `InternallyTerminated` when the cancellation empties it. A sub instance
//!   emptied that way hands control back to its calling execution, which leaves
//!   the call activity.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compensation::{self, PendingCompensation};
use crate::context::CommandContext;
use crate::definition::ListenerEvent;
use crate::error::Result;
use crate::execution::Removal;
use crate::history::{HistoryEvent, IncidentState, ProcessInstanceState};
use crate::incident::IncidentContext;
use crate::instance::SubscriptionKind;
use crate::operations;
use crate::projection;

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancellationSource {
    /// The process itself or an operator modification.
    Internal,
    /// An outside deletion request.
    External,
}

impl CancellationSource {
    /// State of instances ended by this source.
    pub fn terminated_state(&self) -> ProcessInstanceState {
        match self {
            Self::Internal => ProcessInstanceState::InternallyTerminated,
            Self::External => ProcessInstanceState::ExternallyTerminated,
        }
    }

    /// `External` when `external` is set.
    pub fn from_external(external: bool) -> Self {
        if external { Self::External } else { Self::Internal }
    }
}

/// End the activity an execution is positioned at and drop what it owns.
fn release_position(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    reason: &str,
    source: CancellationSource,
    drop_compensation: bool,
) -> Result<()> {
    let definition = ctx.definition_of(instance_id)?;
    let execution = ctx.instance(instance_id)?.tree.require(execution_id)?.clone();

    if let (Some(activity_id), Some(activity_instance_id)) =
        (&execution.activity_id, &execution.activity_instance_id)
    {
        if !execution.is_leaf_scope() {
            let listeners = definition
                .activity(activity_id)
                .map(|a| a.listeners_for(ListenerEvent::End).map(str::to_string).collect())
                .unwrap_or_default();
            ctx.fire_listeners(instance_id, execution_id, listeners, ListenerEvent::End)?;
            ctx.record(HistoryEvent::ActivityInstanceEnded {
                id: activity_instance_id.clone(),
                end_time: ctx.now(),
                canceled: true,
            });
        }
    }

    let now = ctx.now();
    let incident_handlers = &ctx.services().incidents;
    let instance = ctx.instance_mut(instance_id)?;
    for id in instance.tasks_of(execution_id) {
        instance.tasks.remove(&id);
    }
    for id in instance.subscriptions_of(execution_id) {
        let is_compensation = instance
            .subscriptions
            .get(&id)
            .is_some_and(|s| matches!(s.kind, SubscriptionKind::Compensate { .. }));
        if drop_compensation || !is_compensation {
            instance.subscriptions.remove(&id);
        }
    }
    for id in instance.jobs_of(execution_id) {
        instance.jobs.remove(&id);
    }
    let mut deleted = Vec::new();
    for id in instance.incidents_of(execution_id) {
        let Some(incident) = instance.incidents.get(&id).cloned() else {
            continue;
        };
        let context = IncidentContext {
            process_instance_id: instance_id.to_string(),
            execution_id: execution_id.to_string(),
            activity_id: incident.activity_id.clone(),
            configuration: incident.configuration.clone(),
        };
        deleted.extend(
            incident_handlers
                .handler(&incident.incident_type)
                .delete_incident(instance, &context),
        );
    }
    for incident in deleted {
        ctx.record(HistoryEvent::IncidentEnded {
            id: incident.id,
            end_time: now,
            state: IncidentState::Deleted,
        });
    }

    let called = ctx
        .hierarchy()
        .called_instance(instance_id, execution_id)
        .map(|i| i.id.clone());
    if let Some(called) = called {
        terminate_instance(ctx, &called, reason, source, None, false)?;
    }
    Ok(())
}

/// Apply removal side effects to one execution that is about to leave the tree.
fn release_execution(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    reason: &str,
    source: CancellationSource,
) -> Result<()> {
    release_position(ctx, instance_id, execution_id, reason, source, true)?;

    let definition = ctx.definition_of(instance_id)?;
    let execution = ctx.instance(instance_id)?.tree.require(execution_id)?.clone();
    if execution.is_scope && !execution.is_root() {
        if let Some(scope_activity_id) = &execution.scope_activity_id {
            let listeners = definition
                .activity(scope_activity_id)
                .map(|a| a.listeners_for(ListenerEvent::End).map(str::to_string).collect())
                .unwrap_or_default();
            ctx.fire_listeners(instance_id, execution_id, listeners, ListenerEvent::End)?;
        }
        if let Some(scope_instance_id) = &execution.scope_instance_id {
            ctx.record(HistoryEvent::ActivityInstanceEnded {
                id: scope_instance_id.clone(),
                end_time: ctx.now(),
                canceled: true,
            });
        }
    }
    Ok(())
}

/// Hand armed compensation below `execution_id` to the compensation hook.
fn dispatch_compensation(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    subtree: &[String],
    reason: &str,
) -> Result<()> {
    let instance = ctx.instance(instance_id)?;
    let armed = compensation::collect_armed(instance, subtree);
    if armed.is_empty() {
        return Ok(());
    }
    let scope = instance.tree.require(execution_id)?;
    let scope = if scope.is_scope {
        scope
    } else {
        instance.tree.flow_scope_execution(execution_id)?
    };
    let pending = PendingCompensation {
        process_instance_id: instance_id.to_string(),
        scope_activity_id: scope.scope_activity_id.clone(),
        scope_instance_id: scope.scope_instance_id.clone(),
        reason: reason.to_string(),
        subscriptions: armed,
    };
    info!(
        process_instance_id = %instance_id,
        scope_instance_id = ?pending.scope_instance_id,
        subscriptions = pending.subscriptions.len(),
        "Dispatching armed compensation of removed scope"
    );
    let instance = ctx.instance_mut(instance_id)?;
    for subscription in &pending.subscriptions {
        instance.subscriptions.remove(&subscription.id);
    }
    ctx.services().compensation.compensate(&pending);
    Ok(())
}

/// Remove `execution_id` and its descendants with all side effects.
pub(crate) fn remove_subtree(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    reason: &str,
    source: CancellationSource,
) -> Result<Removal> {
    let subtree = ctx.instance(instance_id)?.tree.subtree_post_order(execution_id);
    ctx.check_preemption(instance_id, &subtree)?;
    dispatch_compensation(ctx, instance_id, execution_id, &subtree, reason)?;
    for id in &subtree {
        release_execution(ctx, instance_id, id, reason, source)?;
    }
    let removal = ctx.detach_execution(instance_id, execution_id)?;
    debug!(
        process_instance_id = %instance_id,
        execution_id = %execution_id,
        removed = removal.removed.len(),
        "Execution subtree removed"
    );
    Ok(removal)
}

/// Cancel everything below a scope execution and its own position, keeping the
/// scope execution itself.
pub(crate) fn cancel_scope_content(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    scope_execution_id: &str,
    reason: &str,
    source: CancellationSource,
) -> Result<()> {
    while let Some(child) = ctx
        .instance(instance_id)?
        .tree
        .require(scope_execution_id)?
        .children
        .first()
        .cloned()
    {
        remove_subtree(ctx, instance_id, &child, reason, source)?;
    }
    clear_position(ctx, instance_id, scope_execution_id, reason, source)
}

fn clear_position(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    execution_id: &str,
    reason: &str,
    source: CancellationSource,
) -> Result<()> {
    let positioned = ctx
        .instance(instance_id)?
        .tree
        .require(execution_id)?
        .activity_id
        .is_some();
    if !positioned {
        return Ok(());
    }
    ctx.check_preemption(instance_id, &[execution_id.to_string()])?;
    release_position(ctx, instance_id, execution_id, reason, source, false)?;
    ctx.instance_mut(instance_id)?
        .tree
        .set_position(execution_id, None, None)
}

/// End a whole process instance. Called sub instances end with it.
///
/// With `resume_super` an internally terminated sub instance lets its calling
/// execution leave the call activity.
pub(crate) fn terminate_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    reason: &str,
    source: CancellationSource,
    end_activity_id: Option<String>,
    resume_super: bool,
) -> Result<()> {
    if !ctx.is_live(instance_id) {
        return Ok(());
    }
    let subtree = ctx.instance(instance_id)?.tree.subtree_post_order(instance_id);
    ctx.check_preemption(instance_id, &subtree)?;
    for id in &subtree {
        release_execution(ctx, instance_id, id, reason, source)?;
    }

    let definition = ctx.definition_of(instance_id)?;
    let listeners = definition
        .listeners_for(ListenerEvent::End)
        .map(str::to_string)
        .collect();
    ctx.fire_listeners(instance_id, instance_id, listeners, ListenerEvent::End)?;

    let state = source.terminated_state();
    let ended = operations::end_instance(
        ctx,
        instance_id,
        state,
        end_activity_id,
        Some(reason.to_string()),
    )?;
    info!(
        process_instance_id = %instance_id,
        state = state.as_str(),
        reason = %reason,
        "Process instance terminated"
    );

    if resume_super && source == CancellationSource::Internal {
        if let (Some(super_instance), Some(super_execution)) =
            (ended.super_process_instance_id, ended.super_execution_id)
        {
            operations::resume_super_execution(ctx, &super_instance, &super_execution, instance_id)?;
        }
    }
    Ok(())
}

/// Delete a process instance.
///
/// An external deletion ends the whole call hierarchy from its root; an internal
/// one ends the instance and resumes its caller.
pub fn cancel_process_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    reason: &str,
    source: CancellationSource,
) -> Result<()> {
    ctx.instance(instance_id)?;
    match source {
        CancellationSource::External => {
            let top = ctx
                .hierarchy()
                .super_instances(instance_id)
                .last()
                .cloned()
                .unwrap_or_else(|| instance_id.to_string());
            terminate_instance(ctx, &top, reason, source, None, false)
        }
        CancellationSource::Internal => terminate_instance(ctx, instance_id, reason, source, None, true),
    }
}

/// Cancel emptied scopes upward from `start`.
fn propagate_empty_scope(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    start: Option<String>,
    reason: &str,
    source: CancellationSource,
    preserve_root: bool,
) -> Result<()> {
    let mut current = start;
    while let Some(execution_id) = current.take() {
        if !ctx.is_live(instance_id) {
            return Ok(());
        }
        let Some(execution) = ctx.instance(instance_id)?.tree.get(&execution_id).cloned() else {
            return Ok(());
        };
        if !execution.children.is_empty() || execution.activity_id.is_some() || execution.is_concurrent {
            return Ok(());
        }
        if execution.is_root() {
            if preserve_root {
                return Ok(());
            }
            return cancel_process_instance(ctx, instance_id, reason, source);
        }
        debug!(
            process_instance_id = %instance_id,
            execution_id = %execution_id,
            "Cancelling emptied scope"
        );
        current = remove_subtree(ctx, instance_id, &execution_id, reason, source)?.parent_id;
    }
    Ok(())
}

/// Cancel an activity instance (and everything inside it).
///
/// With `preserve_root` an emptied process instance is left empty for the caller
/// to end; otherwise it ends right away.
pub fn cancel_activity_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    activity_instance_id: &str,
    reason: &str,
    source: CancellationSource,
    preserve_root: bool,
) -> Result<()> {
    projection::project(ctx.instance(instance_id)?).require(activity_instance_id)?;
    if activity_instance_id == instance_id {
        if preserve_root {
            return cancel_scope_content(ctx, instance_id, instance_id, reason, source);
        }
        return cancel_process_instance(ctx, instance_id, reason, source);
    }

    let mut previous: Option<String> = None;
    loop {
        if !ctx.is_live(instance_id) {
            return Ok(());
        }
        let instance = ctx.instance(instance_id)?;
        let projected = projection::project(instance);
        let Some(node) = projected.find(activity_instance_id) else {
            return Ok(());
        };
        let scope_execution = instance
            .tree
            .iter()
            .into_iter()
            .find(|e| e.is_scope && e.scope_instance_id.as_deref() == Some(activity_instance_id))
            .map(|e| e.id.clone());
        let target = match scope_execution {
            Some(id) => id,
            None => match node
                .execution_ids
                .iter()
                .find(|id| instance.tree.get(id).is_some_and(|e| e.activity_instance_id.as_deref() == Some(activity_instance_id)))
            {
                Some(id) => id.clone(),
                None => return Ok(()),
            },
        };
        if previous.as_deref() == Some(target.as_str()) {
            warn!(
                process_instance_id = %instance_id,
                activity_instance_id = %activity_instance_id,
                "Activity instance did not disappear after cancellation"
            );
            return Ok(());
        }
        previous = Some(target.clone());

        let execution = instance.tree.require(&target)?.clone();
        let next = if execution.is_concurrent || (execution.is_scope && execution.scope_instance_id.as_deref() == Some(activity_instance_id)) {
            remove_subtree(ctx, instance_id, &target, reason, source)?.parent_id
        } else {
            clear_position(ctx, instance_id, &target, reason, source)?;
            Some(target)
        };
        propagate_empty_scope(ctx, instance_id, next, reason, source, preserve_root)?;
    }
}

/// Cancel a transition instance; its pending job goes with it.
pub fn cancel_transition_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    transition_instance_id: &str,
    reason: &str,
    preserve_root: bool,
) -> Result<()> {
    let source = CancellationSource::Internal;
    let execution_id = projection::project(ctx.instance(instance_id)?)
        .require_transition(transition_instance_id)?
        .execution_id
        .clone();
    let execution = ctx.instance(instance_id)?.tree.require(&execution_id)?.clone();
    let next = if execution.is_concurrent {
        remove_subtree(ctx, instance_id, &execution_id, reason, source)?.parent_id
    } else {
        clear_position(ctx, instance_id, &execution_id, reason, source)?;
        Some(execution_id)
    };
    propagate_empty_scope(ctx, instance_id, next, reason, source, preserve_root)
}

/// Cancel every activity and transition instance of `activity_id`.
pub fn cancel_all_for_activity(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    activity_id: &str,
    reason: &str,
    preserve_root: bool,
) -> Result<()> {
    let source = CancellationSource::Internal;
    loop {
        if !ctx.is_live(instance_id) {
            return Ok(());
        }
        let projected = projection::project(ctx.instance(instance_id)?);
        if let Some(node) = projected.activity_instances_for(activity_id).first() {
            let id = node.id.clone();
            cancel_activity_instance(ctx, instance_id, &id, reason, source, preserve_root)?;
            if ctx.is_live(instance_id)
                && projection::project(ctx.instance(instance_id)?).find(&id).is_some()
            {
                return Ok(());
            }
            continue;
        }
        if let Some(transition) = projected.transition_instances_for(activity_id).first() {
            let id = transition.id.clone();
            cancel_transition_instance(ctx, instance_id, &id, reason, preserve_root)?;
            continue;
        }
        return Ok(());
    }
}

/// End an instance a modification left without any execution.
pub(crate) fn end_if_empty(ctx: &mut CommandContext<'_>, instance_id: &str, reason: &str) -> Result<()> {
    if ctx.is_live(instance_id) && ctx.instance(instance_id)?.tree.is_empty() {
        terminate_instance(ctx, instance_id, reason, CancellationSource::Internal, None, true)?;
    }
    Ok(())
}
