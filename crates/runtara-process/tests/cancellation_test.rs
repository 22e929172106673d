// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation tests: activity instances, whole instances and call hierarchies.

mod common;

use common::*;

use runtara_process::history::operation_type;
use runtara_process::persistence::ProcessInstanceQuery;
use runtara_process::{CancelTarget, ProcessInstanceState};

/// Deploy leaf <- middle <- top and start `top`. Returns (top, middle, leaf).
async fn start_call_hierarchy(ctx: &TestContext) -> (String, String, String) {
    ctx.deploy(one_task_process("leaf"));
    ctx.deploy(calling_process("middle", "leaf"));
    ctx.deploy(calling_process("top", "middle"));
    let top = ctx.start("top").await;
    let middle = called_instance(ctx, &top, &top).await;
    let leaf = called_instance(ctx, &top, &middle).await;
    (top, middle, leaf)
}

async fn called_instance(ctx: &TestContext, root: &str, caller: &str) -> String {
    ctx.engine
        .process_instances(&ProcessInstanceQuery {
            root_process_instance_id: Some(root.to_string()),
            ..Default::default()
        })
        .await
        .expect("Failed to query process instances")
        .into_iter()
        .find(|p| p.super_process_instance_id.as_deref() == Some(caller))
        .unwrap_or_else(|| panic!("no instance called by '{}'", caller))
        .id
}

#[tokio::test]
async fn test_cancel_one_parallel_branch() {
    let ctx = TestContext::new();
    ctx.deploy(parallel_process());
    let pi = ctx.start("parallel").await;
    let task1 = ctx.activity_instance_ids(&pi, "task1").await.remove(0);

    ctx.engine
        .cancel(CancelTarget::activity_instance(&pi, &task1), "no longer needed", false)
        .await
        .expect("Failed to cancel activity instance");

    let tree = ctx.tree(&pi).await;
    assert!(tree.find(&task1).is_none());
    assert_eq!(tree.activity_instances_for("task2").len(), 1);

    let historic = ctx
        .engine
        .historic_activity_instances(&pi)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.id == task1)
        .unwrap();
    assert!(historic.canceled);
    assert!(historic.end_time.is_some());
}

#[tokio::test]
async fn test_cancel_last_activity_ends_instance() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;
    let task = ctx.activity_instance_ids(&pi, "userTask1").await.remove(0);

    ctx.engine
        .cancel(CancelTarget::activity_instance(&pi, &task), "done", false)
        .await
        .expect("Failed to cancel activity instance");

    assert!(!ctx.is_running(&pi).await);
    let historic = ctx.historic(&pi).await;
    assert_eq!(historic.state, ProcessInstanceState::InternallyTerminated);
    assert_eq!(historic.delete_reason.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_cancel_unknown_activity_instance() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;

    let err = ctx
        .engine
        .cancel(CancelTarget::activity_instance(&pi, "userTask1:unknown"), "x", false)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(ctx.is_running(&pi).await);
}

#[tokio::test]
async fn test_call_hierarchy_shares_root_id() {
    let ctx = TestContext::new();
    let (top, middle, leaf) = start_call_hierarchy(&ctx).await;

    for id in [&top, &middle, &leaf] {
        let instance = ctx.engine.process_instance(id).await.unwrap();
        assert_eq!(instance.root_process_instance_id, top);
        assert_eq!(ctx.historic(id).await.root_process_instance_id, top);
    }
    assert_eq!(ctx.historic(&leaf).await.super_process_instance_id.as_deref(), Some(middle.as_str()));
}

#[tokio::test]
async fn test_external_deletion_ends_whole_hierarchy() {
    let ctx = TestContext::new();
    let (top, middle, leaf) = start_call_hierarchy(&ctx).await;

    ctx.engine
        .cancel(CancelTarget::process_instance(&leaf), "operator", true)
        .await
        .expect("Failed to delete process instance");

    for id in [&top, &middle, &leaf] {
        assert!(!ctx.is_running(id).await);
        assert_eq!(ctx.historic(id).await.state, ProcessInstanceState::ExternallyTerminated);
    }
}

#[tokio::test]
async fn test_internal_cancellation_resumes_caller() {
    let ctx = TestContext::new();
    let (top, middle, leaf) = start_call_hierarchy(&ctx).await;

    ctx.engine
        .cancel(CancelTarget::process_instance(&middle), "escalated", false)
        .await
        .expect("Failed to cancel process instance");

    assert_eq!(ctx.historic(&middle).await.state, ProcessInstanceState::InternallyTerminated);
    let leaf_state = ctx.historic(&leaf).await.state;
    assert!(leaf_state.is_finished());
    assert_ne!(leaf_state, ProcessInstanceState::ExternallyTerminated);

    assert!(ctx.is_running(&top).await);
    assert_eq!(ctx.activity_instance_ids(&top, "afterCall").await.len(), 1);
    assert!(ctx.activity_instance_ids(&top, "callActivity").await.is_empty());
}

#[tokio::test]
async fn test_external_activity_cancellation_ends_whole_hierarchy() {
    let ctx = TestContext::new();
    let (top, middle, leaf) = start_call_hierarchy(&ctx).await;
    let call = ctx.activity_instance_ids(&middle, "callActivity").await.remove(0);

    ctx.engine
        .cancel(CancelTarget::activity_instance(&middle, &call), "withdrawn", true)
        .await
        .expect("Failed to cancel activity instance");

    for id in [&top, &middle, &leaf] {
        assert!(!ctx.is_running(id).await);
        assert_eq!(ctx.historic(id).await.state, ProcessInstanceState::ExternallyTerminated);
    }
}

#[tokio::test]
async fn test_internal_activity_cancellation_stops_at_caller() {
    let ctx = TestContext::new();
    let (top, middle, leaf) = start_call_hierarchy(&ctx).await;
    let call = ctx.activity_instance_ids(&middle, "callActivity").await.remove(0);

    ctx.engine
        .cancel(CancelTarget::activity_instance(&middle, &call), "withdrawn", false)
        .await
        .expect("Failed to cancel activity instance");

    for id in [&middle, &leaf] {
        assert!(!ctx.is_running(id).await);
        assert_eq!(ctx.historic(id).await.state, ProcessInstanceState::InternallyTerminated);
    }
    assert!(ctx.is_running(&top).await);
    assert_eq!(ctx.historic(&top).await.state, ProcessInstanceState::Active);
    assert_eq!(ctx.activity_instance_ids(&top, "afterCall").await.len(), 1);
}

#[tokio::test]
async fn test_delete_suspended_instance() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;
    ctx.engine
        .suspend_process_instances(&[pi.clone()])
        .await
        .expect("Failed to suspend");

    let task = ctx.activity_instance_ids(&pi, "userTask1").await.remove(0);
    let err = ctx
        .engine
        .cancel(CancelTarget::activity_instance(&pi, &task), "x", false)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "SUSPENDED");

    ctx.engine
        .cancel(CancelTarget::process_instance(&pi), "cleanup", true)
        .await
        .expect("Deleting a suspended instance is allowed");
    assert!(!ctx.is_running(&pi).await);
    assert_eq!(ctx.historic(&pi).await.state, ProcessInstanceState::ExternallyTerminated);
}

#[tokio::test]
async fn test_delete_is_logged() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;

    ctx.engine
        .cancel(CancelTarget::process_instance(&pi), "obsolete order", true)
        .await
        .expect("Failed to delete");

    let entries = ctx.operation_log(operation_type::DELETE).await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.process_instance_id.as_deref(), Some(pi.as_str()));
    assert_eq!(entry.process_definition_key.as_deref(), Some("twoTasks"));
    assert_eq!(entry.property.as_deref(), Some("deleteReason"));
    assert_eq!(entry.new_value.as_deref(), Some("obsolete order"));
}
