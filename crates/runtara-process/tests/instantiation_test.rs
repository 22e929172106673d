// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for starting execution before activities, after activities and on
//! sequence flows.

mod common;

use common::*;
use serde_json::json;

use runtara_process::{
    ModificationInstruction, ProcessInstanceModification, ProcessInstanceState,
    StartProcessInstance, Variables,
};

#[tokio::test]
async fn test_start_before_activity_skips_earlier_activities() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());

    let started = ctx
        .engine
        .start_process_instance(
            StartProcessInstance::by_key("twoTasks")
                .business_key("order-42")
                .variable("amount", 10)
                .start_before_activity("userTask2"),
        )
        .await
        .expect("Failed to start");

    assert!(!started.ended);
    assert_eq!(started.business_key.as_deref(), Some("order-42"));
    assert_eq!(started.variables.get("amount"), Some(&json!(10)));

    let tree = ctx.tree(&started.process_instance_id).await;
    assert!(tree.activity_instances_for("userTask1").is_empty());
    assert_eq!(tree.activity_instances_for("userTask2").len(), 1);

    let historic = ctx.historic(&started.process_instance_id).await;
    assert_eq!(historic.start_activity_id.as_deref(), Some("userTask2"));
    assert_eq!(historic.state, ProcessInstanceState::Active);
}

#[tokio::test]
async fn test_start_before_end_event_ends_instance() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());

    let started = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("twoTasks").start_before_activity("end"))
        .await
        .expect("Failed to start");

    assert!(started.ended);
    assert!(!ctx.is_running(&started.process_instance_id).await);
    let historic = ctx.historic(&started.process_instance_id).await;
    assert!(historic.end_time.is_some());
    assert!(historic.state.is_finished());
}

#[tokio::test]
async fn test_start_before_end_event_keeps_other_branches() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;

    ctx.engine
        .modify(ProcessInstanceModification::new(&pi).start_before_activity("end"))
        .await
        .expect("Failed to modify");

    assert!(ctx.is_running(&pi).await);
    assert_eq!(ctx.activity_instance_ids(&pi, "userTask1").await.len(), 1);
    assert!(ctx.historic(&pi).await.end_time.is_none());
}

#[tokio::test]
async fn test_start_after_activity_takes_outgoing_flow() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());

    let started = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("twoTasks").start_after_activity("userTask1"))
        .await
        .expect("Failed to start");

    let tree = ctx.tree(&started.process_instance_id).await;
    assert!(tree.activity_instances_for("userTask1").is_empty());
    assert_eq!(tree.activity_instances_for("userTask2").len(), 1);

    // Only a single start-before instruction defines a start activity.
    let historic = ctx.historic(&started.process_instance_id).await;
    assert_eq!(historic.start_activity_id, None);
}

#[tokio::test]
async fn test_invalid_targets_are_rejected() {
    let ctx = TestContext::new();
    ctx.deploy(exclusive_gateway_process());

    let err = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("exclusiveGateway").start_after_activity("gateway"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TARGET");

    let err = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("exclusiveGateway").start_before_activity("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TARGET");

    let err = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("exclusiveGateway").start_transition("flow99"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TARGET");

    // Nothing was committed for the failed starts.
    let definition = ctx.engine.latest_definition("exclusiveGateway").unwrap();
    assert!(ctx.instances_of(definition.id()).await.is_empty());
}

#[tokio::test]
async fn test_start_transition_positions_after_gateway() {
    let ctx = TestContext::new();
    ctx.deploy(exclusive_gateway_process());
    let pi = ctx.start("exclusiveGateway").await;
    assert_eq!(ctx.activity_instance_ids(&pi, "task1").await.len(), 1);

    ctx.engine
        .modify(
            ProcessInstanceModification::new(&pi).instruction(
                ModificationInstruction::start_transition("flow2")
                    .variable("processVar", "p")
                    .local_variable("localVar", "l"),
            ),
        )
        .await
        .expect("Failed to modify");

    let tree = ctx.tree(&pi).await;
    assert_eq!(tree.activity_instances_for("task1").len(), 1);
    let task2 = tree.activity_instances_for("task2");
    assert_eq!(task2.len(), 1);
    assert_eq!(task2[0].parent_activity_instance_id.as_deref(), Some(pi.as_str()));

    // The process variable is visible at process level.
    assert_eq!(ctx.variable(&pi, "processVar").await, Some(json!("p")));

    // The gateway was not executed again.
    let gateways = ctx
        .engine
        .historic_activity_instances(&pi)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.activity_id == "gateway")
        .count();
    assert_eq!(gateways, 1);

    let details = ctx.engine.historic_variable_details(&pi).await.unwrap();
    let process_detail = details.iter().find(|d| d.name == "processVar").unwrap();
    assert_eq!(process_detail.execution_id, pi);
    assert_eq!(process_detail.activity_instance_id, None);
    let local_detail = details.iter().find(|d| d.name == "localVar").unwrap();
    assert_ne!(local_detail.execution_id, pi);
    assert_eq!(local_detail.activity_instance_id, None);
}

#[tokio::test]
async fn test_start_before_scope_sets_local_variables_on_scope() {
    let ctx = TestContext::new();
    ctx.deploy(sub_process_process());
    let pi = ctx.start("subProcess").await;

    // The root is idle after the first step and carries the new branch.
    ctx.engine
        .modify(
            ProcessInstanceModification::new(&pi)
                .cancel_all_for_activity("subProcess")
                .instruction(
                    ModificationInstruction::start_before("subProcess")
                        .variable("processVar", "p")
                        .local_variable("localVar", "l"),
                ),
        )
        .await
        .expect("Failed to modify");

    let sub = ctx.activity_instance_ids(&pi, "subProcess").await;
    assert_eq!(sub.len(), 1);
    assert_eq!(ctx.variable(&pi, "processVar").await, Some(json!("p")));
    assert_eq!(ctx.variable(&pi, "localVar").await, None);

    let historic = ctx.engine.historic_variable_instances(&pi).await.unwrap();
    let local = historic.iter().find(|v| v.name == "localVar").unwrap();
    assert!(!local.process_scoped);
    assert_ne!(local.execution_id, pi);
    assert_eq!(local.activity_instance_id.as_deref(), Some(sub[0].as_str()));
    let details = ctx.engine.historic_variable_details(&pi).await.unwrap();
    let local_detail = details.iter().find(|d| d.name == "localVar").unwrap();
    assert_eq!(local_detail.activity_instance_id, None);

    // The variable ends with its scope.
    let task = ctx.task_id(&pi, "innerTask").await;
    ctx.engine
        .complete_task(&task, Variables::new())
        .await
        .expect("Failed to complete task");
    assert_eq!(ctx.activity_instance_ids(&pi, "afterSub").await.len(), 1);
    assert_eq!(ctx.variable(&pi, "localVar").await, None);
}

#[tokio::test]
async fn test_start_before_nested_activity_reuses_single_scope() {
    let ctx = TestContext::new();
    ctx.deploy(sub_process_process());
    let pi = ctx.start("subProcess").await;

    ctx.engine
        .modify(ProcessInstanceModification::new(&pi).start_before_activity("innerTask"))
        .await
        .expect("Failed to modify");

    let tree = ctx.tree(&pi).await;
    let sub = tree.activity_instances_for("subProcess");
    assert_eq!(sub.len(), 1);
    assert_eq!(sub[0].child_activity_instances.len(), 2);
}

#[tokio::test]
async fn test_ancestor_selects_scope_instance() {
    let ctx = TestContext::new();
    ctx.deploy(sub_process_process());
    let pi = ctx.start("subProcess").await;

    // Starting at process level creates a second sub process instance.
    ctx.engine
        .modify(
            ProcessInstanceModification::new(&pi)
                .instruction(ModificationInstruction::start_before("innerTask").ancestor(&pi)),
        )
        .await
        .expect("Failed to modify");
    let sub_ids = ctx.activity_instance_ids(&pi, "subProcess").await;
    assert_eq!(sub_ids.len(), 2);

    // Two candidate scopes: the ancestor is now required.
    let err = ctx
        .engine
        .modify(ProcessInstanceModification::new(&pi).start_before_activity("innerTask"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_REQUEST");

    ctx.engine
        .modify(
            ProcessInstanceModification::new(&pi)
                .instruction(ModificationInstruction::start_before("innerTask").ancestor(&sub_ids[1])),
        )
        .await
        .expect("Failed to modify");
    let tree = ctx.tree(&pi).await;
    let second = tree.find(&sub_ids[1]).unwrap();
    assert_eq!(second.child_activity_instances.len(), 2);

    // An ancestor that does not enclose the target is rejected.
    let task = ctx.activity_instance_ids(&pi, "innerTask").await;
    let err = ctx
        .engine
        .modify(
            ProcessInstanceModification::new(&pi)
                .instruction(ModificationInstruction::start_before("afterSub").ancestor(&task[0])),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_REQUEST");
}

#[tokio::test]
async fn test_projection_is_stable_without_changes() {
    let ctx = TestContext::new();
    ctx.deploy(parallel_process());
    let pi = ctx.start("parallel").await;

    let first = ctx.tree(&pi).await;
    let second = ctx.tree(&pi).await;
    assert_eq!(first, second);
    assert_eq!(first.child_activity_instances.len(), 2);
}
