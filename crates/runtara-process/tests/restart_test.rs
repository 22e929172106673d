// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart of finished process instances.

mod common;

use common::*;
use serde_json::json;

use runtara_process::history::operation_type;
use runtara_process::persistence::HistoricProcessInstanceQuery;
use runtara_process::{
    BatchType, CancelTarget, RestartProcessInstances, StartProcessInstance, Variables,
};

/// Start an instance with `amount = 1`, change it to 2 and delete the instance.
async fn finished_instance(ctx: &TestContext) -> String {
    let pi = ctx
        .engine
        .start_process_instance(
            StartProcessInstance::by_key("twoTasks")
                .business_key("order-7")
                .variable("amount", 1),
        )
        .await
        .expect("Failed to start")
        .process_instance_id;
    let mut update = Variables::new();
    update.insert("amount".to_string(), json!(2));
    ctx.engine.set_variables(&pi, update).await.unwrap();
    ctx.engine
        .cancel(CancelTarget::process_instance(&pi), "test", true)
        .await
        .expect("Failed to delete");
    pi
}

#[tokio::test]
async fn test_restart_creates_new_instances() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let first = finished_instance(&ctx).await;
    let second = finished_instance(&ctx).await;

    let report = ctx
        .engine
        .restart(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([first.clone(), second.clone()])
                .start_after_activity("userTask1"),
        )
        .await
        .expect("Failed to restart");

    assert!(report.failures.is_empty());
    assert_eq!(report.restarted.len(), 2);
    for restarted in &report.restarted {
        let id = &restarted.process_instance_id;
        assert_ne!(id, &first);
        assert_ne!(id, &second);
        assert!(ctx.activity_instance_ids(id, "userTask1").await.is_empty());
        assert_eq!(ctx.activity_instance_ids(id, "userTask2").await.len(), 1);
        let historic = ctx.historic(id).await;
        assert_eq!(
            historic.restarted_process_instance_id.as_deref(),
            Some(restarted.restarted_from.as_str())
        );
        assert_eq!(historic.business_key.as_deref(), Some("order-7"));
    }

    let from_first = ctx
        .engine
        .historic_process_instances(&HistoricProcessInstanceQuery {
            restarted_process_instance_id: Some(first.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(from_first.len(), 1);
}

#[tokio::test]
async fn test_restart_restores_latest_variables() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let pi = finished_instance(&ctx).await;

    let report = ctx
        .engine
        .restart(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([pi])
                .start_before_activity("userTask1"),
        )
        .await
        .unwrap();
    let restarted = &report.restarted[0].process_instance_id;
    assert_eq!(ctx.variable(restarted, "amount").await, Some(json!(2)));
}

#[tokio::test]
async fn test_restart_with_initial_variables() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let pi = finished_instance(&ctx).await;

    let report = ctx
        .engine
        .restart(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([pi])
                .start_before_activity("userTask1")
                .initial_set_of_variables(),
        )
        .await
        .unwrap();
    let restarted = &report.restarted[0].process_instance_id;
    assert_eq!(ctx.variable(restarted, "amount").await, Some(json!(1)));
}

#[tokio::test]
async fn test_restart_without_business_key() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let pi = finished_instance(&ctx).await;

    let report = ctx
        .engine
        .restart(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([pi])
                .start_before_activity("userTask1")
                .without_business_key(),
        )
        .await
        .unwrap();
    let restarted = &report.restarted[0].process_instance_id;
    assert_eq!(ctx.historic(restarted).await.business_key, None);
}

#[tokio::test]
async fn test_restart_rejects_running_instance() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let running = ctx.start("twoTasks").await;

    let err = ctx
        .engine
        .restart(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([running])
                .start_before_activity("userTask1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_REQUEST");
    assert!(ctx.operation_log(operation_type::RESTART_PROCESS_INSTANCE).await.is_empty());
}

#[tokio::test]
async fn test_restart_requires_instructions() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let pi = finished_instance(&ctx).await;

    let err = ctx
        .engine
        .restart(RestartProcessInstances::new(&definition_id).process_instance_ids([pi]))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_REQUEST");
}

#[tokio::test]
async fn test_restart_async() {
    let ctx = TestContext::new();
    let definition_id = ctx.deploy(two_tasks_process());
    let first = finished_instance(&ctx).await;
    let second = finished_instance(&ctx).await;

    let batch = ctx
        .engine
        .restart_async(
            RestartProcessInstances::new(&definition_id)
                .process_instance_ids([first.clone(), second.clone()])
                .start_before_activity("userTask2")
                .annotation("replay"),
        )
        .await
        .expect("Failed to create batch");
    assert_eq!(batch.batch_type, BatchType::InstanceRestart);

    let entries = ctx.operation_log(operation_type::RESTART_PROCESS_INSTANCE).await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.operation_id == batch.operation_id));
    assert!(entries.iter().all(|e| e.batch_id.as_deref() == Some(batch.id.as_str())));
    assert!(entries.iter().all(|e| e.annotation.as_deref() == Some("replay")));
    let is_async = entries.iter().find(|e| e.property.as_deref() == Some("async")).unwrap();
    assert_eq!(is_async.new_value.as_deref(), Some("true"));

    ctx.engine.run_batch_jobs().await.expect("Failed to run batch jobs");

    let restarted = ctx
        .engine
        .historic_process_instances(&HistoricProcessInstanceQuery {
            process_definition_id: Some(definition_id.clone()),
            finished: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(restarted.len(), 2);
    for historic in &restarted {
        assert_eq!(historic.start_activity_id.as_deref(), Some("userTask2"));
        assert_eq!(ctx.activity_instance_ids(&historic.id, "userTask2").await.len(), 1);
    }
    assert!(ctx.engine.batch(&batch.id).await.unwrap().is_completed());
}
