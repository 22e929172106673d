// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end runs of process instances through the engine facade.

mod common;

use common::*;
use serde_json::json;

use runtara_process::persistence::ProcessInstanceQuery;
use runtara_process::{
    EngineConfig, HistoryLevel, ProcessDefinitionBuilder, ProcessInstanceState,
    StartProcessInstance, Variables,
};

fn vars(name: &str, value: serde_json::Value) -> Variables {
    let mut variables = Variables::new();
    variables.insert(name.to_string(), value);
    variables
}

#[tokio::test]
async fn test_run_to_completion() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let started = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("twoTasks").variable("customer", "acme"))
        .await
        .unwrap();
    let pi = started.process_instance_id;
    assert_eq!(started.variables.get("customer"), Some(&json!("acme")));
    assert_eq!(ctx.historic(&pi).await.start_activity_id.as_deref(), Some("start"));

    let task = ctx.task_id(&pi, "userTask1").await;
    ctx.engine.complete_task(&task, vars("reviewed", json!(true))).await.unwrap();
    assert_eq!(ctx.variable(&pi, "reviewed").await, Some(json!(true)));

    let task = ctx.task_id(&pi, "userTask2").await;
    ctx.engine.complete_task(&task, Variables::new()).await.unwrap();

    assert!(!ctx.is_running(&pi).await);
    let historic = ctx.historic(&pi).await;
    assert_eq!(historic.state, ProcessInstanceState::Completed);
    assert_eq!(historic.end_activity_id.as_deref(), Some("end"));

    let activities: Vec<String> = ctx
        .engine
        .historic_activity_instances(&pi)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.activity_id)
        .collect();
    assert_eq!(activities, vec!["start", "userTask1", "userTask2", "end"]);
}

#[tokio::test]
async fn test_exclusive_gateway_follows_condition() {
    let ctx = TestContext::new();
    ctx.deploy(exclusive_gateway_process());

    let default_path = ctx.start("exclusiveGateway").await;
    assert_eq!(ctx.activity_instance_ids(&default_path, "task1").await.len(), 1);

    let conditional = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("exclusiveGateway").variable("path", "two"))
        .await
        .unwrap()
        .process_instance_id;
    assert_eq!(ctx.activity_instance_ids(&conditional, "task2").await.len(), 1);
    assert!(ctx.activity_instance_ids(&conditional, "task1").await.is_empty());
}

#[tokio::test]
async fn test_parallel_join_waits_for_all_branches() {
    let ctx = TestContext::new();
    ctx.deploy(parallel_process());
    let pi = ctx.start("parallel").await;

    let task1 = ctx.task_id(&pi, "task1").await;
    ctx.engine.complete_task(&task1, Variables::new()).await.unwrap();
    assert!(ctx.is_running(&pi).await);
    assert_eq!(ctx.activity_instance_ids(&pi, "task2").await.len(), 1);

    let task2 = ctx.task_id(&pi, "task2").await;
    ctx.engine.complete_task(&task2, Variables::new()).await.unwrap();
    assert_eq!(ctx.historic(&pi).await.state, ProcessInstanceState::Completed);
}

#[tokio::test]
async fn test_sub_process_completes_into_parent() {
    let ctx = TestContext::new();
    ctx.deploy(sub_process_process());
    let pi = ctx.start("subProcess").await;

    let tree = ctx.tree(&pi).await;
    let sub = tree.activity_instances_for("subProcess")[0].id.clone();
    let inner = tree.activity_instances_for("innerTask");
    assert_eq!(inner[0].parent_activity_instance_id.as_deref(), Some(sub.as_str()));

    let task = ctx.task_id(&pi, "innerTask").await;
    ctx.engine.complete_task(&task, Variables::new()).await.unwrap();

    let tree = ctx.tree(&pi).await;
    assert!(tree.activity_instances_for("subProcess").is_empty());
    assert_eq!(tree.activity_instances_for("afterSub").len(), 1);
}

#[tokio::test]
async fn test_call_activity_returns_to_caller() {
    let ctx = TestContext::new();
    ctx.deploy(one_task_process("leaf"));
    ctx.deploy(calling_process("caller", "leaf"));
    let caller = ctx.start("caller").await;

    let called = ctx
        .engine
        .process_instances(&ProcessInstanceQuery {
            root_process_instance_id: Some(caller.clone()),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id != caller)
        .expect("called instance");
    assert_eq!(called.super_process_instance_id.as_deref(), Some(caller.as_str()));

    let task = ctx.task_id(&called.id, "theTask").await;
    ctx.engine.complete_task(&task, Variables::new()).await.unwrap();

    assert_eq!(ctx.historic(&called.id).await.state, ProcessInstanceState::Completed);
    assert_eq!(ctx.activity_instance_ids(&caller, "afterCall").await.len(), 1);
}

#[tokio::test]
async fn test_message_correlation() {
    let ctx = TestContext::new();
    ctx.deploy(
        ProcessDefinitionBuilder::new("payment")
            .start_event("start")
            .message_catch_event("waitForPayment", "paymentReceived")
            .service_task("approve", "approve")
            .user_task("ship")
            .end_event("end")
            .flow("flow1", "start", "waitForPayment")
            .flow("flow2", "waitForPayment", "approve")
            .flow("flow3", "approve", "ship")
            .flow("flow4", "ship", "end")
            .build()
            .unwrap(),
    );
    let first = ctx.start("payment").await;
    let second = ctx.start("payment").await;

    // Two instances wait for the same message.
    let err = ctx
        .engine
        .correlate_message("paymentReceived", None, Variables::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "BAD_REQUEST");

    let correlated = ctx
        .engine
        .correlate_message("paymentReceived", Some(&second), vars("amount", json!(99)))
        .await
        .unwrap();
    assert_eq!(correlated, second);
    assert_eq!(ctx.variable(&second, "amount").await, Some(json!(99)));
    assert_eq!(ctx.variable(&second, "approved").await, Some(json!(true)));
    assert_eq!(ctx.activity_instance_ids(&second, "ship").await.len(), 1);
    assert_eq!(ctx.activity_instance_ids(&first, "waitForPayment").await.len(), 1);

    let err = ctx
        .engine
        .correlate_message("unknown", None, Variables::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_definition_versions() {
    let ctx = TestContext::new();
    let v1 = ctx.deploy(one_task_process("versioned"));
    let v2 = ctx.deploy(one_task_process("versioned"));
    assert_ne!(v1, v2);
    assert_eq!(ctx.engine.latest_definition("versioned").unwrap().id(), v2);

    let pinned = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_id(&v1))
        .await
        .unwrap();
    assert_eq!(pinned.definition_id, v1);

    let err = ctx
        .engine
        .start_process_instance(StartProcessInstance::by_key("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_history_level_none_records_nothing() {
    let ctx = TestContext::with_config(EngineConfig {
        history_level: HistoryLevel::None,
        ..Default::default()
    });
    ctx.deploy(two_tasks_process());
    let pi = ctx.start("twoTasks").await;

    assert!(ctx.engine.historic_activity_instances(&pi).await.unwrap().is_empty());
    assert!(ctx.engine.historic_variable_details(&pi).await.unwrap().is_empty());
    assert_eq!(ctx.activity_instance_ids(&pi, "userTask1").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_units_on_separate_instances() {
    let ctx = TestContext::new();
    ctx.deploy(two_tasks_process());
    let ids = ctx.start_many("twoTasks", 8).await;

    let completions = ids.iter().map(|id| {
        let engine = ctx.engine.clone();
        let id = id.clone();
        async move {
            let task = engine
                .tasks(&runtara_process::persistence::TaskQuery {
                    process_instance_id: Some(id.clone()),
                    ..Default::default()
                })
                .await?
                .remove(0);
            engine.complete_task(&task.id, Variables::new()).await?;
            Ok::<_, runtara_process::EngineError>(id)
        }
    });
    let results = futures::future::join_all(completions).await;

    for result in results {
        let id = result.expect("Failed to complete task");
        assert_eq!(ctx.activity_instance_ids(&id, "userTask2").await.len(), 1);
    }
}
