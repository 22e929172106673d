// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-process integration tests.
//!
//! Provides TestContext wiring an engine to an in-memory store, sequential ids
//! and a manual clock, plus the process definitions the tests share.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{TimeZone, Utc};
use serde_json::Value;

use runtara_process::history::HistoricProcessInstance;
use runtara_process::persistence::{ProcessInstanceQuery, TaskQuery, UserOperationLogQuery};
use runtara_process::{
    ActivityInstance, CollectingCompensationHandler, Condition, DelegateExecution, EngineConfig,
    ManualClock, MemoryStore, ProcessDefinition, ProcessDefinitionBuilder, ProcessEngine,
    SequentialIdGenerator, StartProcessInstance,
};

/// Engine plus the collaborators tests inspect.
pub struct TestContext {
    pub engine: ProcessEngine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub compensation: Arc<CollectingCompensationHandler>,
    /// Switch for the `flaky` service task handler.
    pub healthy: Arc<AtomicBool>,
}

impl TestContext {
    /// Create a context with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a context with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap(),
        ));
        let compensation = Arc::new(CollectingCompensationHandler::new());
        let healthy = Arc::new(AtomicBool::new(true));

        let flaky_switch = healthy.clone();
        let engine = ProcessEngine::builder()
            .store(store.clone())
            .config(config)
            .id_generator(Arc::new(SequentialIdGenerator::new()))
            .clock(clock.clone())
            .compensation_handler(compensation.clone())
            .service_task_handler(
                "flaky",
                Arc::new(move |_: &mut DelegateExecution| {
                    if flaky_switch.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("downstream unavailable"))
                    }
                }),
            )
            .service_task_handler(
                "approve",
                Arc::new(|execution: &mut DelegateExecution| {
                    execution.set_variable("approved", true);
                    Ok::<(), anyhow::Error>(())
                }),
            )
            .build()
            .expect("Failed to build engine");

        Self {
            engine,
            store,
            clock,
            compensation,
            healthy,
        }
    }

    /// Deploy `definition` and return its id.
    pub fn deploy(&self, definition: ProcessDefinition) -> String {
        self.engine.deploy(definition).id().to_string()
    }

    /// Start the latest version of `key` and return the instance id.
    pub async fn start(&self, key: &str) -> String {
        self.engine
            .start_process_instance(StartProcessInstance::by_key(key))
            .await
            .expect("Failed to start process instance")
            .process_instance_id
    }

    /// Start `count` instances of `key`.
    pub async fn start_many(&self, key: &str, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.start(key).await);
        }
        ids
    }

    /// Activity instance tree of a running instance.
    pub async fn tree(&self, process_instance_id: &str) -> ActivityInstance {
        self.engine
            .activity_instance_tree(process_instance_id)
            .await
            .expect("Failed to project activity instance tree")
    }

    /// Ids of the activity instances of `activity_id`.
    pub async fn activity_instance_ids(&self, process_instance_id: &str, activity_id: &str) -> Vec<String> {
        self.tree(process_instance_id)
            .await
            .activity_instances_for(activity_id)
            .into_iter()
            .map(|a| a.id.clone())
            .collect()
    }

    /// Historic record of an instance.
    pub async fn historic(&self, process_instance_id: &str) -> HistoricProcessInstance {
        self.engine
            .historic_process_instance(process_instance_id)
            .await
            .expect("Failed to load historic process instance")
    }

    /// Whether the instance is still running.
    pub async fn is_running(&self, process_instance_id: &str) -> bool {
        self.engine.process_instance(process_instance_id).await.is_ok()
    }

    /// Running instances of a definition.
    pub async fn instances_of(&self, process_definition_id: &str) -> Vec<String> {
        self.engine
            .process_instances(&ProcessInstanceQuery {
                process_definition_id: Some(process_definition_id.to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to query process instances")
            .into_iter()
            .map(|p| p.id)
            .collect()
    }

    /// Open task of `activity_id` in an instance.
    pub async fn task_id(&self, process_instance_id: &str, activity_id: &str) -> String {
        self.engine
            .tasks(&TaskQuery {
                process_instance_id: Some(process_instance_id.to_string()),
                activity_id: Some(activity_id.to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to query tasks")
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("no task at '{}'", activity_id))
            .id
    }

    /// User operation log entries of one operation type.
    pub async fn operation_log(&self, operation_type: &str) -> Vec<runtara_process::history::UserOperationLogEntry> {
        self.engine
            .user_operation_log(&UserOperationLogQuery {
                operation_type: Some(operation_type.to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to query user operation log")
    }

    /// Process variable of a running instance.
    pub async fn variable(&self, process_instance_id: &str, name: &str) -> Option<Value> {
        self.engine
            .variables(process_instance_id)
            .await
            .expect("Failed to read variables")
            .get(name)
            .cloned()
    }
}

/// start -> userTask1 -> userTask2 -> end
pub fn two_tasks_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("twoTasks")
        .start_event("start")
        .user_task("userTask1")
        .user_task("userTask2")
        .end_event("end")
        .flow("flow1", "start", "userTask1")
        .flow("flow2", "userTask1", "userTask2")
        .flow("flow3", "userTask2", "end")
        .build()
        .expect("invalid twoTasks process")
}

/// start -> theTask -> end
pub fn one_task_process(key: &str) -> ProcessDefinition {
    ProcessDefinitionBuilder::new(key)
        .start_event("start")
        .user_task("theTask")
        .end_event("end")
        .flow("flow1", "start", "theTask")
        .flow("flow2", "theTask", "end")
        .build()
        .expect("invalid one task process")
}

/// start -> gateway -(flow1, default)-> task1 -> end1, gateway -(flow2: path == "two")-> task2 -> end2
pub fn exclusive_gateway_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("exclusiveGateway")
        .start_event("start")
        .exclusive_gateway("gateway")
        .user_task("task1")
        .user_task("task2")
        .end_event("end1")
        .end_event("end2")
        .flow("flow0", "start", "gateway")
        .flow("flow1", "gateway", "task1")
        .conditional_flow("flow2", "gateway", "task2", Condition::variable_equals("path", "two"))
        .flow("flow3", "task1", "end1")
        .flow("flow4", "task2", "end2")
        .default_flow("gateway", "flow1")
        .build()
        .expect("invalid exclusiveGateway process")
}

/// start -> fork -> task1 / task2 -> join -> end
pub fn parallel_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("parallel")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("task1")
        .user_task("task2")
        .parallel_gateway("join")
        .end_event("end")
        .flow("flow0", "start", "fork")
        .flow("flow1", "fork", "task1")
        .flow("flow2", "fork", "task2")
        .flow("flow3", "task1", "join")
        .flow("flow4", "task2", "join")
        .flow("flow5", "join", "end")
        .build()
        .expect("invalid parallel process")
}

/// start -> subProcess { subStart -> innerTask -> subEnd } -> afterSub -> end
pub fn sub_process_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("subProcess")
        .start_event("start")
        .sub_process("subProcess")
        .start_event("subStart")
        .user_task("innerTask")
        .end_event("subEnd")
        .end_scope()
        .user_task("afterSub")
        .end_event("end")
        .flow("flow0", "start", "subProcess")
        .flow("flow1", "subStart", "innerTask")
        .flow("flow2", "innerTask", "subEnd")
        .flow("flow3", "subProcess", "afterSub")
        .flow("flow4", "afterSub", "end")
        .build()
        .expect("invalid subProcess process")
}

/// start -> callActivity(`called`) -> afterCall -> end
pub fn calling_process(key: &str, called: &str) -> ProcessDefinition {
    ProcessDefinitionBuilder::new(key)
        .start_event("start")
        .call_activity("callActivity", called)
        .user_task("afterCall")
        .end_event("end")
        .flow("flow1", "start", "callActivity")
        .flow("flow2", "callActivity", "afterCall")
        .flow("flow3", "afterCall", "end")
        .build()
        .expect("invalid calling process")
}

/// start -> async service task `flaky` -> end
pub fn async_service_process() -> ProcessDefinition {
    ProcessDefinitionBuilder::new("asyncService")
        .start_event("start")
        .service_task("service", "flaky")
        .end_event("end")
        .flow("flow1", "start", "service")
        .flow("flow2", "service", "end")
        .async_before("service")
        .build()
        .expect("invalid asyncService process")
}
