// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Process - BPMN Process Instance Runtime
//!
//! This crate runs BPMN process instances as trees of executions and lets
//! operators change running and finished instances: start execution at
//! arbitrary activities or sequence flows, cancel activity instances, modify
//! instances one by one or in batches, restart finished instances from history,
//! and suspend or activate instances in bulk.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             ProcessEngine                               │
//! │      start / modify / restart / cancel / suspend / jobs / queries       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ one unit of work per call
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            CommandContext                               │
//! │   instance hierarchy snapshot + operation queue + buffered history      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                          │
//!           ▼                        ▼                          ▼
//! ┌───────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   instantiation   │   │    cancellation     │   │     operations      │
//! │ before/after/flow │   │ cascade + end states│   │  atomic BPMN steps  │
//! └───────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ProcessStore (MemoryStore)                          │
//! │        runtime hierarchies, history, user operation log, batches        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Entry point | Description |
//! |-----------|-------------|-------------|
//! | Start | [`ProcessEngine::start_process_instance`] | None start event or start instructions |
//! | Modify | [`ProcessEngine::modify`] | Ordered start and cancel instructions on one instance |
//! | Bulk modify | [`ProcessEngine::modify_many`], [`ProcessEngine::modify_async`] | Same modification on many instances |
//! | Restart | [`ProcessEngine::restart`], [`ProcessEngine::restart_async`] | New instances from finished ones |
//! | Cancel | [`ProcessEngine::cancel`], [`ProcessEngine::cancel_preempting`] | Process or activity instance, internal or external |
//! | Suspend | [`ProcessEngine::suspend_process_instances`] | Bulk suspension and activation |
//! | Jobs | [`ProcessEngine::run_due_jobs`], [`ProcessEngine::run_batch_jobs`] | Async continuations, timers and batch jobs |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUNTARA_BATCH_JOBS_PER_SEED` | `100` | Execution jobs created per seed run |
//! | `RUNTARA_INVOCATIONS_PER_BATCH_JOB` | `1` | Instances handled per execution job |
//! | `RUNTARA_DEFAULT_JOB_RETRIES` | `3` | Retries of new jobs |
//! | `RUNTARA_HISTORY_LEVEL` | `full` | `none`, `activity` or `full` |
//! | `RUNTARA_JOB_EXECUTOR_CONCURRENCY` | `4` | Units of work running in parallel |
//! | `RUNTARA_JOB_LOCK_DURATION_SECS` | `300` | Seconds an executor holds an acquired job |
//!
//! # Modules
//!
//! - [`engine`]: Engine facade and builder
//! - [`definition`]: Process definitions and their builder
//! - [`execution`]: Execution tree
//! - [`projection`]: Activity instance tree derived from the execution tree
//! - [`instantiation`]: Start before, start after and start transition
//! - [`cancellation`]: Activity instance cancellation and instance termination
//! - [`modification`]: Process instance modification
//! - [`restart`]: Restart of historic process instances
//! - [`batch`]: Asynchronous bulk operations
//! - [`history`]: History events and the user operation log
//! - [`persistence`]: Storage interface and the in-memory store

#![deny(missing_docs)]

/// Batches and batch jobs for asynchronous bulk operations.
pub mod batch;

/// Cancellation of activity instances and termination of process instances.
pub mod cancellation;

/// Time source.
pub mod clock;

/// Compensation hook invoked when scopes with completed compensable work are removed.
pub mod compensation;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Unit of work over an instance hierarchy.
pub mod context;

/// Process definitions.
pub mod definition;

/// Listeners, service task handlers and condition evaluation.
pub mod delegate;

/// Process engine facade.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Execution tree.
pub mod execution;

/// History events and user operation log entries.
pub mod history;

/// Id generation.
pub mod ids;

/// Incident handlers.
pub mod incident;

/// Runtime state of process instances.
pub mod instance;

/// Starting execution at activities and sequence flows.
pub mod instantiation;

/// Process instance modification.
pub mod modification;

mod operations;

/// Storage interface and backends.
pub mod persistence;

/// Activity instance tree.
pub mod projection;

/// Restart of historic process instances.
pub mod restart;

/// Variable scoping.
pub mod variables;

pub use batch::{Batch, BatchJob, BatchJobKind, BatchReport, BatchType, InstanceFailure};
pub use cancellation::CancellationSource;
pub use clock::{Clock, ManualClock, SystemClock};
pub use compensation::{CollectingCompensationHandler, CompensationHandler, PendingCompensation};
pub use config::{EngineConfig, HistoryLevel, init_tracing};
pub use definition::{
    Condition, ListenerEvent, MappingSource, ProcessDefinition, ProcessDefinitionBuilder,
};
pub use delegate::{ConditionEvaluator, DelegateExecution, ExecutionListener, ServiceTaskHandler};
pub use engine::{
    CancelTarget, DefinitionRef, JobRunReport, ProcessEngine, ProcessEngineBuilder,
    ProcessInstanceWithVariables, StartProcessInstance,
};
pub use error::{EngineError, Result};
pub use history::{HistoryEvent, ProcessInstanceState};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use incident::{IncidentContext, IncidentHandler};
pub use instantiation::StartInstruction;
pub use modification::{BulkModification, ModificationInstruction, ProcessInstanceModification};
pub use persistence::{MemoryStore, ProcessStore};
pub use projection::{ActivityInstance, TransitionInstance};
pub use restart::{RestartProcessInstances, RestartReport};
pub use variables::Variables;
