// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable process engine.
//!
//! [`ProcessEngine`] is the entry point of the crate. Each call is one unit of
//! work: the instance hierarchy is loaded from the [`ProcessStore`], the core
//! algorithms run against the in-memory snapshot through a [`CommandContext`],
//! and the result is committed in a single [`UnitOfWork`]. Failed commands are
//! rolled back by dropping the context.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_process::{ProcessEngine, MemoryStore, ProcessDefinitionBuilder, StartProcessInstance};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = ProcessEngine::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .build()?;
//!
//!     engine.deploy(
//!         ProcessDefinitionBuilder::new("invoice")
//!             .start_event("start")
//!             .user_task("approve")
//!             .end_event("end")
//!             .flow("flow1", "start", "approve")
//!             .flow("flow2", "approve", "end")
//!             .build()?,
//!     );
//!     let started = engine
//!         .start_process_instance(StartProcessInstance::by_key("invoice"))
//!         .await?;
//!     println!("started {}", started.process_instance_id);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Batch, BatchJob, BatchJobKind, BatchReport, BatchType, InstanceFailure};
use crate::cancellation::{self, CancellationSource};
use crate::clock::{Clock, SystemClock};
use crate::compensation::{CompensationHandler, TracingCompensationHandler};
use crate::config::EngineConfig;
use crate::context::{CommandContext, DefinitionCache, EngineServices, ExecutionFlags};
use crate::definition::ProcessDefinition;
use crate::delegate::{
    ConditionEvaluator, DelegateRegistry, ExecutionListener, ServiceTaskHandler,
    VariableConditionEvaluator,
};
use crate::error::{EngineError, Result};
use crate::execution::Execution;
use crate::history::{
    self, HistoricActivityInstance, HistoricIncident, HistoricProcessInstance,
    HistoricVariableDetail, HistoricVariableInstance, HistoryEvent, IncidentState,
    OperationContext, ProcessInstanceState, PropertyChange, UserOperationLogEntry, operation_type,
};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::incident::{FAILED_JOB, IncidentContext, IncidentHandler, IncidentHandlerRegistry};
use crate::instance::{Incident, InstanceHierarchy, Job, ProcessInstance, Task};
use crate::instantiation::{self, StartInstruction, StartOptions};
use crate::modification::{self, BulkModification, ProcessInstanceModification};
use crate::operations;
use crate::persistence::{
    HistoricProcessInstanceQuery, JobQuery, ProcessInstanceQuery, ProcessStore, SubscriptionQuery,
    TaskQuery, UnitOfWork, UserOperationLogQuery,
};
use crate::projection::{self, ActivityInstance};
use crate::restart::{self, RestartProcessInstances, RestartReport, RestartSource, RestartedInstance};
use crate::variables::{self, Variables};

/// Which definition to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum DefinitionRef {
    /// A specific definition.
    Id(String),
    /// The latest version of a key.
    Key(String),
}

/// Request to start a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartProcessInstance {
    /// Definition to start.
    pub process_definition: DefinitionRef,
    /// Business key.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Case instance id.
    #[serde(default)]
    pub case_instance_id: Option<String>,
    /// Initial process variables.
    #[serde(default)]
    pub variables: Variables,
    /// Start steps; empty means the none start event.
    #[serde(default)]
    pub instructions: Vec<StartInstruction>,
    /// Do not invoke listeners.
    #[serde(default)]
    pub skip_custom_listeners: bool,
    /// Do not apply input/output mappings.
    #[serde(default)]
    pub skip_io_mappings: bool,
}

impl StartProcessInstance {
    fn new(process_definition: DefinitionRef) -> Self {
        Self {
            process_definition,
            business_key: None,
            case_instance_id: None,
            variables: Variables::new(),
            instructions: Vec::new(),
            skip_custom_listeners: false,
            skip_io_mappings: false,
        }
    }

    /// Start the latest version of `key`.
    pub fn by_key(key: &str) -> Self {
        Self::new(DefinitionRef::Key(key.to_string()))
    }

    /// Start definition `id`.
    pub fn by_id(id: &str) -> Self {
        Self::new(DefinitionRef::Id(id.to_string()))
    }

    /// Set the business key.
    pub fn business_key(mut self, business_key: &str) -> Self {
        self.business_key = Some(business_key.to_string());
        self
    }

    /// Set the case instance id.
    pub fn case_instance_id(mut self, case_instance_id: &str) -> Self {
        self.case_instance_id = Some(case_instance_id.to_string());
        self
    }

    /// Add an initial variable.
    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Start before `activity_id` instead of the start event.
    pub fn start_before_activity(mut self, activity_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartBeforeActivity {
            activity_id: activity_id.to_string(),
        });
        self
    }

    /// Start on the outgoing flow of `activity_id`.
    pub fn start_after_activity(mut self, activity_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartAfterActivity {
            activity_id: activity_id.to_string(),
        });
        self
    }

    /// Start on `transition_id`.
    pub fn start_transition(mut self, transition_id: &str) -> Self {
        self.instructions.push(StartInstruction::StartTransition {
            transition_id: transition_id.to_string(),
        });
        self
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
}

/// A started process instance and its variables after the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceWithVariables {
    /// Process instance id.
    pub process_instance_id: String,
    /// Definition id.
    pub definition_id: String,
    /// Business key.
    pub business_key: Option<String>,
    /// Root of the call hierarchy.
    pub root_process_instance_id: String,
    /// Whether the instance already ended.
    pub ended: bool,
    /// Process variables.
    pub variables: Variables,
}

/// What to cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CancelTarget {
    /// A whole process instance.
    ProcessInstance {
        /// Process instance id.
        process_instance_id: String,
    },
    /// One activity instance.
    ActivityInstance {
        /// Owning process instance.
        process_instance_id: String,
        /// Activity instance id.
        activity_instance_id: String,
    },
}

impl CancelTarget {
    /// Whole process instance.
    pub fn process_instance(id: &str) -> Self {
        Self::ProcessInstance {
            process_instance_id: id.to_string(),
        }
    }

    /// One activity instance.
    pub fn activity_instance(process_instance_id: &str, activity_instance_id: &str) -> Self {
        Self::ActivityInstance {
            process_instance_id: process_instance_id.to_string(),
            activity_instance_id: activity_instance_id.to_string(),
        }
    }

    fn process_instance_id(&self) -> &str {
        match self {
            Self::ProcessInstance {
                process_instance_id,
            }
            | Self::ActivityInstance {
                process_instance_id,
                ..
            } => process_instance_id,
        }
    }
}

/// Outcome of [`ProcessEngine::run_due_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunReport {
    /// Jobs that ran.
    pub succeeded: Vec<String>,
    /// Jobs that failed.
    pub failed: Vec<String>,
    /// Jobs that disappeared before they could run.
    pub skipped: Vec<String>,
}

/// Builder for creating a [`ProcessEngine`].
#[derive(Default)]
pub struct ProcessEngineBuilder {
    store: Option<Arc<dyn ProcessStore>>,
    config: Option<EngineConfig>,
    delegates: DelegateRegistry,
    incidents: IncidentHandlerRegistry,
    compensation: Option<Arc<dyn CompensationHandler>>,
    ids: Option<Arc<dyn IdGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    conditions: Option<Arc<dyn ConditionEvaluator>>,
}

impl std::fmt::Debug for ProcessEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngineBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .field("delegates", &self.delegates)
            .field("incidents", &self.incidents)
            .finish_non_exhaustive()
    }
}

impl ProcessEngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`EngineConfig::default`]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register an execution listener.
    pub fn listener(mut self, name: &str, listener: Arc<dyn ExecutionListener>) -> Self {
        self.delegates.register_listener(name, listener);
        self
    }

    /// Register a service task handler.
    pub fn service_task_handler(mut self, name: &str, handler: Arc<dyn ServiceTaskHandler>) -> Self {
        self.delegates.register_handler(name, handler);
        self
    }

    /// Register an incident handler for its type.
    pub fn incident_handler(mut self, handler: Arc<dyn IncidentHandler>) -> Self {
        self.incidents.register(handler);
        self
    }

    /// Set the compensation hook.
    ///
    /// Default: [`TracingCompensationHandler`]
    pub fn compensation_handler(mut self, handler: Arc<dyn CompensationHandler>) -> Self {
        self.compensation = Some(handler);
        self
    }

    /// Set the id generator.
    ///
    /// Default: [`UuidIdGenerator`]
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Set the clock.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the condition evaluator.
    ///
    /// Default: [`VariableConditionEvaluator`]
    pub fn condition_evaluator(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing or the configuration is invalid.
    pub fn build(self) -> anyhow::Result<ProcessEngine> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let config = self.config.unwrap_or_default();
        if config.batch_jobs_per_seed == 0 || config.invocations_per_batch_job == 0 {
            anyhow::bail!("batch job sizes must be positive");
        }
        if config.job_executor_concurrency == 0 {
            anyhow::bail!("job executor concurrency must be positive");
        }

        let services = EngineServices {
            config,
            definitions: DefinitionCache::new(),
            delegates: self.delegates,
            incidents: self.incidents,
            compensation: self
                .compensation
                .unwrap_or_else(|| Arc::new(TracingCompensationHandler)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidIdGenerator)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            conditions: self
                .conditions
                .unwrap_or_else(|| Arc::new(VariableConditionEvaluator)),
        };
        info!(config = ?services.config, "Process engine built");
        Ok(ProcessEngine {
            services: Arc::new(services),
            store,
            user_id: None,
            lock_owner: uuid::Uuid::new_v4().to_string(),
        })
    }
}

/// Process engine.
///
/// Cheap to clone; clones share definitions, collaborators and the store.
#[derive(Clone)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    store: Arc<dyn ProcessStore>,
    user_id: Option<String>,
    lock_owner: String,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("services", &self.services)
            .field("store", &"...")
            .field("user_id", &self.user_id)
            .field("lock_owner", &self.lock_owner)
            .finish()
    }
}

impl ProcessEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    /// Handle acting as `user_id` in audit entries and batches.
    pub fn as_user(&self, user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..self.clone()
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// The store.
    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    // ========================================================================
    // Units of work
    // ========================================================================

    async fn load(&self, process_instance_id: &str) -> Result<InstanceHierarchy> {
        let root = self
            .store
            .root_of(process_instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Process instance", process_instance_id))?;
        self.store
            .load_hierarchy(&root)
            .await?
            .ok_or_else(|| EngineError::not_found("Process instance", process_instance_id))
    }

    /// Run `command` against `hierarchy` and commit the outcome.
    async fn run_unit<T, F>(&self, hierarchy: InstanceHierarchy, command: F) -> Result<T>
    where
        F: FnOnce(&mut CommandContext<'_>) -> Result<T> + Send,
        T: Send,
    {
        let (value, unit) = {
            let mut ctx = CommandContext::new(&self.services, hierarchy, self.user_id.clone());
            let value = command(&mut ctx)?;
            let (hierarchy, _, history) = ctx.into_parts();
            (
                value,
                UnitOfWork {
                    hierarchy: Some(hierarchy),
                    history,
                    ..Default::default()
                },
            )
        };
        self.store.commit(unit).await?;
        Ok(value)
    }

    async fn in_instance<T, F>(&self, process_instance_id: &str, command: F) -> Result<T>
    where
        F: FnOnce(&mut CommandContext<'_>) -> Result<T> + Send,
        T: Send,
    {
        let hierarchy = self.load(process_instance_id).await?;
        self.run_unit(hierarchy, command).await
    }

    fn recorded(&self, events: Vec<HistoryEvent>) -> Vec<HistoryEvent> {
        events
            .into_iter()
            .filter(|e| e.level() <= self.services.config.history_level)
            .collect()
    }

    fn operation_context(
        &self,
        process_instance_id: Option<&str>,
        definition: Option<&ProcessDefinition>,
        batch_id: Option<&str>,
        annotation: Option<&str>,
    ) -> OperationContext {
        OperationContext {
            process_instance_id: process_instance_id.map(str::to_string),
            process_definition_id: definition.map(|d| d.id().to_string()),
            process_definition_key: definition.map(|d| d.key().to_string()),
            batch_id: batch_id.map(str::to_string),
            user_id: self.user_id.clone(),
            annotation: annotation.map(str::to_string),
        }
    }

    /// User operation log entries of one action.
    fn log_user_operation(
        &self,
        operation_id: &str,
        operation_type: &str,
        entity_type: &str,
        context: &OperationContext,
        changes: Vec<PropertyChange>,
    ) -> Vec<HistoryEvent> {
        let ids = self.services.ids.clone();
        history::operation_entries(
            || ids.next_id(),
            operation_id,
            operation_type,
            entity_type,
            context,
            changes,
            self.services.clock.now(),
        )
        .into_iter()
        .map(HistoryEvent::UserOperation)
        .collect()
    }

    fn definition_or_not_found(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .get(id)
            .ok_or_else(|| EngineError::not_found("Process definition", id))
    }

    // ========================================================================
    // Definitions and instances
    // ========================================================================

    /// Deploy a definition as the next version of its key.
    #[instrument(skip(self, definition), fields(key = %definition.key()))]
    pub fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let version = self.services.definitions.next_version(definition.key());
        let definition = Arc::new(definition.with_version(version));
        self.services.definitions.insert(definition.clone());
        info!(process_definition_id = %definition.id(), "Process definition deployed");
        definition
    }

    /// Deployed definition by id.
    pub fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.definition_or_not_found(id)
    }

    /// Latest deployed definition of `key`.
    pub fn latest_definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .latest(key)
            .ok_or_else(|| EngineError::not_found("Process definition with key", key))
    }

    /// Start a process instance.
    #[instrument(skip(self, request), fields(definition = ?request.process_definition))]
    pub async fn start_process_instance(
        &self,
        request: StartProcessInstance,
    ) -> Result<ProcessInstanceWithVariables> {
        let definition = match &request.process_definition {
            DefinitionRef::Id(id) => self.definition(id)?,
            DefinitionRef::Key(key) => self.latest_definition(key)?,
        };
        let id = self.services.ids.next_id();
        let mut instance = ProcessInstance::new(&id, &definition, &id, self.services.clock.now());
        instance.business_key = request.business_key.clone();
        instance.case_instance_id = request.case_instance_id.clone();

        let started = self
            .run_unit(InstanceHierarchy::new(instance), |ctx| {
                let previous = ctx.set_flags(ExecutionFlags {
                    skip_custom_listeners: request.skip_custom_listeners,
                    skip_io_mappings: request.skip_io_mappings,
                });
                let result = start_instance(ctx, &id, &definition, &request);
                ctx.set_flags(previous);
                result?;

                let (ended, variables) = match ctx.hierarchy().get(&id) {
                    Some(live) => (false, variables::visible(&live.tree, &id)),
                    None => (
                        true,
                        ctx.finished()
                            .get(&id)
                            .map(|f| f.tree.root().variables.clone())
                            .unwrap_or_default(),
                    ),
                };
                Ok(ProcessInstanceWithVariables {
                    process_instance_id: id.clone(),
                    definition_id: definition.id().to_string(),
                    business_key: request.business_key.clone(),
                    root_process_instance_id: id.clone(),
                    ended,
                    variables,
                })
            })
            .await?;
        info!(
            process_instance_id = %started.process_instance_id,
            process_definition_id = %started.definition_id,
            ended = started.ended,
            "Process instance started"
        );
        Ok(started)
    }

    /// Set process variables.
    #[instrument(skip(self, variables))]
    pub async fn set_variables(&self, process_instance_id: &str, variables: Variables) -> Result<()> {
        self.in_instance(process_instance_id, |ctx| {
            ctx.set_variables(process_instance_id, process_instance_id, &variables, false, false)
        })
        .await
    }

    /// Set variables local to an execution.
    #[instrument(skip(self, variables))]
    pub async fn set_variables_local(
        &self,
        process_instance_id: &str,
        execution_id: &str,
        variables: Variables,
    ) -> Result<()> {
        self.in_instance(process_instance_id, |ctx| {
            ctx.set_variables(process_instance_id, execution_id, &variables, true, false)
        })
        .await
    }

    // ========================================================================
    // Tasks, messages and jobs
    // ========================================================================

    /// Complete a user task, writing `variables` first.
    #[instrument(skip(self, variables))]
    pub async fn complete_task(&self, task_id: &str, variables: Variables) -> Result<()> {
        let task = self
            .store
            .tasks(&TaskQuery {
                task_id: Some(task_id.to_string()),
                ..Default::default()
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found("Task", task_id))?;
        let instance_id = task.process_instance_id.clone();
        self.in_instance(&instance_id, |ctx| {
            ctx.instance(&instance_id)?.ensure_active()?;
            ctx.set_variables(&instance_id, &task.execution_id, &variables, false, false)?;
            operations::complete_task(ctx, &instance_id, &task.id)?;
            operations::run(ctx)
        })
        .await?;
        debug!(task_id = %task_id, process_instance_id = %instance_id, "Task completed");
        Ok(())
    }

    /// Deliver a message to the single subscription waiting for it. Returns the
    /// process instance that received it.
    #[instrument(skip(self, variables))]
    pub async fn correlate_message(
        &self,
        message_name: &str,
        process_instance_id: Option<&str>,
        variables: Variables,
    ) -> Result<String> {
        let subscriptions = self
            .store
            .subscriptions(&SubscriptionQuery {
                message_name: Some(message_name.to_string()),
                process_instance_id: process_instance_id.map(str::to_string),
            })
            .await?;
        let subscription = match subscriptions.as_slice() {
            [] => return Err(EngineError::not_found("Message subscription", message_name)),
            [only] => only.clone(),
            many => {
                return Err(EngineError::bad_request(format!(
                    "Cannot correlate message '{}': {} executions match",
                    message_name,
                    many.len()
                )));
            }
        };
        let instance_id = subscription.process_instance_id.clone();
        self.in_instance(&instance_id, |ctx| {
            ctx.instance(&instance_id)?.ensure_active()?;
            ctx.set_variables(&instance_id, &subscription.execution_id, &variables, false, false)?;
            operations::trigger_subscription(ctx, &instance_id, &subscription.id)?;
            operations::run(ctx)
        })
        .await?;
        info!(message_name = %message_name, process_instance_id = %instance_id, "Message correlated");
        Ok(instance_id)
    }

    async fn find_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .jobs(&JobQuery {
                job_id: Some(job_id.to_string()),
                ..Default::default()
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found("Job", job_id))
    }

    /// Lock a job to this engine for `job_lock_duration_secs`.
    ///
    /// While the lock holds, the job is not due for other executors, and
    /// modifications or cancellations that would remove its execution fail
    /// unless they allow preemption. A lock held by another engine fails with
    /// `InvalidState`.
    #[instrument(skip(self))]
    pub async fn acquire_job(&self, job_id: &str) -> Result<Job> {
        let job = self.find_job(job_id).await?;
        let instance_id = job.process_instance_id.clone();
        let owner = self.lock_owner.clone();
        let lock_duration =
            chrono::Duration::seconds(i64::from(self.services.config.job_lock_duration_secs));
        self.in_instance(&instance_id, |ctx| {
            ctx.instance(&instance_id)?.ensure_active()?;
            let now = ctx.now();
            let stored = ctx
                .instance_mut(&instance_id)?
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::not_found("Job", job_id))?;
            if stored.is_locked(now) && stored.lock_owner.as_deref() != Some(owner.as_str()) {
                return Err(EngineError::invalid_state(job_id, "job is locked by another executor"));
            }
            stored.lock_owner = Some(owner);
            stored.lock_expiration = Some(now + lock_duration);
            Ok(stored.clone())
        })
        .await
    }

    /// Execute a job now. A behavior failure decrements the retries of the job,
    /// opens a `failedJob` incident when none are left, and is returned.
    #[instrument(skip(self))]
    pub async fn execute_job(&self, job_id: &str) -> Result<()> {
        let job = self.acquire_job(job_id).await?;
        let instance_id = job.process_instance_id.clone();
        let result = self
            .in_instance(&instance_id, |ctx| {
                ctx.instance(&instance_id)?.ensure_active()?;
                operations::execute_job(ctx, &instance_id, job_id)?;
                operations::run(ctx)
            })
            .await;
        match result {
            Err(err @ EngineError::ProcessEngine { .. }) => {
                self.record_job_failure(&job, &err.to_string()).await?;
                Err(err)
            }
            Err(err) => {
                self.release_job(&job).await;
                Err(err)
            }
            ok => ok,
        }
    }

    async fn release_job(&self, job: &Job) {
        let instance_id = job.process_instance_id.clone();
        let released = self
            .in_instance(&instance_id, |ctx| {
                if let Some(stored) = ctx.instance_mut(&instance_id)?.jobs.get_mut(&job.id) {
                    stored.unlock();
                }
                Ok(())
            })
            .await;
        if let Err(e) = released {
            debug!(job_id = %job.id, error = %e, "Job lock not released");
        }
    }

    async fn record_job_failure(&self, job: &Job, message: &str) -> Result<()> {
        let instance_id = job.process_instance_id.clone();
        self.in_instance(&instance_id, |ctx| {
            let now = ctx.now();
            let (retries, context) = {
                let Some(stored) = ctx.instance_mut(&instance_id)?.jobs.get_mut(&job.id) else {
                    return Ok(());
                };
                stored.retries = stored.retries.saturating_sub(1);
                stored.exception_message = Some(message.to_string());
                stored.unlock();
                (
                    stored.retries,
                    IncidentContext {
                        process_instance_id: instance_id.clone(),
                        execution_id: stored.execution_id.clone(),
                        activity_id: Some(stored.kind.activity_id().to_string()),
                        configuration: Some(stored.id.clone()),
                    },
                )
            };
            warn!(
                job_id = %job.id,
                process_instance_id = %instance_id,
                retries_left = retries,
                error = %message,
                "Job failed"
            );
            if retries == 0 {
                let handler = ctx.services().incidents.handler(FAILED_JOB);
                let incident_id = ctx.next_id();
                let incident = handler.handle_incident(
                    ctx.instance_mut(&instance_id)?,
                    &context,
                    Some(message),
                    incident_id,
                    now,
                );
                ctx.record(HistoryEvent::IncidentCreated(historic_incident(&incident)));
            }
            Ok(())
        })
        .await
    }

    /// Execute all due jobs of active instances concurrently.
    #[instrument(skip(self))]
    pub async fn run_due_jobs(&self) -> Result<JobRunReport> {
        let due = self
            .store
            .due_jobs(self.services.clock.now(), usize::MAX)
            .await?;
        let permits = Arc::new(Semaphore::new(self.services.config.job_executor_concurrency));
        let mut tasks = JoinSet::new();
        for job in due {
            let engine = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let mut result = engine.execute_job(&job.job_id).await;
                if matches!(&result, Err(e) if e.is_retryable()) {
                    result = engine.execute_job(&job.job_id).await;
                }
                (job.job_id, result)
            });
        }

        let mut report = JobRunReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (job_id, result) = joined
                .map_err(|e| EngineError::process_engine(format!("job task failed: {}", e)))?;
            match result {
                Ok(()) => report.succeeded.push(job_id),
                Err(EngineError::NotFound { .. }) => report.skipped.push(job_id),
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, "Due job failed");
                    report.failed.push(job_id);
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Due jobs executed"
        );
        Ok(report)
    }

    /// Change the retries of a job. Raising them from zero resolves the
    /// `failedJob` incident of the job.
    #[instrument(skip(self))]
    pub async fn set_job_retries(&self, job_id: &str, retries: u32) -> Result<()> {
        let job = self.find_job(job_id).await?;
        let instance_id = job.process_instance_id.clone();
        let definition_id = self.process_instance(&instance_id).await?.definition_id;
        let definition = self.definition_or_not_found(&definition_id)?;
        let context =
            self.operation_context(Some(instance_id.as_str()), Some(&*definition), None, None);
        self.in_instance(&instance_id, |ctx| {
            let now = ctx.now();
            let (previous, incident_context) = {
                let stored = ctx
                    .instance_mut(&instance_id)?
                    .jobs
                    .get_mut(job_id)
                    .ok_or_else(|| EngineError::not_found("Job", job_id))?;
                let previous = stored.retries;
                stored.retries = retries;
                (
                    previous,
                    IncidentContext {
                        process_instance_id: instance_id.clone(),
                        execution_id: stored.execution_id.clone(),
                        activity_id: Some(stored.kind.activity_id().to_string()),
                        configuration: Some(stored.id.clone()),
                    },
                )
            };
            if previous == 0 && retries > 0 {
                let handler = ctx.services().incidents.handler(FAILED_JOB);
                let resolved = handler.resolve_incident(ctx.instance_mut(&instance_id)?, &incident_context);
                for incident in resolved {
                    ctx.record(HistoryEvent::IncidentEnded {
                        id: incident.id,
                        end_time: now,
                        state: IncidentState::Resolved,
                    });
                }
            }
            let operation_id = ctx.next_id();
            for event in self.log_user_operation(
                &operation_id,
                operation_type::SET_JOB_RETRIES,
                history::ENTITY_TYPE_JOB,
                &context,
                vec![PropertyChange {
                    property: "retries".to_string(),
                    org_value: Some(previous.to_string()),
                    new_value: Some(retries.to_string()),
                }],
            ) {
                ctx.record(event);
            }
            Ok(())
        })
        .await
    }

    /// Open a custom incident on an execution.
    #[instrument(skip(self, message))]
    pub async fn create_incident(
        &self,
        process_instance_id: &str,
        execution_id: &str,
        incident_type: &str,
        configuration: Option<&str>,
        message: Option<&str>,
    ) -> Result<Incident> {
        self.in_instance(process_instance_id, |ctx| {
            let activity_id = ctx
                .instance(process_instance_id)?
                .tree
                .require(execution_id)?
                .activity_id
                .clone();
            let context = IncidentContext {
                process_instance_id: process_instance_id.to_string(),
                execution_id: execution_id.to_string(),
                activity_id,
                configuration: configuration.map(str::to_string),
            };
            let handler = ctx.services().incidents.handler(incident_type);
            let incident_id = ctx.next_id();
            let now = ctx.now();
            let incident = handler.handle_incident(
                ctx.instance_mut(process_instance_id)?,
                &context,
                message,
                incident_id,
                now,
            );
            ctx.record(HistoryEvent::IncidentCreated(historic_incident(&incident)));
            Ok(incident)
        })
        .await
    }

    /// Resolve a custom incident.
    #[instrument(skip(self))]
    pub async fn resolve_incident(&self, incident_id: &str) -> Result<()> {
        let incident = self
            .store
            .incidents(None)
            .await?
            .into_iter()
            .find(|i| i.id == incident_id)
            .ok_or_else(|| EngineError::not_found("Incident", incident_id))?;
        if incident.incident_type == FAILED_JOB {
            return Err(EngineError::bad_request(format!(
                "Cannot resolve an incident of type {}",
                FAILED_JOB
            )));
        }
        let instance_id = incident.process_instance_id.clone();
        self.in_instance(&instance_id, |ctx| {
            let now = ctx.now();
            let handler = ctx.services().incidents.handler(&incident.incident_type);
            let context = IncidentContext {
                process_instance_id: instance_id.clone(),
                execution_id: incident.execution_id.clone(),
                activity_id: incident.activity_id.clone(),
                configuration: incident.configuration.clone(),
            };
            for resolved in handler.resolve_incident(ctx.instance_mut(&instance_id)?, &context) {
                ctx.record(HistoryEvent::IncidentEnded {
                    id: resolved.id,
                    end_time: now,
                    state: IncidentState::Resolved,
                });
            }
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Modification
    // ========================================================================

    /// Modify one process instance.
    #[instrument(skip(self, modification), fields(process_instance_id = %modification.process_instance_id))]
    pub async fn modify(&self, modification: ProcessInstanceModification) -> Result<()> {
        modification.validate()?;
        let instance_id = modification.process_instance_id.clone();
        self.in_instance(&instance_id, |ctx| {
            let definition = ctx.definition_of(&instance_id)?;
            modification::execute(ctx, &modification)?;
            let context = self.operation_context(
                Some(instance_id.as_str()),
                Some(&*definition),
                None,
                modification.annotation.as_deref(),
            );
            let operation_id = ctx.next_id();
            for event in self.log_user_operation(
                &operation_id,
                operation_type::MODIFY_PROCESS_INSTANCE,
                history::ENTITY_TYPE_PROCESS_INSTANCE,
                &context,
                vec![PropertyChange::new("async", false)],
            ) {
                ctx.record(event);
            }
            Ok(())
        })
        .await
    }

    async fn modify_one(&self, bulk: &BulkModification, process_instance_id: &str) -> Result<()> {
        let modification = bulk.for_instance(process_instance_id);
        self.in_instance(process_instance_id, |ctx| {
            let definition_id = ctx.instance(process_instance_id)?.definition_id.clone();
            if definition_id != bulk.process_definition_id {
                return Err(EngineError::bad_request(format!(
                    "Process instance '{}' cannot be modified. The process instance belongs to process definition '{}' and not to '{}'",
                    process_instance_id, definition_id, bulk.process_definition_id
                )));
            }
            modification::execute(ctx, &modification)
        })
        .await
    }

    /// Apply the same modification to many instances, each in its own unit.
    #[instrument(skip(self, bulk), fields(process_definition_id = %bulk.process_definition_id, instances = bulk.process_instance_ids.len()))]
    pub async fn modify_many(&self, bulk: BulkModification) -> Result<BatchReport> {
        bulk.validate()?;
        let definition = self.definition_or_not_found(&bulk.process_definition_id)?;
        let context =
            self.operation_context(None, Some(&*definition), None, bulk.annotation.as_deref());
        let operation_id = self.services.ids.next_id();
        let audit = self.log_user_operation(
            &operation_id,
            operation_type::MODIFY_PROCESS_INSTANCE,
            history::ENTITY_TYPE_PROCESS_INSTANCE,
            &context,
            vec![
                PropertyChange::new("nrOfInstances", bulk.process_instance_ids.len()),
                PropertyChange::new("async", false),
            ],
        );
        self.store
            .commit(UnitOfWork::history(self.recorded(audit)))
            .await?;

        let mut report = BatchReport::default();
        for id in &bulk.process_instance_ids {
            match self.modify_one(&bulk, id).await {
                Ok(()) => report.succeeded.push(id.clone()),
                Err(e) => report.failures.push(failure(id, &e)),
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            "Bulk modification finished"
        );
        Ok(report)
    }

    /// Create a batch applying the modification to many instances.
    #[instrument(skip(self, bulk), fields(process_definition_id = %bulk.process_definition_id, instances = bulk.process_instance_ids.len()))]
    pub async fn modify_async(&self, bulk: BulkModification) -> Result<Batch> {
        bulk.validate()?;
        let definition = self.definition_or_not_found(&bulk.process_definition_id)?;
        let configuration = serde_json::to_value(&bulk)?;
        self.create_batch(
            BatchType::InstanceModification,
            configuration,
            bulk.process_instance_ids.clone(),
            &definition,
            operation_type::MODIFY_PROCESS_INSTANCE,
            bulk.annotation.as_deref(),
        )
        .await
    }

    // ========================================================================
    // Restart
    // ========================================================================

    async fn restart_source(&self, request: &RestartProcessInstances, historic_id: &str) -> Result<RestartSource> {
        let historic = self
            .store
            .historic_process_instance(historic_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Historic process instance", historic_id))?;
        request.check_historic(&historic)?;
        let variables = self.store.historic_variable_instances(historic_id).await?;
        let details = self.store.historic_variable_details(historic_id).await?;
        Ok(RestartSource::resolve(request, historic, &variables, &details))
    }

    async fn restart_from(&self, request: &RestartProcessInstances, source: &RestartSource) -> Result<String> {
        let hierarchy = restart::new_hierarchy(&self.services, request, source)?;
        self.run_unit(hierarchy, |ctx| restart::restart_instance(ctx, request, source))
            .await
    }

    async fn restart_one(&self, request: &RestartProcessInstances, historic_id: &str) -> Result<String> {
        let source = self.restart_source(request, historic_id).await?;
        self.restart_from(request, &source).await
    }

    /// Restart finished instances, each in its own unit.
    #[instrument(skip(self, request), fields(process_definition_id = %request.process_definition_id, instances = request.process_instance_ids.len()))]
    pub async fn restart(&self, request: RestartProcessInstances) -> Result<RestartReport> {
        request.validate()?;
        let definition = self.definition_or_not_found(&request.process_definition_id)?;
        let mut sources = Vec::with_capacity(request.process_instance_ids.len());
        for id in &request.process_instance_ids {
            sources.push(self.restart_source(&request, id).await?);
        }

        let context =
            self.operation_context(None, Some(&*definition), None, request.annotation.as_deref());
        let operation_id = self.services.ids.next_id();
        let audit = self.log_user_operation(
            &operation_id,
            operation_type::RESTART_PROCESS_INSTANCE,
            history::ENTITY_TYPE_PROCESS_INSTANCE,
            &context,
            vec![
                PropertyChange::new("nrOfInstances", sources.len()),
                PropertyChange::new("async", false),
            ],
        );
        self.store
            .commit(UnitOfWork::history(self.recorded(audit)))
            .await?;

        let mut report = RestartReport::default();
        for source in &sources {
            match self.restart_from(&request, source).await {
                Ok(id) => report.restarted.push(RestartedInstance {
                    restarted_from: source.historic.id.clone(),
                    process_instance_id: id,
                }),
                Err(e) => report.failures.push(failure(&source.historic.id, &e)),
            }
        }
        info!(
            restarted = report.restarted.len(),
            failed = report.failures.len(),
            "Restart finished"
        );
        Ok(report)
    }

    /// Create a batch restarting finished instances.
    #[instrument(skip(self, request), fields(process_definition_id = %request.process_definition_id, instances = request.process_instance_ids.len()))]
    pub async fn restart_async(&self, request: RestartProcessInstances) -> Result<Batch> {
        request.validate()?;
        let definition = self.definition_or_not_found(&request.process_definition_id)?;
        for id in &request.process_instance_ids {
            self.restart_source(&request, id).await?;
        }
        let configuration = serde_json::to_value(&request)?;
        self.create_batch(
            BatchType::InstanceRestart,
            configuration,
            request.process_instance_ids.clone(),
            &definition,
            operation_type::RESTART_PROCESS_INSTANCE,
            request.annotation.as_deref(),
        )
        .await
    }

    // ========================================================================
    // Batches
    // ========================================================================

    async fn create_batch(
        &self,
        batch_type: BatchType,
        configuration: Value,
        instance_ids: Vec<String>,
        definition: &ProcessDefinition,
        operation: &str,
        annotation: Option<&str>,
    ) -> Result<Batch> {
        let operation_id = self.services.ids.next_id();
        let count = instance_ids.len();
        let (batch, seed) = Batch::new(
            self.services.ids.next_id(),
            batch_type,
            configuration,
            instance_ids,
            self.services.config.batch_jobs_per_seed,
            self.services.config.invocations_per_batch_job,
            operation_id.clone(),
            self.user_id.clone(),
            self.services.ids.next_id(),
            self.services.clock.now(),
        )?;
        let context = self.operation_context(None, Some(definition), Some(&batch.id), annotation);
        let audit = self.log_user_operation(
            &operation_id,
            operation,
            history::ENTITY_TYPE_PROCESS_INSTANCE,
            &context,
            vec![
                PropertyChange::new("nrOfInstances", count),
                PropertyChange::new("async", true),
            ],
        );
        self.store
            .commit(UnitOfWork {
                history: self.recorded(audit),
                batches: vec![batch.clone()],
                batch_jobs_created: vec![seed],
                ..Default::default()
            })
            .await?;
        info!(
            batch_id = %batch.id,
            batch_type = batch.batch_type.as_str(),
            total_jobs = batch.total_jobs,
            "Batch created"
        );
        Ok(batch)
    }

    async fn require_batch(&self, id: &str) -> Result<Batch> {
        self.store
            .batch(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Batch", id))
    }

    async fn run_seed_job(&self, job: &BatchJob) -> Result<()> {
        let mut batch = self.require_batch(&job.batch_id).await?;
        let ids = self.services.ids.clone();
        let (mut created, next_seed) = batch.run_seed(|| ids.next_id(), self.services.clock.now());
        debug!(
            batch_id = %batch.id,
            created = created.len(),
            reseeded = next_seed.is_some(),
            "Seed job executed"
        );
        created.extend(next_seed);
        self.store
            .commit(UnitOfWork {
                batches: vec![batch],
                batch_jobs_created: created,
                batch_jobs_deleted: vec![job.id.clone()],
                ..Default::default()
            })
            .await
    }

    async fn run_execution_job(&self, batch_id: &str, instance_ids: &[String]) -> Result<Vec<InstanceFailure>> {
        let batch = self.require_batch(batch_id).await?;
        let mut failures = Vec::new();
        match batch.batch_type {
            BatchType::InstanceModification => {
                let bulk: BulkModification = serde_json::from_value(batch.configuration)?;
                for id in instance_ids {
                    if let Err(e) = self.modify_one(&bulk, id).await {
                        failures.push(failure(id, &e));
                    }
                }
            }
            BatchType::InstanceRestart => {
                let request: RestartProcessInstances = serde_json::from_value(batch.configuration)?;
                for id in instance_ids {
                    if let Err(e) = self.restart_one(&request, id).await {
                        failures.push(failure(id, &e));
                    }
                }
            }
        }
        Ok(failures)
    }

    async fn finish_execution_job(&self, job: &BatchJob, failures: Vec<InstanceFailure>) -> Result<()> {
        let mut batch = self.require_batch(&job.batch_id).await?;
        for f in &failures {
            warn!(
                batch_id = %batch.id,
                process_instance_id = %f.process_instance_id,
                error = %f.message,
                "Batch operation failed for instance"
            );
        }
        batch.complete_execution_job(failures, self.services.clock.now());
        if batch.is_completed() {
            info!(batch_id = %batch.id, failures = batch.failures.len(), "Batch completed");
        }
        self.store
            .commit(UnitOfWork {
                batches: vec![batch],
                batch_jobs_deleted: vec![job.id.clone()],
                ..Default::default()
            })
            .await
    }

    /// Run pending batch jobs until none are left. Execution jobs run
    /// concurrently. Returns the number of jobs run.
    #[instrument(skip(self))]
    pub async fn run_batch_jobs(&self) -> Result<usize> {
        let permits = Arc::new(Semaphore::new(self.services.config.job_executor_concurrency));
        let mut executed = 0;
        loop {
            let jobs = self.store.batch_jobs(None).await?;
            if jobs.is_empty() {
                return Ok(executed);
            }
            let mut tasks = JoinSet::new();
            for job in jobs {
                executed += 1;
                let ids = match &job.kind {
                    BatchJobKind::Seed => {
                        self.run_seed_job(&job).await?;
                        continue;
                    }
                    BatchJobKind::Execution {
                        process_instance_ids,
                    } => process_instance_ids.clone(),
                };
                let engine = self.clone();
                let permits = permits.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let failures = engine.run_execution_job(&job.batch_id, &ids).await;
                    (job, failures)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (job, failures) = joined
                    .map_err(|e| EngineError::process_engine(format!("batch job task failed: {}", e)))?;
                self.finish_execution_job(&job, failures?).await?;
            }
        }
    }

    // ========================================================================
    // Cancellation and suspension
    // ========================================================================

    /// Cancel a process instance or one of its activity instances.
    ///
    /// `external` marks an outside deletion: it cascades to the whole call
    /// hierarchy. Deleting a suspended process instance is allowed.
    ///
    /// Fails with `InvalidState` when it would remove an execution whose job an
    /// executor holds; see [`Self::cancel_preempting`].
    #[instrument(skip(self, reason), fields(process_instance_id = %target.process_instance_id()))]
    pub async fn cancel(&self, target: CancelTarget, reason: &str, external: bool) -> Result<()> {
        self.cancel_target(target, reason, external, false).await
    }

    /// Like [`Self::cancel`], but also removes executions whose asynchronous
    /// continuation is in flight.
    #[instrument(skip(self, reason), fields(process_instance_id = %target.process_instance_id()))]
    pub async fn cancel_preempting(&self, target: CancelTarget, reason: &str, external: bool) -> Result<()> {
        self.cancel_target(target, reason, external, true).await
    }

    async fn cancel_target(
        &self,
        target: CancelTarget,
        reason: &str,
        external: bool,
        allow_preemption: bool,
    ) -> Result<()> {
        let source = CancellationSource::from_external(external);
        let instance_id = target.process_instance_id().to_string();
        self.in_instance(&instance_id, |ctx| {
            ctx.protect_locked_jobs();
            if allow_preemption {
                ctx.allow_preemption();
            }
            match &target {
                CancelTarget::ProcessInstance { .. } => {
                    let definition = ctx.definition_of(&instance_id)?;
                    cancellation::cancel_process_instance(ctx, &instance_id, reason, source)?;
                    let context =
                        self.operation_context(Some(instance_id.as_str()), Some(&*definition), None, None);
                    let operation_id = ctx.next_id();
                    for event in self.log_user_operation(
                        &operation_id,
                        operation_type::DELETE,
                        history::ENTITY_TYPE_PROCESS_INSTANCE,
                        &context,
                        vec![PropertyChange::new("deleteReason", reason)],
                    ) {
                        ctx.record(event);
                    }
                }
                CancelTarget::ActivityInstance {
                    activity_instance_id,
                    ..
                } => {
                    ctx.instance(&instance_id)?.ensure_active()?;
                    cancellation::cancel_activity_instance(
                        ctx,
                        &instance_id,
                        activity_instance_id,
                        reason,
                        source,
                        false,
                    )?;
                }
            }
            operations::run(ctx)
        })
        .await
    }

    /// Suspend process instances.
    #[instrument(skip(self, process_instance_ids), fields(instances = process_instance_ids.len()))]
    pub async fn suspend_process_instances(&self, process_instance_ids: &[String]) -> Result<BatchReport> {
        self.update_suspension(process_instance_ids, true).await
    }

    /// Activate suspended process instances.
    #[instrument(skip(self, process_instance_ids), fields(instances = process_instance_ids.len()))]
    pub async fn activate_process_instances(&self, process_instance_ids: &[String]) -> Result<BatchReport> {
        self.update_suspension(process_instance_ids, false).await
    }

    async fn update_suspension(&self, process_instance_ids: &[String], suspend: bool) -> Result<BatchReport> {
        if process_instance_ids.is_empty() {
            return Err(EngineError::bad_request("Process instance ids is empty"));
        }
        if process_instance_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::bad_request(
                "Process instance ids cannot contain null",
            ));
        }
        let (operation, state, value) = if suspend {
            (operation_type::SUSPEND, ProcessInstanceState::Suspended, "suspended")
        } else {
            (operation_type::ACTIVATE, ProcessInstanceState::Active, "active")
        };

        let operation_id = self.services.ids.next_id();
        let audit = self.log_user_operation(
            &operation_id,
            operation,
            history::ENTITY_TYPE_PROCESS_INSTANCE,
            &self.operation_context(None, None, None, None),
            vec![PropertyChange::new("suspensionState", value)],
        );
        self.store
            .commit(UnitOfWork::history(self.recorded(audit)))
            .await?;

        let mut report = BatchReport::default();
        for id in process_instance_ids {
            let result = self
                .in_instance(id, |ctx| {
                    ctx.instance_mut(id)?.suspended = suspend;
                    ctx.record(HistoryEvent::ProcessInstanceStateChanged {
                        process_instance_id: id.clone(),
                        state,
                    });
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => report.succeeded.push(id.clone()),
                Err(e) => report.failures.push(failure(id, &e)),
            }
        }
        info!(
            suspension_state = value,
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            "Suspension state updated"
        );
        Ok(report)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Running process instance by id.
    pub async fn process_instance(&self, id: &str) -> Result<ProcessInstance> {
        self.load(id).await?.require(id).cloned()
    }

    /// Running process instances.
    pub async fn process_instances(&self, query: &ProcessInstanceQuery) -> Result<Vec<ProcessInstance>> {
        self.store.process_instances(query).await
    }

    /// Activity instance tree of a running instance.
    pub async fn activity_instance_tree(&self, process_instance_id: &str) -> Result<ActivityInstance> {
        let instance = self.process_instance(process_instance_id).await?;
        Ok(projection::project(&instance))
    }

    /// Executions of a running instance in tree order.
    pub async fn executions(&self, process_instance_id: &str) -> Result<Vec<Execution>> {
        let instance = self.process_instance(process_instance_id).await?;
        Ok(instance.tree.iter().into_iter().cloned().collect())
    }

    /// Process variables of a running instance.
    pub async fn variables(&self, process_instance_id: &str) -> Result<Variables> {
        let instance = self.process_instance(process_instance_id).await?;
        Ok(variables::visible(&instance.tree, process_instance_id))
    }

    /// Open user tasks.
    pub async fn tasks(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        self.store.tasks(query).await
    }

    /// Jobs.
    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        self.store.jobs(query).await
    }

    /// Open incidents.
    pub async fn incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<Incident>> {
        self.store.incidents(process_instance_id).await
    }

    /// Batch by id.
    pub async fn batch(&self, id: &str) -> Result<Batch> {
        self.require_batch(id).await
    }

    /// All batches.
    pub async fn batches(&self) -> Result<Vec<Batch>> {
        self.store.batches().await
    }

    /// Pending batch jobs.
    pub async fn batch_jobs(&self, batch_id: Option<&str>) -> Result<Vec<BatchJob>> {
        self.store.batch_jobs(batch_id).await
    }

    /// Historic process instance by id.
    pub async fn historic_process_instance(&self, id: &str) -> Result<HistoricProcessInstance> {
        self.store
            .historic_process_instance(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Historic process instance", id))
    }

    /// Historic process instances.
    pub async fn historic_process_instances(
        &self,
        query: &HistoricProcessInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>> {
        self.store.historic_process_instances(query).await
    }

    /// Historic activity instances of an instance.
    pub async fn historic_activity_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricActivityInstance>> {
        self.store.historic_activity_instances(process_instance_id).await
    }

    /// Latest variable values of an instance.
    pub async fn historic_variable_instances(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableInstance>> {
        self.store.historic_variable_instances(process_instance_id).await
    }

    /// Variable writes of an instance.
    pub async fn historic_variable_details(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableDetail>> {
        self.store.historic_variable_details(process_instance_id).await
    }

    /// Historic incidents.
    pub async fn historic_incidents(&self, process_instance_id: Option<&str>) -> Result<Vec<HistoricIncident>> {
        self.store.historic_incidents(process_instance_id).await
    }

    /// User operation log.
    pub async fn user_operation_log(&self, query: &UserOperationLogQuery) -> Result<Vec<UserOperationLogEntry>> {
        self.store.user_operations(query).await
    }
}

fn start_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: &str,
    definition: &ProcessDefinition,
    request: &StartProcessInstance,
) -> Result<()> {
    if request.instructions.is_empty() {
        let initial = definition
            .initial_activity(None)
            .ok_or_else(|| {
                EngineError::process_engine(format!(
                    "process '{}' has no none start event",
                    definition.id()
                ))
            })?
            .id
            .clone();
        operations::begin_instance(ctx, instance_id, Some(initial.clone()), None)?;
        ctx.set_variables(instance_id, instance_id, &request.variables, false, true)?;
        operations::position_at(ctx, instance_id, instance_id, &initial)?;
        operations::schedule_start(ctx, instance_id, instance_id, &initial, false);
        return operations::run(ctx);
    }

    operations::begin_instance(
        ctx,
        instance_id,
        instantiation::unique_start_activity(&request.instructions),
        None,
    )?;
    ctx.set_variables(instance_id, instance_id, &request.variables, false, true)?;
    for instruction in &request.instructions {
        if !ctx.is_live(instance_id) {
            break;
        }
        instantiation::apply(ctx, instance_id, instruction, StartOptions::default())?;
    }
    Ok(())
}

fn failure(process_instance_id: &str, error: &EngineError) -> InstanceFailure {
    InstanceFailure {
        process_instance_id: process_instance_id.to_string(),
        error_code: error.error_code().to_string(),
        message: error.to_string(),
    }
}

fn historic_incident(incident: &Incident) -> HistoricIncident {
    HistoricIncident {
        id: incident.id.clone(),
        incident_type: incident.incident_type.clone(),
        configuration: incident.configuration.clone(),
        message: incident.message.clone(),
        process_instance_id: incident.process_instance_id.clone(),
        execution_id: incident.execution_id.clone(),
        activity_id: incident.activity_id.clone(),
        created_at: incident.created_at,
        end_time: None,
        state: IncidentState::Open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[test]
    fn test_builder_requires_store() {
        let err = ProcessEngine::builder().build().unwrap_err();
        assert!(err.to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let config = EngineConfig {
            job_executor_concurrency: 0,
            ..Default::default()
        };
        let err = ProcessEngine::builder()
            .store(Arc::new(MemoryStore::new()))
            .config(config)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_start_request_serde_shape() {
        let request = StartProcessInstance::by_key("invoice")
            .business_key("bk-1")
            .variable("amount", 10)
            .start_before_activity("approve");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["process_definition"]["by"], "key");
        assert_eq!(value["instructions"][0]["type"], "start_before_activity");
        let back: StartProcessInstance = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_failure_keeps_error_code() {
        let f = failure("pi-1", &EngineError::not_found("Activity instance", "a:1"));
        assert_eq!(f.error_code, "NOT_FOUND");
        assert!(f.message.contains("a:1"));
    }
}
