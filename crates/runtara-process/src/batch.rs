// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batches.
//!
//! Asynchronous bulk operations are stored as a [`Batch`] plus batch jobs. The
//! seed job fans out up to `batch_jobs_per_seed` execution jobs per run, each
//! covering `invocations_per_batch_job` process instances, and re-creates itself
//! while instances remain. Every instance of an execution job runs in its own
//! unit of work; a failing instance is recorded on the batch and does not affect
//! the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Kind of bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchType {
    /// Process instance modification.
    InstanceModification,
    /// Restart of historic process instances.
    InstanceRestart,
}

impl BatchType {
    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceModification => "instance-modification",
            Self::InstanceRestart => "instance-restart",
        }
    }
}

/// Failure of one process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFailure {
    /// The instance the operation failed for.
    pub process_instance_id: String,
    /// Error code of the failure.
    pub error_code: String,
    /// Error message.
    pub message: String,
}

/// Outcome of a synchronous bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Instances the operation succeeded for.
    pub succeeded: Vec<String>,
    /// Instances the operation failed for.
    pub failures: Vec<InstanceFailure>,
}

impl BatchReport {
    /// Whether every instance succeeded.
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A stored bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    pub id: String,
    /// Operation kind.
    pub batch_type: BatchType,
    /// Serialized request.
    pub configuration: Value,
    /// Process instance ids to process, in order.
    pub instance_ids: Vec<String>,
    /// Number of execution jobs the batch needs.
    pub total_jobs: u32,
    /// Execution jobs created so far.
    pub jobs_created: u32,
    /// Execution jobs finished so far.
    pub jobs_completed: u32,
    /// Execution jobs a seed job creates per run.
    pub batch_jobs_per_seed: u32,
    /// Instances per execution job.
    pub invocations_per_batch_job: u32,
    /// Per-instance failures.
    pub failures: Vec<InstanceFailure>,
    /// Operation id shared with the audit entries.
    pub operation_id: String,
    /// Creating user.
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a batch job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchJobKind {
    /// Creates execution jobs.
    Seed,
    /// Runs the operation for a slice of instances.
    Execution {
        /// Instances of this job.
        process_instance_ids: Vec<String>,
    },
}

/// A job belonging to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Job id.
    pub id: String,
    /// Owning batch.
    pub batch_id: String,
    /// Job kind.
    pub kind: BatchJobKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// New batch with its seed job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        batch_type: BatchType,
        configuration: Value,
        instance_ids: Vec<String>,
        batch_jobs_per_seed: u32,
        invocations_per_batch_job: u32,
        operation_id: String,
        created_by: Option<String>,
        seed_job_id: String,
        now: DateTime<Utc>,
    ) -> Result<(Self, BatchJob)> {
        if batch_jobs_per_seed == 0 || invocations_per_batch_job == 0 {
            return Err(EngineError::bad_request(
                "batch job sizes must be positive",
            ));
        }
        let total_jobs = instance_ids
            .len()
            .div_ceil(invocations_per_batch_job as usize) as u32;
        let batch = Self {
            id,
            batch_type,
            configuration,
            instance_ids,
            total_jobs,
            jobs_created: 0,
            jobs_completed: 0,
            batch_jobs_per_seed,
            invocations_per_batch_job,
            failures: Vec::new(),
            operation_id,
            created_by,
            created_at: now,
            completed_at: None,
        };
        let seed = batch.job(seed_job_id, BatchJobKind::Seed, now);
        Ok((batch, seed))
    }

    fn job(&self, id: String, kind: BatchJobKind, now: DateTime<Utc>) -> BatchJob {
        BatchJob {
            id,
            batch_id: self.id.clone(),
            kind,
            created_at: now,
        }
    }

    /// Whether all execution jobs finished.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Run the seed job: create the next execution jobs and, while instances
    /// remain, the next seed job.
    pub fn run_seed(
        &mut self,
        mut next_id: impl FnMut() -> String,
        now: DateTime<Utc>,
    ) -> (Vec<BatchJob>, Option<BatchJob>) {
        let per_job = self.invocations_per_batch_job as usize;
        let mut created = Vec::new();
        while self.jobs_created < self.total_jobs
            && created.len() < self.batch_jobs_per_seed as usize
        {
            let start = self.jobs_created as usize * per_job;
            let end = (start + per_job).min(self.instance_ids.len());
            let ids = self.instance_ids[start..end].to_vec();
            created.push(self.job(
                next_id(),
                BatchJobKind::Execution {
                    process_instance_ids: ids,
                },
                now,
            ));
            self.jobs_created += 1;
        }
        let next_seed = (self.jobs_created < self.total_jobs)
            .then(|| self.job(next_id(), BatchJobKind::Seed, now));
        if self.total_jobs == 0 {
            self.completed_at = Some(now);
        }
        (created, next_seed)
    }

    /// Record the outcome of an execution job.
    pub fn complete_execution_job(&mut self, failures: Vec<InstanceFailure>, now: DateTime<Utc>) {
        self.failures.extend(failures);
        self.jobs_completed += 1;
        if self.jobs_completed >= self.total_jobs {
            self.completed_at = Some(now);
        }
    }
}
