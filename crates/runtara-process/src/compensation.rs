// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compensation tracking.
//!
//! When an activity with a compensation handler completes, a compensation
//! subscription is armed on its enclosing scope execution. If that scope is later
//! cancelled, the armed subscriptions are not silently dropped: they are handed to
//! the configured [`CompensationHandler`] in reverse order of completion (the last
//! completed activity is compensated first).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::instance::{EventSubscription, ProcessInstance, SubscriptionKind};

/// Compensation state of an armed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationState {
    /// Activity completed, compensation may be needed.
    Pending,
    /// Handed to the compensation handler.
    Triggered,
    /// Compensation completed successfully.
    Completed,
    /// Compensation failed.
    Failed,
}

impl CompensationState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a state from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "triggered" => Some(Self::Triggered),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Armed compensation of a scope that is being removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCompensation {
    /// Process instance owning the scope.
    pub process_instance_id: String,
    /// Removed scope activity, `None` for the process level.
    pub scope_activity_id: Option<String>,
    /// Activity instance of the removed scope.
    pub scope_instance_id: Option<String>,
    /// Why the scope was removed.
    pub reason: String,
    /// Armed subscriptions, last completed first. States are `Triggered`.
    pub subscriptions: Vec<EventSubscription>,
}

/// Receives armed compensation of removed scopes.
pub trait CompensationHandler: Send + Sync {
    /// Called once per removed scope with at least one armed subscription.
    fn compensate(&self, pending: &PendingCompensation);
}

/// Default handler: records the compensation in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCompensationHandler;

impl CompensationHandler for TracingCompensationHandler {
    fn compensate(&self, pending: &PendingCompensation) {
        info!(
            process_instance_id = %pending.process_instance_id,
            scope = pending.scope_activity_id.as_deref().unwrap_or("<process>"),
            reason = %pending.reason,
            count = pending.subscriptions.len(),
            "Triggering compensation"
        );
        for sub in &pending.subscriptions {
            debug!(handler = %sub.activity_id, subscription_id = %sub.id, "Compensation handler scheduled");
        }
    }
}

/// Handler that keeps every request, for inspection by callers.
#[derive(Debug, Default)]
pub struct CollectingCompensationHandler {
    received: Mutex<Vec<PendingCompensation>>,
}

impl CollectingCompensationHandler {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far.
    pub fn received(&self) -> Vec<PendingCompensation> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CompensationHandler for CollectingCompensationHandler {
    fn compensate(&self, pending: &PendingCompensation) {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pending.clone());
    }
}

/// Armed compensation subscriptions owned by `execution_ids`, last created first,
/// marked as triggered.
pub fn collect_armed(instance: &ProcessInstance, execution_ids: &[String]) -> Vec<EventSubscription> {
    let mut armed: Vec<EventSubscription> = instance
        .subscriptions
        .values()
        .filter(|s| execution_ids.iter().any(|e| e == &s.execution_id))
        .filter(|s| {
            matches!(
                s.kind,
                SubscriptionKind::Compensate {
                    state: CompensationState::Pending,
                    ..
                }
            )
        })
        .cloned()
        .collect();
    armed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    for sub in &mut armed {
        if let SubscriptionKind::Compensate { state, .. } = &mut sub.kind {
            *state = CompensationState::Triggered;
        }
    }
    armed
}
