// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User code hooks: execution listeners, service task handlers and condition
//! evaluation.
//!
//! Hooks see a [`DelegateExecution`]: a snapshot of the visible variables plus a
//! write buffer. Writes are applied to the execution tree (and recorded in
//! history) after the hook returns, in the order they were made.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::definition::{Condition, ListenerEvent};
use crate::error::{EngineError, Result};
use crate::variables::{self, Variables};

/// A buffered variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableWrite {
    /// Variable name.
    pub name: String,
    /// New value.
    pub value: Value,
    /// Write to the execution itself instead of resolving the scope.
    pub local: bool,
}

/// Execution handle passed to listeners and service task handlers.
#[derive(Debug, Clone)]
pub struct DelegateExecution {
    /// Process instance id.
    pub process_instance_id: String,
    /// Execution id.
    pub execution_id: String,
    /// Business key of the process instance.
    pub business_key: Option<String>,
    /// Current activity.
    pub activity_id: Option<String>,
    /// Current activity instance.
    pub activity_instance_id: Option<String>,
    /// Listener event, `None` for service task handlers.
    pub event: Option<ListenerEvent>,
    visible: Variables,
    writes: Vec<VariableWrite>,
}

impl DelegateExecution {
    pub(crate) fn new(
        process_instance_id: &str,
        execution_id: &str,
        business_key: Option<String>,
        activity_id: Option<String>,
        activity_instance_id: Option<String>,
        event: Option<ListenerEvent>,
        visible: Variables,
    ) -> Self {
        Self {
            process_instance_id: process_instance_id.to_string(),
            execution_id: execution_id.to_string(),
            business_key,
            activity_id,
            activity_instance_id,
            event,
            visible,
            writes: Vec::new(),
        }
    }

    /// Value of a variable, including writes made through this handle.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.name == name)
            .map(|w| &w.value)
            .or_else(|| self.visible.get(name))
    }

    /// All visible variables, including writes made through this handle.
    pub fn variables(&self) -> Variables {
        let mut out = self.visible.clone();
        for write in &self.writes {
            out.insert(write.name.clone(), write.value.clone());
        }
        out
    }

    /// Write a variable with scope resolution.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.writes.push(VariableWrite {
            name: name.into(),
            value: value.into(),
            local: false,
        });
    }

    /// Write a variable on this execution.
    pub fn set_variable_local(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.writes.push(VariableWrite {
            name: name.into(),
            value: value.into(),
            local: true,
        });
    }

    pub(crate) fn into_writes(self) -> Vec<VariableWrite> {
        self.writes
    }
}

/// Listener notified on activity/process start and end and on transition take.
pub trait ExecutionListener: Send + Sync {
    /// React to the event. Errors abort the unit of work.
    fn notify(&self, execution: &mut DelegateExecution) -> anyhow::Result<()>;
}

impl<F> ExecutionListener for F
where
    F: Fn(&mut DelegateExecution) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, execution: &mut DelegateExecution) -> anyhow::Result<()> {
        self(execution)
    }
}

/// Behavior of a service task.
pub trait ServiceTaskHandler: Send + Sync {
    /// Run the task. Errors abort the unit of work, or fail the job for async tasks.
    fn execute(&self, execution: &mut DelegateExecution) -> anyhow::Result<()>;
}

impl<F> ServiceTaskHandler for F
where
    F: Fn(&mut DelegateExecution) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, execution: &mut DelegateExecution) -> anyhow::Result<()> {
        self(execution)
    }
}

/// Evaluates [`Condition::Expression`] guards.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `expression` against the visible variables.
    fn evaluate(&self, expression: &str, variables: &Variables) -> anyhow::Result<bool>;
}

/// Evaluator for `name` (truthy) and `!name` (falsy) expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableConditionEvaluator;

impl ConditionEvaluator for VariableConditionEvaluator {
    fn evaluate(&self, expression: &str, variables: &Variables) -> anyhow::Result<bool> {
        let expression = expression.trim();
        let expression = expression
            .strip_prefix("${")
            .and_then(|e| e.strip_suffix('}'))
            .unwrap_or(expression)
            .trim();
        let (negated, name) = match expression.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expression),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            anyhow::bail!("unsupported expression '{}'", expression);
        }
        let value = variables.get(name).is_some_and(variables::is_truthy);
        Ok(value != negated)
    }
}

/// Evaluate a flow guard.
pub fn evaluate_condition(
    condition: &Condition,
    variables: &Variables,
    evaluator: &dyn ConditionEvaluator,
) -> Result<bool> {
    match condition {
        Condition::VariableEquals { name, value } => Ok(variables.get(name) == Some(value)),
        Condition::VariableTruthy { name } => {
            Ok(variables.get(name).is_some_and(variables::is_truthy))
        }
        Condition::Expression { expression } => evaluator
            .evaluate(expression, variables)
            .map_err(|e| {
                EngineError::process_engine(format!(
                    "condition '{}' could not be evaluated: {}",
                    expression, e
                ))
            }),
    }
}

/// Named listeners and service task handlers.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    listeners: HashMap<String, Arc<dyn ExecutionListener>>,
    handlers: HashMap<String, Arc<dyn ServiceTaskHandler>>,
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut listeners: Vec<&String> = self.listeners.keys().collect();
        listeners.sort();
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("DelegateRegistry")
            .field("listeners", &listeners)
            .field("handlers", &handlers)
            .finish()
    }
}

impl DelegateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener under `name`.
    pub fn register_listener(&mut self, name: &str, listener: Arc<dyn ExecutionListener>) {
        self.listeners.insert(name.to_string(), listener);
    }

    /// Register a service task handler under `name`.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn ServiceTaskHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Look up a listener.
    pub fn listener(&self, name: &str) -> Result<Arc<dyn ExecutionListener>> {
        self.listeners
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::process_engine(format!("unknown listener '{}'", name)))
    }

    /// Look up a service task handler.
    pub fn handler(&self, name: &str) -> Result<Arc<dyn ServiceTaskHandler>> {
        self.handlers.get(name).cloned().ok_or_else(|| {
            EngineError::process_engine(format!("unknown service task handler '{}'", name))
        })
    }
}
