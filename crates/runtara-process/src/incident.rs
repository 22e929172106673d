// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incident handlers.
//!
//! Incidents are dispatched by type string to an [`IncidentHandler`] looked up once
//! per event in the [`IncidentHandlerRegistry`]. Types without a registered handler
//! use [`DefaultIncidentHandler`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::instance::{Incident, ProcessInstance};

/// Incident type raised when a job runs out of retries.
pub const FAILED_JOB: &str = "failedJob";

/// Where an incident occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentContext {
    /// Process instance.
    pub process_instance_id: String,
    /// Execution.
    pub execution_id: String,
    /// Activity the execution is at.
    pub activity_id: Option<String>,
    /// Handler specific configuration, e.g. the failed job id.
    pub configuration: Option<String>,
}

/// Capability set of an incident type.
pub trait IncidentHandler: Send + Sync {
    /// Type string this handler serves.
    fn incident_type(&self) -> &str;

    /// Open an incident.
    fn handle_incident(
        &self,
        instance: &mut ProcessInstance,
        context: &IncidentContext,
        message: Option<&str>,
        incident_id: String,
        now: DateTime<Utc>,
    ) -> Incident;

    /// Close incidents matching `context` because their cause went away.
    fn resolve_incident(&self, instance: &mut ProcessInstance, context: &IncidentContext) -> Vec<Incident>;

    /// Remove incidents matching `context` because their execution is gone.
    fn delete_incident(&self, instance: &mut ProcessInstance, context: &IncidentContext) -> Vec<Incident>;
}

/// Stores incidents on the process instance.
#[derive(Debug, Clone)]
pub struct DefaultIncidentHandler {
    incident_type: String,
}

impl DefaultIncidentHandler {
    /// Handler for `incident_type`.
    pub fn new(incident_type: impl Into<String>) -> Self {
        Self {
            incident_type: incident_type.into(),
        }
    }

    fn remove_matching(&self, instance: &mut ProcessInstance, context: &IncidentContext) -> Vec<Incident> {
        let ids: Vec<String> = instance
            .incidents
            .values()
            .filter(|i| i.incident_type == self.incident_type)
            .filter(|i| i.execution_id == context.execution_id)
            .filter(|i| context.configuration.is_none() || i.configuration == context.configuration)
            .map(|i| i.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| instance.incidents.remove(id))
            .collect()
    }
}

impl IncidentHandler for DefaultIncidentHandler {
    fn incident_type(&self) -> &str {
        &self.incident_type
    }

    fn handle_incident(
        &self,
        instance: &mut ProcessInstance,
        context: &IncidentContext,
        message: Option<&str>,
        incident_id: String,
        now: DateTime<Utc>,
    ) -> Incident {
        let incident = Incident {
            id: incident_id,
            incident_type: self.incident_type.clone(),
            configuration: context.configuration.clone(),
            message: message.map(str::to_string),
            process_instance_id: context.process_instance_id.clone(),
            execution_id: context.execution_id.clone(),
            activity_id: context.activity_id.clone(),
            created_at: now,
        };
        instance
            .incidents
            .insert(incident.id.clone(), incident.clone());
        incident
    }

    fn resolve_incident(&self, instance: &mut ProcessInstance, context: &IncidentContext) -> Vec<Incident> {
        self.remove_matching(instance, context)
    }

    fn delete_incident(&self, instance: &mut ProcessInstance, context: &IncidentContext) -> Vec<Incident> {
        self.remove_matching(instance, context)
    }
}

/// Incident handlers by type.
#[derive(Clone)]
pub struct IncidentHandlerRegistry {
    handlers: HashMap<String, Arc<dyn IncidentHandler>>,
}

impl std::fmt::Debug for IncidentHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("IncidentHandlerRegistry")
            .field("types", &types)
            .finish()
    }
}

impl Default for IncidentHandlerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(DefaultIncidentHandler::new(FAILED_JOB)));
        registry
    }
}

impl IncidentHandlerRegistry {
    /// Registry with the `failedJob` handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for its type.
    pub fn register(&mut self, handler: Arc<dyn IncidentHandler>) {
        self.handlers
            .insert(handler.incident_type().to_string(), handler);
    }

    /// Handler for `incident_type`, falling back to [`DefaultIncidentHandler`].
    pub fn handler(&self, incident_type: &str) -> Arc<dyn IncidentHandler> {
        self.handlers
            .get(incident_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultIncidentHandler::new(incident_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, ExecutionTree};
    use std::collections::BTreeMap;

    fn instance() -> ProcessInstance {
        ProcessInstance {
            id: "pi".into(),
            definition_id: "p:1".into(),
            definition_key: "p".into(),
            business_key: None,
            case_instance_id: None,
            super_process_instance_id: None,
            super_execution_id: None,
            root_process_instance_id: "pi".into(),
            suspended: false,
            start_time: Utc::now(),
            start_activity_id: None,
            tree: ExecutionTree::new(Execution::root("pi", "pi")),
            tasks: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            incidents: BTreeMap::new(),
        }
    }

    fn context(configuration: &str) -> IncidentContext {
        IncidentContext {
            process_instance_id: "pi".into(),
            execution_id: "pi".into(),
            activity_id: Some("task".into()),
            configuration: Some(configuration.into()),
        }
    }

    #[test]
    fn test_handle_and_resolve_by_configuration() {
        let registry = IncidentHandlerRegistry::new();
        let handler = registry.handler(FAILED_JOB);
        let mut pi = instance();

        handler.handle_incident(&mut pi, &context("job-1"), Some("boom"), "i1".into(), Utc::now());
        handler.handle_incident(&mut pi, &context("job-2"), None, "i2".into(), Utc::now());
        assert_eq!(pi.incidents.len(), 2);

        let resolved = handler.resolve_incident(&mut pi, &context("job-1"));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "i1");
        assert_eq!(pi.incidents.len(), 1);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default_handler() {
        let registry = IncidentHandlerRegistry::new();
        let handler = registry.handler("customType");
        assert_eq!(handler.incident_type(), "customType");

        let mut pi = instance();
        let incident = handler.handle_incident(&mut pi, &context("cfg"), None, "i9".into(), Utc::now());
        assert_eq!(incident.incident_type, "customType");
        assert_eq!(handler.delete_incident(&mut pi, &context("cfg")).len(), 1);
    }
}
