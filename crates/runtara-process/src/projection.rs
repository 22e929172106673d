// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity instance tree.
//!
//! [`project`] derives the user-facing activity instance tree from an execution
//! tree. It is a pure function: the same execution tree always yields the same
//! ids, order and structure, and executions never point back at projected nodes.
//!
//! Rules:
//!
//! | Execution | Projected as |
//! |-----------|--------------|
//! | root | the process instance node (id = process instance id) |
//! | scope execution | node keyed by its scope instance id |
//! | positioned, activity entered | node keyed by its activity instance id |
//! | positioned, activity not entered | transition instance (id = execution id) |
//! | concurrent, no position, no children | execution id added to the enclosing scope node |
//!
//! Executions that share an activity instance id end up in one node.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::execution::Execution;
use crate::instance::ProcessInstance;

/// One visit to an activity or scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstance {
    /// Activity instance id.
    pub id: String,
    /// Activity id (the definition id for the process instance node).
    pub activity_id: String,
    /// Enclosing activity instance.
    pub parent_activity_instance_id: Option<String>,
    /// Process instance.
    pub process_instance_id: String,
    /// Backing executions in tree order.
    pub execution_ids: Vec<String>,
    /// Nested activity instances.
    pub child_activity_instances: Vec<ActivityInstance>,
    /// Nested transition instances.
    pub child_transition_instances: Vec<TransitionInstance>,
}

/// An execution about to enter an activity (asynchronous continuation pending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionInstance {
    /// Transition instance id (the execution id).
    pub id: String,
    /// Activity to be entered.
    pub activity_id: String,
    /// Enclosing activity instance.
    pub parent_activity_instance_id: String,
    /// Process instance.
    pub process_instance_id: String,
    /// Backing execution.
    pub execution_id: String,
}

impl ActivityInstance {
    /// Depth-first search for an activity instance.
    pub fn find(&self, id: &str) -> Option<&ActivityInstance> {
        if self.id == id {
            return Some(self);
        }
        self.child_activity_instances
            .iter()
            .find_map(|child| child.find(id))
    }

    /// Depth-first search for a transition instance.
    pub fn find_transition(&self, id: &str) -> Option<&TransitionInstance> {
        self.child_transition_instances
            .iter()
            .find(|t| t.id == id)
            .or_else(|| {
                self.child_activity_instances
                    .iter()
                    .find_map(|child| child.find_transition(id))
            })
    }

    /// Activity instance or [`EngineError::NotFound`].
    pub fn require(&self, id: &str) -> Result<&ActivityInstance> {
        self.find(id)
            .ok_or_else(|| EngineError::not_found("Activity instance", id))
    }

    /// Transition instance or [`EngineError::NotFound`].
    pub fn require_transition(&self, id: &str) -> Result<&TransitionInstance> {
        self.find_transition(id)
            .ok_or_else(|| EngineError::not_found("Transition instance", id))
    }

    /// All activity instances of `activity_id`, pre-order.
    pub fn activity_instances_for(&self, activity_id: &str) -> Vec<&ActivityInstance> {
        let mut out = Vec::new();
        self.collect(activity_id, &mut out);
        out
    }

    fn collect<'a>(&'a self, activity_id: &str, out: &mut Vec<&'a ActivityInstance>) {
        if self.activity_id == activity_id {
            out.push(self);
        }
        for child in &self.child_activity_instances {
            child.collect(activity_id, out);
        }
    }

    /// All transition instances of `activity_id`, pre-order.
    pub fn transition_instances_for(&self, activity_id: &str) -> Vec<&TransitionInstance> {
        let mut out: Vec<&TransitionInstance> = self
            .child_transition_instances
            .iter()
            .filter(|t| t.activity_id == activity_id)
            .collect();
        for child in &self.child_activity_instances {
            out.extend(child.transition_instances_for(activity_id));
        }
        out
    }
}

#[derive(Debug)]
struct Node {
    id: String,
    activity_id: String,
    parent: Option<usize>,
    execution_ids: Vec<String>,
    children: Vec<usize>,
    transitions: Vec<TransitionInstance>,
}

struct Projector<'a> {
    instance: &'a ProcessInstance,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl<'a> Projector<'a> {
    fn node(&mut self, id: &str, activity_id: &str, parent: usize) -> usize {
        if let Some(&existing) = self.index.get(id) {
            return existing;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.to_string(),
            activity_id: activity_id.to_string(),
            parent: Some(parent),
            execution_ids: Vec::new(),
            children: Vec::new(),
            transitions: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
        self.index.insert(id.to_string(), idx);
        idx
    }

    fn visit(&mut self, execution: &'a Execution, enclosing: usize) {
        let mut scope_node = enclosing;
        if execution.is_root() {
            scope_node = 0;
        } else if execution.is_scope {
            let id = execution
                .scope_instance_id
                .as_deref()
                .unwrap_or(execution.id.as_str());
            let activity = execution.scope_activity_id.as_deref().unwrap_or_default();
            scope_node = self.node(id, activity, enclosing);
            self.nodes[scope_node].execution_ids.push(execution.id.clone());
        }

        if !execution.is_leaf_scope() {
            match (&execution.activity_id, &execution.activity_instance_id) {
                (Some(activity), Some(activity_instance)) => {
                    let idx = self.node(activity_instance, activity, scope_node);
                    self.nodes[idx].execution_ids.push(execution.id.clone());
                }
                (Some(activity), None) => {
                    let parent_id = self.nodes[scope_node].id.clone();
                    self.nodes[scope_node].transitions.push(TransitionInstance {
                        id: execution.id.clone(),
                        activity_id: activity.clone(),
                        parent_activity_instance_id: parent_id,
                        process_instance_id: self.instance.id.clone(),
                        execution_id: execution.id.clone(),
                    });
                }
                (None, _) => {
                    if execution.is_concurrent && execution.children.is_empty() {
                        self.nodes[scope_node]
                            .execution_ids
                            .push(execution.id.clone());
                    }
                }
            }
        }

        let instance = self.instance;
        for child in instance.tree.children(&execution.id) {
            self.visit(child, scope_node);
        }
    }

    fn build(&self, idx: usize) -> ActivityInstance {
        let node = &self.nodes[idx];
        ActivityInstance {
            id: node.id.clone(),
            activity_id: node.activity_id.clone(),
            parent_activity_instance_id: node.parent.map(|p| self.nodes[p].id.clone()),
            process_instance_id: self.instance.id.clone(),
            execution_ids: node.execution_ids.clone(),
            child_activity_instances: node.children.iter().map(|&c| self.build(c)).collect(),
            child_transition_instances: node.transitions.clone(),
        }
    }
}

/// Project the activity instance tree of `instance`.
pub fn project(instance: &ProcessInstance) -> ActivityInstance {
    let root = instance.tree.root();
    let mut projector = Projector {
        instance,
        nodes: vec![Node {
            id: instance.id.clone(),
            activity_id: instance.definition_id.clone(),
            parent: None,
            execution_ids: vec![root.id.clone()],
            children: Vec::new(),
            transitions: Vec::new(),
        }],
        index: HashMap::new(),
    };
    projector.index.insert(instance.id.clone(), 0);
    if !root.is_ended {
        projector.visit(root, 0);
    }
    projector.build(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionTree;
    use crate::ids::SequentialIdGenerator;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn instance(tree: ExecutionTree) -> ProcessInstance {
        ProcessInstance {
            id: "pi".into(),
            definition_id: "proc:1".into(),
            definition_key: "proc".into(),
            business_key: None,
            case_instance_id: None,
            super_process_instance_id: None,
            super_execution_id: None,
            root_process_instance_id: "pi".into(),
            suspended: false,
            start_time: Utc::now(),
            start_activity_id: None,
            tree,
            tasks: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            incidents: BTreeMap::new(),
        }
    }

    /// root forked into task1 and a sub process at innerTask, plus a pending
    /// async continuation before task3.
    fn sample() -> ProcessInstance {
        let ids = SequentialIdGenerator::new();
        let mut root = Execution::root("pi", "pi");
        root.activity_id = Some("task1".into());
        root.activity_instance_id = Some("task1:a".into());
        let mut tree = ExecutionTree::new(root);

        let sub = tree.create_concurrent_child("pi", &ids).unwrap();
        let scope = tree
            .create_scope(&sub.child_id, "s".into(), "sub", "sub:b".into())
            .unwrap();
        tree.set_position(&scope, Some("innerTask".into()), Some("innerTask:c".into()))
            .unwrap();

        let pending = tree.create_concurrent_child("pi", &ids).unwrap();
        tree.set_position(&pending.child_id, Some("task3".into()), None)
            .unwrap();
        instance(tree)
    }

    #[test]
    fn test_projection_structure() {
        let pi = sample();
        let tree = project(&pi);

        assert_eq!(tree.id, "pi");
        assert_eq!(tree.activity_id, "proc:1");
        let ids: Vec<&str> = tree
            .child_activity_instances
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(ids, vec!["task1:a", "sub:b"]);

        let sub = tree.require("sub:b").unwrap();
        assert_eq!(sub.parent_activity_instance_id.as_deref(), Some("pi"));
        assert_eq!(sub.execution_ids, vec!["s"]);
        let inner = tree.require("innerTask:c").unwrap();
        assert_eq!(inner.parent_activity_instance_id.as_deref(), Some("sub:b"));
        assert_eq!(inner.execution_ids, vec!["s"]);

        assert_eq!(tree.child_transition_instances.len(), 1);
        let transition = &tree.child_transition_instances[0];
        assert_eq!(transition.activity_id, "task3");
        assert_eq!(transition.parent_activity_instance_id, "pi");
        assert_eq!(tree.require_transition(&transition.id).unwrap().execution_id, transition.id);
    }

    #[test]
    fn test_projection_is_idempotent() {
        let pi = sample();
        assert_eq!(project(&pi), project(&pi));
    }

    #[test]
    fn test_unpositioned_concurrent_execution_joins_scope_node() {
        let ids = SequentialIdGenerator::new();
        let mut root = Execution::root("pi", "pi");
        root.activity_id = Some("task1".into());
        root.activity_instance_id = Some("task1:a".into());
        let mut tree = ExecutionTree::new(root);
        let fork = tree.create_concurrent_child("pi", &ids).unwrap();

        let projected = project(&instance(tree));

        assert_eq!(projected.execution_ids, vec!["pi".to_string(), fork.child_id]);
    }

    #[test]
    fn test_stale_id_is_not_found() {
        let projected = project(&sample());
        let err = projected.require("task1:gone").unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert!(projected.require_transition("nope").is_err());
    }

    #[test]
    fn test_activity_instances_for_activity() {
        let projected = project(&sample());
        assert_eq!(projected.activity_instances_for("innerTask").len(), 1);
        assert_eq!(projected.transition_instances_for("task3").len(), 1);
        assert!(projected.activity_instances_for("task2").is_empty());
    }
}
