// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution tree of a process instance.
//!
//! An [`Execution`] is one thread of control. Executions form a tree per process
//! instance:
//!
//! ```text
//! root (scope, process level)
//! ├── concurrent child ── at task1
//! └── concurrent child
//!     └── scope execution ── sub process, at innerTask
//! ```
//!
//! - The root is the process level scope. Its scope instance id is the process
//!   instance id.
//! - A scope execution exists for every entered scope activity. While it runs a
//!   non-scope activity of its scope it is positioned there itself.
//! - Concurrent children are created by forks. They are never scopes; entering a
//!   scope activity from a concurrent child adds a scope child below it.
//! - When a fork shrinks to one concurrent child, the child is merged back into
//!   the parent ("collapse"), so the tree never keeps single-child forks.
//!
//! The tree only maintains structure. Ownership side effects (tasks, jobs,
//! subscriptions) follow the [`Replacement`]s returned by fork and collapse and
//! are applied by [`crate::instance::ProcessInstance`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::ids::IdGenerator;
use crate::variables::Variables;

/// One thread of control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique id.
    pub id: String,
    /// Owning process instance.
    pub process_instance_id: String,
    /// Top-most process instance of the call hierarchy.
    pub root_process_instance_id: String,
    /// Parent execution, `None` for the root.
    pub parent_id: Option<String>,
    /// Child executions in creation order.
    pub children: Vec<String>,
    /// Activity the execution is at (entered or about to be entered).
    pub activity_id: Option<String>,
    /// Activity instance of `activity_id`. `None` while the activity has not been
    /// entered yet (transition instance).
    pub activity_instance_id: Option<String>,
    /// Scope activity represented by a scope execution. `None` for the root.
    pub scope_activity_id: Option<String>,
    /// Activity instance id of the represented scope.
    pub scope_instance_id: Option<String>,
    /// Owns a scope.
    pub is_scope: bool,
    /// Sibling in a fork.
    pub is_concurrent: bool,
    /// Currently executing or waiting at an activity.
    pub is_active: bool,
    /// Removed from the flow (only used for the root of a finished instance).
    pub is_ended: bool,
    /// Local variables.
    pub variables: Variables,
}

impl Execution {
    /// Root execution of a process instance.
    pub fn root(process_instance_id: &str, root_process_instance_id: &str) -> Self {
        Self {
            id: process_instance_id.to_string(),
            process_instance_id: process_instance_id.to_string(),
            root_process_instance_id: root_process_instance_id.to_string(),
            parent_id: None,
            children: Vec::new(),
            activity_id: None,
            activity_instance_id: None,
            scope_activity_id: None,
            scope_instance_id: Some(process_instance_id.to_string()),
            is_scope: true,
            is_concurrent: false,
            is_active: true,
            is_ended: false,
            variables: Variables::new(),
        }
    }

    fn child_of(parent: &Execution, id: String) -> Self {
        Self {
            id,
            process_instance_id: parent.process_instance_id.clone(),
            root_process_instance_id: parent.root_process_instance_id.clone(),
            parent_id: Some(parent.id.clone()),
            children: Vec::new(),
            activity_id: None,
            activity_instance_id: None,
            scope_activity_id: None,
            scope_instance_id: None,
            is_scope: false,
            is_concurrent: false,
            is_active: true,
            is_ended: false,
            variables: Variables::new(),
        }
    }

    /// Whether this is the process instance root.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the execution sits at an activity it has not entered yet.
    pub fn is_at_transition(&self) -> bool {
        self.activity_id.is_some() && self.activity_instance_id.is_none()
    }

    /// A scope execution positioned at its own scope activity (e.g. a user task
    /// with boundary events) rather than at an activity inside the scope.
    pub fn is_leaf_scope(&self) -> bool {
        self.is_scope
            && self.scope_activity_id.is_some()
            && self.activity_id == self.scope_activity_id
            && self.activity_instance_id == self.scope_instance_id
    }
}

/// Ownership of `from` moved to `to` (tasks, jobs, subscriptions follow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// Execution that gave up its position.
    pub from: String,
    /// Execution that took it over.
    pub to: String,
}

/// Result of [`ExecutionTree::create_concurrent_child`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    /// The new, unpositioned concurrent child.
    pub child_id: String,
    /// Set when the parent's own position moved into a first concurrent child.
    pub replaced: Option<Replacement>,
}

/// Result of [`ExecutionTree::remove_execution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Removed execution ids, descendants before ancestors.
    pub removed: Vec<String>,
    /// Set when a fork collapsed into its parent.
    pub replaced: Option<Replacement>,
    /// Execution that lost the removed child (after collapsing and pruning).
    pub parent_id: Option<String>,
}

/// Mutable execution tree of one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    root_id: String,
    executions: BTreeMap<String, Execution>,
}

impl ExecutionTree {
    /// Tree consisting of `root` only.
    pub fn new(root: Execution) -> Self {
        let root_id = root.id.clone();
        let mut executions = BTreeMap::new();
        executions.insert(root_id.clone(), root);
        Self {
            root_id,
            executions,
        }
    }

    /// Id of the root execution.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// The root execution.
    pub fn root(&self) -> &Execution {
        // The root entry is never removed from the map.
        &self.executions[&self.root_id]
    }

    pub(crate) fn root_mut(&mut self) -> &mut Execution {
        let root_id = self.root_id.clone();
        self.executions
            .get_mut(&root_id)
            .unwrap_or_else(|| unreachable!("root execution missing"))
    }

    /// Number of executions, root included.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Whether only the root is left and it has no position.
    pub fn is_empty(&self) -> bool {
        let root = self.root();
        root.children.is_empty() && root.activity_id.is_none()
    }

    /// Look up an execution.
    pub fn get(&self, id: &str) -> Option<&Execution> {
        self.executions.get(id)
    }

    /// Look up an execution or fail with [`EngineError::NotFound`].
    pub fn require(&self, id: &str) -> Result<&Execution> {
        self.executions
            .get(id)
            .ok_or_else(|| EngineError::not_found("Execution", id))
    }

    pub(crate) fn require_mut(&mut self, id: &str) -> Result<&mut Execution> {
        self.executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("Execution", id))
    }

    /// Whether the tree contains `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.executions.contains_key(id)
    }

    /// Children of `id` in creation order.
    pub fn children(&self, id: &str) -> Vec<&Execution> {
        self.executions
            .get(id)
            .map(|e| {
                e.children
                    .iter()
                    .filter_map(|c| self.executions.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All executions, pre-order (parents before children, children in creation order).
    pub fn iter(&self) -> Vec<&Execution> {
        let mut out = Vec::with_capacity(self.executions.len());
        let mut stack = vec![self.root_id.as_str()];
        while let Some(id) = stack.pop() {
            if let Some(execution) = self.executions.get(id) {
                out.push(execution);
                for child in execution.children.iter().rev() {
                    stack.push(child.as_str());
                }
            }
        }
        out
    }

    /// `id` and all of its descendants, descendants first.
    pub fn subtree_post_order(&self, id: &str) -> Vec<String> {
        fn visit(tree: &ExecutionTree, id: &str, out: &mut Vec<String>) {
            if let Some(execution) = tree.executions.get(id) {
                for child in &execution.children {
                    visit(tree, child, out);
                }
                out.push(id.to_string());
            }
        }
        let mut out = Vec::new();
        visit(self, id, &mut out);
        out
    }

    /// Ancestors of `id`, parent first.
    pub fn ancestors(&self, id: &str) -> Vec<&Execution> {
        let mut out = Vec::new();
        let mut current = self.executions.get(id).and_then(|e| e.parent_id.as_deref());
        while let Some(parent_id) = current {
            match self.executions.get(parent_id) {
                Some(parent) => {
                    out.push(parent);
                    current = parent.parent_id.as_deref();
                }
                None => break,
            }
        }
        out
    }

    /// Scope execution whose scope contains the activity `id` is positioned at.
    ///
    /// For a leaf scope this is the enclosing scope, for every other execution the
    /// nearest scope among itself and its ancestors.
    pub fn flow_scope_execution(&self, id: &str) -> Result<&Execution> {
        let execution = self.require(id)?;
        if execution.is_scope && !execution.is_leaf_scope() {
            return Ok(execution);
        }
        self.ancestors(id)
            .into_iter()
            .find(|e| e.is_scope)
            .ok_or_else(|| EngineError::invalid_state(id, "execution has no enclosing scope"))
    }

    /// Scope executions representing `scope_activity_id`, in tree order.
    pub fn scope_executions_for(&self, scope_activity_id: &str) -> Vec<&Execution> {
        self.iter()
            .into_iter()
            .filter(|e| e.is_scope && e.scope_activity_id.as_deref() == Some(scope_activity_id))
            .collect()
    }

    /// Executions positioned at `activity_id`, in tree order.
    pub fn executions_at(&self, activity_id: &str) -> Vec<&Execution> {
        self.iter()
            .into_iter()
            .filter(|e| e.activity_id.as_deref() == Some(activity_id))
            .collect()
    }

    /// Position an execution at an activity.
    pub(crate) fn set_position(
        &mut self,
        id: &str,
        activity_id: Option<String>,
        activity_instance_id: Option<String>,
    ) -> Result<()> {
        let execution = self.require_mut(id)?;
        execution.activity_id = activity_id;
        execution.activity_instance_id = activity_instance_id;
        Ok(())
    }

    /// Create a scope execution for `scope_activity_id` below `parent_id`.
    ///
    /// The parent must not have children. It becomes an inactive holder without a
    /// position; the new scope execution is positioned at the scope activity.
    pub fn create_scope(
        &mut self,
        parent_id: &str,
        id: String,
        scope_activity_id: &str,
        scope_instance_id: String,
    ) -> Result<String> {
        let parent = self.require(parent_id)?;
        if parent.is_ended {
            return Err(EngineError::invalid_state(
                parent_id,
                "cannot create a scope below an ended execution",
            ));
        }
        if !parent.children.is_empty() {
            return Err(EngineError::invalid_state(
                parent_id,
                "cannot create a scope below an execution that already has children",
            ));
        }

        let mut scope = Execution::child_of(parent, id.clone());
        scope.is_scope = true;
        scope.scope_activity_id = Some(scope_activity_id.to_string());
        scope.scope_instance_id = Some(scope_instance_id.clone());
        scope.activity_id = Some(scope_activity_id.to_string());
        scope.activity_instance_id = Some(scope_instance_id);

        let parent = self.require_mut(parent_id)?;
        parent.children.push(id.clone());
        parent.is_active = false;
        parent.activity_id = None;
        parent.activity_instance_id = None;
        self.executions.insert(id.clone(), scope);
        Ok(id)
    }

    /// Create a concurrent child of the scope execution `parent_id`.
    ///
    /// The first fork below a positioned parent moves the parent's position into a
    /// first concurrent child; a parent hosting a single scope child gets a
    /// concurrent child inserted above that scope child.
    pub fn create_concurrent_child(
        &mut self,
        parent_id: &str,
        ids: &dyn IdGenerator,
    ) -> Result<Fork> {
        let parent = self.require(parent_id)?;
        if parent.is_ended {
            return Err(EngineError::invalid_state(
                parent_id,
                "cannot fork from an ended execution",
            ));
        }
        if !parent.is_scope || parent.is_concurrent {
            return Err(EngineError::invalid_state(
                parent_id,
                "only scope executions can be fork points",
            ));
        }
        if parent.is_leaf_scope() {
            return Err(EngineError::invalid_state(
                parent_id,
                "a scope positioned at its own activity cannot fork",
            ));
        }

        let mut replaced = None;
        let existing: Vec<String> = parent.children.clone();
        let single_scope_child = existing.len() == 1
            && self
                .executions
                .get(&existing[0])
                .is_some_and(|c| !c.is_concurrent);

        if existing.is_empty() && parent.activity_id.is_some() {
            let mut first = Execution::child_of(parent, ids.next_id());
            first.is_concurrent = true;
            first.is_active = parent.is_active;
            first.activity_id = parent.activity_id.clone();
            first.activity_instance_id = parent.activity_instance_id.clone();
            let first_id = first.id.clone();
            self.executions.insert(first_id.clone(), first);

            let parent = self.require_mut(parent_id)?;
            parent.children.push(first_id.clone());
            parent.activity_id = None;
            parent.activity_instance_id = None;
            parent.is_active = false;
            replaced = Some(Replacement {
                from: parent_id.to_string(),
                to: first_id,
            });
        } else if single_scope_child {
            let scope_child_id = existing[0].clone();
            let mut holder = Execution::child_of(parent, ids.next_id());
            holder.is_concurrent = true;
            holder.is_active = false;
            holder.children.push(scope_child_id.clone());
            let holder_id = holder.id.clone();
            self.executions.insert(holder_id.clone(), holder);
            self.require_mut(&scope_child_id)?.parent_id = Some(holder_id.clone());
            self.require_mut(parent_id)?.children = vec![holder_id];
        }

        let parent = self.require(parent_id)?;
        let mut child = Execution::child_of(parent, ids.next_id());
        child.is_concurrent = true;
        let child_id = child.id.clone();
        self.executions.insert(child_id.clone(), child);
        let parent = self.require_mut(parent_id)?;
        parent.children.push(child_id.clone());
        parent.is_active = false;

        Ok(Fork { child_id, replaced })
    }

    /// Remove `id` and its descendants.
    ///
    /// Removing the root clears the tree and marks the root ended. Removing the
    /// only scope child of a concurrent child removes that concurrent child too.
    /// A fork left with one concurrent child collapses into its parent.
    pub fn remove_execution(&mut self, id: &str) -> Result<Removal> {
        self.require(id)?;

        if id == self.root_id {
            let mut removed = self.subtree_post_order(id);
            removed.pop();
            for child in &removed {
                self.executions.remove(child);
            }
            let root = self.root_mut();
            root.children.clear();
            root.activity_id = None;
            root.activity_instance_id = None;
            root.is_active = false;
            root.is_ended = true;
            removed.push(id.to_string());
            return Ok(Removal {
                removed,
                replaced: None,
                parent_id: None,
            });
        }

        let mut removed = self.subtree_post_order(id);
        for execution in &removed {
            self.executions.remove(execution);
        }

        let mut parent_id = self
            .detach_from_parent(id)?
            .ok_or_else(|| EngineError::invalid_state(id, "non-root execution without parent"))?;

        // A concurrent holder without position or children is a dead branch.
        loop {
            let parent = self.require(&parent_id)?;
            if parent.is_concurrent && parent.children.is_empty() && parent.activity_id.is_none() {
                let holder_id = parent_id.clone();
                self.executions.remove(&holder_id);
                parent_id = self.detach_from_parent(&holder_id)?.ok_or_else(|| {
                    EngineError::invalid_state(&holder_id, "concurrent execution without parent")
                })?;
                removed.push(holder_id);
            } else {
                break;
            }
        }

        let replaced = self.collapse_fork(&parent_id)?;
        Ok(Removal {
            removed,
            replaced,
            parent_id: Some(parent_id),
        })
    }

    fn detach_from_parent(&mut self, id: &str) -> Result<Option<String>> {
        let parent_id = self
            .executions
            .values()
            .find(|e| e.children.iter().any(|c| c == id))
            .map(|e| e.id.clone());
        if let Some(parent_id) = &parent_id {
            let parent = self.require_mut(parent_id)?;
            parent.children.retain(|c| c != id);
        }
        Ok(parent_id)
    }

    /// Merge a single remaining concurrent child into `parent_id`.
    pub fn collapse_fork(&mut self, parent_id: &str) -> Result<Option<Replacement>> {
        let parent = self.require(parent_id)?;
        if parent.children.len() != 1 {
            return Ok(None);
        }
        let child_id = parent.children[0].clone();
        let child = self.require(&child_id)?.clone();
        if !child.is_concurrent {
            return Ok(None);
        }

        for grandchild in &child.children {
            self.require_mut(grandchild)?.parent_id = Some(parent_id.to_string());
        }
        let parent = self.require_mut(parent_id)?;
        parent.children = child.children.clone();
        parent.activity_id = child.activity_id.clone();
        parent.activity_instance_id = child.activity_instance_id.clone();
        parent.is_active = child.is_active;
        for (name, value) in child.variables {
            parent.variables.entry(name).or_insert(value);
        }
        self.executions.remove(&child_id);

        Ok(Some(Replacement {
            from: child_id,
            to: parent_id.to_string(),
        }))
    }
}
