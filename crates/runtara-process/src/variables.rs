// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped variables.
//!
//! Every execution carries local variables. Reads walk from the execution up to
//! the root. A non-local write updates the nearest execution that already defines
//! the variable and otherwise creates it on the process instance root.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;
use crate::execution::ExecutionTree;

/// Variable map. Ordered so that applying a map is deterministic.
pub type Variables = BTreeMap<String, Value>;

/// Where an assignment landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Execution that holds the variable.
    pub execution_id: String,
    /// The variable did not exist on that execution before.
    pub created: bool,
}

/// Resolve a variable visible from `execution_id`.
pub fn get<'a>(tree: &'a ExecutionTree, execution_id: &str, name: &str) -> Option<&'a Value> {
    let execution = tree.get(execution_id)?;
    if let Some(value) = execution.variables.get(name) {
        return Some(value);
    }
    tree.ancestors(execution_id)
        .into_iter()
        .find_map(|e| e.variables.get(name))
}

/// All variables visible from `execution_id`. Inner definitions shadow outer ones.
pub fn visible(tree: &ExecutionTree, execution_id: &str) -> Variables {
    let mut chain: Vec<_> = tree.ancestors(execution_id);
    chain.reverse();
    if let Some(execution) = tree.get(execution_id) {
        chain.push(execution);
    }
    let mut out = Variables::new();
    for execution in chain {
        for (name, value) in &execution.variables {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

/// Write a variable.
///
/// Local writes go to `execution_id` itself. Non-local writes update the nearest
/// definition or create the variable on the root.
pub fn assign(
    tree: &mut ExecutionTree,
    execution_id: &str,
    name: &str,
    value: Value,
    local: bool,
) -> Result<Assignment> {
    let target = if local {
        execution_id.to_string()
    } else {
        let execution = tree.require(execution_id)?;
        if execution.variables.contains_key(name) {
            execution_id.to_string()
        } else {
            tree.ancestors(execution_id)
                .into_iter()
                .find(|e| e.variables.contains_key(name))
                .map(|e| e.id.clone())
                .unwrap_or_else(|| tree.root_id().to_string())
        }
    };

    let execution = tree.require_mut(&target)?;
    let created = execution
        .variables
        .insert(name.to_string(), value)
        .is_none();
    Ok(Assignment {
        execution_id: target,
        created,
    })
}

/// Activity instance a variable on `execution_id` is attributed to in history.
///
/// Scope executions report their scope instance (the process instance id for the
/// root); other executions report the activity instance they are in, if any.
pub fn history_activity_instance_id(tree: &ExecutionTree, execution_id: &str) -> Option<String> {
    let execution = tree.get(execution_id)?;
    if execution.is_scope {
        execution.scope_instance_id.clone()
    } else {
        execution.activity_instance_id.clone()
    }
}

/// Truthiness used by [`crate::definition::Condition::VariableTruthy`].
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Execution;
    use crate::ids::SequentialIdGenerator;
    use serde_json::json;

    fn forked() -> (ExecutionTree, String) {
        let ids = SequentialIdGenerator::new();
        let mut root = Execution::root("pi", "pi");
        root.activity_id = Some("task1".into());
        root.activity_instance_id = Some("task1:0".into());
        let mut tree = ExecutionTree::new(root);
        let fork = tree.create_concurrent_child("pi", &ids).unwrap();
        (tree, fork.child_id)
    }

    #[test]
    fn test_non_local_assignment_lands_on_root() {
        let (mut tree, child) = forked();
        let assignment = assign(&mut tree, &child, "amount", json!(10), false).unwrap();
        assert_eq!(assignment.execution_id, "pi");
        assert!(assignment.created);
        assert_eq!(get(&tree, &child, "amount"), Some(&json!(10)));
    }

    #[test]
    fn test_non_local_assignment_updates_nearest_definition() {
        let (mut tree, child) = forked();
        assign(&mut tree, &child, "x", json!("local"), true).unwrap();
        let assignment = assign(&mut tree, &child, "x", json!("updated"), false).unwrap();
        assert_eq!(assignment.execution_id, child);
        assert!(!assignment.created);
        assert!(tree.root().variables.is_empty());
    }

    #[test]
    fn test_visible_variables_inner_shadows_outer() {
        let (mut tree, child) = forked();
        assign(&mut tree, "pi", "x", json!(1), true).unwrap();
        assign(&mut tree, "pi", "y", json!(2), true).unwrap();
        assign(&mut tree, &child, "x", json!(3), true).unwrap();
        let vars = visible(&tree, &child);
        assert_eq!(vars.get("x"), Some(&json!(3)));
        assert_eq!(vars.get("y"), Some(&json!(2)));
    }

    #[test]
    fn test_history_activity_instance_attribution() {
        let (tree, child) = forked();
        assert_eq!(history_activity_instance_id(&tree, "pi").as_deref(), Some("pi"));
        assert_eq!(history_activity_instance_id(&tree, &child), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!([1])));
    }
}
