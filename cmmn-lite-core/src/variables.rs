//! Hierarchical variable resolution over the execution arena.
//!
//! Names delegate upward through ancestors when not found locally; writes go
//! to the nearest scope that already defines the name, falling back to the
//! case root. Listeners are the only callers — the state machine itself never
//! reads a variable.

use crate::types::{CaseInstance, VariableValue};
use uuid::Uuid;

/// Walk `from` toward the root, returning the first scope defining `name`.
fn defining_scope(instance: &CaseInstance, from: Uuid, name: &str) -> Option<Uuid> {
    let mut current = Some(from);
    while let Some(id) = current {
        let node = instance.node(id)?;
        if node.variables.contains_key(name) {
            return Some(id);
        }
        current = node.parent_id;
    }
    None
}

pub fn get<'a>(instance: &'a CaseInstance, execution_id: Uuid, name: &str) -> Option<&'a VariableValue> {
    let scope = defining_scope(instance, execution_id, name)?;
    instance.node(scope)?.variables.get(name)
}

pub fn get_local<'a>(
    instance: &'a CaseInstance,
    execution_id: Uuid,
    name: &str,
) -> Option<&'a VariableValue> {
    instance.node(execution_id)?.variables.get(name)
}

/// Update the nearest defining scope, or define on the case root when no
/// ancestor holds the name yet.
pub fn set(instance: &mut CaseInstance, execution_id: Uuid, name: &str, value: VariableValue) {
    let scope = defining_scope(instance, execution_id, name).unwrap_or(instance.root_id);
    if let Some(node) = instance.node_mut(scope) {
        node.variables.insert(name.to_string(), value);
    }
}

pub fn set_local(instance: &mut CaseInstance, execution_id: Uuid, name: &str, value: VariableValue) {
    if let Some(node) = instance.node_mut(execution_id) {
        node.variables.insert(name.to_string(), value);
    }
}

/// Remove from the nearest defining scope. No-op when the name is unbound.
pub fn remove(instance: &mut CaseInstance, execution_id: Uuid, name: &str) {
    if let Some(scope) = defining_scope(instance, execution_id, name) {
        if let Some(node) = instance.node_mut(scope) {
            node.variables.remove(name);
        }
    }
}

pub fn remove_local(instance: &mut CaseInstance, execution_id: Uuid, name: &str) {
    if let Some(node) = instance.node_mut(execution_id) {
        node.variables.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn two_level_instance() -> (CaseInstance, Uuid, Uuid) {
        let root_id = Uuid::now_v7();
        let child_id = Uuid::now_v7();
        let def = |activity: &str, kind: ItemKind| PlanItemDefinition {
            activity_id: activity.to_string(),
            name: activity.to_string(),
            kind,
            activation_policy: ActivationPolicy::Automatic,
            required: true,
            auto_complete: false,
            children: vec![],
            entry_sentry_ids: vec![],
            exit_sentry_ids: vec![],
        };
        let mut root =
            CaseExecutionNode::from_definition(root_id, root_id, None, &def("case", ItemKind::Stage));
        root.children.push(child_id);
        let child = CaseExecutionNode::from_definition(
            child_id,
            root_id,
            Some(root_id),
            &def("task", ItemKind::Task),
        );
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id, root);
        nodes.insert(child_id, child);
        let instance = CaseInstance {
            case_instance_id: root_id,
            case_definition_key: "k".to_string(),
            root_id,
            nodes,
            sentries: BTreeMap::new(),
            closed: false,
            created_at: 0,
        };
        (instance, root_id, child_id)
    }

    #[test]
    fn get_delegates_upward() {
        let (mut instance, root_id, child_id) = two_level_instance();
        set_local(&mut instance, root_id, "who", json!("root"));

        assert_eq!(get(&instance, child_id, "who"), Some(&json!("root")));
        assert_eq!(get_local(&instance, child_id, "who"), None);
    }

    #[test]
    fn set_updates_defining_scope_not_caller() {
        let (mut instance, root_id, child_id) = two_level_instance();
        set_local(&mut instance, root_id, "count", json!(1));

        set(&mut instance, child_id, "count", json!(2));
        assert_eq!(get_local(&instance, root_id, "count"), Some(&json!(2)));
        assert_eq!(get_local(&instance, child_id, "count"), None);
    }

    #[test]
    fn set_of_unbound_name_lands_on_root() {
        let (mut instance, root_id, child_id) = two_level_instance();
        set(&mut instance, child_id, "fresh", json!(true));
        assert_eq!(get_local(&instance, root_id, "fresh"), Some(&json!(true)));
    }

    #[test]
    fn local_shadowing_and_remove() {
        let (mut instance, root_id, child_id) = two_level_instance();
        set_local(&mut instance, root_id, "v", json!("outer"));
        set_local(&mut instance, child_id, "v", json!("inner"));

        assert_eq!(get(&instance, child_id, "v"), Some(&json!("inner")));

        remove(&mut instance, child_id, "v");
        assert_eq!(get(&instance, child_id, "v"), Some(&json!("outer")));
    }
}
