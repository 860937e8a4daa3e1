//! Edit primitives over a working tree: set, delete and move. These are the
//! only mutations the operation log records, and replay applies them with
//! exactly the same semantics.

use crate::data::tree::{DataTree, MovePosition, NodeId};
use crate::error::EngineError;
use crate::schema::model::{SchemaModule, SchemaNodeId, SchemaNodeKind};
use crate::value::ValueData;
use crate::xpath::{Predicate, Step, XPath};

/// Edit options bitmask: `non_recursive` = 1, `strict` = 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditFlags {
    pub non_recursive: bool,
    pub strict: bool,
}

impl EditFlags {
    pub const DEFAULT: EditFlags = EditFlags {
        non_recursive: false,
        strict: false,
    };

    pub const STRICT: EditFlags = EditFlags {
        non_recursive: false,
        strict: true,
    };

    pub const NON_RECURSIVE: EditFlags = EditFlags {
        non_recursive: true,
        strict: false,
    };

    pub fn bits(&self) -> u32 {
        (self.non_recursive as u32) | ((self.strict as u32) << 1)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            non_recursive: bits & 1 != 0,
            strict: bits & 2 != 0,
        }
    }
}

fn find_instances(
    schema: &SchemaModule,
    tree: &DataTree,
    parent: Option<NodeId>,
    step_schema: SchemaNodeId,
    step: &Step,
) -> Vec<NodeId> {
    tree.children_of(parent)
        .iter()
        .copied()
        .filter(|child| {
            tree.node(*child).schema == step_schema && step_predicates_match(schema, tree, *child, step)
        })
        .collect()
}

fn step_predicates_match(
    schema: &SchemaModule,
    tree: &DataTree,
    id: NodeId,
    step: &Step,
) -> bool {
    for predicate in &step.predicates {
        match predicate {
            Predicate::Key { name, value } => {
                let keys = tree.list_keys(schema, id);
                if !keys.iter().any(|(k, v)| k == name && v == value) {
                    return false;
                }
            }
            Predicate::Value(value) => {
                let matches = tree
                    .node(id)
                    .value
                    .as_ref()
                    .map(|v| v.lexical() == *value)
                    .unwrap_or(false);
                if !matches {
                    return false;
                }
            }
        }
    }
    true
}

fn single_instance(
    schema: &SchemaModule,
    tree: &DataTree,
    parent: Option<NodeId>,
    step_schema: SchemaNodeId,
    step: &Step,
    path: &XPath,
) -> Result<Option<NodeId>, EngineError> {
    let mut instances = find_instances(schema, tree, parent, step_schema, step);
    match instances.len() {
        0 => Ok(None),
        1 => Ok(instances.pop()),
        _ => Err(EngineError::InvalidArg(format!(
            "'{path}' addresses more than one instance of '{}'",
            step.name
        ))),
    }
}

fn create_list_instance(
    schema: &SchemaModule,
    tree: &mut DataTree,
    parent: Option<NodeId>,
    list_schema: SchemaNodeId,
    step: &Step,
    path: &XPath,
) -> Result<NodeId, EngineError> {
    let SchemaNodeKind::List { keys, .. } = &schema.node(list_schema).kind else {
        return Err(EngineError::Internal("not a list schema node".into()));
    };
    let mut key_values = Vec::with_capacity(keys.len());
    for key in keys {
        let value = step.predicates.iter().find_map(|p| match p {
            Predicate::Key { name, value } if name == key => Some(value.clone()),
            _ => None,
        });
        let value = value.ok_or_else(|| {
            EngineError::InvalidArg(format!("'{path}' is missing key '{key}' of '{}'", step.name))
        })?;
        key_values.push((key.clone(), value));
    }
    let instance = tree.add(parent, list_schema, Some(ValueData::List), false);
    for (key, lexical) in key_values {
        let key_schema = schema.find_child(Some(list_schema), &key).ok_or_else(|| {
            EngineError::Internal(format!("list '{}' lost key leaf '{key}'", step.name))
        })?;
        let SchemaNodeKind::Leaf { ty, .. } = &schema.node(key_schema).kind else {
            return Err(EngineError::Internal(format!("key '{key}' is not a leaf")));
        };
        let value = ValueData::parse(ty, &lexical)?;
        tree.add(Some(instance), key_schema, Some(value), false);
    }
    Ok(instance)
}

/// Descend to the parent of the last step, creating missing ancestors unless
/// `non_recursive` forbids it. Returns the parent node and the last step's
/// schema node.
fn descend_to_parent(
    schema: &SchemaModule,
    tree: &mut DataTree,
    path: &XPath,
    flags: EditFlags,
) -> Result<(Option<NodeId>, SchemaNodeId), EngineError> {
    let mut schema_cursor: Option<SchemaNodeId> = None;
    let mut data_cursor: Option<NodeId> = None;
    for (index, step) in path.steps.iter().enumerate() {
        let step_schema = schema.find_child(schema_cursor, &step.name).ok_or_else(|| {
            EngineError::BadElement(format!("no node '{}' in '{path}'", step.name))
        })?;
        if index + 1 == path.steps.len() {
            return Ok((data_cursor, step_schema));
        }
        let existing = single_instance(schema, tree, data_cursor, step_schema, step, path)?;
        let instance = match existing {
            Some(id) => id,
            None => {
                if flags.non_recursive {
                    return Err(EngineError::DataMissing(format!(
                        "ancestor '{}' of '{path}' does not exist",
                        step.name
                    )));
                }
                match &schema.node(step_schema).kind {
                    SchemaNodeKind::Container { presence } => {
                        let value = if *presence {
                            ValueData::PresenceContainer
                        } else {
                            ValueData::Container
                        };
                        tree.add(data_cursor, step_schema, Some(value), false)
                    }
                    SchemaNodeKind::List { .. } => {
                        create_list_instance(schema, tree, data_cursor, step_schema, step, path)?
                    }
                    _ => {
                        return Err(EngineError::BadElement(format!(
                            "'{}' in '{path}' cannot contain children",
                            step.name
                        )))
                    }
                }
            }
        };
        schema_cursor = Some(step_schema);
        data_cursor = Some(instance);
    }
    Err(EngineError::InvalidArg(format!("empty path '{path}'")))
}

/// Create or replace the node addressed by `path`.
pub fn apply_set(
    schema: &SchemaModule,
    tree: &mut DataTree,
    path: &XPath,
    value: Option<&ValueData>,
    flags: EditFlags,
) -> Result<(), EngineError> {
    let target = schema.resolve(path)?;
    let target_node = schema.node(target);
    if target_node.kind.is_procedure()
        || matches!(target_node.kind, SchemaNodeKind::Input | SchemaNodeKind::Output)
    {
        return Err(EngineError::BadElement(format!(
            "'{path}' addresses a procedure, not data"
        )));
    }
    let (parent, step_schema) = descend_to_parent(schema, tree, path, flags)?;
    let step = path.steps.last().ok_or_else(|| {
        EngineError::InvalidArg(format!("empty path '{path}'"))
    })?;
    match &schema.node(step_schema).kind {
        SchemaNodeKind::Leaf { ty, .. } => {
            let value = match value {
                Some(data) => {
                    if !data.matches_type(ty) {
                        return Err(EngineError::InvalidArg(format!(
                            "value kind '{}' does not match the type of '{path}'",
                            data.kind_str()
                        )));
                    }
                    data.clone()
                }
                None if matches!(ty, crate::value::LeafType::Empty) => ValueData::LeafEmpty,
                None => {
                    return Err(EngineError::InvalidArg(format!(
                        "a value is required to set '{path}'"
                    )))
                }
            };
            match single_instance(schema, tree, parent, step_schema, step, path)? {
                Some(existing) => {
                    if flags.strict {
                        return Err(EngineError::DataExists(path.to_string()));
                    }
                    tree.set_value(existing, Some(value));
                    tree.set_dflt(existing, false);
                }
                None => {
                    tree.add(parent, step_schema, Some(value), false);
                }
            }
        }
        SchemaNodeKind::LeafList { ty, .. } => {
            // An xpath value predicate takes precedence over the argument.
            let lexical = step.predicates.iter().find_map(|p| match p {
                Predicate::Value(v) => Some(v.clone()),
                _ => None,
            });
            let value = match (lexical, value) {
                (Some(lexical), _) => ValueData::parse(ty, &lexical)?,
                (None, Some(data)) => {
                    if !data.matches_type(ty) {
                        return Err(EngineError::InvalidArg(format!(
                            "value kind '{}' does not match the type of '{path}'",
                            data.kind_str()
                        )));
                    }
                    data.clone()
                }
                (None, None) => {
                    return Err(EngineError::InvalidArg(format!(
                        "a value is required to set '{path}'"
                    )))
                }
            };
            let exists = tree
                .children_of(parent)
                .iter()
                .any(|child| {
                    tree.node(*child).schema == step_schema
                        && tree.node(*child).value.as_ref().map(|v| v.lexical())
                            == Some(value.lexical())
                });
            if exists {
                if flags.strict {
                    return Err(EngineError::DataExists(path.to_string()));
                }
            } else {
                tree.add(parent, step_schema, Some(value), false);
            }
        }
        SchemaNodeKind::List { .. } => {
            match single_instance(schema, tree, parent, step_schema, step, path)? {
                Some(_) => {
                    if flags.strict {
                        return Err(EngineError::DataExists(path.to_string()));
                    }
                }
                None => {
                    create_list_instance(schema, tree, parent, step_schema, step, path)?;
                }
            }
        }
        SchemaNodeKind::Container { presence } => {
            match single_instance(schema, tree, parent, step_schema, step, path)? {
                Some(_) => {
                    if flags.strict {
                        return Err(EngineError::DataExists(path.to_string()));
                    }
                }
                None => {
                    let value = if *presence {
                        ValueData::PresenceContainer
                    } else {
                        ValueData::Container
                    };
                    tree.add(parent, step_schema, Some(value), false);
                }
            }
        }
        _ => {
            return Err(EngineError::BadElement(format!(
                "'{path}' cannot be set"
            )))
        }
    }
    Ok(())
}

fn has_real_children(tree: &DataTree, id: NodeId) -> bool {
    tree.children_of(Some(id))
        .iter()
        .any(|child| !tree.node(*child).dflt)
}

/// Delete the node(s) addressed by `path`. Without key predicates every
/// instance of a list goes.
pub fn apply_delete(
    schema: &SchemaModule,
    tree: &mut DataTree,
    path: &XPath,
    flags: EditFlags,
) -> Result<(), EngineError> {
    schema.resolve(path)?;
    let instances = tree.find(schema, path)?;
    if instances.is_empty() {
        if flags.strict {
            return Err(EngineError::DataMissing(path.to_string()));
        }
        return Ok(());
    }
    if flags.non_recursive {
        for id in &instances {
            let kind = &schema.node(tree.node(*id).schema).kind;
            let is_interior = matches!(
                kind,
                SchemaNodeKind::Container { .. } | SchemaNodeKind::List { .. }
            );
            if is_interior && has_real_children(tree, *id) {
                return Err(EngineError::DataExists(format!(
                    "'{}' is not empty",
                    tree.node_path(schema, *id)
                )));
            }
        }
    }
    for id in instances {
        tree.remove(id);
    }
    Ok(())
}

/// Reorder a user-ordered list or leaf-list instance.
pub fn apply_move(
    schema: &SchemaModule,
    tree: &mut DataTree,
    path: &XPath,
    position: MovePosition,
    relative: Option<&XPath>,
) -> Result<(), EngineError> {
    let target_schema = schema.resolve(path)?;
    let user_ordered = match &schema.node(target_schema).kind {
        SchemaNodeKind::List { user_ordered, .. } => *user_ordered,
        SchemaNodeKind::LeafList { user_ordered, .. } => *user_ordered,
        _ => false,
    };
    if !user_ordered {
        return Err(EngineError::InvalidArg(format!(
            "'{path}' is not a user-ordered list or leaf-list"
        )));
    }
    let mut instances = tree.find(schema, path)?;
    let id = match instances.len() {
        0 => return Err(EngineError::DataMissing(path.to_string())),
        1 => instances.remove(0),
        _ => {
            return Err(EngineError::InvalidArg(format!(
                "'{path}' addresses more than one instance"
            )))
        }
    };
    let relative_id = match (position, relative) {
        (MovePosition::Before | MovePosition::After, Some(rel_path)) => {
            let mut rel = tree.find(schema, rel_path)?;
            match rel.len() {
                0 => return Err(EngineError::DataMissing(rel_path.to_string())),
                1 => Some(rel.remove(0)),
                _ => {
                    return Err(EngineError::InvalidArg(format!(
                        "'{rel_path}' addresses more than one instance"
                    )))
                }
            }
        }
        (MovePosition::Before | MovePosition::After, None) => {
            return Err(EngineError::InvalidArg(
                "relative path required for before/after move".into(),
            ))
        }
        _ => None,
    };
    tree.move_node(id, position, relative_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::SchemaModuleBuilder;
    use crate::value::LeafType;

    fn schema() -> SchemaModule {
        let mut b = SchemaModuleBuilder::new("example-module");
        let container = b.container(None, "container");
        let list = b.list(Some(container), "list", &["key1", "key2"], true);
        b.leaf(Some(list), "key1", LeafType::String, None);
        b.leaf(Some(list), "key2", LeafType::String, None);
        b.leaf(Some(list), "leaf", LeafType::String, None);
        b.leaf_list(Some(container), "numbers", LeafType::Uint32, true);
        b.build().unwrap()
    }

    fn set(tree: &mut DataTree, schema: &SchemaModule, path: &str, value: &str) {
        apply_set(
            schema,
            tree,
            &XPath::parse(path).unwrap(),
            Some(&ValueData::String(value.into())),
            EditFlags::DEFAULT,
        )
        .unwrap();
    }

    #[test]
    fn edit_flags_round_trip_through_bits() {
        for bits in 0..4 {
            assert_eq!(EditFlags::from_bits(bits).bits(), bits);
        }
        assert!(EditFlags::STRICT.strict);
        assert!(EditFlags::NON_RECURSIVE.non_recursive);
        assert_eq!(EditFlags::DEFAULT.bits(), 0);
    }

    #[test]
    fn set_creates_missing_ancestors_with_keys() {
        let schema = schema();
        let mut tree = DataTree::new();
        set(
            &mut tree,
            &schema,
            "/example-module:container/list[key1='a'][key2='b']/leaf",
            "v",
        );
        let found = tree
            .find(
                &schema,
                &XPath::parse("/example-module:container/list[key1='a'][key2='b']/leaf").unwrap(),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            tree.node(found[0]).value,
            Some(ValueData::String("v".into()))
        );
    }

    #[test]
    fn strict_set_on_existing_node_is_data_exists() {
        let schema = schema();
        let mut tree = DataTree::new();
        let path = "/example-module:container/list[key1='a'][key2='b']/leaf";
        set(&mut tree, &schema, path, "v");
        let err = apply_set(
            &schema,
            &mut tree,
            &XPath::parse(path).unwrap(),
            Some(&ValueData::String("w".into())),
            EditFlags::STRICT,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DataExists(_)));
    }

    #[test]
    fn non_recursive_set_requires_ancestors() {
        let schema = schema();
        let mut tree = DataTree::new();
        let err = apply_set(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list[key1='a'][key2='b']/leaf").unwrap(),
            Some(&ValueData::String("v".into())),
            EditFlags::NON_RECURSIVE,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DataMissing(_)));
    }

    #[test]
    fn strict_delete_of_missing_node_is_data_missing() {
        let schema = schema();
        let mut tree = DataTree::new();
        let err = apply_delete(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list[key1='a'][key2='b']/leaf").unwrap(),
            EditFlags::STRICT,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DataMissing(_)));
        // Without strict the same delete is a no-op.
        apply_delete(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list[key1='a'][key2='b']/leaf").unwrap(),
            EditFlags::DEFAULT,
        )
        .unwrap();
    }

    #[test]
    fn delete_without_keys_removes_all_instances() {
        let schema = schema();
        let mut tree = DataTree::new();
        set(
            &mut tree,
            &schema,
            "/example-module:container/list[key1='a'][key2='b']/leaf",
            "v",
        );
        set(
            &mut tree,
            &schema,
            "/example-module:container/list[key1='c'][key2='d']/leaf",
            "w",
        );
        apply_delete(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list").unwrap(),
            EditFlags::DEFAULT,
        )
        .unwrap();
        let all = tree
            .find(&schema, &XPath::parse("/example-module:container/list").unwrap())
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn non_recursive_delete_of_populated_list_fails() {
        let schema = schema();
        let mut tree = DataTree::new();
        set(
            &mut tree,
            &schema,
            "/example-module:container/list[key1='a'][key2='b']/leaf",
            "v",
        );
        let err = apply_delete(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list[key1='a'][key2='b']").unwrap(),
            EditFlags::NON_RECURSIVE,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DataExists(_)));
    }

    #[test]
    fn leaf_list_predicate_takes_precedence_over_value() {
        let schema = schema();
        let mut tree = DataTree::new();
        apply_set(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/numbers[.='42']").unwrap(),
            Some(&ValueData::Uint32(7)),
            EditFlags::DEFAULT,
        )
        .unwrap();
        let found = tree
            .find(
                &schema,
                &XPath::parse("/example-module:container/numbers[.='42']").unwrap(),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(tree.node(found[0]).value, Some(ValueData::Uint32(42)));
    }

    #[test]
    fn move_rejects_ordered_by_system() {
        let mut b = SchemaModuleBuilder::new("m");
        let list = b.list(None, "system-list", &["id"], false);
        b.leaf(Some(list), "id", LeafType::String, None);
        let schema = b.build().unwrap();
        let mut tree = DataTree::new();
        apply_set(
            &schema,
            &mut tree,
            &XPath::parse("/m:system-list[id='x']").unwrap(),
            None,
            EditFlags::DEFAULT,
        )
        .unwrap();
        let err = apply_move(
            &schema,
            &mut tree,
            &XPath::parse("/m:system-list[id='x']").unwrap(),
            MovePosition::First,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArg(_)));
    }

    #[test]
    fn move_reorders_user_ordered_list() {
        let schema = schema();
        let mut tree = DataTree::new();
        for key in ["a", "b", "c"] {
            set(
                &mut tree,
                &schema,
                &format!("/example-module:container/list[key1='{key}'][key2='k']/leaf"),
                "v",
            );
        }
        apply_move(
            &schema,
            &mut tree,
            &XPath::parse("/example-module:container/list[key1='c'][key2='k']").unwrap(),
            MovePosition::First,
            None,
        )
        .unwrap();
        let order: Vec<String> = tree
            .find(&schema, &XPath::parse("/example-module:container/list").unwrap())
            .unwrap()
            .iter()
            .map(|id| tree.list_keys(&schema, *id)[0].1.clone())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
