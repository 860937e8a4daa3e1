//! Structural validation, default materialization and procedure-argument
//! validation. Tree-level checks return `(message, xpath)` records; callers
//! decide whether a non-empty list fails the request.

use std::collections::HashMap;

use crate::data::tree::{DataTree, NodeId};
use crate::error::{EngineError, SessionError};
use crate::schema::model::{SchemaModule, SchemaNodeId, SchemaNodeKind};
use crate::value::{Value, ValueData};
use crate::xpath::XPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Rpc,
    Action,
    EventNotification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    Input,
    Output,
}

fn subtree_has_defaults(schema: &SchemaModule, id: SchemaNodeId) -> bool {
    match &schema.node(id).kind {
        SchemaNodeKind::Leaf { default, .. } => default.is_some(),
        SchemaNodeKind::Container { presence: false } => schema
            .node(id)
            .children
            .iter()
            .any(|child| subtree_has_defaults(schema, *child)),
        _ => false,
    }
}

fn materialize_level(
    schema: &SchemaModule,
    tree: &mut DataTree,
    parent_schema: Option<SchemaNodeId>,
    parent_node: Option<NodeId>,
) {
    for child_schema in schema.children_of(parent_schema).to_vec() {
        let instances: Vec<NodeId> = tree
            .children_of(parent_node)
            .iter()
            .copied()
            .filter(|id| tree.node(*id).schema == child_schema)
            .collect();
        match &schema.node(child_schema).kind {
            SchemaNodeKind::Leaf { ty, default, .. } => {
                if instances.is_empty() {
                    if let Some(default) = default {
                        if let Ok(value) = ValueData::parse(ty, default) {
                            tree.add(parent_node, child_schema, Some(value), true);
                        }
                    }
                }
            }
            SchemaNodeKind::Container { presence: false } => {
                let instance = match instances.first() {
                    Some(id) => Some(*id),
                    None if subtree_has_defaults(schema, child_schema) => Some(tree.add(
                        parent_node,
                        child_schema,
                        Some(ValueData::Container),
                        true,
                    )),
                    None => None,
                };
                if let Some(id) = instance {
                    materialize_level(schema, tree, Some(child_schema), Some(id));
                }
            }
            SchemaNodeKind::Container { presence: true } | SchemaNodeKind::List { .. } => {
                for id in instances {
                    materialize_level(schema, tree, Some(child_schema), Some(id));
                }
            }
            _ => {}
        }
    }
}

/// Create default leaves (and the non-presence containers that carry them)
/// wherever they are absent. Added nodes carry the default flag.
pub fn materialize_defaults(schema: &SchemaModule, tree: &mut DataTree) {
    materialize_level(schema, tree, None, None);
}

fn validate_level(
    schema: &SchemaModule,
    tree: &DataTree,
    parent_schema: Option<SchemaNodeId>,
    parent_node: Option<NodeId>,
    errors: &mut Vec<SessionError>,
) {
    let children: Vec<NodeId> = tree.children_of(parent_node).to_vec();
    let mut singleton_seen: HashMap<SchemaNodeId, NodeId> = HashMap::new();
    let mut instance_seen: HashMap<(SchemaNodeId, Vec<String>), NodeId> = HashMap::new();
    for id in &children {
        let node = tree.node(*id);
        let schema_node = schema.node(node.schema);
        match &schema_node.kind {
            SchemaNodeKind::Leaf { ty, .. } => {
                if singleton_seen.insert(node.schema, *id).is_some() {
                    errors.push(SessionError::at(
                        format!("duplicate node '{}'", schema_node.name),
                        tree.node_path(schema, *id),
                    ));
                }
                if let Some(value) = &node.value {
                    if !value.matches_type(ty) {
                        errors.push(SessionError::at(
                            format!(
                                "value kind '{}' does not match the type of '{}'",
                                value.kind_str(),
                                schema_node.name
                            ),
                            tree.node_path(schema, *id),
                        ));
                    }
                }
            }
            SchemaNodeKind::Container { .. } => {
                if singleton_seen.insert(node.schema, *id).is_some() {
                    errors.push(SessionError::at(
                        format!("duplicate node '{}'", schema_node.name),
                        tree.node_path(schema, *id),
                    ));
                }
                validate_level(schema, tree, Some(node.schema), Some(*id), errors);
            }
            SchemaNodeKind::List { keys, .. } => {
                let key_values = tree.list_keys(schema, *id);
                for (key, _) in keys.iter().zip(key_values.iter()) {
                    let present = tree.children_of(Some(*id)).iter().any(|child| {
                        schema.node(tree.node(*child).schema).name == *key
                            && tree.node(*child).value.is_some()
                    });
                    if !present {
                        errors.push(SessionError::at(
                            format!("list instance is missing key '{key}'"),
                            tree.node_path(schema, *id),
                        ));
                    }
                }
                let discriminator: Vec<String> =
                    key_values.into_iter().map(|(_, value)| value).collect();
                if instance_seen
                    .insert((node.schema, discriminator), *id)
                    .is_some()
                {
                    errors.push(SessionError::at(
                        format!("duplicate instance of list '{}'", schema_node.name),
                        tree.node_path(schema, *id),
                    ));
                }
                validate_level(schema, tree, Some(node.schema), Some(*id), errors);
            }
            SchemaNodeKind::LeafList { ty, .. } => {
                let lexical = node.value.as_ref().map(|v| v.lexical()).unwrap_or_default();
                if instance_seen
                    .insert((node.schema, vec![lexical]), *id)
                    .is_some()
                {
                    errors.push(SessionError::at(
                        format!("duplicate leaf-list value in '{}'", schema_node.name),
                        tree.node_path(schema, *id),
                    ));
                }
                if let Some(value) = &node.value {
                    if !value.matches_type(ty) {
                        errors.push(SessionError::at(
                            format!(
                                "value kind '{}' does not match the type of '{}'",
                                value.kind_str(),
                                schema_node.name
                            ),
                            tree.node_path(schema, *id),
                        ));
                    }
                }
            }
            _ => {
                errors.push(SessionError::at(
                    format!("'{}' is not a data node", schema_node.name),
                    tree.node_path(schema, *id),
                ));
            }
        }
    }
    // Mandatory leaves of the present parent.
    for child_schema in schema.children_of(parent_schema) {
        if let SchemaNodeKind::Leaf {
            mandatory: true, ..
        } = &schema.node(*child_schema).kind
        {
            let present = children
                .iter()
                .any(|id| tree.node(*id).schema == *child_schema && !tree.node(*id).dflt);
            if present {
                continue;
            }
            // Mandatory checks apply below present interior nodes and at the top.
            if parent_node.is_some() || parent_schema.is_none() {
                errors.push(SessionError::at(
                    format!(
                        "missing mandatory node '{}'",
                        schema.node(*child_schema).name
                    ),
                    schema.schema_path(*child_schema),
                ));
            }
        }
    }
}

/// Full structural validation of one module tree.
pub fn validate_tree(schema: &SchemaModule, tree: &DataTree) -> Vec<SessionError> {
    let mut errors = Vec::new();
    validate_level(schema, tree, None, None, &mut errors);
    errors
}

fn procedure_schema_kind(kind: ProcedureKind) -> &'static str {
    match kind {
        ProcedureKind::Rpc => "rpc",
        ProcedureKind::Action => "action",
        ProcedureKind::EventNotification => "notification",
    }
}

/// Validate the arguments of an RPC, action or event notification against
/// the procedure's schema, materializing input/output defaults. Procedures
/// nested in the data tree require their parent instance to exist in the
/// caller's view.
pub fn validate_procedure(
    schema: &SchemaModule,
    view: Option<&DataTree>,
    kind: ProcedureKind,
    xpath: &str,
    args: &[Value],
    direction: ArgDirection,
) -> Result<Vec<Value>, EngineError> {
    let path = XPath::parse(xpath)?;
    let proc_id = schema.resolve(&path)?;
    let matches = matches!(
        (&schema.node(proc_id).kind, kind),
        (SchemaNodeKind::Rpc, ProcedureKind::Rpc)
            | (SchemaNodeKind::Action, ProcedureKind::Action)
            | (SchemaNodeKind::Notification, ProcedureKind::EventNotification)
    );
    if !matches {
        return Err(EngineError::InvalidArg(format!(
            "'{xpath}' is not an {}",
            procedure_schema_kind(kind)
        )));
    }
    // A procedure below the top level lives inside the data tree; its parent
    // instance must exist for the call to make sense.
    if let Some(parent_path) = path.parent() {
        let view = view.ok_or_else(|| {
            EngineError::BadElement(format!("no data view to resolve parent of '{xpath}'"))
        })?;
        let parents = view.find(schema, &parent_path)?;
        if parents.is_empty() {
            return Err(EngineError::BadElement(format!(
                "parent of '{xpath}' does not exist"
            )));
        }
    }
    // Arguments live under input/output for rpc and action, directly under
    // the notification node otherwise.
    let arg_root = match kind {
        ProcedureKind::EventNotification => proc_id,
        _ => {
            let stanza = match direction {
                ArgDirection::Input => "input",
                ArgDirection::Output => "output",
            };
            schema.find_child(Some(proc_id), stanza).ok_or_else(|| {
                EngineError::Internal(format!("procedure '{xpath}' has no {stanza} stanza"))
            })?
        }
    };

    let proc_prefix = format!("{path}");
    let mut completed = Vec::new();
    let mut supplied: Vec<String> = Vec::new();
    for arg in args {
        let rest = arg
            .xpath
            .strip_prefix(&proc_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                EngineError::BadElement(format!(
                    "argument '{}' is outside procedure '{xpath}'",
                    arg.xpath
                ))
            })?;
        let mut cursor = arg_root;
        for step in rest.split('/') {
            let name = step.split('[').next().unwrap_or(step);
            cursor = schema.find_child(Some(cursor), name).ok_or_else(|| {
                EngineError::BadElement(format!(
                    "argument '{}' does not exist in '{xpath}'",
                    arg.xpath
                ))
            })?;
        }
        if let SchemaNodeKind::Leaf { ty, .. } | SchemaNodeKind::LeafList { ty, .. } =
            &schema.node(cursor).kind
        {
            if !arg.data.matches_type(ty) {
                return Err(EngineError::InvalidArg(format!(
                    "argument '{}' has value kind '{}' not matching its type",
                    arg.xpath,
                    arg.data.kind_str()
                )));
            }
        }
        supplied.push(rest.to_string());
        completed.push(arg.clone());
    }
    // Materialize defaults for leaves directly under the argument root.
    for child in schema.children_of(Some(arg_root)) {
        if let SchemaNodeKind::Leaf {
            ty,
            default: Some(default),
            ..
        } = &schema.node(*child).kind
        {
            let name = &schema.node(*child).name;
            if supplied.iter().any(|s| s == name || s.starts_with(&format!("{name}/"))) {
                continue;
            }
            let value = ValueData::parse(ty, default)?;
            completed.push(Value {
                xpath: format!("{proc_prefix}/{name}"),
                dflt: true,
                data: value,
            });
        }
    }
    Ok(completed)
}
