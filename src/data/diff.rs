//! Tree comparison. `diff_trees` produces the per-module difference list a
//! commit stores in its context; `generate_changes` flattens it into the
//! change records served to notification sessions.

use std::collections::HashMap;

use crate::data::tree::{DataTree, InstanceKey, NodeId};
use crate::schema::model::{SchemaModule, SchemaNodeId, SchemaNodeKind};
use crate::value::{Value, ValueData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Created,
    Deleted,
    Changed,
    MovedFrom,
    MovedTo,
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub xpath: String,
    pub schema: SchemaNodeId,
    pub old_node: Option<NodeId>,
    pub new_node: Option<NodeId>,
}

/// External change operations, the shape subscribers iterate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeOp {
    Created,
    Modified,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub op: ChangeOp,
    pub xpath: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

fn visible_children(tree: &DataTree, parent: Option<NodeId>) -> Vec<NodeId> {
    tree.children_of(parent)
        .iter()
        .copied()
        .filter(|id| !tree.node(*id).dflt)
        .collect()
}

/// Indices (into `positions`) of elements forming a longest increasing
/// subsequence; everything else moved.
fn stable_positions(positions: &[usize]) -> Vec<bool> {
    let n = positions.len();
    let mut best_len = vec![1usize; n];
    let mut prev = vec![usize::MAX; n];
    let mut best_end = 0usize;
    for i in 0..n {
        for j in 0..i {
            if positions[j] < positions[i] && best_len[j] + 1 > best_len[i] {
                best_len[i] = best_len[j] + 1;
                prev[i] = j;
            }
        }
        if best_len[i] > best_len[best_end] {
            best_end = i;
        }
    }
    let mut stable = vec![false; n];
    if n > 0 {
        let mut cursor = best_end;
        loop {
            stable[cursor] = true;
            if prev[cursor] == usize::MAX {
                break;
            }
            cursor = prev[cursor];
        }
    }
    stable
}

fn diff_level(
    schema: &SchemaModule,
    old: &DataTree,
    new: &DataTree,
    old_parent: Option<NodeId>,
    new_parent: Option<NodeId>,
    out: &mut Vec<DiffEntry>,
) {
    let old_children = visible_children(old, old_parent);
    let new_children = visible_children(new, new_parent);
    let old_keys: Vec<InstanceKey> = old_children
        .iter()
        .map(|id| old.instance_key(schema, *id))
        .collect();
    let new_keys: Vec<InstanceKey> = new_children
        .iter()
        .map(|id| new.instance_key(schema, *id))
        .collect();
    let old_index: HashMap<&InstanceKey, usize> =
        old_keys.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let new_index: HashMap<&InstanceKey, usize> =
        new_keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

    // Deletions, in old order.
    for (i, key) in old_keys.iter().enumerate() {
        if !new_index.contains_key(key) {
            out.push(DiffEntry {
                kind: DiffKind::Deleted,
                xpath: old.node_path(schema, old_children[i]),
                schema: key.schema,
                old_node: Some(old_children[i]),
                new_node: None,
            });
        }
    }
    // Creations and common nodes, in new order.
    for (i, key) in new_keys.iter().enumerate() {
        let new_id = new_children[i];
        match old_index.get(key) {
            None => {
                out.push(DiffEntry {
                    kind: DiffKind::Created,
                    xpath: new.node_path(schema, new_id),
                    schema: key.schema,
                    old_node: None,
                    new_node: Some(new_id),
                });
            }
            Some(old_pos) => {
                let old_id = old_children[*old_pos];
                let is_leaf = matches!(
                    schema.node(key.schema).kind,
                    SchemaNodeKind::Leaf { .. }
                );
                if is_leaf && old.node(old_id).value != new.node(new_id).value {
                    out.push(DiffEntry {
                        kind: DiffKind::Changed,
                        xpath: new.node_path(schema, new_id),
                        schema: key.schema,
                        old_node: Some(old_id),
                        new_node: Some(new_id),
                    });
                }
                diff_level(schema, old, new, Some(old_id), Some(new_id), out);
            }
        }
    }
    // Order changes among common instances of user-ordered nodes.
    let mut by_schema: Vec<SchemaNodeId> = Vec::new();
    for key in &new_keys {
        let user_ordered = match &schema.node(key.schema).kind {
            SchemaNodeKind::List { user_ordered, .. } => *user_ordered,
            SchemaNodeKind::LeafList { user_ordered, .. } => *user_ordered,
            _ => false,
        };
        if user_ordered && !by_schema.contains(&key.schema) {
            by_schema.push(key.schema);
        }
    }
    for ordered_schema in by_schema {
        let common_new: Vec<usize> = (0..new_keys.len())
            .filter(|i| new_keys[*i].schema == ordered_schema && old_index.contains_key(&new_keys[*i]))
            .collect();
        let old_positions: Vec<usize> = common_new
            .iter()
            .map(|i| old_index[&new_keys[*i]])
            .collect();
        let stable = stable_positions(&old_positions);
        for (slot, i) in common_new.iter().enumerate() {
            if !stable[slot] {
                let new_id = new_children[*i];
                let old_id = old_children[old_positions[slot]];
                out.push(DiffEntry {
                    kind: DiffKind::MovedFrom,
                    xpath: old.node_path(schema, old_id),
                    schema: ordered_schema,
                    old_node: Some(old_id),
                    new_node: None,
                });
                out.push(DiffEntry {
                    kind: DiffKind::MovedTo,
                    xpath: new.node_path(schema, new_id),
                    schema: ordered_schema,
                    old_node: None,
                    new_node: Some(new_id),
                });
            }
        }
    }
}

/// Compare two module trees, ignoring materialized default nodes.
pub fn diff_trees(schema: &SchemaModule, old: &DataTree, new: &DataTree) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    diff_level(schema, old, new, None, None, &mut out);
    out
}

fn node_value(schema: &SchemaModule, tree: &DataTree, id: NodeId) -> Value {
    let node = tree.node(id);
    Value {
        xpath: tree.node_path(schema, id),
        dflt: node.dflt,
        data: node.value.clone().unwrap_or(ValueData::Container),
    }
}

/// Flatten a diff into the externally visible change list. Created and
/// deleted subtrees expand to one change per contained node.
pub fn generate_changes(
    schema: &SchemaModule,
    old: &DataTree,
    new: &DataTree,
    diff: &[DiffEntry],
) -> Vec<Change> {
    let mut changes = Vec::new();
    for entry in diff {
        match entry.kind {
            DiffKind::Created => {
                if let Some(root) = entry.new_node {
                    for id in new.preorder(Some(root)) {
                        if new.node(id).dflt {
                            continue;
                        }
                        changes.push(Change {
                            op: ChangeOp::Created,
                            xpath: new.node_path(schema, id),
                            old_value: None,
                            new_value: Some(node_value(schema, new, id)),
                        });
                    }
                }
            }
            DiffKind::Deleted => {
                if let Some(root) = entry.old_node {
                    for id in old.preorder(Some(root)) {
                        if old.node(id).dflt {
                            continue;
                        }
                        changes.push(Change {
                            op: ChangeOp::Deleted,
                            xpath: old.node_path(schema, id),
                            old_value: Some(node_value(schema, old, id)),
                            new_value: None,
                        });
                    }
                }
            }
            DiffKind::Changed => {
                changes.push(Change {
                    op: ChangeOp::Modified,
                    xpath: entry.xpath.clone(),
                    old_value: entry.old_node.map(|id| node_value(schema, old, id)),
                    new_value: entry.new_node.map(|id| node_value(schema, new, id)),
                });
            }
            DiffKind::MovedFrom => {}
            DiffKind::MovedTo => {
                changes.push(Change {
                    op: ChangeOp::Moved,
                    xpath: entry.xpath.clone(),
                    old_value: None,
                    new_value: entry.new_node.map(|id| node_value(schema, new, id)),
                });
            }
        }
    }
    changes
}
