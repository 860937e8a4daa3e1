//! Arena-owned data trees. A tree owns all of its nodes in one vector;
//! parents and children reference each other by index, so subtree ownership
//! is unambiguous and duplication is a walk.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::schema::model::{SchemaModule, SchemaNodeId, SchemaNodeKind};
use crate::value::ValueData;
use crate::xpath::{Predicate, Step, XPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct DataNode {
    pub schema: SchemaNodeId,
    pub value: Option<ValueData>,
    /// Set on materialized default nodes; stripped from the on-disk form.
    pub dflt: bool,
    pub parent: Option<NodeId>,
    children: Vec<NodeId>,
    alive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataTree {
    nodes: Vec<DataNode>,
    roots: Vec<NodeId>,
}

/// Identity of one instance among its siblings: the schema node plus the key
/// values (list), the value (leaf-list) or nothing (singletons).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub schema: SchemaNodeId,
    pub discriminator: Vec<String>,
}

impl DataTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DataNode {
        &self.nodes[id.0]
    }

    pub fn children_of(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            Some(id) => &self.nodes[id.0].children,
            None => &self.roots,
        }
    }

    pub fn add(
        &mut self,
        parent: Option<NodeId>,
        schema: SchemaNodeId,
        value: Option<ValueData>,
        dflt: bool,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(DataNode {
            schema,
            value,
            dflt,
            parent,
            children: Vec::new(),
            alive: true,
        });
        match parent {
            Some(parent_id) => self.nodes[parent_id.0].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn set_value(&mut self, id: NodeId, value: Option<ValueData>) {
        self.nodes[id.0].value = value;
    }

    pub fn set_dflt(&mut self, id: NodeId, dflt: bool) {
        self.nodes[id.0].dflt = dflt;
    }

    /// Detach and drop a subtree.
    pub fn remove(&mut self, id: NodeId) {
        let parent = self.nodes[id.0].parent;
        match parent {
            Some(parent_id) => self.nodes[parent_id.0].children.retain(|c| *c != id),
            None => self.roots.retain(|c| *c != id),
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.nodes[current.0].alive = false;
            stack.extend(self.nodes[current.0].children.clone());
            self.nodes[current.0].children.clear();
        }
    }

    /// Preorder walk of the subtree under `from` (`None` = whole tree).
    pub fn preorder(&self, from: Option<NodeId>) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match from {
            Some(id) => vec![id],
            None => self.roots.iter().rev().copied().collect(),
        };
        while let Some(current) = stack.pop() {
            out.push(current);
            for child in self.nodes[current.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Compacted deep copy: dead slots are not carried over, order is kept.
    pub fn deep_copy(&self) -> DataTree {
        let mut copy = DataTree::new();
        let mut mapping: HashMap<NodeId, NodeId> = HashMap::new();
        for id in self.preorder(None) {
            let node = &self.nodes[id.0];
            let parent = node.parent.and_then(|p| mapping.get(&p).copied());
            let new_id = copy.add(parent, node.schema, node.value.clone(), node.dflt);
            mapping.insert(id, new_id);
        }
        copy
    }

    /// Drop every subtree whose schema node fails `keep`.
    pub fn retain_schema(&mut self, keep: &dyn Fn(SchemaNodeId) -> bool) {
        let mut doomed = Vec::new();
        let mut stack: Vec<NodeId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            if !keep(self.nodes[id.0].schema) {
                doomed.push(id);
            } else {
                stack.extend(self.nodes[id.0].children.clone());
            }
        }
        for id in doomed {
            self.remove(id);
        }
    }

    /// Key values of a list instance, in declared key order.
    pub fn list_keys(&self, schema: &SchemaModule, id: NodeId) -> Vec<(String, String)> {
        let node = &self.nodes[id.0];
        let SchemaNodeKind::List { keys, .. } = &schema.node(node.schema).kind else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for key in keys {
            let value = node
                .children
                .iter()
                .find(|child| schema.node(self.nodes[child.0].schema).name == *key)
                .and_then(|child| self.nodes[child.0].value.as_ref())
                .map(|value| value.lexical())
                .unwrap_or_default();
            out.push((key.clone(), value));
        }
        out
    }

    /// Sibling identity used by the diff and by instance lookup.
    pub fn instance_key(&self, schema: &SchemaModule, id: NodeId) -> InstanceKey {
        let node = &self.nodes[id.0];
        let discriminator = match &schema.node(node.schema).kind {
            SchemaNodeKind::List { .. } => self
                .list_keys(schema, id)
                .into_iter()
                .map(|(_, value)| value)
                .collect(),
            SchemaNodeKind::LeafList { .. } => {
                vec![node.value.as_ref().map(|v| v.lexical()).unwrap_or_default()]
            }
            _ => Vec::new(),
        };
        InstanceKey {
            schema: node.schema,
            discriminator,
        }
    }

    fn step_matches(
        &self,
        schema: &SchemaModule,
        id: NodeId,
        step_schema: SchemaNodeId,
        step: &Step,
    ) -> bool {
        let node = &self.nodes[id.0];
        if node.schema != step_schema {
            return false;
        }
        for predicate in &step.predicates {
            match predicate {
                Predicate::Key { name, value } => {
                    let keys = self.list_keys(schema, id);
                    let matched = keys
                        .iter()
                        .any(|(key, key_value)| key == name && key_value == value);
                    if !matched {
                        return false;
                    }
                }
                Predicate::Value(value) => {
                    let matched = node
                        .value
                        .as_ref()
                        .map(|v| v.lexical() == *value)
                        .unwrap_or(false);
                    if !matched {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// All instances addressed by a path. A list step without key predicates
    /// matches every instance. Resolution errors (unknown schema step) come
    /// back as bad element; an empty result is not an error.
    pub fn find(&self, schema: &SchemaModule, path: &XPath) -> Result<Vec<NodeId>, EngineError> {
        let mut schema_cursor: Option<SchemaNodeId> = None;
        let mut frontier: Vec<Option<NodeId>> = vec![None];
        for step in &path.steps {
            let step_schema = schema.find_child(schema_cursor, &step.name).ok_or_else(|| {
                EngineError::BadElement(format!("no node '{}' in '{path}'", step.name))
            })?;
            let mut next = Vec::new();
            for parent in &frontier {
                for child in self.children_of(*parent) {
                    if self.step_matches(schema, *child, step_schema, step) {
                        next.push(Some(*child));
                    }
                }
            }
            schema_cursor = Some(step_schema);
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(frontier.into_iter().flatten().collect())
    }

    /// Data path of a node, with list keys and leaf-list values spelled out.
    pub fn node_path(&self, schema: &SchemaModule, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            let schema_node = schema.node(node.schema);
            let mut segment = schema_node.name.clone();
            match &schema_node.kind {
                SchemaNodeKind::List { .. } => {
                    for (key, value) in self.list_keys(schema, node_id) {
                        segment.push_str(&format!("[{key}='{value}']"));
                    }
                }
                SchemaNodeKind::LeafList { .. } => {
                    if let Some(value) = &node.value {
                        segment.push_str(&format!("[.='{}']", value.lexical()));
                    }
                }
                _ => {}
            }
            segments.push(segment);
            current = node.parent;
        }
        segments.reverse();
        let mut path = String::new();
        for (i, segment) in segments.iter().enumerate() {
            path.push('/');
            if i == 0 {
                path.push_str(&schema.name);
                path.push(':');
            }
            path.push_str(segment);
        }
        path
    }
}

/// Reposition `id` among its same-schema siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePosition {
    Before,
    After,
    First,
    Last,
}

impl MovePosition {
    pub fn tag(&self) -> u8 {
        match self {
            MovePosition::Before => 0,
            MovePosition::After => 1,
            MovePosition::First => 2,
            MovePosition::Last => 3,
        }
    }
}

impl DataTree {
    /// Move a user-ordered instance. `relative` is required for
    /// before/after; it must share parent and schema with `id`.
    pub fn move_node(
        &mut self,
        id: NodeId,
        position: MovePosition,
        relative: Option<NodeId>,
    ) -> Result<(), EngineError> {
        let parent = self.nodes[id.0].parent;
        let schema = self.nodes[id.0].schema;
        if let Some(rel) = relative {
            if self.nodes[rel.0].parent != parent || self.nodes[rel.0].schema != schema {
                return Err(EngineError::InvalidArg(
                    "relative node is not a sibling instance".into(),
                ));
            }
        }
        let siblings: Vec<NodeId> = match parent {
            Some(p) => self.nodes[p.0].children.clone(),
            None => self.roots.clone(),
        };
        let mut reordered: Vec<NodeId> = siblings.iter().copied().filter(|s| *s != id).collect();
        let index = match position {
            MovePosition::First => reordered
                .iter()
                .position(|s| self.nodes[s.0].schema == schema)
                .unwrap_or(reordered.len()),
            MovePosition::Last => reordered
                .iter()
                .rposition(|s| self.nodes[s.0].schema == schema)
                .map(|i| i + 1)
                .unwrap_or(reordered.len()),
            MovePosition::Before => {
                let rel = relative.ok_or_else(|| {
                    EngineError::InvalidArg("relative instance required for 'before'".into())
                })?;
                reordered
                    .iter()
                    .position(|s| *s == rel)
                    .ok_or_else(|| EngineError::Internal("relative sibling vanished".into()))?
            }
            MovePosition::After => {
                let rel = relative.ok_or_else(|| {
                    EngineError::InvalidArg("relative instance required for 'after'".into())
                })?;
                reordered
                    .iter()
                    .position(|s| *s == rel)
                    .map(|i| i + 1)
                    .ok_or_else(|| EngineError::Internal("relative sibling vanished".into()))?
            }
        };
        reordered.insert(index, id);
        match parent {
            Some(p) => self.nodes[p.0].children = reordered,
            None => self.roots = reordered,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::SchemaModuleBuilder;
    use crate::value::LeafType;

    fn schema() -> SchemaModule {
        let mut b = SchemaModuleBuilder::new("m");
        let container = b.container(None, "container");
        let list = b.list(Some(container), "list", &["name"], true);
        b.leaf(Some(list), "name", LeafType::String, None);
        b.leaf(Some(list), "value", LeafType::Uint32, None);
        b.leaf_list(Some(container), "tags", LeafType::String, true);
        b.build().unwrap()
    }

    fn instance(tree: &mut DataTree, schema: &SchemaModule, name: &str, value: u32) -> NodeId {
        let container_s = schema.find_child(None, "container").unwrap();
        let list_s = schema.find_child(Some(container_s), "list").unwrap();
        let name_s = schema.find_child(Some(list_s), "name").unwrap();
        let value_s = schema.find_child(Some(list_s), "value").unwrap();
        let container = match tree.children_of(None).first().copied() {
            Some(existing) => existing,
            None => tree.add(None, container_s, Some(ValueData::Container), false),
        };
        let item = tree.add(Some(container), list_s, Some(ValueData::List), false);
        tree.add(
            Some(item),
            name_s,
            Some(ValueData::String(name.into())),
            false,
        );
        tree.add(Some(item), value_s, Some(ValueData::Uint32(value)), false);
        item
    }

    #[test]
    fn find_with_key_predicate_selects_one_instance() {
        let schema = schema();
        let mut tree = DataTree::new();
        instance(&mut tree, &schema, "a", 1);
        let b = instance(&mut tree, &schema, "b", 2);
        let path = XPath::parse("/m:container/list[name='b']").unwrap();
        assert_eq!(tree.find(&schema, &path).unwrap(), vec![b]);
        let all = XPath::parse("/m:container/list").unwrap();
        assert_eq!(tree.find(&schema, &all).unwrap().len(), 2);
    }

    #[test]
    fn node_path_includes_keys() {
        let schema = schema();
        let mut tree = DataTree::new();
        let a = instance(&mut tree, &schema, "a", 1);
        assert_eq!(tree.node_path(&schema, a), "/m:container/list[name='a']");
    }

    #[test]
    fn remove_detaches_whole_subtree() {
        let schema = schema();
        let mut tree = DataTree::new();
        let a = instance(&mut tree, &schema, "a", 1);
        instance(&mut tree, &schema, "b", 2);
        tree.remove(a);
        let all = XPath::parse("/m:container/list").unwrap();
        assert_eq!(tree.find(&schema, &all).unwrap().len(), 1);
    }

    #[test]
    fn deep_copy_compacts_dead_slots() {
        let schema = schema();
        let mut tree = DataTree::new();
        let a = instance(&mut tree, &schema, "a", 1);
        instance(&mut tree, &schema, "b", 2);
        tree.remove(a);
        let copy = tree.deep_copy();
        assert_eq!(copy.preorder(None).len(), tree.preorder(None).len());
        let all = XPath::parse("/m:container/list").unwrap();
        assert_eq!(copy.find(&schema, &all).unwrap().len(), 1);
    }

    #[test]
    fn move_first_last_before_after() {
        let schema = schema();
        let mut tree = DataTree::new();
        let a = instance(&mut tree, &schema, "a", 1);
        let b = instance(&mut tree, &schema, "b", 2);
        let c = instance(&mut tree, &schema, "c", 3);
        let order = |tree: &DataTree| {
            let path = XPath::parse("/m:container/list").unwrap();
            tree.find(&schema, &path)
                .unwrap()
                .iter()
                .map(|id| tree.list_keys(&schema, *id)[0].1.clone())
                .collect::<Vec<_>>()
        };
        tree.move_node(c, MovePosition::First, None).unwrap();
        assert_eq!(order(&tree), vec!["c", "a", "b"]);
        tree.move_node(c, MovePosition::Last, None).unwrap();
        assert_eq!(order(&tree), vec!["a", "b", "c"]);
        tree.move_node(a, MovePosition::After, Some(b)).unwrap();
        assert_eq!(order(&tree), vec!["b", "a", "c"]);
        tree.move_node(c, MovePosition::Before, Some(b)).unwrap();
        assert_eq!(order(&tree), vec!["c", "b", "a"]);
    }

    #[test]
    fn leaf_list_value_predicate() {
        let schema = schema();
        let mut tree = DataTree::new();
        let container_s = schema.find_child(None, "container").unwrap();
        let tags_s = schema.find_child(Some(container_s), "tags").unwrap();
        let container = tree.add(None, container_s, Some(ValueData::Container), false);
        tree.add(
            Some(container),
            tags_s,
            Some(ValueData::String("red".into())),
            false,
        );
        tree.add(
            Some(container),
            tags_s,
            Some(ValueData::String("blue".into())),
            false,
        );
        let path = XPath::parse("/m:container/tags[.='blue']").unwrap();
        assert_eq!(tree.find(&schema, &path).unwrap().len(), 1);
    }
}
