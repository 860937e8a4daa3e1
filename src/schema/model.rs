//! Arena-backed schema trees. Nodes are addressed by index; parent/child
//! cycles never own each other, so duplication and traversal are plain walks.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::value::LeafType;
use crate::xpath::XPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaNodeId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNodeKind {
    Container {
        presence: bool,
    },
    List {
        keys: Vec<String>,
        user_ordered: bool,
    },
    Leaf {
        ty: LeafType,
        default: Option<String>,
        mandatory: bool,
    },
    LeafList {
        ty: LeafType,
        user_ordered: bool,
    },
    Rpc,
    Action,
    Notification,
    Input,
    Output,
}

impl SchemaNodeKind {
    pub fn is_procedure(&self) -> bool {
        matches!(
            self,
            SchemaNodeKind::Rpc | SchemaNodeKind::Action | SchemaNodeKind::Notification
        )
    }
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: String,
    pub kind: SchemaNodeKind,
    /// Effective config statement; `false` marks operational (state) data.
    pub config: bool,
    pub parent: Option<SchemaNodeId>,
    pub children: Vec<SchemaNodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    pub name: String,
    pub revision: Option<String>,
}

/// Per-schema-node population state of the running datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Disabled,
    Enabled,
    EnabledWithChildren,
}

/// One installed schema. Shared by all sessions behind an `Arc`; the mutable
/// companions (enabled features, node states) live in the registry entry.
#[derive(Debug, Clone)]
pub struct SchemaModule {
    pub name: String,
    pub revision: Option<String>,
    pub namespace: String,
    pub prefix: String,
    pub submodules: Vec<Submodule>,
    /// Feature names the module declares.
    pub features: Vec<String>,
    nodes: Vec<SchemaNode>,
    roots: Vec<SchemaNodeId>,
}

impl SchemaModule {
    pub fn node(&self, id: SchemaNodeId) -> &SchemaNode {
        &self.nodes[id.0]
    }

    pub fn roots(&self) -> &[SchemaNodeId] {
        &self.roots
    }

    pub fn children_of(&self, parent: Option<SchemaNodeId>) -> &[SchemaNodeId] {
        match parent {
            Some(id) => &self.nodes[id.0].children,
            None => &self.roots,
        }
    }

    pub fn find_child(&self, parent: Option<SchemaNodeId>, name: &str) -> Option<SchemaNodeId> {
        self.children_of(parent)
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].name == name)
    }

    /// Resolve a data path to its schema node. The path's module must be this
    /// module; an unknown step is a bad element.
    pub fn resolve(&self, path: &XPath) -> Result<SchemaNodeId, EngineError> {
        if path.module != self.name {
            return Err(EngineError::UnknownModel(path.module.clone()));
        }
        let mut current: Option<SchemaNodeId> = None;
        for step in &path.steps {
            if let Some(module) = &step.module {
                if module != &self.name {
                    return Err(EngineError::BadElement(format!(
                        "unknown prefix '{module}' in '{path}'"
                    )));
                }
            }
            current = Some(self.find_child(current, &step.name).ok_or_else(|| {
                EngineError::BadElement(format!("no node '{}' in '{path}'", step.name))
            })?);
        }
        current.ok_or_else(|| EngineError::InvalidArg(format!("empty path '{path}'")))
    }

    /// True when `ancestor` is `node` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: SchemaNodeId, node: SchemaNodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes[id.0].parent;
        }
        false
    }

    /// Schema path for diagnostics, e.g. `/module:container/list`.
    pub fn schema_path(&self, id: SchemaNodeId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            names.push(self.nodes[node_id.0].name.clone());
            current = self.nodes[node_id.0].parent;
        }
        names.reverse();
        let mut path = String::new();
        for (i, name) in names.iter().enumerate() {
            path.push('/');
            if i == 0 {
                path.push_str(&self.name);
                path.push(':');
            }
            path.push_str(name);
        }
        path
    }

    /// Whether the module declares any `config false` subtree.
    pub fn has_state_data(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| !node.config && !node.kind.is_procedure())
    }

    /// Iterate the subtree rooted at `id` (preorder, including `id`).
    pub fn descendants(&self, id: SchemaNodeId) -> Vec<SchemaNodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            for child in self.nodes[current.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }
}

/// Enablement test for running-datastore population: a node is enabled when
/// any ancestor-or-self carries `EnabledWithChildren`, or the node itself was
/// marked `Enabled` (ancestors of an enabled subtree are marked `Enabled` by
/// the same call).
pub fn node_enabled(
    module: &SchemaModule,
    states: &HashMap<SchemaNodeId, NodeState>,
    id: SchemaNodeId,
) -> bool {
    let mut current = Some(id);
    while let Some(node_id) = current {
        if matches!(states.get(&node_id), Some(NodeState::EnabledWithChildren)) {
            return true;
        }
        current = module.node(node_id).parent;
    }
    matches!(states.get(&id), Some(NodeState::Enabled))
}

/// Fluent construction of a schema module; used by schema loaders and tests.
#[derive(Debug)]
pub struct SchemaModuleBuilder {
    name: String,
    revision: Option<String>,
    namespace: Option<String>,
    prefix: Option<String>,
    submodules: Vec<Submodule>,
    features: Vec<String>,
    nodes: Vec<SchemaNode>,
    roots: Vec<SchemaNodeId>,
    state_roots: HashSet<usize>,
}

impl SchemaModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: None,
            namespace: None,
            prefix: None,
            submodules: Vec::new(),
            features: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
            state_roots: HashSet::new(),
        }
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn submodule(mut self, name: impl Into<String>, revision: Option<&str>) -> Self {
        self.submodules.push(Submodule {
            name: name.into(),
            revision: revision.map(str::to_string),
        });
        self
    }

    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.features.push(name.into());
        self
    }

    fn add_node(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        kind: SchemaNodeKind,
    ) -> SchemaNodeId {
        let id = SchemaNodeId(self.nodes.len());
        self.nodes.push(SchemaNode {
            name: name.to_string(),
            kind,
            config: true,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent_id) => self.nodes[parent_id.0].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn container(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.add_node(parent, name, SchemaNodeKind::Container { presence: false })
    }

    pub fn presence_container(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.add_node(parent, name, SchemaNodeKind::Container { presence: true })
    }

    pub fn list(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        keys: &[&str],
        user_ordered: bool,
    ) -> SchemaNodeId {
        self.add_node(
            parent,
            name,
            SchemaNodeKind::List {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                user_ordered,
            },
        )
    }

    pub fn leaf(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
        default: Option<&str>,
    ) -> SchemaNodeId {
        self.add_node(
            parent,
            name,
            SchemaNodeKind::Leaf {
                ty,
                default: default.map(str::to_string),
                mandatory: false,
            },
        )
    }

    pub fn mandatory_leaf(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
    ) -> SchemaNodeId {
        self.add_node(
            parent,
            name,
            SchemaNodeKind::Leaf {
                ty,
                default: None,
                mandatory: true,
            },
        )
    }

    pub fn leaf_list(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
        user_ordered: bool,
    ) -> SchemaNodeId {
        self.add_node(parent, name, SchemaNodeKind::LeafList { ty, user_ordered })
    }

    /// Add an RPC with its input and output stanzas.
    pub fn rpc(&mut self, name: &str) -> (SchemaNodeId, SchemaNodeId, SchemaNodeId) {
        let rpc = self.add_node(None, name, SchemaNodeKind::Rpc);
        let input = self.add_node(Some(rpc), "input", SchemaNodeKind::Input);
        let output = self.add_node(Some(rpc), "output", SchemaNodeKind::Output);
        (rpc, input, output)
    }

    /// Add an action nested under a data node.
    pub fn action(
        &mut self,
        parent: SchemaNodeId,
        name: &str,
    ) -> (SchemaNodeId, SchemaNodeId, SchemaNodeId) {
        let action = self.add_node(Some(parent), name, SchemaNodeKind::Action);
        let input = self.add_node(Some(action), "input", SchemaNodeKind::Input);
        let output = self.add_node(Some(action), "output", SchemaNodeKind::Output);
        (action, input, output)
    }

    /// Add an event notification, top-level or nested under a data node.
    pub fn notification(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.add_node(parent, name, SchemaNodeKind::Notification)
    }

    /// Mark a subtree as operational (`config false`) data.
    pub fn state_subtree(&mut self, id: SchemaNodeId) {
        self.state_roots.insert(id.0);
    }

    pub fn build(mut self) -> Result<SchemaModule, EngineError> {
        // Propagate config=false down from each marked subtree root.
        let state_roots: Vec<usize> = self.state_roots.iter().copied().collect();
        for root in state_roots {
            let mut stack = vec![root];
            while let Some(index) = stack.pop() {
                self.nodes[index].config = false;
                stack.extend(self.nodes[index].children.iter().map(|id| id.0));
            }
        }
        // Every declared list key must exist as a child leaf.
        for node in &self.nodes {
            if let SchemaNodeKind::List { keys, .. } = &node.kind {
                for key in keys {
                    let found = node.children.iter().any(|child| {
                        let child = &self.nodes[child.0];
                        child.name == *key && matches!(child.kind, SchemaNodeKind::Leaf { .. })
                    });
                    if !found {
                        return Err(EngineError::InvalidArg(format!(
                            "list '{}' declares key '{key}' without a matching leaf",
                            node.name
                        )));
                    }
                }
            }
        }
        let namespace = self
            .namespace
            .unwrap_or_else(|| format!("urn:constor:{}", self.name));
        let prefix = self.prefix.unwrap_or_else(|| self.name.clone());
        Ok(SchemaModule {
            name: self.name,
            revision: self.revision,
            namespace,
            prefix,
            submodules: self.submodules,
            features: self.features,
            nodes: self.nodes,
            roots: self.roots,
        })
    }
}
