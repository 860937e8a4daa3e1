pub mod deps;
pub mod model;
pub mod registry;

pub use deps::{DependencyKind, ModuleDependency, ModuleDependencyIndex, ModuleRecord};
pub use model::{
    node_enabled, NodeState, SchemaModule, SchemaModuleBuilder, SchemaNode, SchemaNodeId,
    SchemaNodeKind, Submodule,
};
pub use registry::{ModuleEntry, SchemaLoader, SchemaRegistry, StaticSchemaLoader};
