pub mod diff;
pub mod edit;
pub mod tree;
pub mod xml;

pub use diff::{Change, ChangeOp, DiffEntry, DiffKind};
pub use edit::{apply_delete, apply_move, apply_set, EditFlags};
pub use tree::{DataNode, DataTree, InstanceKey, MovePosition, NodeId};
