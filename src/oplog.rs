//! The per-(session, datastore) edit log: an append-only sequence of set,
//! delete and move entries, replayable against a refreshed base when a
//! commit finds the session copy stale. Replay is the only mechanism that
//! resolves concurrent writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::data::edit::{apply_delete, apply_move, apply_set, EditFlags};
use crate::data::tree::{DataTree, MovePosition};
use crate::error::EngineError;
use crate::schema::model::SchemaModule;
use crate::xpath::XPath;

#[derive(Debug, Clone)]
pub enum OpDetail {
    Set {
        xpath: String,
        value: Option<crate::value::ValueData>,
        flags: EditFlags,
    },
    Delete {
        xpath: String,
        flags: EditFlags,
    },
    Move {
        xpath: String,
        position: MovePosition,
        relative: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub detail: OpDetail,
    /// Sticky error mark; flagged entries are dropped from the log before
    /// the next replay pass.
    pub has_error: bool,
}

impl Operation {
    pub fn set(
        xpath: impl Into<String>,
        value: Option<crate::value::ValueData>,
        flags: EditFlags,
    ) -> Self {
        Self {
            detail: OpDetail::Set {
                xpath: xpath.into(),
                value,
                flags,
            },
            has_error: false,
        }
    }

    pub fn delete(xpath: impl Into<String>, flags: EditFlags) -> Self {
        Self {
            detail: OpDetail::Delete {
                xpath: xpath.into(),
                flags,
            },
            has_error: false,
        }
    }

    pub fn move_item(
        xpath: impl Into<String>,
        position: MovePosition,
        relative: Option<String>,
    ) -> Self {
        Self {
            detail: OpDetail::Move {
                xpath: xpath.into(),
                position,
                relative,
            },
            has_error: false,
        }
    }

    pub fn xpath(&self) -> &str {
        match &self.detail {
            OpDetail::Set { xpath, .. }
            | OpDetail::Delete { xpath, .. }
            | OpDetail::Move { xpath, .. } => xpath,
        }
    }

    /// Apply this entry with the same semantics as the original call.
    pub fn apply(&self, schema: &SchemaModule, tree: &mut DataTree) -> Result<(), EngineError> {
        match &self.detail {
            OpDetail::Set {
                xpath,
                value,
                flags,
            } => {
                let path = XPath::parse(xpath)?;
                apply_set(schema, tree, &path, value.as_ref(), *flags)
            }
            OpDetail::Delete { xpath, flags } => {
                let path = XPath::parse(xpath)?;
                apply_delete(schema, tree, &path, *flags)
            }
            OpDetail::Move {
                xpath,
                position,
                relative,
            } => {
                let path = XPath::parse(xpath)?;
                let relative = relative.as_deref().map(XPath::parse).transpose()?;
                apply_move(schema, tree, &path, *position, relative.as_ref())
            }
        }
    }
}

/// One module's replay material: the refreshed base and the tree being
/// rebuilt from it.
#[derive(Debug)]
pub struct ReplayTarget {
    pub schema: Arc<SchemaModule>,
    pub base: DataTree,
    pub result: DataTree,
}

impl ReplayTarget {
    pub fn new(schema: Arc<SchemaModule>, base: DataTree) -> Self {
        let result = base.deep_copy();
        Self {
            schema,
            base,
            result,
        }
    }
}

/// Outcome of a replay: how many entries were dropped for errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub dropped: usize,
    pub applied: usize,
}

/// Replay the log over the targets' bases. Each pass starts from a pristine
/// copy of the base; entries that error are flagged, dropped, and the pass
/// repeats until it runs clean. Modules in `skip` keep their session trees
/// (the optimized-commit path) and their entries are not re-applied.
pub fn replay(
    ops: &mut Vec<Operation>,
    targets: &mut HashMap<String, ReplayTarget>,
    skip: &HashSet<String>,
) -> ReplayReport {
    let mut dropped = 0;
    loop {
        for target in targets.values_mut() {
            target.result = target.base.deep_copy();
        }
        let mut pass_errors = 0;
        let mut applied = 0;
        for op in ops.iter_mut() {
            let module = match XPath::parse(op.xpath()) {
                Ok(path) => path.module,
                Err(err) => {
                    warn!("event=replay_bad_xpath xpath={} error={err}", op.xpath());
                    op.has_error = true;
                    pass_errors += 1;
                    continue;
                }
            };
            if skip.contains(&module) {
                continue;
            }
            let Some(target) = targets.get_mut(&module) else {
                continue;
            };
            match op.apply(&target.schema, &mut target.result) {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(
                        "event=replay_entry_failed xpath={} error={err}",
                        op.xpath()
                    );
                    op.has_error = true;
                    pass_errors += 1;
                }
            }
        }
        if pass_errors == 0 {
            debug!("event=replay_complete applied={applied} dropped={dropped}");
            return ReplayReport { dropped, applied };
        }
        let before = ops.len();
        ops.retain(|op| !op.has_error);
        dropped += before - ops.len();
    }
}
