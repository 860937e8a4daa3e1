//! Ordered index of installed modules and their dependency edges. Used to
//! load transitively required schemas and to iterate modules in a safe order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Plain import of definitions.
    Import,
    /// The dependency augments or extends this module; its schema must be
    /// loaded before this module validates.
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub name: String,
    pub revision: Option<String>,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub revision: Option<String>,
    pub filepath: PathBuf,
    pub deps: Vec<ModuleDependency>,
    /// Schema paths of `config false` subtrees served by providers.
    pub op_data_subtrees: Vec<String>,
}

/// Reader/writer-locked module graph. Queries take the read lock; inserts and
/// removals take the write lock.
#[derive(Debug, Default)]
pub struct ModuleDependencyIndex {
    inner: RwLock<Vec<ModuleRecord>>,
}

impl ModuleDependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module record. Re-inserting an already-present module (same
    /// name and revision) is a no-op.
    pub fn insert(&self, record: ModuleRecord) {
        let mut records = self.inner.write();
        let present = records
            .iter()
            .any(|existing| existing.name == record.name && existing.revision == record.revision);
        if present {
            log::debug!(
                "event=module_dependency_reinsert module={} outcome=noop",
                record.name
            );
            return;
        }
        records.push(record);
    }

    pub fn info(&self, name: &str, revision: Option<&str>) -> Option<ModuleRecord> {
        let records = self.inner.read();
        records
            .iter()
            .rev()
            .find(|record| {
                record.name == name
                    && revision.map_or(true, |rev| record.revision.as_deref() == Some(rev))
            })
            .cloned()
    }

    pub fn remove(&self, name: &str, revision: Option<&str>) -> Result<(), EngineError> {
        let mut records = self.inner.write();
        let before = records.len();
        records.retain(|record| {
            !(record.name == name
                && revision.map_or(true, |rev| record.revision.as_deref() == Some(rev)))
        });
        if records.len() == before {
            return Err(EngineError::NotFound(format!("module '{name}'")));
        }
        Ok(())
    }

    pub fn records(&self) -> Vec<ModuleRecord> {
        self.inner.read().clone()
    }

    /// Module names in load order: dependencies before dependents. Modules
    /// involved in a cycle fall back to insertion order after the sorted
    /// prefix.
    pub fn load_order(&self) -> Vec<String> {
        let records = self.inner.read();
        let positions: HashMap<&str, usize> = records
            .iter()
            .enumerate()
            .map(|(i, record)| (record.name.as_str(), i))
            .collect();
        let mut ordered = Vec::with_capacity(records.len());
        let mut done: HashSet<usize> = HashSet::new();
        loop {
            let mut progressed = false;
            for (i, record) in records.iter().enumerate() {
                if done.contains(&i) {
                    continue;
                }
                let ready = record.deps.iter().all(|dep| {
                    match positions.get(dep.name.as_str()) {
                        Some(pos) => done.contains(pos),
                        // Dependencies outside the index do not gate ordering.
                        None => true,
                    }
                });
                if ready {
                    done.insert(i);
                    ordered.push(record.name.clone());
                    progressed = true;
                }
            }
            if done.len() == records.len() {
                break;
            }
            if !progressed {
                for (i, record) in records.iter().enumerate() {
                    if done.insert(i) {
                        ordered.push(record.name.clone());
                    }
                }
                break;
            }
        }
        ordered
    }

    /// All modules required to use `name`: its transitive imports and
    /// extension targets, dependencies first, `name` last.
    pub fn transitive(&self, name: &str) -> Vec<String> {
        let records = self.inner.read();
        let by_name: HashMap<&str, &ModuleRecord> = records
            .iter()
            .map(|record| (record.name.as_str(), record))
            .collect();
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        fn visit(
            name: &str,
            by_name: &HashMap<&str, &ModuleRecord>,
            visited: &mut HashSet<String>,
            out: &mut Vec<String>,
        ) {
            if !visited.insert(name.to_string()) {
                return;
            }
            if let Some(record) = by_name.get(name) {
                for dep in &record.deps {
                    visit(&dep.name, by_name, visited, out);
                }
            }
            out.push(name.to_string());
        }
        visit(name, &by_name, &mut visited, &mut out);
        out
    }
}
