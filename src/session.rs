//! Client sessions: per-datastore working sets of loaded module trees, the
//! ordered edit log, the last-error record and the explicit request state
//! machine driven by the dispatcher and the operational-data broker.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::data::tree::DataTree;
use crate::error::{EngineError, SessionError};
use crate::oplog::Operation;
use crate::provider::PendingRead;
use crate::value::Datastore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub effective_username: Option<String>,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            effective_username: None,
        }
    }
}

/// Explicit request state machine; a session transitions only under its own
/// mutex. A timer event and a provider response are both just messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Processing,
    WaitingForProviderData,
    DataLoaded,
}

/// One loaded (module, datastore) copy: the tree, the modified flag and the
/// load timestamp the freshness check compares against file mtimes.
#[derive(Debug)]
pub struct DataInfo {
    pub module: String,
    pub tree: DataTree,
    pub modified: bool,
    pub timestamp: Option<SystemTime>,
    /// The tree aliases another session's copy and must not be edited.
    pub rdonly_copy: bool,
}

impl DataInfo {
    pub fn new(module: impl Into<String>, tree: DataTree, timestamp: Option<SystemTime>) -> Self {
        Self {
            module: module.into(),
            tree,
            modified: false,
            timestamp,
            rdonly_copy: false,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub credentials: UserCredentials,
    pub datastore: Datastore,
    working: [HashMap<String, DataInfo>; 3],
    ops: [Vec<Operation>; 3],
    pub state: SessionState,
    pub holds_datastore_lock: bool,
    last_error: Option<SessionError>,
    errors: Vec<SessionError>,
    /// Parked read awaiting operational data.
    pub pending: Option<PendingRead>,
    /// Set on notification sessions bound to a retained commit context.
    pub notification_commit_id: Option<u32>,
}

impl Session {
    pub fn new(id: SessionId, credentials: UserCredentials, datastore: Datastore) -> Self {
        Self {
            id,
            credentials,
            datastore,
            working: Default::default(),
            ops: Default::default(),
            state: SessionState::Idle,
            holds_datastore_lock: false,
            last_error: None,
            errors: Vec::new(),
            pending: None,
            notification_commit_id: None,
        }
    }

    pub fn working(&self) -> &HashMap<String, DataInfo> {
        &self.working[self.datastore.index()]
    }

    pub fn working_mut(&mut self) -> &mut HashMap<String, DataInfo> {
        &mut self.working[self.datastore.index()]
    }

    pub fn working_for(&self, ds: Datastore) -> &HashMap<String, DataInfo> {
        &self.working[ds.index()]
    }

    pub fn working_for_mut(&mut self, ds: Datastore) -> &mut HashMap<String, DataInfo> {
        &mut self.working[ds.index()]
    }

    pub fn info(&self, module: &str) -> Option<&DataInfo> {
        self.working().get(module)
    }

    pub fn info_mut(&mut self, module: &str) -> Option<&mut DataInfo> {
        let index = self.datastore.index();
        self.working[index].get_mut(module)
    }

    pub fn insert_info(&mut self, info: DataInfo) {
        self.working_mut().insert(info.module.clone(), info);
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops[self.datastore.index()]
    }

    pub fn ops_mut(&mut self) -> &mut Vec<Operation> {
        &mut self.ops[self.datastore.index()]
    }

    pub fn record_op(&mut self, op: Operation) {
        self.ops[self.datastore.index()].push(op);
    }

    pub fn take_ops(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.ops[self.datastore.index()])
    }

    /// Modules of the active datastore carrying uncommitted changes.
    pub fn modified_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .working()
            .values()
            .filter(|info| info.modified)
            .map(|info| info.module.clone())
            .collect();
        modules.sort();
        modules
    }

    pub fn has_modifications(&self) -> bool {
        self.working().values().any(|info| info.modified)
    }

    /// Drop all working copies and empty the edit log of the active
    /// datastore; the next access reloads from disk.
    pub fn discard_changes(&mut self) {
        let index = self.datastore.index();
        self.working[index].clear();
        self.ops[index].clear();
    }

    pub fn switch_datastore(&mut self, ds: Datastore) {
        self.datastore = ds;
    }

    pub fn record_error(&mut self, err: &EngineError) {
        self.last_error = Some(SessionError::new(err.to_string()));
    }

    pub fn record_error_at(&mut self, err: SessionError) {
        self.last_error = Some(err);
    }

    pub fn set_errors(&mut self, errors: Vec<SessionError>) {
        if let Some(first) = errors.first() {
            self.last_error = Some(first.clone());
        }
        self.errors = errors;
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn errors(&self) -> &[SessionError] {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.last_error = None;
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::edit::EditFlags;
    use crate::value::ValueData;

    fn session() -> Session {
        Session::new(
            SessionId(1),
            UserCredentials::new("tester"),
            Datastore::Startup,
        )
    }

    #[test]
    fn working_sets_are_per_datastore() {
        let mut session = session();
        session.insert_info(DataInfo::new("m", DataTree::new(), None));
        assert!(session.info("m").is_some());
        session.switch_datastore(Datastore::Running);
        assert!(session.info("m").is_none());
        session.switch_datastore(Datastore::Startup);
        assert!(session.info("m").is_some());
    }

    #[test]
    fn discard_clears_ops_and_copies_of_active_datastore_only() {
        let mut session = session();
        session.insert_info(DataInfo::new("m", DataTree::new(), None));
        session.record_op(Operation::set(
            "/m:top/a",
            Some(ValueData::String("v".into())),
            EditFlags::DEFAULT,
        ));
        session.switch_datastore(Datastore::Running);
        session.insert_info(DataInfo::new("n", DataTree::new(), None));
        session.switch_datastore(Datastore::Startup);

        session.discard_changes();
        assert!(session.working().is_empty());
        assert!(session.ops().is_empty());
        assert!(!session.working_for(Datastore::Running).is_empty());
    }

    #[test]
    fn modified_modules_are_sorted_and_filtered() {
        let mut session = session();
        let mut info = DataInfo::new("zebra", DataTree::new(), None);
        info.modified = true;
        session.insert_info(info);
        let mut info = DataInfo::new("alpha", DataTree::new(), None);
        info.modified = true;
        session.insert_info(info);
        session.insert_info(DataInfo::new("clean", DataTree::new(), None));
        assert_eq!(session.modified_modules(), vec!["alpha", "zebra"]);
    }

    #[test]
    fn error_record_keeps_first_of_batch() {
        let mut session = session();
        session.set_errors(vec![
            SessionError::at("first", "/m:a"),
            SessionError::at("second", "/m:b"),
        ]);
        assert_eq!(session.last_error().unwrap().message, "first");
        assert_eq!(session.errors().len(), 2);
    }
}
