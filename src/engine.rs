//! The engine value: every piece of process-wide mutable state (schema
//! registry, lock set, commit contexts, last commit time) lives here, held
//! once per process and borrowed by the dispatcher and all sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::commit::{run_commit, CommitContexts};
use crate::data::diff::Change;
use crate::data::edit::{self, EditFlags};
use crate::data::tree::{DataTree, MovePosition, NodeId};
use crate::data::xml;
use crate::dispatch::{Dispatcher, Request, RequestEnvelope, Response};
use crate::error::{EngineError, SessionError};
use crate::locks::{LockKey, LockSet};
use crate::notifications::NotificationStore;
use crate::oplog::{replay, Operation, ReplayTarget};
use crate::provider::{OperationalBroker, PendingRead};
use crate::schema::deps::{ModuleDependencyIndex, ModuleRecord};
use crate::schema::model::SchemaModule;
use crate::schema::registry::{ModuleEntry, SchemaLoader, SchemaRegistry};
use crate::session::{DataInfo, Session, SessionId, SessionState, UserCredentials};
use crate::store::file::{self, AccessControl, AllowAll, FileLockGuard};
use crate::store::layout::RepoLayout;
use crate::store::persist::{JsonSettingsStore, PersistedSubscription, SettingsStore};
use crate::subscription::{
    NoopTransport, SubscriberTransport, Subscription, SubscriptionKind, SubscriptionRegistry,
};
use crate::telemetry::{MetricsRegistry, MetricsSnapshot, SharedMetrics};
use crate::timeouts::EngineTimeouts;
use crate::validate::{self, ArgDirection, ProcedureKind};
use crate::value::{Datastore, Value};
use crate::xpath::XPath;

const DEFAULT_WORKER_COUNT: usize = 4;

pub struct EngineBuilder {
    root: PathBuf,
    worker_count: usize,
    timeouts: EngineTimeouts,
    loader: Option<Arc<dyn SchemaLoader>>,
    transport: Arc<dyn SubscriberTransport>,
    access: Arc<dyn AccessControl>,
    settings: Option<Arc<dyn SettingsStore>>,
}

impl EngineBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            worker_count: DEFAULT_WORKER_COUNT,
            timeouts: EngineTimeouts::default(),
            loader: None,
            transport: Arc::new(NoopTransport),
            access: Arc::new(AllowAll),
            settings: None,
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn schema_loader(mut self, loader: Arc<dyn SchemaLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn SubscriberTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn settings_store(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let layout = RepoLayout::new(self.root);
        layout
            .ensure()
            .map_err(|err| EngineError::InitFailed(err.to_string()))?;
        let settings: Arc<dyn SettingsStore> = match self.settings {
            Some(settings) => settings,
            None => Arc::new(JsonSettingsStore::new(layout.clone())),
        };
        let notifications = NotificationStore::new(
            layout.clone(),
            self.timeouts.notification_file_window,
            self.timeouts.notification_age_out,
        );
        let engine = Arc::new(Engine {
            layout,
            timeouts: self.timeouts,
            schemas: SchemaRegistry::new(self.loader, settings.clone()),
            deps: ModuleDependencyIndex::new(),
            locks: LockSet::new(),
            subscriptions: SubscriptionRegistry::new(),
            commit_ctxs: CommitContexts::new(),
            notifications,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU32::new(1),
            last_commit: Mutex::new(None),
            commit_lock: RwLock::new(()),
            transport: self.transport,
            access: self.access,
            settings,
            metrics: MetricsRegistry::shared("constor"),
            dispatcher: Mutex::new(None),
            broker: Mutex::new(None),
        });
        let dispatcher = Dispatcher::start(&engine, self.worker_count);
        *engine.dispatcher.lock() = Some(dispatcher);
        let broker = OperationalBroker::start(&engine);
        *engine.broker.lock() = Some(broker);
        info!("event=engine_started workers={}", self.worker_count);
        Ok(engine)
    }
}

pub struct Engine {
    layout: RepoLayout,
    timeouts: EngineTimeouts,
    schemas: SchemaRegistry,
    deps: ModuleDependencyIndex,
    locks: LockSet,
    subscriptions: SubscriptionRegistry,
    commit_ctxs: CommitContexts,
    notifications: NotificationStore,
    sessions: Mutex<HashMap<u32, Arc<Mutex<Session>>>>,
    next_session: AtomicU32,
    last_commit: Mutex<Option<(Instant, SystemTime)>>,
    commit_lock: RwLock<()>,
    transport: Arc<dyn SubscriberTransport>,
    access: Arc<dyn AccessControl>,
    settings: Arc<dyn SettingsStore>,
    metrics: SharedMetrics,
    dispatcher: Mutex<Option<Dispatcher>>,
    broker: Mutex<Option<OperationalBroker>>,
}

impl Engine {
    pub fn builder(root: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(root)
    }

    pub(crate) fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    pub(crate) fn timeouts(&self) -> &EngineTimeouts {
        &self.timeouts
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn dependencies(&self) -> &ModuleDependencyIndex {
        &self.deps
    }

    pub(crate) fn locks(&self) -> &LockSet {
        &self.locks
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub(crate) fn commit_contexts(&self) -> &CommitContexts {
        &self.commit_ctxs
    }

    pub(crate) fn transport(&self) -> &dyn SubscriberTransport {
        self.transport.as_ref()
    }

    pub(crate) fn access(&self) -> &dyn AccessControl {
        self.access.as_ref()
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub(crate) fn last_commit_time(&self) -> Option<SystemTime> {
        self.last_commit.lock().map(|(_, wall)| wall)
    }

    pub(crate) fn stamp_commit_time(&self, mono: Instant, wall: SystemTime) {
        *self.last_commit.lock() = Some((mono, wall));
    }

    pub(crate) fn count(&self, name: &str) {
        self.metrics.lock().add(name, 1);
    }

    pub(crate) fn observe_duration(&self, name: &str, elapsed: Duration) {
        self.metrics.lock().observe(name, elapsed);
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    pub fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.shutdown();
        }
        if let Some(broker) = self.broker.lock().take() {
            broker.shutdown();
        }
    }

    // ---- sessions -------------------------------------------------------

    pub fn session_start(&self, credentials: UserCredentials, ds: Datastore) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(id, credentials, ds);
        self.sessions.lock().insert(id.0, Arc::new(Mutex::new(session)));
        debug!("event=session_started session={id} ds={ds}");
        id
    }

    pub fn session_stop(&self, id: SessionId) -> Result<(), EngineError> {
        let removed = self.sessions.lock().remove(&id.0);
        if removed.is_none() {
            return Err(EngineError::InvalidArg(format!("unknown session {id}")));
        }
        self.locks.release_session(id);
        debug!("event=session_stopped session={id}");
        Ok(())
    }

    fn session(&self, id: SessionId) -> Result<Arc<Mutex<Session>>, EngineError> {
        self.sessions
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| EngineError::InvalidArg(format!("unknown session {id}")))
    }

    fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let session = self.session(id)?;
        let mut session = session.lock();
        session.clear_errors();
        match f(&mut session) {
            Ok(value) => Ok(value),
            Err(err) => {
                session.record_error(&err);
                Err(err)
            }
        }
    }

    pub fn switch_datastore(&self, id: SessionId, ds: Datastore) -> Result<(), EngineError> {
        self.with_session(id, |session| {
            session.switch_datastore(ds);
            Ok(())
        })
    }

    pub fn last_error(&self, id: SessionId) -> Result<Option<SessionError>, EngineError> {
        let session = self.session(id)?;
        let session = session.lock();
        Ok(session.last_error().cloned())
    }

    pub fn session_errors(&self, id: SessionId) -> Result<Vec<SessionError>, EngineError> {
        let session = self.session(id)?;
        let session = session.lock();
        Ok(session.errors().to_vec())
    }

    // ---- working-set plumbing ------------------------------------------

    fn get_or_load(&self, session: &mut Session, module: &str) -> Result<Arc<ModuleEntry>, EngineError> {
        let entry = self.schemas.get(module, None)?;
        if session.info(module).is_some() {
            return Ok(entry);
        }
        let load_ds = match session.datastore {
            Datastore::Candidate => Datastore::Running,
            other => other,
        };
        let mut tree;
        if load_ds == Datastore::Running && !entry.has_enabled_subtree() {
            // Running holds data only for modules with an enabled subtree.
            tree = DataTree::new();
        } else {
            let loaded = file::load_tree(
                &self.layout,
                &entry.module,
                module,
                load_ds,
                &session.credentials,
                self.access.as_ref(),
            )?;
            tree = loaded.tree;
        }
        if session.datastore == Datastore::Candidate {
            // The candidate starts from running, pruned to enabled subtrees.
            let entry_ref = entry.clone();
            tree.retain_schema(&move |schema_id| entry_ref.is_enabled(schema_id));
            validate::materialize_defaults(&entry.module, &mut tree);
        }
        let mut info = DataInfo::new(module, tree, Some(SystemTime::now()));
        info.modified = false;
        session.insert_info(info);
        Ok(entry)
    }

    fn values_at(
        entry: &ModuleEntry,
        tree: &DataTree,
        nodes: &[NodeId],
    ) -> Vec<Value> {
        nodes
            .iter()
            .map(|id| {
                let node = tree.node(*id);
                Value {
                    xpath: tree.node_path(&entry.module, *id),
                    dflt: node.dflt,
                    data: node
                        .value
                        .clone()
                        .unwrap_or(crate::value::ValueData::Container),
                }
            })
            .collect()
    }

    // ---- reads and edits ------------------------------------------------

    pub fn get_items(&self, id: SessionId, xpath: &str) -> Result<Vec<Value>, EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let entry = self.get_or_load(session, &path.module)?;
            let info = session
                .info(&path.module)
                .ok_or_else(|| EngineError::Internal("working copy vanished".into()))?;
            let nodes = info.tree.find(&entry.module, &path)?;
            if nodes.is_empty() {
                return Err(EngineError::NotFound(xpath.to_string()));
            }
            Ok(Self::values_at(&entry, &info.tree, &nodes))
        })
    }

    pub fn get_item(&self, id: SessionId, xpath: &str) -> Result<Value, EngineError> {
        let mut values = self.get_items(id, xpath)?;
        Ok(values.remove(0))
    }

    fn apply_recorded_op(
        &self,
        session: &mut Session,
        module: &str,
        op: Operation,
    ) -> Result<(), EngineError> {
        let entry = self.get_or_load(session, module)?;
        session.record_op(op);
        let info = session
            .info_mut(module)
            .ok_or_else(|| EngineError::Internal("working copy vanished".into()))?;
        if info.rdonly_copy {
            session.ops_mut().pop();
            return Err(EngineError::Unsupported(format!(
                "module '{module}' is a read-only alias in this session"
            )));
        }
        let op_ref = session
            .ops()
            .last()
            .cloned()
            .ok_or_else(|| EngineError::Internal("operation log out of sync".into()))?;
        let info = session
            .info_mut(module)
            .ok_or_else(|| EngineError::Internal("working copy vanished".into()))?;
        match op_ref.apply(&entry.module, &mut info.tree) {
            Ok(()) => {
                info.modified = true;
                Ok(())
            }
            Err(err) => {
                // The in-memory mutation failed; the entry must not survive.
                session.ops_mut().pop();
                Err(err)
            }
        }
    }

    pub fn set_item(
        &self,
        id: SessionId,
        xpath: &str,
        value: Option<crate::value::ValueData>,
        flags: EditFlags,
    ) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let op = Operation::set(xpath, value.clone(), flags);
            self.apply_recorded_op(session, &path.module, op)
        })
    }

    pub fn delete_item(
        &self,
        id: SessionId,
        xpath: &str,
        flags: EditFlags,
    ) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let op = Operation::delete(xpath, flags);
            self.apply_recorded_op(session, &path.module, op)
        })
    }

    pub fn move_item(
        &self,
        id: SessionId,
        xpath: &str,
        position: MovePosition,
        relative: Option<&str>,
    ) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let op = Operation::move_item(xpath, position, relative.map(str::to_string));
            self.apply_recorded_op(session, &path.module, op)
        })
    }

    pub fn discard_changes(&self, id: SessionId) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            session.discard_changes();
            Ok(())
        })
    }

    /// Validate the modified modules of the session, re-materializing
    /// defaults. Read-only besides the default nodes.
    pub fn validate(&self, id: SessionId) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        let session = self.session(id)?;
        let mut session = session.lock();
        session.clear_errors();
        let mut errors = Vec::new();
        for module in session.modified_modules() {
            let entry = self.schemas.get(&module, None)?;
            if let Some(info) = session.info_mut(&module) {
                validate::materialize_defaults(&entry.module, &mut info.tree);
                errors.extend(validate::validate_tree(&entry.module, &info.tree));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            let err = EngineError::ValidationFailed(format!("{} error(s)", errors.len()));
            session.set_errors(errors);
            Err(err)
        }
    }

    /// Refresh the session's working copies against newer on-disk state:
    /// stale unmodified copies are dropped, stale modified copies are
    /// rebased by replaying the operation log.
    pub fn refresh(&self, id: SessionId) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| self.refresh_session(session))
    }

    fn refresh_session(&self, session: &mut Session) -> Result<(), EngineError> {
        let load_ds = match session.datastore {
            Datastore::Candidate => Datastore::Running,
            other => other,
        };
        let last_commit = self.last_commit_time();
        let mut stale_clean = Vec::new();
        let mut stale_modified = Vec::new();
        for info in session.working().values() {
            let path = self.layout.data_file(&info.module, load_ds);
            let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            let fresh = file::copy_up_to_date(info.timestamp, mtime, last_commit, SystemTime::now());
            if fresh {
                continue;
            }
            if info.modified {
                stale_modified.push(info.module.clone());
            } else {
                stale_clean.push(info.module.clone());
            }
        }
        for module in stale_clean {
            debug!("event=refresh_dropped module={module} session={}", session.id);
            session.working_mut().remove(&module);
        }
        if stale_modified.is_empty() {
            return Ok(());
        }
        let mut targets = HashMap::new();
        for module in &stale_modified {
            let entry = self.schemas.get(module, None)?;
            let loaded = file::load_tree(
                &self.layout,
                &entry.module,
                module,
                load_ds,
                &session.credentials,
                self.access.as_ref(),
            )?;
            targets.insert(module.clone(), ReplayTarget::new(entry.module.clone(), loaded.tree));
        }
        let mut ops = session.take_ops();
        let report = replay(&mut ops, &mut targets, &std::collections::HashSet::new());
        *session.ops_mut() = ops;
        if report.dropped > 0 {
            warn!(
                "event=refresh_replay_dropped session={} dropped={}",
                session.id, report.dropped
            );
        }
        let stamp = SystemTime::now();
        for (module, target) in targets {
            let schema = target.schema.clone();
            let mut tree = target.result;
            validate::materialize_defaults(&schema, &mut tree);
            let mut info = DataInfo::new(module, tree, Some(stamp));
            info.modified = true;
            session.insert_info(info);
        }
        Ok(())
    }

    // ---- commit and copy ------------------------------------------------

    pub fn commit(&self, id: SessionId) -> Result<Option<u32>, EngineError> {
        let _write = self.commit_lock.write();
        let session = self.session(id)?;
        let mut session = session.lock();
        session.clear_errors();
        let started = Instant::now();
        let outcome = run_commit(self, &mut session);
        self.observe_duration("commit.duration_ms", started.elapsed());
        match outcome {
            Ok(commit_id) => Ok(commit_id),
            Err(failure) => {
                self.count("commit.failures");
                session.set_errors(failure.errors);
                Err(failure.error)
            }
        }
    }

    /// Copy one module (or every installed module) between datastores. The
    /// destination files are rewritten under their advisory locks; copying
    /// into candidate replaces the session's scratch tree instead.
    pub fn copy_config(
        &self,
        id: SessionId,
        module: Option<&str>,
        src: Datastore,
        dst: Datastore,
    ) -> Result<(), EngineError> {
        if src == dst {
            return Err(EngineError::InvalidArg(
                "source and destination datastores are equal".into(),
            ));
        }
        let _write = self.commit_lock.write();
        self.with_session(id, |session| {
            let modules: Vec<String> = match module {
                Some(module) => vec![module.to_string()],
                None => self
                    .schemas
                    .list()
                    .into_iter()
                    .filter(|entry| dst != Datastore::Running || entry.has_enabled_subtree())
                    .map(|entry| entry.module.name.clone())
                    .collect(),
            };
            for module in &modules {
                self.copy_one_module(session, module, src, dst)?;
            }
            Ok(())
        })
    }

    fn copy_one_module(
        &self,
        session: &mut Session,
        module: &str,
        src: Datastore,
        dst: Datastore,
    ) -> Result<(), EngineError> {
        let entry = self.schemas.get(module, None)?;
        let prior_ds = session.datastore;
        // Source tree: candidate lives only in the session; the others load
        // from disk.
        let mut tree = if src == Datastore::Candidate {
            session.switch_datastore(Datastore::Candidate);
            let result = self.get_or_load(session, module).map(|_| {
                session
                    .info(module)
                    .map(|info| info.tree.deep_copy())
                    .unwrap_or_default()
            });
            session.switch_datastore(prior_ds);
            result?
        } else {
            file::load_tree(
                &self.layout,
                &entry.module,
                module,
                src,
                &session.credentials,
                self.access.as_ref(),
            )?
            .tree
        };
        if dst == Datastore::Running {
            let entry_ref = entry.clone();
            tree.retain_schema(&move |schema_id| entry_ref.is_enabled(schema_id));
            validate::materialize_defaults(&entry.module, &mut tree);
        }
        if dst == Datastore::Candidate {
            session.switch_datastore(Datastore::Candidate);
            let mut info = DataInfo::new(module, tree, Some(SystemTime::now()));
            info.modified = true;
            session.insert_info(info);
            session.switch_datastore(prior_ds);
            return Ok(());
        }
        self.access.check_write(&session.credentials, module)?;
        let key = LockKey::module(dst, module.to_string());
        let held_already = self.locks.holder(&key) == Some(session.id);
        if !held_already {
            self.locks
                .lock(key.clone(), session.id, false, std::time::Duration::ZERO)?;
        }
        let result = (|| {
            let lock_path = self.layout.lock_file(module, dst);
            let _file_lock = FileLockGuard::acquire(
                &lock_path,
                &format!("copy-{}", session.id),
                false,
                std::time::Duration::ZERO,
            )
            .map_err(|err| EngineError::OperationFailed(err.to_string()))?;
            let path = self.layout.data_file(module, dst);
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file::write_tree(&mut file, &entry.module, &tree)
        })();
        if !held_already {
            let _ = self.locks.unlock(&key, session.id);
        }
        result?;
        self.stamp_commit_time(Instant::now(), SystemTime::now());
        info!("event=copy_config module={module} src={src} dst={dst}");
        Ok(())
    }

    // ---- locking --------------------------------------------------------

    pub fn lock_module(&self, id: SessionId, module: &str) -> Result<(), EngineError> {
        self.with_session(id, |session| {
            self.schemas.get(module, None)?;
            self.locks.lock(
                LockKey::module(session.datastore, module.to_string()),
                session.id,
                false,
                std::time::Duration::ZERO,
            )
        })
    }

    pub fn unlock_module(&self, id: SessionId, module: &str) -> Result<(), EngineError> {
        self.with_session(id, |session| {
            self.locks.unlock(
                &LockKey::module(session.datastore, module.to_string()),
                session.id,
            )
        })
    }

    /// Take the exclusive datastore lock: the global key plus every module
    /// in dependency order. Refused while the session has unsaved changes.
    pub fn lock_datastore(&self, id: SessionId) -> Result<(), EngineError> {
        self.with_session(id, |session| {
            if session.has_modifications() {
                return Err(EngineError::OperationFailed(
                    "session has unsaved changes; commit or discard them first".into(),
                ));
            }
            let installed: std::collections::HashSet<String> = self
                .schemas
                .list()
                .into_iter()
                .map(|entry| entry.module.name.clone())
                .collect();
            let modules: Vec<String> = self
                .deps
                .load_order()
                .into_iter()
                .filter(|name| installed.contains(name))
                .chain(
                    installed
                        .iter()
                        .filter(|name| !self.deps.info(name, None).is_some())
                        .cloned(),
                )
                .collect();
            self.locks.lock_all(session.datastore, session.id, &modules)?;
            session.holds_datastore_lock = true;
            Ok(())
        })
    }

    pub fn unlock_datastore(&self, id: SessionId) -> Result<(), EngineError> {
        self.with_session(id, |session| {
            let ds = session.datastore;
            let mut released = false;
            for key in self.locks.held_by(session.id) {
                let matches = match &key {
                    LockKey::Datastore(held_ds) => *held_ds == ds,
                    LockKey::Module { ds: held_ds, .. } => *held_ds == ds,
                    LockKey::File(_) => false,
                };
                if matches {
                    self.locks.unlock(&key, session.id)?;
                    released = true;
                }
            }
            if !released {
                return Err(EngineError::InvalidArg(format!(
                    "datastore {ds} is not locked by session {}",
                    session.id
                )));
            }
            session.holds_datastore_lock = false;
            Ok(())
        })
    }

    // ---- schema management ---------------------------------------------

    pub fn install_module(
        &self,
        module: SchemaModule,
        record: Option<ModuleRecord>,
    ) -> Result<(), EngineError> {
        let name = module.name.clone();
        let revision = module.revision.clone();
        self.schemas.install(module)?;
        if let Some(record) = record {
            self.deps.insert(record);
        }
        for sub in self
            .subscriptions
            .for_module(&name, &[SubscriptionKind::ModuleInstall])
        {
            self.transport.module_install(&sub, &name, true);
        }
        info!(
            "event=module_installed module={name} revision={}",
            revision.as_deref().unwrap_or("none")
        );
        Ok(())
    }

    pub fn uninstall_module(&self, name: &str, revision: Option<&str>) -> Result<(), EngineError> {
        self.schemas.uninstall(name, revision)?;
        let _ = self.deps.remove(name, revision);
        for sub in self
            .subscriptions
            .for_module(name, &[SubscriptionKind::ModuleInstall])
        {
            self.transport.module_install(&sub, name, false);
        }
        Ok(())
    }

    pub fn feature_enable(
        &self,
        module: &str,
        feature: &str,
        enable: bool,
    ) -> Result<(), EngineError> {
        self.schemas.feature_enable(module, feature, enable)?;
        for sub in self
            .subscriptions
            .for_module(module, &[SubscriptionKind::FeatureEnable])
        {
            self.transport.feature_enable(&sub, module, feature, enable);
        }
        Ok(())
    }

    // ---- running enablement --------------------------------------------

    fn persist_enabled_subtrees(&self, entry: &ModuleEntry) -> Result<(), EngineError> {
        let mut persisted = self
            .settings
            .load_module(&entry.module.name)
            .map_err(|err| EngineError::Io(err.to_string()))?;
        persisted.enabled_subtrees = entry.enabled_subtree_paths();
        self.settings
            .save_module(&entry.module.name, &persisted)
            .map_err(|err| EngineError::Io(err.to_string()))
    }

    /// Enable a whole module in running and seed it from startup data.
    pub fn enable_module_running(&self, id: SessionId, module: &str) -> Result<(), EngineError> {
        let entry = self.schemas.get(module, None)?;
        entry.enable_module();
        self.persist_enabled_subtrees(&entry)?;
        self.copy_config(id, Some(module), Datastore::Startup, Datastore::Running)
    }

    /// Enable one subtree in running and seed it from startup data.
    pub fn enable_subtree_running(
        &self,
        id: SessionId,
        module: &str,
        xpath: &str,
    ) -> Result<(), EngineError> {
        let entry = self.schemas.get(module, None)?;
        entry.enable_subtree(xpath)?;
        self.persist_enabled_subtrees(&entry)?;
        self.copy_config(id, Some(module), Datastore::Startup, Datastore::Running)
    }

    /// Disable the module in running and drop its running data file.
    pub fn disable_module_running(&self, module: &str) -> Result<(), EngineError> {
        let entry = self.schemas.get(module, None)?;
        entry.disable_running();
        self.persist_enabled_subtrees(&entry)?;
        let path = self.layout.data_file(module, Datastore::Running);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::from(err)),
        }
    }

    // ---- subscriptions --------------------------------------------------

    pub fn subscribe(&self, id: SessionId, subscription: Subscription) -> Result<(), EngineError> {
        self.schemas.get(&subscription.module, None)?;
        let module = subscription.module.clone();
        let persisted_sub = PersistedSubscription {
            kind: subscription.kind,
            destination: subscription.delivery.address.clone(),
            id: subscription.delivery.id,
            xpath: subscription.xpath.clone(),
            priority: subscription.priority,
            event_filter: Some(subscription.event_filter),
            enables_running: subscription.enables_running,
        };
        let enables = subscription.enables_running;
        let xpath = subscription.xpath.clone();
        self.subscriptions.subscribe(subscription);
        let mut persisted = self
            .settings
            .load_module(&module)
            .map_err(|err| EngineError::Io(err.to_string()))?;
        persisted.subscriptions.push(persisted_sub);
        self.settings
            .save_module(&module, &persisted)
            .map_err(|err| EngineError::Io(err.to_string()))?;
        if enables {
            match xpath {
                Some(xpath) => self.enable_subtree_running(id, &module, &xpath)?,
                None => self.enable_module_running(id, &module)?,
            }
        }
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        module: &str,
        kind: SubscriptionKind,
        delivery: &crate::subscription::DeliveryAddress,
    ) -> Result<(), EngineError> {
        self.subscriptions.unsubscribe(module, kind, delivery)?;
        let mut persisted = self
            .settings
            .load_module(module)
            .map_err(|err| EngineError::Io(err.to_string()))?;
        persisted
            .subscriptions
            .retain(|sub| !(sub.kind == kind && sub.destination == delivery.address && sub.id == delivery.id));
        self.settings
            .save_module(module, &persisted)
            .map_err(|err| EngineError::Io(err.to_string()))
    }

    // ---- procedures -----------------------------------------------------

    fn procedure_view(
        &self,
        session: &mut Session,
        module: &str,
    ) -> Result<(Arc<ModuleEntry>, DataTree), EngineError> {
        let entry = self.get_or_load(session, module)?;
        let tree = session
            .info(module)
            .map(|info| info.tree.deep_copy())
            .unwrap_or_default();
        Ok((entry, tree))
    }

    pub fn validate_procedure(
        &self,
        id: SessionId,
        kind: ProcedureKind,
        xpath: &str,
        args: &[Value],
        direction: ArgDirection,
    ) -> Result<Vec<Value>, EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let (entry, view) = self.procedure_view(session, &path.module)?;
            validate::validate_procedure(&entry.module, Some(&view), kind, xpath, args, direction)
        })
    }

    /// Validate and deliver an RPC or action call, returning its validated
    /// output values.
    pub fn call_procedure(
        &self,
        id: SessionId,
        kind: ProcedureKind,
        xpath: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, EngineError> {
        let sub_kind = match kind {
            ProcedureKind::Rpc => SubscriptionKind::Rpc,
            ProcedureKind::Action => SubscriptionKind::Action,
            ProcedureKind::EventNotification => {
                return Err(EngineError::InvalidArg(
                    "event notifications are delivered, not called".into(),
                ))
            }
        };
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let (entry, view) = self.procedure_view(session, &path.module)?;
            let input = validate::validate_procedure(
                &entry.module,
                Some(&view),
                kind,
                xpath,
                args,
                ArgDirection::Input,
            )?;
            let subs = self.subscriptions.for_module(&path.module, &[sub_kind]);
            let sub = subs.first().ok_or_else(|| {
                EngineError::NotFound(format!("no subscriber serves '{xpath}'"))
            })?;
            let output = self.transport.rpc(sub, xpath, &input)?;
            validate::validate_procedure(
                &entry.module,
                Some(&view),
                kind,
                xpath,
                &output,
                ArgDirection::Output,
            )
        })
    }

    /// Validate an event notification, deliver it to subscribers and retain
    /// it on disk. Delivery failures are logged, never returned.
    pub fn event_notification(
        &self,
        id: SessionId,
        xpath: &str,
        values: &[Value],
    ) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        self.with_session(id, |session| {
            let path = XPath::parse(xpath)?;
            let (entry, view) = self.procedure_view(session, &path.module)?;
            let completed = validate::validate_procedure(
                &entry.module,
                Some(&view),
                ProcedureKind::EventNotification,
                xpath,
                values,
                ArgDirection::Input,
            )?;
            for sub in self
                .subscriptions
                .for_module(&path.module, &[SubscriptionKind::EventNotification])
            {
                if let Err(err) = self.transport.event_notification(&sub, xpath, &completed) {
                    warn!(
                        "event=notification_delivery_failed dst={} xpath={xpath} error={err}",
                        sub.delivery.address
                    );
                }
            }
            let now = SystemTime::now();
            self.notifications.append(xpath, &completed, now)?;
            let _ = self.notifications.cleanup(now);
            Ok(())
        })
    }

    // ---- commit contexts ------------------------------------------------

    pub fn get_changes(
        &self,
        commit_id: u32,
        xpath: &str,
    ) -> Result<Vec<Change>, EngineError> {
        let path = XPath::parse(xpath)?;
        let ctx = self
            .commit_ctxs
            .get(commit_id)
            .ok_or_else(|| EngineError::NotFound(format!("commit context {commit_id}")))?;
        let ctx = ctx.lock();
        ctx.changes_for(&path.module, Some(xpath))
    }

    /// Bind a session to a retained commit context so its change-iteration
    /// queries refer to that commit.
    pub fn bind_notification_session(
        &self,
        id: SessionId,
        commit_id: u32,
    ) -> Result<(), EngineError> {
        if !self.commit_ctxs.contains(commit_id) {
            return Err(EngineError::NotFound(format!("commit context {commit_id}")));
        }
        self.with_session(id, |session| {
            session.notification_commit_id = Some(commit_id);
            Ok(())
        })
    }

    /// One subscriber acknowledgment towards releasing a commit context.
    pub fn commit_ack(&self, commit_id: u32) -> Result<bool, EngineError> {
        self.commit_ctxs.acknowledge(commit_id)
    }

    /// Force-release a retained commit context.
    pub fn commit_release(&self, commit_id: u32) -> Result<(), EngineError> {
        self.commit_ctxs.release(commit_id)
    }

    // ---- operational data ----------------------------------------------

    fn needs_provider_data(&self, session: &Session, entry: &ModuleEntry, module: &str) -> bool {
        session.datastore == Datastore::Running
            && entry.module.has_state_data()
            && !self
                .subscriptions
                .operational_subscriptions(module)
                .is_empty()
    }

    fn park_for_providers(
        &self,
        session: &mut Session,
        module: &str,
        envelope: RequestEnvelope,
    ) {
        let broker_guard = self.broker.lock();
        let Some(broker) = broker_guard.as_ref() else {
            return;
        };
        let request_id = broker.next_request_id();
        let subs = self.subscriptions.operational_subscriptions(module);
        let mut remaining = subs.len();
        for sub in &subs {
            let xpath = sub
                .xpath
                .clone()
                .unwrap_or_else(|| format!("/{module}:*"));
            if let Err(err) = self
                .transport
                .request_operational_data(sub, request_id, &xpath)
            {
                warn!(
                    "event=provider_request_failed dst={} error={err}",
                    sub.delivery.address
                );
                remaining = remaining.saturating_sub(1);
            }
        }
        session.state = SessionState::WaitingForProviderData;
        session.pending = Some(PendingRead {
            envelope,
            request_id,
            remaining,
            deadline: Instant::now() + self.timeouts.operational_data,
        });
        self.count("provider.waits");
        if remaining == 0 {
            // No provider reachable; resume right away with what we have.
            self.resume_pending(session);
            return;
        }
        broker.arm(session.id, request_id, self.timeouts.operational_data);
    }

    fn resume_pending(&self, session: &mut Session) {
        session.state = SessionState::DataLoaded;
        if let Some(pending) = &session.pending {
            let envelope = pending.envelope.clone();
            self.enqueue(envelope);
        }
    }

    /// A provider answered: merge its values into the waiting session's tree
    /// and resume the parked read once every answer arrived.
    pub fn provider_response(
        &self,
        id: SessionId,
        request_id: u64,
        values: &[Value],
    ) -> Result<(), EngineError> {
        let _read = self.commit_lock.read();
        let session = self.session(id)?;
        let mut session = session.lock();
        let matches = matches!(
            (&session.state, &session.pending),
            (SessionState::WaitingForProviderData, Some(pending)) if pending.request_id == request_id
        );
        if !matches {
            debug!(
                "event=provider_response_stale session={id} request_id={request_id}"
            );
            return Ok(());
        }
        for value in values {
            let path = match XPath::parse(&value.xpath) {
                Ok(path) => path,
                Err(err) => {
                    warn!("event=provider_value_rejected xpath={} error={err}", value.xpath);
                    continue;
                }
            };
            let entry = match self.schemas.get(&path.module, None) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("event=provider_value_rejected xpath={} error={err}", value.xpath);
                    continue;
                }
            };
            if let Some(info) = session.info_mut(&path.module) {
                if let Err(err) = edit::apply_set(
                    &entry.module,
                    &mut info.tree,
                    &path,
                    Some(&value.data),
                    EditFlags::DEFAULT,
                ) {
                    warn!("event=provider_value_rejected xpath={} error={err}", value.xpath);
                }
            }
        }
        let finished = {
            let pending = session.pending.as_mut().ok_or_else(|| {
                EngineError::Internal("pending read vanished".into())
            })?;
            pending.remaining = pending.remaining.saturating_sub(1);
            pending.remaining == 0
        };
        if finished {
            self.resume_pending(&mut session);
        }
        Ok(())
    }

    /// The wait deadline fired: resume with whatever data arrived.
    pub(crate) fn provider_timeout(&self, id: SessionId, request_id: u64) {
        let Ok(session) = self.session(id) else { return };
        let mut session = session.lock();
        let matches = matches!(
            (&session.state, &session.pending),
            (SessionState::WaitingForProviderData, Some(pending)) if pending.request_id == request_id
        );
        if !matches {
            return;
        }
        self.count("provider.timeouts");
        debug!("event=provider_wait_timeout session={id} request_id={request_id}");
        self.resume_pending(&mut session);
    }

    // ---- dispatcher integration ----------------------------------------

    /// Queue a request for the worker pool; the response arrives on the
    /// returned channel.
    pub fn submit(
        &self,
        session: Option<SessionId>,
        request: Request,
    ) -> std::sync::mpsc::Receiver<Response> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.enqueue(RequestEnvelope {
            session,
            request,
            reply: tx,
        });
        rx
    }

    fn enqueue(&self, envelope: RequestEnvelope) {
        let dispatcher = self.dispatcher.lock();
        if let Some(dispatcher) = dispatcher.as_ref() {
            dispatcher.enqueue(envelope);
        } else {
            warn!("event=request_dropped reason=dispatcher_stopped");
        }
    }

    /// Worker entry point: route one request, replying unless the request
    /// parked itself waiting for providers.
    pub(crate) fn dispatch(&self, envelope: RequestEnvelope) {
        self.count("dispatch.requests");
        let Some(session_id) = envelope.session else {
            let _ = envelope
                .reply
                .send(Response::failed(
                    crate::error::ErrorCode::InvalidArg,
                    vec![SessionError::new("request without a session")],
                ));
            return;
        };
        // Reads against provider-backed state park instead of replying.
        if let Request::GetItem { xpath } | Request::GetItems { xpath } = &envelope.request {
            match self.try_park_read(session_id, xpath, &envelope) {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    let _ = envelope.reply.send(Response::failed(
                        err.code(),
                        vec![SessionError::new(err.to_string())],
                    ));
                    return;
                }
            }
        }
        let response = self.handle_request(session_id, &envelope.request);
        let _ = envelope.reply.send(response);
    }

    fn try_park_read(
        &self,
        id: SessionId,
        xpath: &str,
        envelope: &RequestEnvelope,
    ) -> Result<bool, EngineError> {
        let _read = self.commit_lock.read();
        let session = self.session(id)?;
        let mut session = session.lock();
        match session.state {
            SessionState::DataLoaded => {
                // Resumed request: serve below, then return to idle.
                session.state = SessionState::Idle;
                session.pending = None;
                return Ok(false);
            }
            SessionState::WaitingForProviderData => {
                // A different request raced in while waiting; requeue it.
                self.enqueue(envelope.clone());
                return Ok(true);
            }
            _ => {}
        }
        let path = XPath::parse(xpath)?;
        let entry = self.get_or_load(&mut session, &path.module)?;
        if self.needs_provider_data(&session, &entry, &path.module) {
            session.state = SessionState::Processing;
            self.park_for_providers(&mut session, &path.module, envelope.clone());
            return Ok(true);
        }
        Ok(false)
    }

    fn handle_request(&self, id: SessionId, request: &Request) -> Response {
        let outcome: Result<Response, EngineError> = match request {
            Request::GetItem { xpath } => self
                .get_item(id, xpath)
                .map(|value| Response::with_values(vec![value])),
            Request::GetItems { xpath } => {
                self.get_items(id, xpath).map(Response::with_values)
            }
            Request::SetItem {
                xpath,
                value,
                flags,
            } => self
                .set_item(id, xpath, value.clone(), *flags)
                .map(|()| Response::ok()),
            Request::DeleteItem { xpath, flags } => {
                self.delete_item(id, xpath, *flags).map(|()| Response::ok())
            }
            Request::MoveItem {
                xpath,
                position,
                relative,
            } => self
                .move_item(id, xpath, *position, relative.as_deref())
                .map(|()| Response::ok()),
            Request::Validate => self.validate(id).map(|()| Response::ok()),
            Request::Commit => self.commit(id).map(|commit_id| Response {
                commit_id,
                ..Response::default()
            }),
            Request::DiscardChanges => self.discard_changes(id).map(|()| Response::ok()),
            Request::Refresh => self.refresh(id).map(|()| Response::ok()),
            Request::CopyConfig { module, src, dst } => self
                .copy_config(id, module.as_deref(), *src, *dst)
                .map(|()| Response::ok()),
            Request::LockDatastore => self.lock_datastore(id).map(|()| Response::ok()),
            Request::UnlockDatastore => self.unlock_datastore(id).map(|()| Response::ok()),
            Request::LockModule { module } => {
                self.lock_module(id, module).map(|()| Response::ok())
            }
            Request::UnlockModule { module } => {
                self.unlock_module(id, module).map(|()| Response::ok())
            }
            Request::SwitchDatastore { ds } => {
                self.switch_datastore(id, *ds).map(|()| Response::ok())
            }
            Request::Rpc { xpath, args } => self
                .call_procedure(id, ProcedureKind::Rpc, xpath, args)
                .map(Response::with_values),
            Request::Action { xpath, args } => self
                .call_procedure(id, ProcedureKind::Action, xpath, args)
                .map(Response::with_values),
            Request::EventNotification { xpath, values } => self
                .event_notification(id, xpath, values)
                .map(|()| Response::ok()),
            Request::GetChanges { commit_id, xpath } => {
                self.get_changes(*commit_id, xpath).map(|changes| Response {
                    changes,
                    ..Response::default()
                })
            }
        };
        match outcome {
            Ok(response) => response,
            Err(err) => {
                let errors = self
                    .session_errors(id)
                    .ok()
                    .filter(|errors| !errors.is_empty())
                    .unwrap_or_else(|| vec![SessionError::new(err.to_string())]);
                Response::failed(err.code(), errors)
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // The drop can run on a worker thread (the last reference may be the
        // one a worker upgraded), so only signal here; joining is what the
        // explicit shutdown is for.
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.request_stop();
        }
        if let Some(broker) = self.broker.lock().take() {
            broker.request_stop();
        }
    }
}

/// Serialize a session's working copy of one module, mostly for tests and
/// diagnostics.
pub fn dump_working_tree(
    engine: &Engine,
    id: SessionId,
    module: &str,
) -> Result<String, EngineError> {
    let entry = engine.schemas().get(module, None)?;
    let session = engine.session(id)?;
    let session = session.lock();
    let info = session
        .info(module)
        .ok_or_else(|| EngineError::NotFound(format!("module '{module}' not loaded")))?;
    Ok(xml::serialize_tree(&entry.module, &info.tree, false))
}
