//! The two-phase, subscriber-mediated commit pipeline: prepare a context,
//! lock and load, diff and verify, persist and notify. Contexts with
//! notified subscribers are retained for change iteration until every
//! acknowledgment arrives or a forced release fires.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::data::diff::{diff_trees, generate_changes, Change, DiffEntry};
use crate::data::tree::DataTree;
use crate::data::xml;
use crate::engine::Engine;
use crate::error::{EngineError, SessionError};
use crate::locks::LockKey;
use crate::oplog::{replay, Operation, ReplayTarget};
use crate::schema::model::{SchemaModule, SchemaNodeId};
use crate::session::Session;
use crate::store::file::{copy_up_to_date, write_tree, FileLockGuard};
use crate::subscription::{match_subscription, Subscription};
use crate::validate;
use crate::value::Datastore;
use crate::xpath::XPath;

const COMMIT_ID_MAX_ATTEMPTS: usize = 100;

/// Subscription snapshot of one modified module, priority-descending, with
/// the diff produced in phase C and the lazily generated change list.
#[derive(Debug)]
pub struct ModuleSubscriptions {
    pub module: String,
    pub subs: Vec<Arc<Subscription>>,
    pub nodes: Vec<Option<SchemaNodeId>>,
    pub matched: Vec<bool>,
    pub diff: Vec<DiffEntry>,
    pub changes: RwLock<Option<Vec<Change>>>,
}

/// Retained post-commit state: previous and merged trees per module plus the
/// subscription snapshot, kept until notified subscribers acknowledge.
#[derive(Debug)]
pub struct CommitContext {
    pub id: u32,
    pub source: Datastore,
    pub target: Datastore,
    pub subscriptions: HashMap<String, ModuleSubscriptions>,
    pub result_trees: HashMap<String, (Arc<SchemaModule>, DataTree)>,
    pub prev_trees: HashMap<String, DataTree>,
    pub waiters: usize,
}

impl CommitContext {
    /// Change list of one module, generated on first use under the module's
    /// changes lock and filtered by the query path.
    pub fn changes_for(&self, module: &str, xpath: Option<&str>) -> Result<Vec<Change>, EngineError> {
        let ms = self.subscriptions.get(module).ok_or_else(|| {
            EngineError::NotFound(format!("module '{module}' in commit {}", self.id))
        })?;
        {
            let cached = ms.changes.read();
            if cached.is_none() {
                drop(cached);
                let (schema, new_tree) = self.result_trees.get(module).ok_or_else(|| {
                    EngineError::Internal(format!("commit {} lost tree of '{module}'", self.id))
                })?;
                let prev = self.prev_trees.get(module).ok_or_else(|| {
                    EngineError::Internal(format!("commit {} lost prev tree of '{module}'", self.id))
                })?;
                let generated = generate_changes(schema, prev, new_tree, &ms.diff);
                *ms.changes.write() = Some(generated);
            }
        }
        let cached = ms.changes.read();
        let all = cached.as_deref().unwrap_or(&[]);
        let filtered = match xpath {
            None => all.to_vec(),
            Some(query) => all
                .iter()
                .filter(|change| {
                    change.xpath == query
                        || change.xpath.starts_with(&format!("{query}/"))
                        || change.xpath.starts_with(&format!("{query}["))
                })
                .cloned()
                .collect(),
        };
        Ok(filtered)
    }
}

/// Registry of retained commit contexts, keyed by commit id.
#[derive(Debug, Default)]
pub struct CommitContexts {
    inner: RwLock<HashMap<u32, Arc<Mutex<CommitContext>>>>,
}

impl CommitContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Mutex<CommitContext>>> {
        self.inner.read().get(&id).cloned()
    }

    pub fn insert(&self, ctx: CommitContext) {
        self.inner.write().insert(ctx.id, Arc::new(Mutex::new(ctx)));
    }

    /// One subscriber acknowledgment. When the waiter count reaches zero the
    /// context is removed and its retained trees freed. Returns whether the
    /// context was released.
    pub fn acknowledge(&self, id: u32) -> Result<bool, EngineError> {
        let ctx = self
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("commit context {id}")))?;
        let released = {
            let mut ctx = ctx.lock();
            ctx.waiters = ctx.waiters.saturating_sub(1);
            ctx.waiters == 0
        };
        if released {
            self.inner.write().remove(&id);
            debug!("event=commit_context_released commit_id={id} reason=acknowledged");
        }
        Ok(released)
    }

    /// Forced release regardless of outstanding acknowledgments.
    pub fn release(&self, id: u32) -> Result<(), EngineError> {
        if self.inner.write().remove(&id).is_none() {
            return Err(EngineError::NotFound(format!("commit context {id}")));
        }
        debug!("event=commit_context_released commit_id={id} reason=forced");
        Ok(())
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// A failed commit: the leading error plus per-module detail records.
#[derive(Debug)]
pub struct CommitFailure {
    pub error: EngineError,
    pub errors: Vec<SessionError>,
}

impl CommitFailure {
    fn from_error(error: EngineError) -> Self {
        let errors = vec![SessionError::new(error.to_string())];
        Self { error, errors }
    }

    fn with_errors(error: EngineError, errors: Vec<SessionError>) -> Self {
        Self { error, errors }
    }
}

struct OpenedFile {
    module: String,
    path: PathBuf,
    file: File,
    existed: bool,
    _lock: FileLockGuard,
}

/// Module locks taken for the duration of one commit; released on drop so
/// every failure path unwinds them.
struct HeldModuleLocks<'a> {
    engine: &'a Engine,
    owner: crate::session::SessionId,
    keys: Vec<LockKey>,
}

impl Drop for HeldModuleLocks<'_> {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            let _ = self.engine.locks().unlock(&key, self.owner);
        }
    }
}

fn roll_commit_id(engine: &Engine) -> Result<u32, EngineError> {
    let mut rng = rand::thread_rng();
    for _ in 0..COMMIT_ID_MAX_ATTEMPTS {
        let id: u32 = rng.gen();
        if id == 0 {
            continue;
        }
        if !engine.commit_contexts().contains(id) {
            return Ok(id);
        }
    }
    Err(EngineError::Internal(
        "unable to generate a unique commit id".into(),
    ))
}

fn read_disk_tree(
    schema: &SchemaModule,
    path: &std::path::Path,
    existed: bool,
) -> Result<DataTree, EngineError> {
    let mut tree = if existed {
        let content = std::fs::read_to_string(path)?;
        xml::parse_tree(schema, &content)?
    } else {
        DataTree::new()
    };
    validate::materialize_defaults(schema, &mut tree);
    Ok(tree)
}

/// Run the whole commit pipeline for a session. Returns the commit id, or
/// `None` when the session had nothing to commit.
pub(crate) fn run_commit(
    engine: &Engine,
    session: &mut Session,
) -> Result<Option<u32>, CommitFailure> {
    let source = session.datastore;
    let target = source.effective();
    let modified = session.modified_modules();
    if modified.is_empty() {
        debug!("event=commit_noop session={}", session.id);
        return Ok(None);
    }
    if session.ops().is_empty() && source != Datastore::Candidate {
        warn!(
            "event=commit_without_operations session={} outcome=skipped",
            session.id
        );
        return Ok(None);
    }

    // Phase A: context id and priority-descending subscription snapshots.
    let commit_id = roll_commit_id(engine).map_err(CommitFailure::from_error)?;
    let mut subscriptions: HashMap<String, ModuleSubscriptions> = HashMap::new();
    if source != Datastore::Startup {
        for module in &modified {
            let entry = engine
                .schemas()
                .get(module, None)
                .map_err(CommitFailure::from_error)?;
            let subs = engine.subscriptions().change_subscriptions(module);
            let nodes = subs
                .iter()
                .map(|sub| {
                    sub.xpath.as_deref().and_then(|xpath| {
                        XPath::parse(xpath)
                            .ok()
                            .and_then(|path| entry.module.resolve(&path).ok())
                    })
                })
                .collect();
            let matched = vec![false; subs.len()];
            subscriptions.insert(
                module.clone(),
                ModuleSubscriptions {
                    module: module.clone(),
                    subs,
                    nodes,
                    matched,
                    diff: Vec::new(),
                    changes: RwLock::new(None),
                },
            );
        }
    }

    // Phase B: module locks, candidate enablement, files, freshness.
    let mut held = HeldModuleLocks {
        engine,
        owner: session.id,
        keys: Vec::new(),
    };
    for module in &modified {
        let mut wanted = vec![LockKey::module(target, module.clone())];
        if source == Datastore::Candidate {
            wanted.push(LockKey::module(Datastore::Candidate, module.clone()));
        }
        for key in wanted {
            if engine.locks().holder(&key) == Some(session.id) {
                continue;
            }
            engine
                .locks()
                .lock(key.clone(), session.id, false, Duration::ZERO)
                .map_err(CommitFailure::from_error)?;
            held.keys.push(key);
        }
    }

    if source == Datastore::Candidate {
        for module in &modified {
            let entry = engine
                .schemas()
                .get(module, None)
                .map_err(CommitFailure::from_error)?;
            let info = session.info(module).ok_or_else(|| {
                CommitFailure::from_error(EngineError::Internal(format!(
                    "modified module '{module}' has no working copy"
                )))
            })?;
            for id in info.tree.preorder(None) {
                let node = info.tree.node(id);
                if node.dflt {
                    continue;
                }
                if !entry.is_enabled(node.schema) {
                    let err = EngineError::OperationFailed(format!(
                        "node '{}' of module '{module}' is not enabled in running",
                        entry.module.schema_path(node.schema)
                    ));
                    return Err(CommitFailure::from_error(err));
                }
            }
        }
    }

    let last_commit = engine.last_commit_time();
    let mut opened: Vec<OpenedFile> = Vec::new();
    let mut up_to_date: HashSet<String> = HashSet::new();
    let mut result: HashMap<String, (Arc<SchemaModule>, DataTree)> = HashMap::new();
    let mut prev: HashMap<String, DataTree> = HashMap::new();
    let mut replay_targets: HashMap<String, ReplayTarget> = HashMap::new();

    for module in &modified {
        let entry = engine
            .schemas()
            .get(module, None)
            .map_err(CommitFailure::from_error)?;
        engine
            .access()
            .check_write(&session.credentials, module)
            .map_err(CommitFailure::from_error)?;
        let path = engine.layout().data_file(module, target);
        let (file, existed) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => (file, true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|err| CommitFailure::from_error(EngineError::from(err)))?;
                (file, false)
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CommitFailure::from_error(EngineError::Unauthorized(
                    format!("cannot write data of module '{module}'"),
                )));
            }
            Err(err) => return Err(CommitFailure::from_error(EngineError::from(err))),
        };
        let lock_path = engine.layout().lock_file(module, target);
        let lock = FileLockGuard::acquire(
            &lock_path,
            &format!("commit-{commit_id}"),
            false,
            Duration::ZERO,
        )
        .map_err(|err| {
            // Non-blocking write-lock failure is an operation failure here.
            CommitFailure::from_error(EngineError::OperationFailed(err.to_string()))
        })?;

        let mtime = if existed {
            file.metadata().ok().and_then(|m| m.modified().ok())
        } else {
            None
        };
        let info = session.info(module).ok_or_else(|| {
            CommitFailure::from_error(EngineError::Internal(format!(
                "modified module '{module}' has no working copy"
            )))
        })?;
        let fresh = copy_up_to_date(info.timestamp, mtime, last_commit, SystemTime::now());
        // The candidate path always carries its own merged tree; operations
        // are never replayed over running state.
        if fresh || source == Datastore::Candidate {
            debug!("event=commit_optimized module={module} commit_id={commit_id}");
            up_to_date.insert(module.clone());
            result.insert(module.clone(), (entry.module.clone(), info.tree.deep_copy()));
        } else {
            let base = read_disk_tree(&entry.module, &path, existed)
                .map_err(CommitFailure::from_error)?;
            replay_targets.insert(module.clone(), ReplayTarget::new(entry.module.clone(), base));
        }
        if source != Datastore::Startup {
            let prev_tree = read_disk_tree(&entry.module, &path, existed)
                .map_err(CommitFailure::from_error)?;
            prev.insert(module.clone(), prev_tree);
        }
        opened.push(OpenedFile {
            module: module.clone(),
            path,
            file,
            existed,
            _lock: lock,
        });
    }

    // Replay the operation log over refreshed bases, then validate.
    if !replay_targets.is_empty() {
        let mut ops: Vec<Operation> = session.ops().to_vec();
        let report = replay(&mut ops, &mut replay_targets, &up_to_date);
        if report.dropped > 0 {
            warn!(
                "event=commit_replay_dropped commit_id={commit_id} dropped={}",
                report.dropped
            );
        }
        for (module, target_state) in replay_targets {
            let schema = target_state.schema.clone();
            let mut tree = target_state.result;
            validate::materialize_defaults(&schema, &mut tree);
            result.insert(module, (schema, tree));
        }
    }

    let mut validation_errors = Vec::new();
    for (schema, tree) in result.values() {
        validation_errors.extend(validate::validate_tree(schema, tree));
    }
    if !validation_errors.is_empty() {
        return Err(CommitFailure::with_errors(
            EngineError::ValidationFailed(format!(
                "{} validation error(s)",
                validation_errors.len()
            )),
            validation_errors,
        ));
    }

    // Phase C: diff against the previous state, then verify. Startup
    // commits notify nobody.
    if source != Datastore::Startup {
        for module in &modified {
            let Some(ms) = subscriptions.get_mut(module) else {
                continue;
            };
            let (schema, new_tree) = &result[module];
            let prev_tree = &prev[module];
            ms.diff = diff_trees(schema, prev_tree, new_tree);
            if ms.diff.is_empty() {
                debug!("event=commit_no_changes module={module} commit_id={commit_id}");
                continue;
            }
            for (index, sub) in ms.subs.iter().enumerate() {
                let matched = ms
                    .diff
                    .iter()
                    .any(|entry| match_subscription(schema, ms.nodes[index], entry, prev_tree, new_tree));
                ms.matched[index] = matched;
                if matched && sub.event_filter.wants_verify() {
                    debug!(
                        "event=commit_verify commit_id={commit_id} module={module} dst={} priority={}",
                        sub.delivery.address, sub.priority
                    );
                    let waited = Instant::now();
                    let verdict =
                        engine
                            .transport()
                            .verify(sub, commit_id, engine.timeouts().commit_verify);
                    engine.observe_duration("commit.verify_wait_ms", waited.elapsed());
                    if let Err(err) = verdict {
                        engine.count("commit.verify_veto");
                        warn!(
                            "event=commit_vetoed commit_id={commit_id} module={module} dst={} error={err}",
                            sub.delivery.address
                        );
                        return Err(CommitFailure::with_errors(
                            err.clone(),
                            vec![SessionError::new(format!(
                                "verifier {} rejected the commit: {err}",
                                sub.delivery.address
                            ))],
                        ));
                    }
                }
            }
        }
    }

    // Phase D: persist, stamp the commit time, notify, retain the context.
    let mut write_errors = Vec::new();
    for opened_file in opened.iter_mut() {
        let (schema, tree) = &result[&opened_file.module];
        if let Err(err) = write_tree(&mut opened_file.file, schema, tree) {
            warn!(
                "event=commit_write_failed commit_id={commit_id} module={} error={err}",
                opened_file.module
            );
            write_errors.push(SessionError::new(format!(
                "failed to write module '{}': {err}",
                opened_file.module
            )));
        } else {
            debug!(
                "event=commit_written commit_id={commit_id} module={} path={} existed={}",
                opened_file.module,
                opened_file.path.display(),
                opened_file.existed
            );
        }
    }
    engine.stamp_commit_time(Instant::now(), SystemTime::now());
    if !write_errors.is_empty() {
        // Already-written modules stay as written; there is no cross-module
        // rollback.
        return Err(CommitFailure::with_errors(
            EngineError::Internal(format!("{} module write(s) failed", write_errors.len())),
            write_errors,
        ));
    }

    let mut waiters = 0usize;
    if source != Datastore::Startup {
        for module in &modified {
            let Some(ms) = subscriptions.get(module) else {
                continue;
            };
            if ms.diff.is_empty() {
                continue;
            }
            for (index, sub) in ms.subs.iter().enumerate() {
                if ms.matched[index] && sub.event_filter.wants_notify() {
                    engine.transport().notify(sub, commit_id);
                    engine.count("commit.notifications");
                    waiters += 1;
                }
            }
        }
    }
    if waiters > 0 {
        engine.commit_contexts().insert(CommitContext {
            id: commit_id,
            source,
            target,
            subscriptions,
            result_trees: result,
            prev_trees: prev,
            waiters,
        });
    }

    // Post-commit session bookkeeping: the log is consumed, copies are
    // clean and freshly stamped.
    session.take_ops();
    let stamp = SystemTime::now();
    for module in &modified {
        if let Some(info) = session.info_mut(module) {
            info.modified = false;
            info.timestamp = Some(stamp);
        }
    }
    drop(held);
    engine.count("commit.total");
    info!(
        "event=commit_complete commit_id={commit_id} session={} source={source} target={target} modules={} notified={waiters}",
        session.id,
        modified.len()
    );
    Ok(Some(commit_id))
}
