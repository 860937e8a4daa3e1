//! Data-file access: schema-bound load with default materialization, the
//! commit-side write path (serialize, truncate, fsync) and the advisory lock
//! guard over `<module>.<ds>.lock` targets.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::data::tree::DataTree;
use crate::data::xml;
use crate::error::EngineError;
use crate::schema::model::SchemaModule;
use crate::session::UserCredentials;
use crate::store::layout::RepoLayout;
use crate::validate;
use crate::value::Datastore;

/// Freshness bound: a file modified within this window of "now" cannot be
/// trusted against timestamp comparison, so the copy reloads.
pub const GRANULARITY_THRESHOLD: Duration = Duration::from_millis(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Access-control collaborator. The engine never evaluates rules itself;
/// denial surfaces as unauthorized.
pub trait AccessControl: Send + Sync {
    fn check_read(&self, creds: &UserCredentials, module: &str) -> Result<(), EngineError>;
    fn check_write(&self, creds: &UserCredentials, module: &str) -> Result<(), EngineError>;
}

/// Default collaborator: every identity may read and write.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_read(&self, _creds: &UserCredentials, _module: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn check_write(&self, _creds: &UserCredentials, _module: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Result of loading one (module, datastore) file.
#[derive(Debug)]
pub struct LoadedTree {
    pub tree: DataTree,
    pub mtime: Option<SystemTime>,
    pub existed: bool,
}

/// Load a data file read-only: parse, structurally bind to the schema and
/// materialize defaults. A missing file is not an error; it loads as an
/// empty tree with defaults.
pub fn load_tree(
    layout: &RepoLayout,
    schema: &SchemaModule,
    module: &str,
    ds: Datastore,
    creds: &UserCredentials,
    access: &dyn AccessControl,
) -> Result<LoadedTree, EngineError> {
    access.check_read(creds, module)?;
    let path = layout.data_file(module, ds);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("event=data_file_missing module={module} ds={ds} outcome=empty_tree");
            let mut tree = DataTree::new();
            validate::materialize_defaults(schema, &mut tree);
            return Ok(LoadedTree {
                tree,
                mtime: None,
                existed: false,
            });
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!("event=data_file_denied module={module} ds={ds}");
            return Err(EngineError::Unauthorized(format!(
                "cannot read data of module '{module}'"
            )));
        }
        Err(err) => return Err(EngineError::from(err)),
    };
    let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
    let mut tree = xml::parse_tree(schema, &content)?;
    validate::materialize_defaults(schema, &mut tree);
    Ok(LoadedTree {
        tree,
        mtime,
        existed: true,
    })
}

/// Write the post-commit tree into an already-opened and locked data file.
/// The tree is serialized before the file is touched; truncation happens
/// only once the payload is ready.
pub fn write_tree(
    file: &mut File,
    schema: &SchemaModule,
    tree: &DataTree,
) -> Result<(), EngineError> {
    let payload = xml::serialize_tree(schema, tree, false);
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// The optimized-commit predicate: a session copy loaded at `copy_ts` is
/// authoritative only if it strictly post-dates both the file mtime and the
/// engine's last commit, the file has settled past the granularity
/// threshold, and the filesystem actually reports nanosecond mtimes (a zero
/// nanosecond field forces the always-reload fallback).
pub fn copy_up_to_date(
    copy_ts: Option<SystemTime>,
    file_mtime: Option<SystemTime>,
    last_commit: Option<SystemTime>,
    now: SystemTime,
) -> bool {
    let (Some(copy_ts), Some(mtime)) = (copy_ts, file_mtime) else {
        return false;
    };
    let Ok(mtime_epoch) = mtime.duration_since(UNIX_EPOCH) else {
        return false;
    };
    if mtime_epoch.subsec_nanos() == 0 {
        return false;
    }
    if copy_ts <= mtime {
        return false;
    }
    if let Some(last_commit) = last_commit {
        if copy_ts <= last_commit {
            return false;
        }
    }
    match now.duration_since(mtime) {
        Ok(age) => age > GRANULARITY_THRESHOLD,
        Err(_) => false,
    }
}

/// Advisory file lock realized as an exclusive `.lock` companion. Creation
/// is atomic; the guard removes the file on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    lock_path: PathBuf,
}

impl FileLockGuard {
    /// Try to take the lock. Non-blocking mode reports `Locked` right away;
    /// blocking mode retries until `timeout` and then reports `TimedOut`.
    pub fn acquire(
        lock_path: &Path,
        owner: &str,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(mut file) => {
                    let _ = file.write_all(owner.as_bytes());
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !blocking {
                        return Err(EngineError::Locked(format!(
                            "file lock at {}",
                            lock_path.display()
                        )));
                    }
                    if started.elapsed() >= timeout {
                        return Err(EngineError::TimedOut(format!(
                            "waiting for file lock at {}",
                            lock_path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => return Err(EngineError::from(err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::SchemaModuleBuilder;
    use crate::value::LeafType;
    use tempfile::TempDir;

    fn schema() -> SchemaModule {
        let mut b = SchemaModuleBuilder::new("m").namespace("urn:m");
        let top = b.container(None, "top");
        b.leaf(Some(top), "leaf", LeafType::String, None);
        b.leaf(Some(top), "with-default", LeafType::String, Some("d"));
        b.build().unwrap()
    }

    fn creds() -> UserCredentials {
        UserCredentials::new("tester")
    }

    #[test]
    fn missing_file_loads_as_defaults() {
        let tmp = TempDir::new().unwrap();
        let layout = RepoLayout::new(tmp.path());
        layout.ensure().unwrap();
        let loaded = load_tree(
            &layout,
            &schema(),
            "m",
            Datastore::Startup,
            &creds(),
            &AllowAll,
        )
        .unwrap();
        assert!(!loaded.existed);
        assert!(loaded.mtime.is_none());
        assert!(!loaded.tree.is_empty(), "defaults should materialize");
    }

    #[test]
    fn write_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let layout = RepoLayout::new(tmp.path());
        layout.ensure().unwrap();
        let schema = schema();
        let mut tree = DataTree::new();
        crate::data::edit::apply_set(
            &schema,
            &mut tree,
            &crate::xpath::XPath::parse("/m:top/leaf").unwrap(),
            Some(&crate::value::ValueData::String("v".into())),
            crate::data::edit::EditFlags::DEFAULT,
        )
        .unwrap();
        let path = layout.data_file("m", Datastore::Startup);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        write_tree(&mut file, &schema, &tree).unwrap();

        let loaded = load_tree(
            &layout,
            &schema,
            "m",
            Datastore::Startup,
            &creds(),
            &AllowAll,
        )
        .unwrap();
        assert!(loaded.existed);
        assert!(loaded.mtime.is_some());
        let found = loaded
            .tree
            .find(&schema, &crate::xpath::XPath::parse("/m:top/leaf").unwrap())
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn freshness_predicate_covers_the_edge_cases() {
        let base = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mtime = base + Duration::from_nanos(123_456_789);
        let now = base + Duration::from_secs(60);

        // Fresh: copy after mtime and last commit, file has settled.
        assert!(copy_up_to_date(
            Some(mtime + Duration::from_secs(1)),
            Some(mtime),
            Some(base),
            now,
        ));
        // Stale: copy predates the file.
        assert!(!copy_up_to_date(
            Some(mtime - Duration::from_secs(1)),
            Some(mtime),
            None,
            now,
        ));
        // Stale: a commit happened after the copy.
        assert!(!copy_up_to_date(
            Some(mtime + Duration::from_secs(1)),
            Some(mtime),
            Some(mtime + Duration::from_secs(2)),
            now,
        ));
        // Stale: the file was modified within the granularity threshold.
        assert!(!copy_up_to_date(
            Some(mtime + Duration::from_millis(1)),
            Some(mtime),
            None,
            mtime + Duration::from_millis(2),
        ));
        // Fallback: whole-second mtime means no nanosecond resolution.
        let coarse = base + Duration::from_secs(5);
        assert!(!copy_up_to_date(
            Some(coarse + Duration::from_secs(1)),
            Some(coarse),
            None,
            now,
        ));
        // No file mtime at all means reload.
        assert!(!copy_up_to_date(Some(now), None, None, now));
    }

    #[test]
    fn file_lock_is_exclusive_and_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("m.startup.lock");
        let guard =
            FileLockGuard::acquire(&lock_path, "sess-1", false, Duration::ZERO).unwrap();
        let second = FileLockGuard::acquire(&lock_path, "sess-2", false, Duration::ZERO);
        assert!(matches!(second, Err(EngineError::Locked(_))));
        drop(guard);
        let third = FileLockGuard::acquire(&lock_path, "sess-3", false, Duration::ZERO);
        assert!(third.is_ok());
    }
}
