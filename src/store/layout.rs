use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::value::Datastore;

const DATA_LOCK_SUFFIX: &str = ".lock";
const NOTIFICATION_PREFIX: &str = "notif-";
const NOTIFICATION_SUFFIX: &str = ".log";

/// Canonical repository layout rooted at the configured repo directory:
/// schemas under `yang/`, serialized trees under `data/<module>.<ds>`,
/// persisted per-module settings under `data/internal/` and retained
/// notifications under `data/notifications/`.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn paths(&self) -> RepoPaths {
        RepoPaths {
            root: self.root.clone(),
            yang_dir: self.root.join("yang"),
            yang_internal_dir: self.root.join("yang/internal"),
            data_dir: self.root.join("data"),
            data_internal_dir: self.root.join("data/internal"),
            notifications_dir: self.root.join("data/notifications"),
        }
    }

    pub fn ensure(&self) -> Result<(), LayoutError> {
        let paths = self.paths();
        fs::create_dir_all(&paths.yang_internal_dir)?;
        fs::create_dir_all(&paths.data_internal_dir)?;
        fs::create_dir_all(&paths.notifications_dir)?;
        Ok(())
    }

    /// Serialized tree for one (module, datastore). Candidate has no file of
    /// its own; callers resolve it to running before asking.
    pub fn data_file(&self, module: &str, ds: Datastore) -> PathBuf {
        self.paths()
            .data_dir
            .join(format!("{module}.{}", ds.as_str()))
    }

    /// Advisory lock target for a data file.
    pub fn lock_file(&self, module: &str, ds: Datastore) -> PathBuf {
        self.paths()
            .data_dir
            .join(format!("{module}.{}{DATA_LOCK_SUFFIX}", ds.as_str()))
    }

    pub fn schema_file(&self, module: &str, revision: Option<&str>) -> PathBuf {
        let name = match revision {
            Some(rev) => format!("{module}@{rev}.yang"),
            None => format!("{module}.yang"),
        };
        self.paths().yang_dir.join(name)
    }

    /// Persisted settings (features, enabled subtrees, subscriptions) of one
    /// module.
    pub fn settings_file(&self, module: &str) -> PathBuf {
        self.paths().data_internal_dir.join(format!("{module}.json"))
    }

    /// Retained-notification file for the window containing `epoch_secs`.
    pub fn notification_file(&self, epoch_secs: u64, window: Duration) -> PathBuf {
        let window_secs = window.as_secs().max(1);
        let start = epoch_secs - (epoch_secs % window_secs);
        self.paths()
            .notifications_dir
            .join(format!("{NOTIFICATION_PREFIX}{start}{NOTIFICATION_SUFFIX}"))
    }

    /// Window start encoded in a retained-notification file name, if the name
    /// matches the expected shape.
    pub fn notification_window_start(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(NOTIFICATION_PREFIX)?
            .strip_suffix(NOTIFICATION_SUFFIX)?;
        digits.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct RepoPaths {
    pub root: PathBuf,
    pub yang_dir: PathBuf,
    pub yang_internal_dir: PathBuf,
    pub data_dir: PathBuf,
    pub data_internal_dir: PathBuf,
    pub notifications_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_creates_the_tree() {
        let tmp = TempDir::new().unwrap();
        let layout = RepoLayout::new(tmp.path());
        layout.ensure().unwrap();
        let paths = layout.paths();
        assert!(paths.yang_internal_dir.is_dir());
        assert!(paths.data_internal_dir.is_dir());
        assert!(paths.notifications_dir.is_dir());
    }

    #[test]
    fn data_and_lock_paths_follow_the_scheme() {
        let layout = RepoLayout::new("/repo");
        assert_eq!(
            layout.data_file("example-module", Datastore::Startup),
            PathBuf::from("/repo/data/example-module.startup")
        );
        assert_eq!(
            layout.lock_file("example-module", Datastore::Running),
            PathBuf::from("/repo/data/example-module.running.lock")
        );
    }

    #[test]
    fn notification_windows_are_aligned() {
        let layout = RepoLayout::new("/repo");
        let window = Duration::from_secs(600);
        let a = layout.notification_file(1200, window);
        let b = layout.notification_file(1799, window);
        assert_eq!(a, b);
        assert_eq!(RepoLayout::notification_window_start(&a), Some(1200));
    }

    #[test]
    fn schema_file_names_carry_revision() {
        let layout = RepoLayout::new("/repo");
        assert_eq!(
            layout.schema_file("m", Some("2026-01-15")),
            PathBuf::from("/repo/yang/m@2026-01-15.yang")
        );
        assert_eq!(layout.schema_file("m", None), PathBuf::from("/repo/yang/m.yang"));
    }
}
