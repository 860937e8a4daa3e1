//! Persisted per-module settings: enabled feature names, enabled running
//! subtrees and subscription descriptors. The default store keeps one JSON
//! file per module under `data/internal/`, written via tmp-then-rename.

use std::fs;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::layout::RepoLayout;
use crate::subscription::{EventFilter, SubscriptionKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedModule {
    #[serde(default)]
    pub enabled_features: Vec<String>,
    #[serde(default)]
    pub enabled_subtrees: Vec<String>,
    #[serde(default)]
    pub subscriptions: Vec<PersistedSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSubscription {
    pub kind: SubscriptionKind,
    pub destination: String,
    pub id: u32,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub event_filter: Option<EventFilter>,
    #[serde(default)]
    pub enables_running: bool,
}

/// Contract of the persistent settings collaborator. Feature toggles must
/// roll back when `save_module` fails.
pub trait SettingsStore: Send + Sync {
    fn load_module(&self, module: &str) -> Result<PersistedModule, PersistError>;
    fn save_module(&self, module: &str, settings: &PersistedModule) -> Result<(), PersistError>;
}

#[derive(Debug)]
pub struct JsonSettingsStore {
    layout: RepoLayout,
}

impl JsonSettingsStore {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load_module(&self, module: &str) -> Result<PersistedModule, PersistError> {
        let path = self.layout.settings_file(module);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PersistedModule::default()),
            Err(err) => Err(PersistError::Io(err)),
        }
    }

    fn save_module(&self, module: &str, settings: &PersistedModule) -> Result<(), PersistError> {
        let path = self.layout.settings_file(module);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        let payload = serde_json::to_vec_pretty(settings)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(tmp_path, &path)?;
        Ok(())
    }
}

/// In-memory store for tests and for callers that inject failures.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    modules: std::collections::HashMap<String, PersistedModule>,
    fail_saves: bool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail, for rollback tests.
    pub fn fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_module(&self, module: &str) -> Result<PersistedModule, PersistError> {
        Ok(self
            .inner
            .lock()
            .modules
            .get(module)
            .cloned()
            .unwrap_or_default())
    }

    fn save_module(&self, module: &str, settings: &PersistedModule) -> Result<(), PersistError> {
        let mut inner = self.inner.lock();
        if inner.fail_saves {
            return Err(PersistError::Io(io::Error::other("injected save failure")));
        }
        inner.modules.insert(module.to_string(), settings.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_settings_load_as_default() {
        let tmp = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(RepoLayout::new(tmp.path()));
        let settings = store.load_module("ghost").unwrap();
        assert_eq!(settings, PersistedModule::default());
    }

    #[test]
    fn settings_round_trip() {
        let tmp = TempDir::new().unwrap();
        let layout = RepoLayout::new(tmp.path());
        layout.ensure().unwrap();
        let store = JsonSettingsStore::new(layout);
        let settings = PersistedModule {
            enabled_features: vec!["metrics".into()],
            enabled_subtrees: vec!["/m:interfaces".into()],
            subscriptions: vec![PersistedSubscription {
                kind: SubscriptionKind::ModuleChange,
                destination: "unix:/tmp/sub.sock".into(),
                id: 7,
                xpath: None,
                priority: 10,
                event_filter: Some(EventFilter::Both),
                enables_running: true,
            }],
        };
        store.save_module("m", &settings).unwrap();
        assert_eq!(store.load_module("m").unwrap(), settings);
    }

    #[test]
    fn memory_store_can_inject_failures() {
        let store = MemorySettingsStore::new();
        store.fail_saves(true);
        assert!(store
            .save_module("m", &PersistedModule::default())
            .is_err());
    }
}
