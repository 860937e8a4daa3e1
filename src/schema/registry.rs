use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::error::EngineError;
use crate::schema::model::{node_enabled, NodeState, SchemaModule, SchemaNodeId};
use crate::store::persist::SettingsStore;
use crate::xpath::XPath;

/// Contract of the schema loader collaborator, consulted on cache miss when
/// local loading is configured.
pub trait SchemaLoader: Send + Sync {
    fn load(&self, name: &str, revision: Option<&str>) -> Result<SchemaModule, EngineError>;
}

/// Loader over a fixed set of prebuilt modules.
#[derive(Debug, Default)]
pub struct StaticSchemaLoader {
    modules: Vec<SchemaModule>,
}

impl StaticSchemaLoader {
    pub fn new(modules: Vec<SchemaModule>) -> Self {
        Self { modules }
    }
}

impl SchemaLoader for StaticSchemaLoader {
    fn load(&self, name: &str, revision: Option<&str>) -> Result<SchemaModule, EngineError> {
        self.modules
            .iter()
            .find(|module| {
                module.name == name
                    && revision.map_or(true, |rev| module.revision.as_deref() == Some(rev))
            })
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))
    }
}

/// One installed schema plus its runtime enablement companions. The schema
/// itself is immutable and shared; feature and node-state maps are guarded so
/// every session referencing a node observes the same state.
#[derive(Debug)]
pub struct ModuleEntry {
    pub module: Arc<SchemaModule>,
    enabled_features: RwLock<HashSet<String>>,
    node_states: RwLock<HashMap<SchemaNodeId, NodeState>>,
}

impl ModuleEntry {
    fn new(module: SchemaModule) -> Self {
        Self {
            module: Arc::new(module),
            enabled_features: RwLock::new(HashSet::new()),
            node_states: RwLock::new(HashMap::new()),
        }
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.enabled_features.read().contains(feature)
    }

    pub fn enabled_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self.enabled_features.read().iter().cloned().collect();
        features.sort();
        features
    }

    pub fn node_state(&self, id: SchemaNodeId) -> NodeState {
        self.node_states
            .read()
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_node_state(&self, id: SchemaNodeId, state: NodeState) {
        self.node_states.write().insert(id, state);
    }

    /// Whether this node may be populated in the running datastore.
    pub fn is_enabled(&self, id: SchemaNodeId) -> bool {
        node_enabled(&self.module, &self.node_states.read(), id)
    }

    /// Whether any subtree of the module is enabled for running.
    pub fn has_enabled_subtree(&self) -> bool {
        self.node_states
            .read()
            .values()
            .any(|state| !matches!(state, NodeState::Disabled))
    }

    /// Enable the whole module for running.
    pub fn enable_module(&self) {
        let mut states = self.node_states.write();
        for root in self.module.roots() {
            states.insert(*root, NodeState::EnabledWithChildren);
        }
    }

    /// Enable one subtree for running: ancestors become `Enabled`, the target
    /// `EnabledWithChildren`.
    pub fn enable_subtree(&self, xpath: &str) -> Result<(), EngineError> {
        let path = XPath::parse(xpath)?;
        let target = self.module.resolve(&path)?;
        let mut states = self.node_states.write();
        let mut current = self.module.node(target).parent;
        while let Some(id) = current {
            let entry = states.entry(id).or_default();
            if matches!(entry, NodeState::Disabled) {
                *entry = NodeState::Enabled;
            }
            current = self.module.node(id).parent;
        }
        states.insert(target, NodeState::EnabledWithChildren);
        Ok(())
    }

    /// Drop all running enablement for the module.
    pub fn disable_running(&self) {
        self.node_states.write().clear();
    }

    pub fn enabled_subtree_paths(&self) -> Vec<String> {
        let states = self.node_states.read();
        let mut paths: Vec<String> = states
            .iter()
            .filter(|(_, state)| matches!(state, NodeState::EnabledWithChildren))
            .map(|(id, _)| self.module.schema_path(*id))
            .collect();
        paths.sort();
        paths
    }
}

/// Keyed lookup over installed schemas with feature enablement and the
/// disabled-module set. Guarded by a reader/writer lock; lookups take the
/// read side.
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
    loader: Option<Arc<dyn SchemaLoader>>,
    settings: Arc<dyn SettingsStore>,
}

struct RegistryInner {
    modules: HashMap<String, Vec<Arc<ModuleEntry>>>,
    disabled: HashSet<String>,
}

impl SchemaRegistry {
    pub fn new(loader: Option<Arc<dyn SchemaLoader>>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                modules: HashMap::new(),
                disabled: HashSet::new(),
            }),
            loader,
            settings,
        }
    }

    /// Look up an installed module, optionally pinned to a revision. On a
    /// cache miss the configured loader, if any, is consulted and the result
    /// installed. A disabled module name always reports unknown model.
    pub fn get(&self, name: &str, revision: Option<&str>) -> Result<Arc<ModuleEntry>, EngineError> {
        {
            let inner = self.inner.read();
            if inner.disabled.contains(name) {
                return Err(EngineError::UnknownModel(name.to_string()));
            }
            if let Some(entry) = Self::find(&inner, name, revision) {
                return Ok(entry);
            }
        }
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))?;
        let module = loader.load(name, revision)?;
        self.install(module)
    }

    fn find(inner: &RegistryInner, name: &str, revision: Option<&str>) -> Option<Arc<ModuleEntry>> {
        let entries = inner.modules.get(name)?;
        match revision {
            Some(rev) => entries
                .iter()
                .find(|entry| entry.module.revision.as_deref() == Some(rev))
                .cloned(),
            None => entries.last().cloned(),
        }
    }

    /// Install a schema. Re-installing the same (name, revision) returns the
    /// existing entry; re-installing a disabled module requires a process
    /// restart and is refused.
    pub fn install(&self, module: SchemaModule) -> Result<Arc<ModuleEntry>, EngineError> {
        let mut inner = self.inner.write();
        if inner.disabled.contains(&module.name) {
            warn!(
                "event=schema_install_refused module={} reason=disabled_requires_restart",
                module.name
            );
            return Err(EngineError::Internal(format!(
                "module '{}' was uninstalled; restart required to re-install",
                module.name
            )));
        }
        if let Some(existing) = Self::find(&inner, &module.name, module.revision.as_deref()) {
            return Ok(existing);
        }
        let name = module.name.clone();
        let entry = Arc::new(ModuleEntry::new(module));
        self.restore_persisted(&entry);
        inner.modules.entry(name.clone()).or_default().push(entry.clone());
        info!("event=schema_installed module={name}");
        Ok(entry)
    }

    fn restore_persisted(&self, entry: &ModuleEntry) {
        let persisted = match self.settings.load_module(&entry.module.name) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(
                    "event=settings_restore_failed module={} error={err}",
                    entry.module.name
                );
                return;
            }
        };
        {
            let mut features = entry.enabled_features.write();
            for feature in &persisted.enabled_features {
                if entry.module.features.contains(feature) {
                    features.insert(feature.clone());
                }
            }
        }
        for subtree in &persisted.enabled_subtrees {
            if let Err(err) = entry.enable_subtree(subtree) {
                warn!(
                    "event=enabled_subtree_restore_failed module={} xpath={subtree} error={err}",
                    entry.module.name
                );
            }
        }
    }

    /// Mark a module disabled. Lookups for its name report unknown model from
    /// now on; only a restart brings it back.
    pub fn uninstall(&self, name: &str, revision: Option<&str>) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        let entries = inner
            .modules
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))?;
        match revision {
            Some(rev) => entries.retain(|entry| entry.module.revision.as_deref() != Some(rev)),
            None => entries.clear(),
        }
        if entries.is_empty() {
            inner.modules.remove(name);
        }
        inner.disabled.insert(name.to_string());
        info!("event=schema_uninstalled module={name}");
        Ok(())
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.inner.read().disabled.contains(name)
    }

    pub fn list(&self) -> Vec<Arc<ModuleEntry>> {
        let inner = self.inner.read();
        let mut entries: Vec<Arc<ModuleEntry>> = inner
            .modules
            .values()
            .flat_map(|revisions| revisions.iter().cloned())
            .collect();
        entries.sort_by(|a, b| a.module.name.cmp(&b.module.name));
        entries
    }

    /// Toggle a feature under the exclusive lock and persist the new set.
    /// When persistence fails the in-memory toggle is rolled back.
    pub fn feature_enable(
        &self,
        name: &str,
        feature: &str,
        enable: bool,
    ) -> Result<(), EngineError> {
        let entry = self.get(name, None)?;
        if !entry.module.features.iter().any(|f| f == feature) {
            return Err(EngineError::InvalidArg(format!(
                "unknown feature '{feature}' in module '{name}'"
            )));
        }
        let changed = {
            let mut features = entry.enabled_features.write();
            if enable {
                features.insert(feature.to_string())
            } else {
                features.remove(feature)
            }
        };
        if !changed {
            debug!("event=feature_toggle_noop module={name} feature={feature} enable={enable}");
            return Ok(());
        }
        let mut persisted = self
            .settings
            .load_module(name)
            .map_err(|err| EngineError::Io(err.to_string()))?;
        persisted.enabled_features = entry.enabled_features();
        if let Err(err) = self.settings.save_module(name, &persisted) {
            // Mandatory rollback: the toggle must not outlive a failed persist.
            let mut features = entry.enabled_features.write();
            if enable {
                features.remove(feature);
            } else {
                features.insert(feature.to_string());
            }
            warn!("event=feature_persist_failed module={name} feature={feature} error={err}");
            return Err(EngineError::Io(err.to_string()));
        }
        info!("event=feature_toggled module={name} feature={feature} enable={enable}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::SchemaModuleBuilder;
    use crate::store::persist::MemorySettingsStore;
    use crate::value::LeafType;

    fn module_with_feature(name: &str) -> SchemaModule {
        let mut b = SchemaModuleBuilder::new(name).feature("metrics");
        let top = b.container(None, "top");
        b.leaf(Some(top), "leaf", LeafType::String, None);
        b.build().unwrap()
    }

    fn registry(settings: Arc<MemorySettingsStore>) -> SchemaRegistry {
        SchemaRegistry::new(None, settings)
    }

    #[test]
    fn reinstall_returns_existing_entry() {
        let registry = registry(Arc::new(MemorySettingsStore::new()));
        let first = registry.install(module_with_feature("m")).unwrap();
        let second = registry.install(module_with_feature("m")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn uninstalled_module_reports_unknown_model_and_refuses_reinstall() {
        let registry = registry(Arc::new(MemorySettingsStore::new()));
        registry.install(module_with_feature("m")).unwrap();
        registry.uninstall("m", None).unwrap();
        assert!(matches!(
            registry.get("m", None),
            Err(EngineError::UnknownModel(_))
        ));
        assert!(matches!(
            registry.install(module_with_feature("m")),
            Err(EngineError::Internal(_))
        ));
    }

    #[test]
    fn feature_toggle_persists_and_rolls_back_on_failure() {
        let settings = Arc::new(MemorySettingsStore::new());
        let registry = registry(settings.clone());
        registry.install(module_with_feature("m")).unwrap();

        registry.feature_enable("m", "metrics", true).unwrap();
        assert_eq!(
            settings.load_module("m").unwrap().enabled_features,
            vec!["metrics".to_string()]
        );

        settings.fail_saves(true);
        let err = registry.feature_enable("m", "metrics", false);
        assert!(err.is_err());
        let entry = registry.get("m", None).unwrap();
        assert!(entry.feature_enabled("metrics"), "rollback must keep the feature on");
    }

    #[test]
    fn unknown_feature_is_invalid_arg() {
        let registry = registry(Arc::new(MemorySettingsStore::new()));
        registry.install(module_with_feature("m")).unwrap();
        assert!(matches!(
            registry.feature_enable("m", "ghost", true),
            Err(EngineError::InvalidArg(_))
        ));
    }

    #[test]
    fn persisted_state_restores_on_install() {
        let settings = Arc::new(MemorySettingsStore::new());
        settings
            .save_module(
                "m",
                &crate::store::persist::PersistedModule {
                    enabled_features: vec!["metrics".into()],
                    enabled_subtrees: vec!["/m:top".into()],
                    subscriptions: Vec::new(),
                },
            )
            .unwrap();
        let registry = registry(settings);
        let entry = registry.install(module_with_feature("m")).unwrap();
        assert!(entry.feature_enabled("metrics"));
        assert!(entry.has_enabled_subtree());
    }

    #[test]
    fn revision_pinned_lookup() {
        let registry = registry(Arc::new(MemorySettingsStore::new()));
        let mut b = SchemaModuleBuilder::new("m").revision("2026-01-01");
        b.container(None, "a");
        registry.install(b.build().unwrap()).unwrap();
        let mut b = SchemaModuleBuilder::new("m").revision("2026-06-01");
        b.container(None, "a");
        registry.install(b.build().unwrap()).unwrap();

        let latest = registry.get("m", None).unwrap();
        assert_eq!(latest.module.revision.as_deref(), Some("2026-06-01"));
        let pinned = registry.get("m", Some("2026-01-01")).unwrap();
        assert_eq!(pinned.module.revision.as_deref(), Some("2026-01-01"));
    }
}
