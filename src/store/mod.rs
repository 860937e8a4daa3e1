pub mod file;
pub mod layout;
pub mod persist;

pub use file::{copy_up_to_date, AccessControl, AllowAll, FileLockGuard, LoadedTree};
pub use layout::{LayoutError, RepoLayout, RepoPaths};
pub use persist::{
    JsonSettingsStore, MemorySettingsStore, PersistError, PersistedModule, PersistedSubscription,
    SettingsStore,
};
