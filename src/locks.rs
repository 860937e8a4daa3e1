//! Process-wide advisory lock table: logical module locks, the exclusive
//! datastore lock and filesystem-path locks realized through `.lock`
//! companion files. All locks auto-release when their owning session ends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::EngineError;
use crate::session::SessionId;
use crate::store::file::FileLockGuard;
use crate::value::Datastore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Datastore(Datastore),
    Module { ds: Datastore, module: String },
    File(PathBuf),
}

impl LockKey {
    pub fn module(ds: Datastore, module: impl Into<String>) -> Self {
        LockKey::Module {
            ds,
            module: module.into(),
        }
    }

    fn describe(&self) -> String {
        match self {
            LockKey::Datastore(ds) => format!("datastore {ds}"),
            LockKey::Module { ds, module } => format!("module {module} in {ds}"),
            LockKey::File(path) => format!("file {}", path.display()),
        }
    }
}

#[derive(Debug)]
struct Held {
    owner: SessionId,
    _file_guard: Option<FileLockGuard>,
}

/// Table of held locks plus the condvar blocked acquirers sleep on.
#[derive(Debug, Default)]
pub struct LockSet {
    inner: Mutex<HashMap<LockKey, Held>>,
    released: Condvar,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock. Non-blocking acquisition reports `Locked` right away;
    /// blocking acquisition waits until the lock frees or `timeout` expires.
    pub fn lock(
        &self,
        key: LockKey,
        owner: SessionId,
        blocking: bool,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.inner.lock();
        loop {
            if !table.contains_key(&key) {
                let file_guard = match &key {
                    LockKey::File(path) => Some(FileLockGuard::acquire(
                        path,
                        &format!("session-{owner}"),
                        false,
                        Duration::ZERO,
                    )?),
                    _ => None,
                };
                table.insert(
                    key.clone(),
                    Held {
                        owner,
                        _file_guard: file_guard,
                    },
                );
                debug!("event=lock_acquired key={} session={owner}", key.describe());
                return Ok(());
            }
            if !blocking {
                return Err(EngineError::Locked(key.describe()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::TimedOut(format!(
                    "waiting for {}",
                    key.describe()
                )));
            }
            if self.released.wait_for(&mut table, remaining).timed_out()
                && table.contains_key(&key)
            {
                return Err(EngineError::TimedOut(format!(
                    "waiting for {}",
                    key.describe()
                )));
            }
        }
    }

    /// Release a lock held by `owner`; releasing a lock that is not held by
    /// the caller is invalid.
    pub fn unlock(&self, key: &LockKey, owner: SessionId) -> Result<(), EngineError> {
        let mut table = self.inner.lock();
        match table.get(key) {
            Some(held) if held.owner == owner => {
                table.remove(key);
                self.released.notify_all();
                debug!("event=lock_released key={} session={owner}", key.describe());
                Ok(())
            }
            Some(_) | None => Err(EngineError::InvalidArg(format!(
                "{} is not locked by session {owner}",
                key.describe()
            ))),
        }
    }

    pub fn holder(&self, key: &LockKey) -> Option<SessionId> {
        self.inner.lock().get(key).map(|held| held.owner)
    }

    /// Acquire the datastore-global lock, then every module in dependency
    /// order. On any failure everything acquired here is released and the
    /// offending error returned.
    pub fn lock_all(
        &self,
        ds: Datastore,
        owner: SessionId,
        modules: &[String],
    ) -> Result<(), EngineError> {
        self.lock(LockKey::Datastore(ds), owner, false, Duration::ZERO)?;
        let mut acquired = Vec::new();
        for module in modules {
            let key = LockKey::module(ds, module.clone());
            match self.lock(key.clone(), owner, false, Duration::ZERO) {
                Ok(()) => acquired.push(key),
                Err(err) => {
                    for key in acquired {
                        let _ = self.unlock(&key, owner);
                    }
                    let _ = self.unlock(&LockKey::Datastore(ds), owner);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop every lock the session still holds; called on session end.
    pub fn release_session(&self, owner: SessionId) {
        let mut table = self.inner.lock();
        let before = table.len();
        table.retain(|_, held| held.owner != owner);
        if table.len() != before {
            debug!(
                "event=session_locks_released session={owner} count={}",
                before - table.len()
            );
            self.released.notify_all();
        }
    }

    pub fn held_by(&self, owner: SessionId) -> Vec<LockKey> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, held)| held.owner == owner)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_lock_is_exclusive_until_released() {
        let locks = LockSet::new();
        let key = LockKey::module(Datastore::Startup, "example-module");
        locks
            .lock(key.clone(), SessionId(1), false, Duration::ZERO)
            .unwrap();
        let second = locks.lock(key.clone(), SessionId(2), false, Duration::ZERO);
        assert!(matches!(second, Err(EngineError::Locked(_))));

        locks.release_session(SessionId(1));
        locks
            .lock(key.clone(), SessionId(2), false, Duration::ZERO)
            .unwrap();
        assert_eq!(locks.holder(&key), Some(SessionId(2)));
    }

    #[test]
    fn unlock_by_non_owner_is_invalid() {
        let locks = LockSet::new();
        let key = LockKey::Datastore(Datastore::Running);
        locks
            .lock(key.clone(), SessionId(1), false, Duration::ZERO)
            .unwrap();
        assert!(matches!(
            locks.unlock(&key, SessionId(2)),
            Err(EngineError::InvalidArg(_))
        ));
        assert!(matches!(
            locks.unlock(&LockKey::Datastore(Datastore::Startup), SessionId(1)),
            Err(EngineError::InvalidArg(_))
        ));
        locks.unlock(&key, SessionId(1)).unwrap();
    }

    #[test]
    fn lock_all_rolls_back_on_conflict() {
        let locks = LockSet::new();
        let modules = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        // Another session already holds b.
        locks
            .lock(
                LockKey::module(Datastore::Startup, "b"),
                SessionId(9),
                false,
                Duration::ZERO,
            )
            .unwrap();
        let result = locks.lock_all(Datastore::Startup, SessionId(1), &modules);
        assert!(matches!(result, Err(EngineError::Locked(_))));
        // Nothing from the failed pass remains held.
        assert!(locks.held_by(SessionId(1)).is_empty());
        assert_eq!(
            locks.holder(&LockKey::module(Datastore::Startup, "b")),
            Some(SessionId(9))
        );

        locks.release_session(SessionId(9));
        locks
            .lock_all(Datastore::Startup, SessionId(1), &modules)
            .unwrap();
        assert_eq!(locks.held_by(SessionId(1)).len(), 4);
    }

    #[test]
    fn blocking_lock_times_out() {
        let locks = LockSet::new();
        let key = LockKey::module(Datastore::Startup, "m");
        locks
            .lock(key.clone(), SessionId(1), false, Duration::ZERO)
            .unwrap();
        let err = locks.lock(key, SessionId(2), true, Duration::from_millis(30));
        assert!(matches!(err, Err(EngineError::TimedOut(_))));
    }

    #[test]
    fn blocking_lock_wakes_on_release() {
        use std::sync::Arc;
        let locks = Arc::new(LockSet::new());
        let key = LockKey::module(Datastore::Running, "m");
        locks
            .lock(key.clone(), SessionId(1), false, Duration::ZERO)
            .unwrap();
        let locks_clone = locks.clone();
        let key_clone = key.clone();
        let waiter = std::thread::spawn(move || {
            locks_clone.lock(key_clone, SessionId(2), true, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        locks.unlock(&key, SessionId(1)).unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }
}
