//! Retained event notifications: delivered notifications are appended to
//! window-grouped files under `data/notifications/` so notification sessions
//! can replay recent history; files past the age-out are removed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::layout::RepoLayout;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedNotification {
    pub timestamp_secs: u64,
    pub xpath: String,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct NotificationStore {
    layout: RepoLayout,
    window: Duration,
    age_out: Duration,
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl NotificationStore {
    pub fn new(layout: RepoLayout, window: Duration, age_out: Duration) -> Self {
        Self {
            layout,
            window,
            age_out,
        }
    }

    /// Append one delivered notification to its window file.
    pub fn append(
        &self,
        xpath: &str,
        values: &[Value],
        now: SystemTime,
    ) -> Result<(), EngineError> {
        let record = RetainedNotification {
            timestamp_secs: epoch_secs(now),
            xpath: xpath.to_string(),
            values: values.to_vec(),
        };
        let path = self.layout.notification_file(record.timestamp_secs, self.window);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(&record)
            .map_err(|err| EngineError::Internal(format!("notification encoding: {err}")))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// All retained notifications whose timestamp falls in `[from, to]`.
    pub fn read_range(&self, from: SystemTime, to: SystemTime) -> Result<Vec<RetainedNotification>, EngineError> {
        let from_secs = epoch_secs(from);
        let to_secs = epoch_secs(to);
        let window_secs = self.window.as_secs().max(1);
        let dir = self.layout.paths().notifications_dir;
        let mut out = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(EngineError::from(err)),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(start) = RepoLayout::notification_window_start(&path) else {
                continue;
            };
            if start + window_secs < from_secs || start > to_secs {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            for line in content.lines().filter(|line| !line.trim().is_empty()) {
                match serde_json::from_str::<RetainedNotification>(line) {
                    Ok(record) => {
                        if record.timestamp_secs >= from_secs && record.timestamp_secs <= to_secs {
                            out.push(record);
                        }
                    }
                    Err(err) => {
                        warn!(
                            "event=notification_record_skipped file={} error={err}",
                            path.display()
                        );
                    }
                }
            }
        }
        out.sort_by_key(|record| record.timestamp_secs);
        Ok(out)
    }

    /// Remove window files fully past the age-out. Returns how many were
    /// deleted.
    pub fn cleanup(&self, now: SystemTime) -> Result<usize, EngineError> {
        let now_secs = epoch_secs(now);
        let horizon = now_secs.saturating_sub(self.age_out.as_secs());
        let window_secs = self.window.as_secs().max(1);
        let dir = self.layout.paths().notifications_dir;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(EngineError::from(err)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(start) = RepoLayout::notification_window_start(&path) else {
                continue;
            };
            if start + window_secs <= horizon {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        debug!("event=notification_window_aged_out file={}", path.display());
                    }
                    Err(err) => {
                        warn!(
                            "event=notification_cleanup_failed file={} error={err}",
                            path.display()
                        );
                    }
                }
            }
        }
        Ok(removed)
    }
}
