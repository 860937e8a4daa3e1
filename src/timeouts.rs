//! Centralized timeout policies for the engine.
//!
//! Keeping these values in one place makes it clear which parts of the system
//! share behaviour (request deadlines, commit verification windows, retained
//! notification ageing) and gives us a single knob to turn if we need to
//! tighten or relax limits. All of them can be overridden per engine via
//! [`EngineTimeouts`].

use std::time::Duration;

/// Maximum time an ordinary request is allowed to run.
pub const STANDARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Maximum time for long requests: commit, copy-config, RPC and action calls.
pub const LONG_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// How long a commit waits for a single verifier to answer.
pub const COMMIT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a read waits for operational-data providers before completing
/// with whatever has arrived.
pub const OPERATIONAL_DATA_TIMEOUT: Duration = Duration::from_secs(2);
/// Retained notifications older than this are removed.
pub const NOTIFICATION_AGE_OUT: Duration = Duration::from_secs(60 * 60);
/// Width of one retained-notification file window.
pub const NOTIFICATION_FILE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Per-engine copy of the timeout policy. Constructed from the defaults
/// above; callers override individual fields at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    pub standard_request: Duration,
    pub long_request: Duration,
    pub commit_verify: Duration,
    pub operational_data: Duration,
    pub notification_age_out: Duration,
    pub notification_file_window: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            standard_request: STANDARD_REQUEST_TIMEOUT,
            long_request: LONG_REQUEST_TIMEOUT,
            commit_verify: COMMIT_VERIFY_TIMEOUT,
            operational_data: OPERATIONAL_DATA_TIMEOUT,
            notification_age_out: NOTIFICATION_AGE_OUT,
            notification_file_window: NOTIFICATION_FILE_WINDOW,
        }
    }
}
