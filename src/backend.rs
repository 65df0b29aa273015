//! Pluggable backend contract.
//!
//! A backend owns the mechanics of one update-delivery tool: locating it,
//! running its check, and launching its installer. Backends are selected at
//! configuration time and drive the controller through broadcast
//! [`BackendEvent`]s, so a completion is never delivered synchronously
//! inside the call that requested the check.

use std::ops::{BitOr, BitOrAssign};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::UpdaterError;
use crate::UpdateInfo;

// ─── Capability Flags ────────────────────────────────────────

/// Bit-set of backend capabilities. The controller only enables the
/// affordances a backend actually advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features(u32);

impl Features {
    pub const NONE: Features = Features(0);
    /// Can run update checks.
    pub const CHECK_UPDATES: Features = Features(1 << 0);
    /// Can launch the external installer as a detached process.
    pub const TRIGGER_INSTALL: Features = Features(1 << 1);
    /// Can run a monitored in-process installation.
    pub const PERFORM_INSTALL: Features = Features(1 << 2);
    /// Installation requires the host application to exit first.
    pub const INSTALL_NEEDS_EXIT: Features = Features(1 << 3);

    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        self.0 |= rhs.0;
    }
}

// ─── Completion Events ───────────────────────────────────────

/// Outcome of one check cycle, broadcast by the backend.
///
/// An empty `updates` list is a clean "no updates" result. Parse failures
/// and crashed tools arrive as `CheckFailed`; `normal_exit` distinguishes a
/// tool that exited on its own from one that was terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendEvent {
    CheckCompleted {
        updates: Vec<UpdateInfo>,
    },
    CheckFailed {
        message: String,
        exit_code: Option<i32>,
        normal_exit: bool,
    },
}

// ─── Backend Contract ────────────────────────────────────────

/// Update-delivery backend. New delivery tools only need to implement this
/// trait.
#[async_trait]
pub trait UpdaterBackend: Send + Sync {
    /// Advertised capabilities. Must be empty until `initialize` succeeded.
    fn features(&self) -> Features;

    /// Locate and validate the delivery tool. Returns `false` when the tool
    /// is unavailable, a non-fatal state the host tolerates by leaving
    /// update checks disabled.
    async fn initialize(&self) -> bool;

    /// Begin an asynchronous update check. The result arrives later as a
    /// [`BackendEvent`]; `Err(AlreadyRunning)` means a check is in flight
    /// and nothing was spawned.
    async fn check_for_updates(&self) -> Result<(), UpdaterError>;

    /// Whether a check process is currently running.
    async fn is_checking(&self) -> bool;

    /// Request termination of a running check. `force` escalates from a
    /// graceful termination request to an immediate kill. No-op when idle.
    async fn abort(&self, force: bool);

    /// Launch the installer as a detached, unmonitored process. `elevated`
    /// requests routing through the configured elevation helper when the
    /// current process lacks admin rights. Returns whether the launch was
    /// initiated, not whether installation succeeded.
    async fn trigger_updates(&self, updates: &[UpdateInfo], elevated: bool) -> bool;

    /// Run a monitored in-process installation, where supported.
    async fn install_updates(&self, updates: &[UpdateInfo]) -> Result<(), UpdaterError>;

    /// Subscribe to completion events.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}

// ─── Elevation ───────────────────────────────────────────────

/// Host-supplied elevation collaborator, consulted only when triggering an
/// install without existing admin rights.
pub trait AdminAuthoriser: Send + Sync {
    fn has_admin_rights(&self) -> bool;

    /// Run `program` with `args` under elevated privileges. Returns whether
    /// the elevated launch was initiated.
    fn execute_as_admin(&self, program: &Path, args: &[String]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_bit_ops() {
        let f = Features::CHECK_UPDATES | Features::TRIGGER_INSTALL;
        assert!(f.contains(Features::CHECK_UPDATES));
        assert!(f.contains(Features::TRIGGER_INSTALL));
        assert!(!f.contains(Features::PERFORM_INSTALL));
        assert!(f.contains(Features::CHECK_UPDATES | Features::TRIGGER_INSTALL));
        assert!(!f.contains(Features::CHECK_UPDATES | Features::PERFORM_INSTALL));
    }

    #[test]
    fn features_empty() {
        assert!(Features::NONE.is_empty());
        assert!(Features::default().is_empty());
        let mut f = Features::NONE;
        f |= Features::INSTALL_NEEDS_EXIT;
        assert!(!f.is_empty());
        assert_eq!(f.bits(), 1 << 3);
    }
}
