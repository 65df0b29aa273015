//! # Tama-chan updater library
//!
//! Coordinates update checks for the Tama-chan desktop platform. The actual
//! update mechanics live in an external maintenance tool shipped next to
//! the host binary; this crate decides *when* to run it, *how much* the
//! user sees, and *what* to do with its results.
//!
//! ## How it works
//! - **Controller (controller.rs)**: the session state machine. One check
//!   at a time; interaction-level policy; cancellation with a bounded grace
//!   period; install decisions and the exit hand-off.
//! - **Backend (backend.rs / maintenance.rs)**: pluggable adapter around an
//!   update-delivery tool, selected at configuration time and advertising
//!   its capabilities as a bit-set. The reference backend spawns the
//!   maintenance tool, validates its output and broadcasts the result.
//! - **Scheduler (scheduler.rs)**: delay/absolute-time triggers with
//!   cancellable task ids, feeding the same check pipeline.
//!
//! All completion paths travel through channels and are consumed by the
//! controller's own event-loop task, so a result is never delivered
//! re-entrantly inside the call that requested it.
//!
//! ## Maintenance tool contract
//! ```text
//! $ maintenancetool --checkupdates
//! <updates>
//!   <update name="core" version="1.2.0" size="73400320"/>
//! </updates>
//! ```
//! UTF-8 on stdout, exit code 0 on success. The update list may be embedded
//! anywhere in the stream; no list means no updates. Installs are triggered
//! with `--updater` (interactive) or `--silentUpdate`.

pub mod backend;
pub mod controller;
pub mod error;
pub mod maintenance;
pub mod scheduler;
pub mod version;


// Re-exports for convenience
pub use backend::{AdminAuthoriser, BackendEvent, Features, UpdaterBackend};
pub use controller::{
    ControllerEvent, ControllerPhase, InstallChoice, InstallDecision, NoticeSeverity, UiRequest,
    UpdateController,
};
pub use error::UpdaterError;
pub use maintenance::{parse_update_output, tool_requires_admin, MaintenanceToolBackend};
pub use scheduler::{ScheduledFire, TaskId, TaskScheduler, INVALID_TASK_ID};
pub use version::Version;

use serde::{Deserialize, Serialize};

// ─── Interaction Levels ──────────────────────────────────────

/// How much the user is prompted and informed during a check, ordered by
/// increasing interaction. Everything below `Ask` starts without blocking
/// on a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateLevel {
    /// No dialogs at all; on updates the hand-off is armed and host exit is
    /// requested immediately.
    Silent,
    /// No dialogs during the check; the hand-off waits for the host to exit
    /// on its own, announced by a single notice.
    Exit,
    /// Show the catalog and ask for an install decision.
    Info,
    /// `Info`, plus result notices (no updates / canceled / crashed).
    ExtendedInfo,
    /// `ExtendedInfo`, plus a cancellable progress surrogate.
    Progress,
    /// `Progress`, plus a confirmation before the check starts.
    Ask,
}

// ─── Update Catalog ──────────────────────────────────────────

/// One installable update reported by the maintenance tool. Only produced
/// by a successful output parse; immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub name: String,
    pub version: Version,
    /// Download/install size in bytes.
    pub size: u64,
}

// ─── Configuration ───────────────────────────────────────────

/// Updater section of the host configuration (`config/updater.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Master switch; a disabled updater fails backend initialization and
    /// leaves checks unavailable for the session.
    pub enabled: bool,
    /// Maintenance tool location override. Relative paths resolve against
    /// the host executable's directory.
    pub path: Option<String>,
    /// Launch the installer without its interactive wizard.
    pub silent: bool,
    /// Replace the default installer arguments entirely.
    pub run_args: Option<Vec<String>>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            silent: false,
            run_args: None,
        }
    }
}

impl UpdaterConfig {
    /// Load from `config/updater.toml`. A missing or malformed file falls
    /// back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("config/updater.toml")
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path).unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }
}
