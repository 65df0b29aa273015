//! Update orchestration state machine.
//!
//! ## Lifecycle
//! `Idle → Confirming → Checking → Reporting → Idle`, one session at a
//! time. Backend completions and scheduler firings are consumed by a
//! dedicated event-loop task, so a completion is never handled inside the
//! call that triggered it.
//!
//! ## UI collaborator
//! No dialog is rendered here. The controller emits [`UiRequest`] messages
//! on a channel; the host renders them and answers through the enclosed
//! reply senders. With no receiver attached, confirmation resolves to
//! "declined" and the install choice to `NoInstall`: a headless deployment
//! must never auto-confirm an interaction it cannot show.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};

use crate::backend::{BackendEvent, Features, UpdaterBackend};
use crate::error::UpdaterError;
use crate::scheduler::{ScheduledFire, TaskId, TaskScheduler, INVALID_TASK_ID};
use crate::{UpdateInfo, UpdateLevel};

// ─── UI Requests ─────────────────────────────────────────────

/// Dialog traffic from the controller to the host UI.
#[derive(Debug)]
pub enum UiRequest {
    /// Ask the user whether the check should run at all.
    ConfirmCheck { reply: oneshot::Sender<bool> },
    /// Show an indeterminate progress surrogate. Its cancel affordance
    /// should call `UpdateController::cancel_update`.
    BeginProgress,
    /// Mark the progress surrogate as canceling; it stays visible until
    /// `EndProgress`.
    ProgressCanceled,
    /// Tear the progress surrogate down.
    EndProgress,
    /// Present the catalog and collect an install decision.
    ChooseInstall {
        updates: Vec<UpdateInfo>,
        run_as_admin: bool,
        /// Whether the dialog may expose the elevation toggle to the user.
        admin_editable: bool,
        reply: oneshot::Sender<InstallChoice>,
    },
    /// Best-effort notification; interaction-level gating already happened.
    Notify {
        severity: NoticeSeverity,
        title: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallDecision {
    InstallNow,
    InstallLater,
    NoInstall,
}

/// Install dialog reply. `run_as_admin` echoes the elevation toggle, which
/// the dialog may have flipped when it was presented as user-editable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstallChoice {
    pub decision: InstallDecision,
    pub run_as_admin: bool,
}

// ─── Controller Events ───────────────────────────────────────

/// State changes broadcast to hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerEvent {
    RunningChanged { running: bool },
    RunAsAdminChanged { run_as_admin: bool },
    /// The host should terminate so the installer can take over.
    ExitRequested,
}

// ─── Session State ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Idle,
    Confirming,
    Checking,
    Reporting,
}

#[derive(Debug, Clone, Copy)]
struct ExitHandoff {
    elevated: bool,
}

struct SessionState {
    phase: ControllerPhase,
    level: UpdateLevel,
    was_canceled: bool,
    progress_shown: bool,
    run_as_admin: bool,
    admin_user_editable: bool,
    handoff: Option<ExitHandoff>,
    /// Catalog from the most recent completed check.
    catalog: Vec<UpdateInfo>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: ControllerPhase::Idle,
            level: UpdateLevel::Silent,
            was_canceled: false,
            progress_shown: false,
            run_as_admin: false,
            admin_user_editable: true,
            handoff: None,
            catalog: Vec::new(),
        }
    }
}

struct Shared {
    backend: Arc<dyn UpdaterBackend>,
    state: RwLock<SessionState>,
    events: broadcast::Sender<ControllerEvent>,
    ui: mpsc::Sender<UiRequest>,
    running_tx: watch::Sender<bool>,
}

// ─── Controller ──────────────────────────────────────────────

/// Orchestrates update checks against a pluggable backend.
pub struct UpdateController {
    shared: Arc<Shared>,
    scheduler: TaskScheduler,
    running_rx: watch::Receiver<bool>,
}

impl UpdateController {
    /// Create a controller and start its event loop. `ui` receives dialog
    /// requests; drop the receiver for a fully headless deployment.
    pub fn new(backend: Arc<dyn UpdaterBackend>, ui: mpsc::Sender<UiRequest>) -> Self {
        let (events, _) = broadcast::channel(32);
        let (running_tx, running_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            backend: backend.clone(),
            state: RwLock::new(SessionState::default()),
            events,
            ui,
            running_tx,
        });

        let (fire_tx, fire_rx) = mpsc::channel(16);
        let scheduler = TaskScheduler::new(fire_tx);
        let backend_rx = backend.subscribe();
        tokio::spawn(run_event_loop(shared.clone(), backend_rx, fire_rx));

        Self { shared, scheduler, running_rx }
    }

    /// Subscribe to controller state events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    /// Whether a check session is active.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    pub async fn phase(&self) -> ControllerPhase {
        self.shared.state.read().await.phase
    }

    /// Interaction level of the current (or last) session.
    pub async fn current_level(&self) -> UpdateLevel {
        self.shared.state.read().await.level
    }

    /// Begin a check session at the given interaction level. Returns `false`
    /// when a session is already active, the user declined, or the backend
    /// could not start a check; the session state is left unchanged on a
    /// rejected start.
    pub async fn start(&self, level: UpdateLevel) -> bool {
        self.shared.start(level).await
    }

    /// Cancel the running check. Requests a graceful termination now and
    /// escalates to a forced kill after `max_delay`. Returns whether a
    /// cancellation was initiated; the process may still be exiting when
    /// this returns.
    pub async fn cancel_update(&self, max_delay: Duration) -> bool {
        self.shared.cancel_update(max_delay).await
    }

    /// Schedule a check after `delay_seconds`, optionally repeating.
    /// Returns [`INVALID_TASK_ID`] when the delay does not fit the
    /// millisecond timer range.
    pub async fn schedule_update(&self, delay_seconds: u32, repeat: bool, level: UpdateLevel) -> TaskId {
        let millis = u64::from(delay_seconds) * 1000;
        if millis > u64::from(u32::MAX) {
            let err = UpdaterError::ScheduleOverflow { seconds: delay_seconds };
            tracing::warn!("[Controller] {}", err);
            return INVALID_TASK_ID;
        }
        self.scheduler.start_schedule(millis as u32, repeat, level).await
    }

    /// Schedule a one-shot check for an absolute time.
    pub async fn schedule_update_at(&self, when: DateTime<Utc>, level: UpdateLevel) -> TaskId {
        self.scheduler.start_schedule_at(when, level).await
    }

    /// Cancel a scheduled check; unknown ids are ignored.
    pub async fn cancel_scheduled_update(&self, task_id: TaskId) {
        self.scheduler.cancel_schedule(task_id).await;
    }

    pub async fn run_as_admin(&self) -> bool {
        self.shared.state.read().await.run_as_admin
    }

    /// Set the elevation mode for the installer hand-off and whether the
    /// install dialog exposes the toggle. An armed hand-off is re-armed
    /// with the new mode.
    pub async fn set_run_as_admin(&self, run_as_admin: bool, user_editable: bool) {
        self.shared.set_run_as_admin(run_as_admin, user_editable).await;
    }

    /// Whether an installer hand-off is armed for host exit.
    pub async fn will_run_on_exit(&self) -> bool {
        self.shared.state.read().await.handoff.is_some()
    }

    /// Launch the armed installer hand-off (called by the host during
    /// shutdown). Returns whether a launch was initiated; disarms on
    /// success.
    pub async fn execute_exit_handoff(&self) -> bool {
        self.shared.execute_exit_handoff().await
    }

    /// Catalog from the most recent completed check.
    pub async fn update_info(&self) -> Vec<UpdateInfo> {
        self.shared.state.read().await.catalog.clone()
    }
}

impl Drop for UpdateController {
    fn drop(&mut self) {
        if *self.running_rx.borrow() {
            tracing::error!(
                "[Controller] controller destroyed while a check is running! The external process may outlive its handler"
            );
        }
    }
}

// ─── Session Logic ───────────────────────────────────────────

impl Shared {
    async fn start(&self, level: UpdateLevel) -> bool {
        {
            let mut state = self.state.write().await;
            if state.phase != ControllerPhase::Idle {
                tracing::debug!("[Controller] start({:?}) ignored, a session is already active", level);
                return false;
            }
            state.phase = if level >= UpdateLevel::Ask {
                ControllerPhase::Confirming
            } else {
                ControllerPhase::Checking
            };
            state.level = level;
            state.was_canceled = false;
        }
        self.set_running(true);
        tracing::info!("[Controller] starting update check at level {:?}", level);

        if level >= UpdateLevel::Ask {
            if !self.confirm_check().await {
                tracing::info!("[Controller] update check declined by user");
                self.finish_session().await;
                return false;
            }
            self.state.write().await.phase = ControllerPhase::Checking;
        }

        if !self.backend.features().contains(Features::CHECK_UPDATES) {
            tracing::warn!("[Controller] backend does not support update checks");
            self.finish_session().await;
            return false;
        }

        // Arm the surrogate before delegating: a completion event can race
        // the return of check_for_updates, and teardown must never precede
        // the arming.
        if level >= UpdateLevel::Progress {
            self.state.write().await.progress_shown = true;
            self.send_ui(UiRequest::BeginProgress).await;
        }

        match self.backend.check_for_updates().await {
            Ok(()) => true,
            Err(err) => {
                let shown = {
                    let mut state = self.state.write().await;
                    std::mem::replace(&mut state.progress_shown, false)
                };
                if shown {
                    self.send_ui(UiRequest::EndProgress).await;
                }
                match err {
                    UpdaterError::AlreadyRunning => {
                        tracing::warn!("[Controller] a check is already in flight");
                        if level >= UpdateLevel::Progress {
                            self.notify(
                                NoticeSeverity::Warning,
                                "Check for Updates",
                                "The program is already checking for updates",
                            )
                            .await;
                        }
                    }
                    err => {
                        tracing::error!("[Controller] failed to start update check: {}", err);
                    }
                }
                self.finish_session().await;
                false
            }
        }
    }

    async fn cancel_update(&self, max_delay: Duration) -> bool {
        if !self.backend.is_checking().await {
            return false;
        }

        let progress_shown = {
            let mut state = self.state.write().await;
            state.was_canceled = true;
            state.progress_shown
        };
        if progress_shown {
            self.send_ui(UiRequest::ProgressCanceled).await;
        }

        tracing::info!("[Controller] canceling update check (grace period {:?})", max_delay);
        self.backend.abort(false).await;

        // Escalate once the grace period elapses and the tool is still up.
        let backend = self.backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(max_delay).await;
            if backend.is_checking().await {
                tracing::warn!("[Controller] maintenance tool ignored the termination request, killing it");
                backend.abort(true).await;
            }
        });

        true
    }

    async fn handle_backend_event(&self, event: BackendEvent) {
        {
            let mut state = self.state.write().await;
            if state.phase == ControllerPhase::Idle {
                // Completion for a check this controller did not start (the
                // host may drive the backend directly). Keep the catalog.
                if let BackendEvent::CheckCompleted { updates } = &event {
                    state.catalog = updates.clone();
                }
                tracing::debug!("[Controller] backend completion with no active session");
                return;
            }
            state.phase = ControllerPhase::Reporting;
            match &event {
                BackendEvent::CheckCompleted { updates } => state.catalog = updates.clone(),
                BackendEvent::CheckFailed { .. } => state.catalog = Vec::new(),
            }
        }

        let (has_updates, has_error) = match &event {
            BackendEvent::CheckCompleted { updates } => (!updates.is_empty(), false),
            BackendEvent::CheckFailed { .. } => (false, true),
        };
        self.check_updates_done(has_updates, has_error, &event).await;
    }

    /// Terminal step of a session: interpret the result against the chosen
    /// interaction level, then return to idle.
    async fn check_updates_done(&self, has_updates: bool, has_error: bool, event: &BackendEvent) {
        let (level, was_canceled, progress_shown) = {
            let state = self.state.read().await;
            (state.level, state.was_canceled, state.progress_shown)
        };

        if progress_shown {
            self.send_ui(UiRequest::EndProgress).await;
            self.state.write().await.progress_shown = false;
        }

        if was_canceled {
            if level >= UpdateLevel::ExtendedInfo {
                self.notify(
                    NoticeSeverity::Warning,
                    "Check for Updates",
                    "Checking for updates was canceled",
                )
                .await;
            }
        } else if has_updates {
            self.report_updates(level).await;
        } else {
            if has_error {
                if let BackendEvent::CheckFailed { message, exit_code, .. } = event {
                    tracing::warn!(
                        "[Controller] maintenance tool finished with exit code {:?}: {}",
                        exit_code,
                        message
                    );
                }
            }
            if level >= UpdateLevel::ExtendedInfo {
                let normal_exit = match event {
                    BackendEvent::CheckCompleted { .. } => true,
                    BackendEvent::CheckFailed { normal_exit, .. } => *normal_exit,
                };
                if normal_exit {
                    self.notify(NoticeSeverity::Info, "Check for Updates", "No new updates available")
                        .await;
                } else {
                    self.notify(
                        NoticeSeverity::Warning,
                        "Check for Updates",
                        "The update check process crashed",
                    )
                    .await;
                }
            }
        }

        self.finish_session().await;
    }

    /// Updates were found: collect an install decision (or decide silently)
    /// and arm the hand-off accordingly.
    async fn report_updates(&self, level: UpdateLevel) {
        if level >= UpdateLevel::Info {
            let (catalog, run_as_admin, admin_editable) = {
                let state = self.state.read().await;
                (state.catalog.clone(), state.run_as_admin, state.admin_user_editable)
            };

            let choice = self.choose_install(catalog, run_as_admin, admin_editable).await;
            if choice.run_as_admin != run_as_admin {
                self.set_run_as_admin(choice.run_as_admin, admin_editable).await;
            }

            match choice.decision {
                InstallDecision::InstallNow => {
                    self.arm_handoff().await;
                    let _ = self.events.send(ControllerEvent::ExitRequested);
                }
                InstallDecision::InstallLater => {
                    self.arm_handoff().await;
                }
                InstallDecision::NoInstall => {}
            }
        } else {
            // Below Info nobody gets to choose: arm the hand-off, and unless
            // the level defers to host exit, ask the host to terminate now.
            self.arm_handoff().await;
            if level == UpdateLevel::Exit {
                self.notify(
                    NoticeSeverity::Info,
                    "Install Updates",
                    "New updates are available. The maintenance tool will install them once you close the application",
                )
                .await;
            } else {
                let _ = self.events.send(ControllerEvent::ExitRequested);
            }
        }
    }

    async fn arm_handoff(&self) {
        let mut state = self.state.write().await;
        let elevated = state.run_as_admin;
        state.handoff = Some(ExitHandoff { elevated });
        tracing::info!("[Controller] installer hand-off armed (elevated: {})", elevated);
    }

    async fn set_run_as_admin(&self, run_as_admin: bool, user_editable: bool) {
        let changed = {
            let mut state = self.state.write().await;
            let changed = state.run_as_admin != run_as_admin;
            if changed {
                state.run_as_admin = run_as_admin;
                if let Some(handoff) = state.handoff.as_mut() {
                    handoff.elevated = run_as_admin;
                    tracing::info!("[Controller] re-armed installer hand-off (elevated: {})", run_as_admin);
                }
            }
            state.admin_user_editable = user_editable;
            changed
        };
        if changed {
            let _ = self.events.send(ControllerEvent::RunAsAdminChanged { run_as_admin });
        }
    }

    async fn execute_exit_handoff(&self) -> bool {
        let (handoff, catalog) = {
            let state = self.state.read().await;
            (state.handoff, state.catalog.clone())
        };
        let Some(handoff) = handoff else {
            return false;
        };
        if !self.backend.features().contains(Features::TRIGGER_INSTALL) {
            tracing::warn!("[Controller] backend cannot trigger the installer");
            return false;
        }

        let ok = self.backend.trigger_updates(&catalog, handoff.elevated).await;
        if ok {
            self.state.write().await.handoff = None;
            tracing::info!("[Controller] installer launched, hand-off disarmed");
        } else {
            tracing::error!("[Controller] installer launch failed");
        }
        ok
    }

    async fn finish_session(&self) {
        self.state.write().await.phase = ControllerPhase::Idle;
        self.set_running(false);
    }

    fn set_running(&self, running: bool) {
        let was = self.running_tx.send_replace(running);
        if was != running {
            let _ = self.events.send(ControllerEvent::RunningChanged { running });
        }
    }

    // ── UI helpers ───────────────────────────────────────────

    async fn confirm_check(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.ui.send(UiRequest::ConfirmCheck { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn choose_install(
        &self,
        updates: Vec<UpdateInfo>,
        run_as_admin: bool,
        admin_editable: bool,
    ) -> InstallChoice {
        let fallback = InstallChoice { decision: InstallDecision::NoInstall, run_as_admin };
        let (reply, rx) = oneshot::channel();
        let request = UiRequest::ChooseInstall { updates, run_as_admin, admin_editable, reply };
        if self.ui.send(request).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    async fn notify(&self, severity: NoticeSeverity, title: &str, message: &str) {
        let _ = self
            .ui
            .send(UiRequest::Notify {
                severity,
                title: title.to_string(),
                message: message.to_string(),
            })
            .await;
    }

    async fn send_ui(&self, request: UiRequest) {
        let _ = self.ui.send(request).await;
    }
}

// ─── Event Loop ──────────────────────────────────────────────

async fn run_event_loop(
    shared: Arc<Shared>,
    mut backend_rx: broadcast::Receiver<BackendEvent>,
    mut fire_rx: mpsc::Receiver<ScheduledFire>,
) {
    tracing::debug!("[Controller] event loop started");
    loop {
        tokio::select! {
            event = backend_rx.recv() => match event {
                Ok(event) => shared.handle_backend_event(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("[Controller] dropped {} backend event(s)", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            fire = fire_rx.recv() => match fire {
                Some(fire) => {
                    tracing::info!("[Controller] scheduled check {} fired", fire.task_id);
                    if !shared.start(fire.level).await {
                        tracing::debug!("[Controller] scheduled check {} could not start", fire.task_id);
                    }
                }
                None => break,
            },
        }
    }
    tracing::debug!("[Controller] event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_is_idle() {
        let state = SessionState::default();
        assert_eq!(state.phase, ControllerPhase::Idle);
        assert!(!state.was_canceled);
        assert!(state.handoff.is_none());
        assert!(state.catalog.is_empty());
    }

    #[test]
    fn install_choice_serializes() {
        let choice = InstallChoice { decision: InstallDecision::InstallLater, run_as_admin: true };
        let json = serde_json::to_value(&choice).unwrap();
        assert_eq!(json["decision"], "install_later");
        assert_eq!(json["run_as_admin"], true);
    }
}
