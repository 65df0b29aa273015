//! Check-trigger scheduler — one-shot and repeating timers addressed by
//! cancellable task ids.
//!
//! Firings are delivered into the controller's event loop through a channel
//! and run the same `start(level)` path a host call would. Ids are allocated
//! monotonically and never reused while a task is pending, so a stale
//! cancel can never hit a newer task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::UpdateLevel;

pub type TaskId = u32;

/// Sentinel returned when a schedule request is rejected.
pub const INVALID_TASK_ID: TaskId = 0;

/// A schedule firing, delivered to the controller's event loop.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledFire {
    pub task_id: TaskId,
    pub level: UpdateLevel,
}

struct ScheduledEntry {
    handle: Option<JoinHandle<()>>,
    repeat: bool,
}

/// Timer registry. Owned by the controller; dropping it aborts every
/// pending timer.
pub struct TaskScheduler {
    fire_tx: mpsc::Sender<ScheduledFire>,
    tasks: Arc<Mutex<HashMap<TaskId, ScheduledEntry>>>,
    next_id: AtomicU32,
}

impl TaskScheduler {
    pub fn new(fire_tx: mpsc::Sender<ScheduledFire>) -> Self {
        Self {
            fire_tx,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
        }
    }

    /// Arm a timer that fires after `delay_ms`, repeatedly when `repeat` is
    /// set. Returns the new task id.
    pub async fn start_schedule(&self, delay_ms: u32, repeat: bool, level: UpdateLevel) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().await.insert(id, ScheduledEntry { handle: None, repeat });

        let tasks = self.tasks.clone();
        let fire_tx = self.fire_tx.clone();
        let delay = Duration::from_millis(u64::from(delay_ms));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if repeat {
                    // Re-arms with the same interval until canceled.
                    if !tasks.lock().await.contains_key(&id) {
                        return;
                    }
                } else {
                    // Removed before delivery: canceling a one-shot that has
                    // already fired must be a no-op.
                    if tasks.lock().await.remove(&id).is_none() {
                        return;
                    }
                }
                tracing::debug!("[Scheduler] task {} fired", id);
                if fire_tx.send(ScheduledFire { task_id: id, level }).await.is_err() {
                    return;
                }
                if !repeat {
                    return;
                }
            }
        });

        // The entry may already be gone if a zero-delay one-shot fired (or
        // was canceled) before we got back here.
        match self.tasks.lock().await.get_mut(&id) {
            Some(entry) => entry.handle = Some(handle),
            None => handle.abort(),
        }

        tracing::debug!("[Scheduler] task {} armed ({} ms, repeat: {})", id, delay_ms, repeat);
        id
    }

    /// Arm a one-shot timer for an absolute time. The delay is computed once
    /// at registration; later wall-clock changes shift the effective fire
    /// time. A timestamp not in the future is rejected with the sentinel id.
    pub async fn start_schedule_at(&self, when: DateTime<Utc>, level: UpdateLevel) -> TaskId {
        let millis = (when - Utc::now()).num_milliseconds();
        if millis <= 0 {
            tracing::warn!("[Scheduler] requested time {} is not in the future", when);
            return INVALID_TASK_ID;
        }
        if millis > i64::from(u32::MAX) {
            tracing::warn!("[Scheduler] requested time {} exceeds the millisecond timer range", when);
            return INVALID_TASK_ID;
        }
        self.start_schedule(millis as u32, false, level).await
    }

    /// Cancel a pending task. Unknown or already-fired ids are a silent
    /// no-op.
    pub async fn cancel_schedule(&self, task_id: TaskId) {
        match self.tasks.lock().await.remove(&task_id) {
            Some(entry) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                tracing::debug!("[Scheduler] task {} canceled", task_id);
            }
            None => {
                tracing::debug!("[Scheduler] cancel for unknown task {} ignored", task_id);
            }
        }
    }

    /// Number of tasks still pending.
    pub async fn pending_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        // Abort pending timers so their fire senders close with the
        // scheduler and the consuming loop can wind down.
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for (_, entry) in tasks.drain() {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────
