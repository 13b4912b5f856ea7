//! Background sync orchestration.
//!
//! The loop runs one reconciliation pass, sleeps for the poll delay and
//! re-evaluates the [`SyncGate`]. A pass only starts while sync is enabled
//! and no interactive editing session is active; ending a session wakes the
//! loop at once. Passes are never interrupted: shutdown is observed between
//! passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::Result;
use crate::events::EventLog;
use crate::reconcile::{PassReport, Reconciler};

const SETTINGS_CATEGORY: &str = "sync";
const KEY_ENABLED: &str = "enabled";
const KEY_EDITOR_ACTIVE: &str = "editor_active";
const KEY_LOG_EVENTS: &str = "log_events";

/// Upper bound on waiting for in-flight requests at shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Runtime switches deciding whether a pass may start.
///
/// Every switch is persisted in `local_settings` so it survives restarts.
pub struct SyncGate {
    enabled: AtomicBool,
    editor_active: AtomicBool,
    force: bool,
    editing_ended: Notify,
    events: EventLog,
}

impl SyncGate {
    /// Load the persisted switches. `force` bypasses the gate entirely.
    pub fn load(db: &DbState, force: bool, events: EventLog) -> Result<Self> {
        let conn = db.lock()?;
        let enabled = db::get_flag(&conn, SETTINGS_CATEGORY, KEY_ENABLED, false);
        let editor_active = db::get_flag(&conn, SETTINGS_CATEGORY, KEY_EDITOR_ACTIVE, false);
        events.set_enabled(db::get_flag(&conn, SETTINGS_CATEGORY, KEY_LOG_EVENTS, false));
        if force {
            warn!("sync gate forced open");
        }
        Ok(Self {
            enabled: AtomicBool::new(enabled),
            editor_active: AtomicBool::new(editor_active),
            force,
            editing_ended: Notify::new(),
            events,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_editor_active(&self) -> bool {
        self.editor_active.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Whether a pass may start now.
    pub fn should_run(&self) -> bool {
        self.force || (self.is_enabled() && !self.is_editor_active())
    }

    pub fn set_enabled(&self, db: &DbState, enabled: bool) -> Result<()> {
        let conn = db.lock()?;
        db::set_flag(&conn, SETTINGS_CATEGORY, KEY_ENABLED, enabled)?;
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "catalog sync switched");
        Ok(())
    }

    pub fn set_log_events(&self, db: &DbState, enabled: bool) -> Result<()> {
        let conn = db.lock()?;
        db::set_flag(&conn, SETTINGS_CATEGORY, KEY_LOG_EVENTS, enabled)?;
        self.events.set_enabled(enabled);
        Ok(())
    }

    /// An interactive editor logged in.
    pub fn begin_editing(&self, db: &DbState) -> Result<()> {
        let conn = db.lock()?;
        db::set_flag(&conn, SETTINGS_CATEGORY, KEY_EDITOR_ACTIVE, true)?;
        self.editor_active.store(true, Ordering::SeqCst);
        debug!("editing session started");
        Ok(())
    }

    /// The editor logged out; wakes the loop for an immediate pass.
    pub fn end_editing(&self, db: &DbState) -> Result<()> {
        let conn = db.lock()?;
        db::set_flag(&conn, SETTINGS_CATEGORY, KEY_EDITOR_ACTIVE, false)?;
        self.editor_active.store(false, Ordering::SeqCst);
        self.editing_ended.notify_one();
        debug!("editing session ended");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

/// Shared state of the background loop.
#[derive(Default)]
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<std::sync::Mutex<Option<String>>>,
    pub last_report: Arc<std::sync::Mutex<Option<PassReport>>>,
    pub passes: AtomicU64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, report: &PassReport) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        if let Ok(mut guard) = self.last_report.lock() {
            *guard = Some(report.clone());
        }
        self.passes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop. Returns the task handle; cancel
/// `shutdown` to stop it after the current pass.
pub fn start_sync_loop(
    reconciler: Arc<Reconciler>,
    gate: Arc<SyncGate>,
    sync_state: Arc<SyncState>,
    poll_delay: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let is_running = sync_state.is_running.clone();
    is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (poll delay: {}s)", poll_delay.as_secs());

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if gate.should_run() {
                match reconciler.run_pass().await {
                    Ok(report) => sync_state.record(&report),
                    Err(e) => warn!("Reconciliation pass failed: {e}"),
                }
            } else {
                debug!(
                    enabled = gate.is_enabled(),
                    editor_active = gate.is_editor_active(),
                    "sync gated, pass skipped"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_delay) => {}
                _ = gate.editing_ended.notified() => {
                    info!("Editing session ended, syncing now");
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, reconciler.dispatcher().wait_idle())
            .await
            .is_err()
        {
            warn!("In-flight requests still pending at shutdown");
        }
        is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

/// Run one pass now, regardless of the gate.
pub async fn force_sync(reconciler: &Reconciler, sync_state: &SyncState) -> Result<PassReport> {
    let report = reconciler.run_pass().await?;
    sync_state.record(&report);
    info!("Force sync complete");
    Ok(report)
}
