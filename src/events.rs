//! Optional event log of outbound requests, their responses and remote
//! changes applied locally.
//!
//! Entries go to the `catalog_sync::events` tracing target, so they can be
//! routed or filtered separately from the operational log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::models::EntityKind;

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    enabled: Arc<AtomicBool>,
}

impl EventLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn request(&self, event: &str, local_id: Option<i64>, remote_id: Option<&str>, body: &str) {
        if self.is_enabled() {
            info!(
                target: "catalog_sync::events",
                event,
                local_id,
                remote_id,
                body,
                "request"
            );
        }
    }

    pub fn response(&self, event: &str, local_id: Option<i64>, status: u16, body: &str) {
        if self.is_enabled() {
            info!(
                target: "catalog_sync::events",
                event,
                local_id,
                status,
                body,
                "response"
            );
        }
    }

    /// A change made on the remote side was applied to the local catalog.
    pub fn remote_change(&self, kind: EntityKind, local_id: i64, remote_id: &str, change: &str) {
        if self.is_enabled() {
            info!(
                target: "catalog_sync::events",
                kind = kind.as_str(),
                local_id,
                remote_id,
                change,
                "remote change applied"
            );
        }
    }
}
