use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::lifecycle::RoomStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub room_id: String,
    pub old: RoomStatus,
    pub new: RoomStatus,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Receives every committed status transition. Called with the room lock
/// held, so implementations must hand off instead of doing slow work.
pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, change: &StatusChange);
}

/// Fans status changes out to any number of subscribers (WebSocket clients).
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusChange>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tx.subscribe()
    }
}

impl StatusObserver for StatusBroadcaster {
    fn on_status_change(&self, change: &StatusChange) {
        tracing::info!(
            room = %change.room_id,
            old = %change.old,
            new = %change.new,
            pid = ?change.pid,
            "Room status changed"
        );
        // no subscribers is fine
        let _ = self.tx.send(change.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Start,
    Stop,
    Restart,
    Delete,
    /// The process exited without a stop request.
    Crash,
    Backup,
    Restore,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub room_id: String,
    pub action: AuditAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new<E: std::fmt::Display>(
        room_id: &str,
        action: AuditAction,
        outcome: Result<(), &E>,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            action,
            success: outcome.is_ok(),
            reason: outcome.err().map(|e| e.to_string()),
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget record of control actions.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

const AUDIT_CAPACITY: usize = 500;

/// Keeps the most recent audit entries in memory and mirrors them to the
/// `audit` tracing target.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().rev().take(limit).cloned().collect()
    }
}

impl AuditSink for AuditLog {
    fn record(&self, entry: AuditEntry) {
        if entry.success {
            tracing::info!(target: "audit", room = %entry.room_id, action = ?entry.action, "ok");
        } else {
            tracing::warn!(
                target: "audit",
                room = %entry.room_id,
                action = ?entry.action,
                reason = entry.reason.as_deref().unwrap_or(""),
                "failed"
            );
        }

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_back(entry);
        if entries.len() > AUDIT_CAPACITY {
            entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PanelError;

    #[test]
    fn audit_log_is_bounded_and_newest_first() {
        let log = AuditLog::new();
        for i in 0..(AUDIT_CAPACITY + 10) {
            log.record(AuditEntry::new::<PanelError>(
                &format!("room{i}"),
                AuditAction::Start,
                Ok(()),
            ));
        }

        let recent = log.recent(usize::MAX);
        assert_eq!(recent.len(), AUDIT_CAPACITY);
        assert_eq!(recent[0].room_id, format!("room{}", AUDIT_CAPACITY + 9));
    }

    #[test]
    fn failed_entries_keep_reason() {
        let log = AuditLog::new();
        let err = PanelError::NotRunning;
        log.record(AuditEntry::new("room1", AuditAction::Stop, Err(&err)));

        let entry = &log.recent(1)[0];
        assert!(!entry.success);
        assert_eq!(entry.reason.as_deref(), Some("Room is not running"));
    }

    #[tokio::test]
    async fn broadcaster_delivers_to_subscribers() {
        let broadcaster = StatusBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.on_status_change(&StatusChange {
            room_id: "room1".to_string(),
            old: RoomStatus::Stopped,
            new: RoomStatus::Starting,
            pid: Some(1),
            at: Utc::now(),
        });

        let change = rx.recv().await.unwrap();
        assert_eq!(change.new, RoomStatus::Starting);
    }
}
