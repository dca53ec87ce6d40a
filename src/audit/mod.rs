//! Append-only audit trail of commands and their outcomes.
//!
//! Writes are best-effort: a failed insert is logged and swallowed, so
//! auditing can never take down the pipeline. DB writes are offloaded via
//! `spawn_blocking` so sqlite I/O does not block the async runtime.

use crate::state::Database;
use crate::types::{AuditEntry, AuditOutcome};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Audit log handle.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Mutex<Database>>,
}

impl AuditLog {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    async fn persist(&self, entry: AuditEntry) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let db = db.blocking_lock();
            db.insert_audit(&entry)
        })
        .await??;
        Ok(())
    }

    /// Record one command. Never fails.
    pub async fn record(
        &self,
        actor: &str,
        command: &str,
        action: Option<&str>,
        outcome: AuditOutcome,
    ) {
        let entry = AuditEntry {
            id: ulid::Ulid::new().to_string(),
            actor: actor.to_string(),
            command: command.to_string(),
            action: action.map(str::to_string),
            outcome,
            timestamp: Utc::now(),
        };

        info!(actor = %actor, outcome = %outcome, "Audit: {}", action.unwrap_or(command));
        if let Err(e) = self.persist(entry).await {
            warn!("Audit write failed for {}: {}", actor, e);
        }
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let db = self.db.lock().await;
        db.recent_audit(limit)
    }
}

/// Render entries the way `#audit` shows them in chat.
pub fn format_entries(entries: &[AuditEntry]) -> String {
    if entries.is_empty() {
        return "No audit entries.".to_string();
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{} {} [{}] {}{}",
                e.timestamp.format("%m-%d %H:%M:%S"),
                e.actor,
                e.outcome,
                e.command,
                e.action
                    .as_deref()
                    .map(|a| format!(" -> {}", a))
                    .unwrap_or_default(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(Mutex::new(Database::open_memory().unwrap())))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recent_returns_newest_first() {
        let audit = log();
        audit.record("owner", "#audit", Some("list"), AuditOutcome::Success).await;
        audit.record("mallory", "#restart", None, AuditOutcome::Denied).await;

        let entries = audit.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor, "mallory");
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
        assert_eq!(entries[1].action.as_deref(), Some("list"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recent_honours_limit() {
        let audit = log();
        for i in 0..5 {
            audit
                .record("owner", &format!("#audit {}", i), None, AuditOutcome::Success)
                .await;
        }
        assert_eq!(audit.recent(3).await.unwrap().len(), 3);
    }

    #[test]
    fn empty_listing_is_explicit() {
        assert_eq!(format_entries(&[]), "No audit entries.");
    }
}
