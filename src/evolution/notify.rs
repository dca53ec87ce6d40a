//! Pending-notification marker that survives a hot reload.
//!
//! Written just before the worker exits with the hot-reload code; the
//! next worker reads it once, tells the recorded target, and deletes it.

use crate::channel::ChannelHandle;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const STATUS_PENDING_REPORT: &str = "pending_report";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub reason: String,
    pub target: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

impl PendingNotification {
    pub fn new(reason: &str, target: Option<String>) -> Self {
        Self {
            reason: reason.to_string(),
            target,
            timestamp: Utc::now(),
            status: STATUS_PENDING_REPORT.to_string(),
        }
    }
}

/// Write the marker atomically (temp file + rename).
pub fn write_pending(path: &Path, pending: &PendingNotification) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(pending)?;
    std::fs::write(&tmp, json).context("Failed to write pending notification")?;
    std::fs::rename(&tmp, path).context("Failed to move pending notification into place")?;
    Ok(())
}

pub fn read_pending(path: &Path) -> Result<Option<PendingNotification>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let pending =
                serde_json::from_str(&contents).context("Malformed pending notification")?;
            Ok(Some(pending))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("Failed to read pending notification"),
    }
}

pub fn clear_pending(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("Failed to delete pending notification"),
    }
}

/// Deliver a pending notification, if any, then delete the marker.
///
/// The marker is removed whether or not the send succeeded, so a flaky
/// channel can never cause the same report to go out twice.
pub async fn deliver_pending(
    path: &Path,
    channel: &ChannelHandle,
    signature: &str,
) -> Result<Option<PendingNotification>> {
    let pending = match read_pending(path) {
        Ok(Some(p)) => p,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!("Discarding unreadable pending notification: {}", e);
            clear_pending(path)?;
            return Ok(None);
        }
    };

    if let Some(target) = &pending.target {
        let text = format!("Restart complete: {}{}", pending.reason, signature);
        match channel.send_text(target, &text).await {
            Ok(()) => info!("Reported evolution to {}", target),
            Err(e) => warn!("Failed to report evolution to {}: {}", target, e),
        }
    }
    clear_pending(path)?;
    Ok(Some(pending))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("evolution_pending.json");
        assert_eq!(read_pending(&path).unwrap(), None);

        let pending = PendingNotification::new("tone tweak", Some("owner".into()));
        write_pending(&path, &pending).unwrap();
        let loaded = read_pending(&path).unwrap().unwrap();
        assert_eq!(loaded.status, STATUS_PENDING_REPORT);
        assert_eq!(loaded.target.as_deref(), Some("owner"));

        clear_pending(&path).unwrap();
        clear_pending(&path).unwrap();
        assert_eq!(read_pending(&path).unwrap(), None);
    }

    #[test]
    fn marker_schema_field_names() {
        let pending = PendingNotification::new("r", None);
        let value = serde_json::to_value(&pending).unwrap();
        for key in ["reason", "target", "timestamp", "status"] {
            assert!(value.get(key).is_some(), "{}", key);
        }
    }
}
