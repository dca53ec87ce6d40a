//! Cron scheduler for periodic background tasks.
//!
//! Reads `schedule.yml` for task entries and runs each one when its cron
//! expression comes due. Falls back to built-in defaults when the file
//! does not exist.

pub mod tasks;

pub use tasks::TaskContext;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    /// Cron expression with a seconds field.
    pub schedule: String,
    pub task: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

pub struct Scheduler {
    ctx: TaskContext,
    entries: Vec<(ScheduleEntry, Schedule)>,
    last_run: HashMap<String, DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl Scheduler {
    /// Build from already-loaded entries. Entries with an invalid cron
    /// expression are skipped with a warning.
    pub fn new(ctx: TaskContext, entries: Vec<ScheduleEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| e.enabled)
            .filter_map(|e| match Schedule::from_str(&e.schedule) {
                Ok(s) => Some((e, s)),
                Err(err) => {
                    warn!("Invalid cron schedule '{}' for '{}': {}", e.schedule, e.name, err);
                    None
                }
            })
            .collect::<Vec<_>>();
        info!("Loaded {} scheduled tasks", entries.len());
        Self {
            ctx,
            entries,
            last_run: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(e, _)| e.name.as_str()).collect()
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Scheduler started");
        let tick_interval = tokio::time::Duration::from_secs(30);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick_interval) => {
                    self.tick_at(Utc::now()).await;
                }
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Run every entry that came due between its last run and `now`.
    /// Returns the names of the tasks that ran.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut ran = Vec::new();
        for (entry, schedule) in &self.entries {
            let last = self
                .last_run
                .get(&entry.name)
                .copied()
                .unwrap_or(self.started_at);
            let due = matches!(schedule.after(&last).next(), Some(next) if next <= now);
            if !due {
                continue;
            }

            debug!("Running scheduled task: {}", entry.name);
            match tasks::execute_task(&entry.task, &entry.params, &self.ctx).await {
                Ok(result) => debug!("Task '{}' finished: {}", entry.name, result),
                Err(e) => error!("Task '{}' failed: {:#}", entry.name, e),
            }
            self.last_run.insert(entry.name.clone(), now);
            ran.push(entry.name.clone());
        }
        ran
    }
}

/// Load schedule entries from YAML, or the defaults if the file is absent.
pub fn load_schedule(path: &Path) -> Result<Vec<ScheduleEntry>> {
    if !path.exists() {
        debug!("No schedule at {:?}, using defaults", path);
        return Ok(default_entries());
    }
    let contents = std::fs::read_to_string(path).context("Failed to read schedule.yml")?;
    serde_yaml::from_str(&contents).context("Failed to parse schedule.yml")
}

pub fn default_entries() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            name: "heartbeat_ping".into(),
            schedule: "0 */5 * * * *".into(), // every 5 minutes
            task: "heartbeat_ping".into(),
            enabled: true,
            params: serde_json::Value::Null,
        },
        ScheduleEntry {
            name: "daily_digest".into(),
            schedule: "0 0 21 * * *".into(), // 21:00 UTC
            task: "daily_digest".into(),
            enabled: true,
            params: serde_json::Value::Null,
        },
    ]
}
