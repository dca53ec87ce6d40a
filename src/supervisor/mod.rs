//! Watchdog that owns the worker process.
//!
//! | Exit | Action |
//! |------|--------|
//! | 0    | stop supervising |
//! | 100  | respawn, reset crash counter |
//! | 999  | stop permanently |
//! | else | count; 3 inside 60 s rolls back one commit, then respawn |

pub mod crash;
pub mod launcher;

pub use crash::CrashTracker;
pub use launcher::{ChildProcess, ChildStatus, ProcessLauncher, StdLauncher};

use crate::config::schema::SupervisorConfig;
use crate::evolution;
use crate::git_ops::VersionControl;
use crate::state::Database;
use crate::types::{AuditEntry, AuditOutcome, EvolutionStage, ExitSignal};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Normal,
    Isolated,
    RollbackFailed,
    SpawnFailed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub spawns: u32,
    pub reloads: u32,
    pub crashes: u32,
    pub rollbacks: u32,
    pub stop: StopReason,
}

pub struct Supervisor {
    command: Vec<String>,
    launcher: Arc<dyn ProcessLauncher>,
    vcs: Arc<dyn VersionControl>,
    state: Option<Database>,
    tracker: CrashTracker,
    restart_delay: Duration,
    reload_delay: Duration,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        config: &SupervisorConfig,
        command: Vec<String>,
        launcher: Arc<dyn ProcessLauncher>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        Self {
            command,
            launcher,
            vcs,
            state: None,
            tracker: CrashTracker::new(
                config.crash_threshold,
                Duration::from_secs(config.crash_window_secs),
            ),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            reload_delay: Duration::from_millis(config.reload_delay_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Record rollbacks in this store (evolution stages and audit log).
    pub fn with_state(mut self, db: Database) -> Self {
        self.state = Some(db);
        self
    }

    pub fn state(&self) -> Option<&Database> {
        self.state.as_ref()
    }

    pub fn crash_count(&self) -> usize {
        self.tracker.count()
    }

    fn spawn(&self, report: &mut SupervisorReport) -> Result<Box<dyn ChildProcess>> {
        let child = self.launcher.spawn(&self.command)?;
        report.spawns += 1;
        info!(pid = ?child.id(), "Worker started (spawn #{})", report.spawns);
        Ok(child)
    }

    /// Poll `child` until it exits. `None` means `cancel` fired first.
    async fn wait_for_exit(
        &self,
        child: &mut Box<dyn ChildProcess>,
        cancel: &CancellationToken,
    ) -> Result<Option<ExitSignal>> {
        loop {
            if let ChildStatus::Exited(code) = child.poll()? {
                return Ok(Some(ExitSignal::from_code(code)));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// Supervise until a terminal exit, a fatal error, or `cancel`.
    pub async fn run(&mut self, cancel: CancellationToken) -> SupervisorReport {
        let mut report = SupervisorReport::default();

        let mut child = match self.spawn(&mut report) {
            Ok(c) => c,
            Err(e) => {
                error!("{:#}", e);
                report.stop = StopReason::SpawnFailed;
                return report;
            }
        };

        loop {
            let signal = match self.wait_for_exit(&mut child, &cancel).await {
                Ok(Some(signal)) => signal,
                Ok(None) => {
                    info!("Supervisor cancelled, stopping worker");
                    if let Err(e) = child.kill() {
                        warn!("{:#}", e);
                    }
                    report.stop = StopReason::Cancelled;
                    return report;
                }
                Err(e) => {
                    // Cannot observe the child; treat as a crash.
                    error!("{:#}", e);
                    ExitSignal::Crash(None)
                }
            };

            let delay = match signal {
                ExitSignal::Normal => {
                    info!("Worker exited normally, supervisor stopping");
                    report.stop = StopReason::Normal;
                    return report;
                }
                ExitSignal::SelfIsolate => {
                    warn!("Worker isolated itself. Not restarting; manual intervention required");
                    report.stop = StopReason::Isolated;
                    return report;
                }
                ExitSignal::HotReload => {
                    info!("Hot reload requested, restarting worker");
                    report.reloads += 1;
                    self.tracker.reset();
                    self.reload_delay
                }
                ExitSignal::Crash(code) => {
                    report.crashes += 1;
                    warn!(code = ?code, "Worker crashed");
                    if self.tracker.record(Instant::now()) {
                        match self.rollback().await {
                            Ok(head) => {
                                report.rollbacks += 1;
                                warn!("Crash loop: rolled back to {}", head);
                            }
                            Err(e) => {
                                error!("Crash loop and rollback failed, isolating: {:#}", e);
                                report.stop = StopReason::RollbackFailed;
                                return report;
                            }
                        }
                    }
                    self.restart_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    report.stop = StopReason::Cancelled;
                    return report;
                }
            }
            child = match self.spawn(&mut report) {
                Ok(c) => c,
                Err(e) => {
                    error!("{:#}", e);
                    report.stop = StopReason::SpawnFailed;
                    return report;
                }
            };
        }
    }

    /// Revert the latest evolution commit and record it. Store failures
    /// are logged only.
    async fn rollback(&mut self) -> Result<String> {
        let vcs = self.vcs.clone();
        let (before, result) = tokio::task::spawn_blocking(move || {
            let before = vcs.head().ok().flatten();
            (before, vcs.revert_to_previous())
        })
        .await
        .unwrap_or_else(|e| (None, Err(anyhow::Error::new(e))));
        let reverted = matches!(&result, Ok(head) if before.as_deref() != Some(head.as_str()));

        let Some(db) = &self.state else {
            return result;
        };
        let (outcome, action) = match &result {
            Ok(head) if reverted => (AuditOutcome::Success, format!("reverted to {}", head)),
            Ok(head) => (
                AuditOutcome::Success,
                format!("nothing to revert, kept {}", head),
            ),
            Err(e) => (AuditOutcome::Fail, format!("rollback failed: {}", e)),
        };
        let entry = AuditEntry {
            id: ulid::Ulid::new().to_string(),
            actor: "supervisor".into(),
            command: "rollback".into(),
            action: Some(action.clone()),
            outcome,
            timestamp: Utc::now(),
        };
        if let Err(e) = db.insert_audit(&entry) {
            warn!("Could not audit rollback: {}", e);
        }
        let live = [EvolutionStage::ReloadRequested, EvolutionStage::Reloaded];
        let marked = match &result {
            Ok(_) if reverted => {
                evolution::mark_latest(db, &live, EvolutionStage::RolledBack, Some(&action))
            }
            Ok(_) => Ok(None),
            Err(_) => evolution::annotate_latest(db, &live, &action),
        };
        if let Err(e) = marked {
            warn!("Could not update evolution record: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Children that exit immediately with scripted codes.
    struct ScriptedLauncher {
        codes: Mutex<VecDeque<Option<i32>>>,
    }

    struct Exited(Option<i32>);

    impl ChildProcess for Exited {
        fn poll(&mut self) -> Result<ChildStatus> {
            Ok(ChildStatus::Exited(self.0))
        }
        fn kill(&mut self) -> Result<()> {
            Ok(())
        }
        fn id(&self) -> Option<u32> {
            None
        }
    }

    impl ProcessLauncher for ScriptedLauncher {
        fn spawn(&self, _: &[String]) -> Result<Box<dyn ChildProcess>> {
            let code = self
                .codes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Some(0));
            Ok(Box::new(Exited(code)))
        }
    }

    #[derive(Default)]
    struct CountingVcs {
        reverts: Mutex<u32>,
        fail: bool,
    }

    const EVOLVED_HEAD: &str = "def456";

    impl VersionControl for CountingVcs {
        fn commit(&self, _: &[PathBuf], _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn revert_to_previous(&self) -> Result<String> {
            if self.fail {
                anyhow::bail!("no previous commit");
            }
            *self.reverts.lock().unwrap() += 1;
            Ok("abc123".into())
        }
        fn head(&self) -> Result<Option<String>> {
            Ok(Some(EVOLVED_HEAD.into()))
        }
    }

    fn supervisor(codes: &[Option<i32>], vcs: Arc<CountingVcs>) -> Supervisor {
        let config = SupervisorConfig {
            restart_delay_ms: 0,
            reload_delay_ms: 0,
            poll_interval_ms: 1,
            ..SupervisorConfig::default()
        };
        let launcher = Arc::new(ScriptedLauncher {
            codes: Mutex::new(codes.iter().copied().collect()),
        });
        Supervisor::new(&config, vec!["worker".into()], launcher, vcs)
    }

    #[tokio::test]
    async fn hot_reloads_respawn_and_reset() {
        let vcs = Arc::new(CountingVcs::default());
        let mut s = supervisor(&[Some(7), Some(100), Some(100), Some(100), Some(0)], vcs.clone());
        let report = s.run(CancellationToken::new()).await;
        assert_eq!(report.spawns, 5);
        assert_eq!(report.reloads, 3);
        assert_eq!(report.rollbacks, 0);
        assert_eq!(report.stop, StopReason::Normal);
        assert_eq!(s.crash_count(), 0);
    }

    #[tokio::test]
    async fn crash_loop_rolls_back_once() {
        let vcs = Arc::new(CountingVcs::default());
        let mut s = supervisor(&[Some(7), Some(7), Some(7), Some(0)], vcs.clone());
        let report = s.run(CancellationToken::new()).await;
        assert_eq!(report.crashes, 3);
        assert_eq!(report.rollbacks, 1);
        assert_eq!(*vcs.reverts.lock().unwrap(), 1);
        assert_eq!(s.crash_count(), 0);
        assert_eq!(report.spawns, 4);
    }

    #[tokio::test]
    async fn isolation_is_final() {
        for code in [999, 231] {
            let vcs = Arc::new(CountingVcs::default());
            let mut s = supervisor(&[Some(code), Some(0)], vcs);
            let report = s.run(CancellationToken::new()).await;
            assert_eq!(report.stop, StopReason::Isolated);
            assert_eq!(report.spawns, 1);
        }
    }

    #[tokio::test]
    async fn failed_rollback_escalates_and_is_audited() {
        let vcs = Arc::new(CountingVcs {
            fail: true,
            ..CountingVcs::default()
        });
        let mut s = supervisor(&[Some(1), Some(1), None], vcs)
            .with_state(Database::open_memory().unwrap());
        let report = s.run(CancellationToken::new()).await;
        assert_eq!(report.stop, StopReason::RollbackFailed);
        assert_eq!(report.spawns, 3);

        let audit = s.state().unwrap().recent_audit(1).unwrap();
        assert_eq!(audit[0].outcome, AuditOutcome::Fail);
        assert_eq!(audit[0].command, "rollback");
    }

    #[tokio::test]
    async fn failed_rollback_notes_the_live_evolution() {
        let db = Database::open_memory().unwrap();
        let mut record = crate::types::EvolutionRecord::new("a.md", "r", "owner", None);
        record.stage = EvolutionStage::Reloaded;
        db.insert_evolution(&record).unwrap();

        let vcs = Arc::new(CountingVcs {
            fail: true,
            ..CountingVcs::default()
        });
        let mut s = supervisor(&[Some(1), Some(1), Some(1)], vcs).with_state(db);
        s.run(CancellationToken::new()).await;

        let stored = s.state().unwrap().get_evolution(&record.id).unwrap().unwrap();
        assert_eq!(stored.stage, EvolutionStage::Reloaded);
        assert!(stored.detail.unwrap().starts_with("rollback failed"));
    }

    #[tokio::test]
    async fn rollback_marks_reloaded_evolution() {
        let db = Database::open_memory().unwrap();
        let mut record = crate::types::EvolutionRecord::new("a.md", "r", "owner", None);
        record.stage = EvolutionStage::Reloaded;
        db.insert_evolution(&record).unwrap();

        let vcs = Arc::new(CountingVcs::default());
        let mut s = supervisor(&[Some(2), Some(2), Some(2), Some(0)], vcs).with_state(db);
        s.run(CancellationToken::new()).await;

        let stored = s.state().unwrap().get_evolution(&record.id).unwrap().unwrap();
        assert_eq!(stored.stage, EvolutionStage::RolledBack);
    }
}
