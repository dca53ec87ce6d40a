//! Worker process assembly and lifecycle.
//!
//! Builds every component from one validated [`WardenConfig`], runs the
//! listener, worker and scheduler as tasks, and returns the exit signal
//! the process should finish with.

pub mod exit;

pub use exit::ExitController;

use crate::audit::AuditLog;
use crate::auth::AuthGate;
use crate::channel::{ChannelDriver, ChannelHandle};
use crate::commands::CommandHandler;
use crate::config::WardenConfig;
use crate::dedup::ReplyGuard;
use crate::evolution::{self, notify, workspace, EvolutionPipeline};
use crate::git_ops::VersionControl;
use crate::pipeline::{IngestQueue, Listener, SharedDedup, Worker, WorkerSettings};
use crate::reasoning::{ReasoningBackend, ReasoningGateway};
use crate::scheduler::{self, Scheduler, TaskContext};
use crate::state::Database;
use crate::tools::ToolContext;
use crate::types::{EvolutionStage, ExitSignal, IncomingMessage};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Route panics through tracing before the default hook runs.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {}", info);
        default_hook(info);
    }));
}

pub struct WorkerRuntime {
    pub config: WardenConfig,
    pub db: Arc<Mutex<Database>>,
    pub audit: AuditLog,
    pub channel: ChannelHandle,
    pub exit: ExitController,
    pub evolution: Arc<EvolutionPipeline>,
    pub queue: Arc<IngestQueue<IncomingMessage>>,
    pub listener: Listener,
    pub worker: Arc<Worker>,
}

impl WorkerRuntime {
    /// Wire every component around the given seams.
    pub fn build(
        config: WardenConfig,
        db: Database,
        backend: Arc<dyn ReasoningBackend>,
        driver: Box<dyn ChannelDriver>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        let db = Arc::new(Mutex::new(db));
        let audit = AuditLog::new(db.clone());
        let channel = ChannelHandle::new(
            driver,
            Duration::from_millis(config.channel.lock_timeout_ms),
        );
        let exit = ExitController::new();
        let signature = config.channel.ai_signature.clone();

        let auth = Arc::new(AuthGate::new(&config.auth, db.clone()));
        let evolution = Arc::new(EvolutionPipeline::new(&config, vcs, db.clone(), audit.clone()));
        let dedup = SharedDedup::new(config.pipeline.dedup_window);
        let queue = Arc::new(IngestQueue::new(config.pipeline.queue_capacity));

        let commands = Arc::new(CommandHandler::new(
            auth.clone(),
            db.clone(),
            audit.clone(),
            evolution.clone(),
            exit.clone(),
            channel.clone(),
            &signature,
        ));
        let listener = Listener::new(
            channel.clone(),
            auth,
            dedup.clone(),
            queue.clone(),
            commands,
            audit.clone(),
            &signature,
            Duration::from_millis(config.channel.poll_interval_ms),
        );

        let mut settings = WorkerSettings::from_config(&config);
        match workspace::load_system_prompt(&config) {
            Ok(prompt) => settings.system_prompt = prompt,
            Err(e) => warn!("Using configured system prompt: {:#}", e),
        }

        let gateway = Arc::new(ReasoningGateway::from_config(backend, &config.reasoning));
        let tools = ToolContext {
            evolution: evolution.clone(),
            exit: exit.clone(),
            channel: channel.clone(),
            audit: audit.clone(),
            signature,
        };
        let worker = Arc::new(Worker::new(
            queue.clone(),
            gateway,
            tools,
            ReplyGuard::new(config.reply_guard.clone()),
            dedup,
            db.clone(),
            audit.clone(),
            channel.clone(),
            settings,
        ));

        Self {
            config,
            db,
            audit,
            channel,
            exit,
            evolution,
            queue,
            listener,
            worker,
        }
    }

    /// Finish a hot reload: report it once and mark the evolution applied.
    pub async fn complete_reload(&self) -> Result<()> {
        let delivered = notify::deliver_pending(
            self.evolution.pending_path(),
            &self.channel,
            &self.config.channel.ai_signature,
        )
        .await?;
        if let Some(pending) = delivered {
            info!("Resumed after reload: {}", pending.reason);
        }

        let db = self.db.lock().await;
        if let Some(record) = evolution::mark_latest(
            &db,
            &[EvolutionStage::ReloadRequested],
            EvolutionStage::Reloaded,
            None,
        )? {
            info!("Evolution {} is live", record.id);
        }
        db.kv_set("worker_state", "running")?;
        Ok(())
    }

    fn scheduler(&self) -> Option<Scheduler> {
        if !self.config.scheduler.enabled {
            return None;
        }
        let path = self.config.resolved_schedule_path();
        let entries = scheduler::load_schedule(Path::new(&path)).unwrap_or_else(|e| {
            warn!("Falling back to default schedule: {:#}", e);
            scheduler::default_entries()
        });
        let ctx = TaskContext {
            db: self.db.clone(),
            channel: Some(self.channel.clone()),
            signature: self.config.channel.ai_signature.clone(),
            digest_receiver: self.config.scheduler.digest_receiver.clone(),
        };
        Some(Scheduler::new(ctx, entries))
    }

    /// Run until ctrl-c or a requested exit, then stop every task within
    /// the shutdown timeout. A task that ends on its own is a crash.
    pub async fn run(self) -> Result<ExitSignal> {
        if let Err(e) = self.complete_reload().await {
            warn!("Startup bookkeeping failed: {:#}", e);
        }

        let cancel = self.exit.token();
        let scheduler = self.scheduler();
        let mut tasks: JoinSet<&'static str> = JoinSet::new();
        let listener = self.listener;
        let listener_cancel = cancel.clone();
        tasks.spawn(async move {
            listener.run(listener_cancel).await;
            "listener"
        });
        let worker = self.worker.clone();
        let worker_cancel = cancel.clone();
        tasks.spawn(async move {
            worker.run(worker_cancel).await;
            "worker"
        });
        if let Some(scheduler) = scheduler {
            let scheduler_cancel = cancel.clone();
            tasks.spawn(async move {
                scheduler.run(scheduler_cancel).await;
                "scheduler"
            });
        }
        info!("Worker '{}' running", self.config.name);

        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = ctrl_c => self.exit.request(ExitSignal::Normal),
            Some(ended) = tasks.join_next() => {
                match ended {
                    Ok(name) => error!("{} task stopped unexpectedly", name),
                    Err(e) => error!("Task died: {}", e),
                }
                // Tasks also return once a requested exit cancels them.
                if !cancel.is_cancelled() {
                    self.exit.request(ExitSignal::Crash(None));
                }
            }
        }

        let shutdown_timeout = Duration::from_secs(self.config.pipeline.shutdown_timeout_secs);
        let joined = tokio::time::timeout(shutdown_timeout, async {
            while let Some(ended) = tasks.join_next().await {
                if let Err(e) = ended {
                    warn!("Task join error: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Tasks still running after {:?}, exiting anyway", shutdown_timeout);
            tasks.abort_all();
        }
        if !self.queue.is_empty() {
            warn!("{} queued messages dropped at shutdown", self.queue.len());
        }

        let signal = self.exit.signal();
        {
            let db = self.db.lock().await;
            if let Err(e) = db.kv_set("worker_state", &format!("stopped: {}", signal)) {
                warn!("Could not record worker state: {}", e);
            }
        }
        info!("Worker stopped ({})", signal);
        Ok(signal)
    }
}
