//! Warden: unattended chat agent runtime.
//!
//! Usage:
//!   warden init                 Write a default config
//!   warden supervise            Run the watchdog (spawns `warden run`)
//!   warden run                  Run one worker process
//!   warden status               Show recent audit and evolution state
//!   warden grant <name> <0-3>   Grant a role
//!   warden allow-group <name>   Let members of a group talk as guests

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use warden::channel::FileBridge;
use warden::config::{self, WardenConfig};
use warden::evolution::workspace;
use warden::git_ops::GitRepo;
use warden::reasoning::HttpBackend;
use warden::runtime::{self, WorkerRuntime};
use warden::state::Database;
use warden::supervisor::{StdLauncher, StopReason, Supervisor};
use warden::types::*;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Unattended chat agent with a self-evolution pipeline and crash-loop watchdog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to warden home directory.
    #[arg(long, default_value = "~/.warden")]
    home: String,

    /// Config file (defaults to <home>/warden.toml).
    #[arg(long)]
    config: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and initialize the workspace repo.
    Init {
        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },

    /// Run one worker process (normally started by `supervise`).
    Run,

    /// Supervise the worker: restart, hot reload, rollback, isolation.
    Supervise,

    /// Show recent audit entries and evolution records.
    Status,

    /// Grant a role level (0 stranger, 1 guest, 2 admin, 3 root).
    Grant { name: String, level: i64 },

    /// Allow members of a group chat to talk to the agent as guests.
    AllowGroup {
        name: String,
        /// Remove the group from the allow list instead.
        #[arg(long)]
        revoke: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
    runtime::install_panic_hook();

    let home_dir = PathBuf::from(shellexpand::tilde(&cli.home).into_owned());
    let config_path = match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
        None => home_dir.join("warden.toml"),
    };

    match &cli.command {
        Commands::Init { force } => cmd_init(&home_dir, &config_path, *force),
        Commands::Run => match cmd_run(&config_path).await {
            Ok(signal) => std::process::exit(signal.code()),
            Err(e) => {
                error!("Worker failed: {:#}", e);
                std::process::exit(ExitSignal::Crash(None).code());
            }
        },
        Commands::Supervise => cmd_supervise(&cli, &config_path).await,
        Commands::Status => cmd_status(&config_path),
        Commands::Grant { name, level } => cmd_grant(&config_path, name, *level),
        Commands::AllowGroup { name, revoke } => cmd_allow_group(&config_path, name, !*revoke),
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn cmd_init(home_dir: &Path, config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }
    std::fs::create_dir_all(home_dir)
        .with_context(|| format!("Failed to create home directory: {}", home_dir.display()))?;

    let home = home_dir.to_string_lossy();
    let mut cfg = WardenConfig::default();
    cfg.db_path = format!("{}/state.db", home);
    cfg.evolution.repo_dir = format!("{}/workspace", home);
    cfg.evolution.pending_path = format!("{}/evolution_pending.json", home);
    cfg.channel.inbox_path = format!("{}/bridge/inbox.jsonl", home);
    cfg.channel.outbox_path = format!("{}/bridge/outbox.jsonl", home);
    cfg.scheduler.schedule_path = format!("{}/schedule.yml", home);
    config::save_config(&cfg, config_path)?;
    prepare_workspace(&cfg)?;

    println!("{} Wrote {}", ">>>".green().bold(), config_path.display());
    println!("    Set auth.root_uid or auth.root_name and reasoning.api_key, then run:");
    println!("    warden supervise");
    Ok(())
}

async fn cmd_run(config_path: &Path) -> Result<ExitSignal> {
    let cfg = load_validated(config_path)?;
    cfg.validate_worker()?;

    let db = open_db(&cfg)?;
    let repo = prepare_workspace(&cfg)?;
    let backend = HttpBackend::new(&cfg.reasoning)?;
    let bridge = FileBridge::open(
        Path::new(&cfg.resolve_path(&cfg.channel.inbox_path)),
        Path::new(&cfg.resolve_path(&cfg.channel.outbox_path)),
        true,
    )
    .await?;

    info!("Starting worker '{}' (model: {})", cfg.name, cfg.reasoning.model);
    let runtime = WorkerRuntime::build(
        cfg,
        db,
        Arc::new(backend),
        Box::new(bridge),
        Arc::new(repo),
    );
    runtime.run().await
}

async fn cmd_supervise(cli: &Cli, config_path: &Path) -> Result<()> {
    let cfg = load_validated(config_path)?;

    let command = if cfg.supervisor.command.is_empty() {
        let exe = std::env::current_exe().context("Cannot locate warden executable")?;
        vec![
            exe.to_string_lossy().into_owned(),
            "--home".into(),
            cli.home.clone(),
            "--config".into(),
            config_path.to_string_lossy().into_owned(),
            "--log-level".into(),
            cli.log_level.clone(),
            "run".into(),
        ]
    } else {
        cfg.supervisor.command.clone()
    };

    let repo = prepare_workspace(&cfg)?;
    let db = open_db(&cfg)?;

    println!(
        "{} Supervising '{}': {}",
        ">>>".green().bold(),
        cfg.name,
        command.join(" ")
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let mut supervisor = Supervisor::new(
        &cfg.supervisor,
        command,
        Arc::new(StdLauncher),
        Arc::new(repo),
    )
    .with_state(db);
    let report = supervisor.run(cancel).await;

    println!(
        "{} Supervisor stopped ({:?}): {} spawns, {} reloads, {} crashes, {} rollbacks",
        "<<<".red().bold(),
        report.stop,
        report.spawns,
        report.reloads,
        report.crashes,
        report.rollbacks
    );
    match report.stop {
        StopReason::RollbackFailed => bail!("Crash loop could not be rolled back; worker isolated"),
        StopReason::SpawnFailed => bail!("Worker could not be started"),
        _ => Ok(()),
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let cfg = load_validated(config_path)?;
    let db = open_db(&cfg)?;

    let worker_state = db.kv_get("worker_state")?.unwrap_or_else(|| "unknown".into());
    let last_heartbeat = db.kv_get("last_heartbeat")?.unwrap_or_else(|| "never".into());
    let last_digest = db.kv_get("last_digest")?.unwrap_or_else(|| "never".into());

    println!();
    println!("{}", "=== Warden Status ===".bold());
    println!();
    println!("  {}:  {}", "Name".bold(), cfg.name);
    println!("  {}:  {}", "Worker".bold(), worker_state);
    println!("  {}: {}", "Heartbeat".bold(), last_heartbeat);
    println!("  {}:  {}", "Digest".bold(), last_digest);
    println!();

    println!("  {}:", "Permissions".bold());
    for (name, role) in db.list_permissions()? {
        println!("    {:<20} {}", name, role);
    }
    println!();

    println!("  {}:", "Recent audit".bold());
    for entry in db.recent_audit(10)? {
        println!(
            "    {} {:<8} {:<16} {}",
            entry.timestamp.format("%m-%d %H:%M:%S"),
            colorize_outcome(entry.outcome),
            entry.actor,
            entry.command
        );
    }
    println!();

    println!("  {}:", "Evolutions".bold());
    for record in db.recent_evolutions(5)? {
        println!(
            "    {} {:<17} {} ({})",
            record.created_at.format("%m-%d %H:%M"),
            colorize_stage(record.stage),
            record.target_path,
            record.commit_id.as_deref().map_or("-", |c| &c[..c.len().min(8)])
        );
    }
    println!();
    Ok(())
}

fn cmd_grant(config_path: &Path, name: &str, level: i64) -> Result<()> {
    let Some(role) = RoleLevel::from_level(level) else {
        bail!("Level must be 0-3, got {}", level);
    };
    let cfg = load_validated(config_path)?;
    let db = open_db(&cfg)?;
    db.set_permission(name, role, "cli")?;
    println!("Granted {} to {}", role, name);
    Ok(())
}

fn cmd_allow_group(config_path: &Path, name: &str, allow: bool) -> Result<()> {
    let cfg = load_validated(config_path)?;
    let db = open_db(&cfg)?;
    db.allow_group(name, allow)?;
    if allow {
        println!("Members of '{}' may now talk to the agent", name);
    } else {
        println!("Group '{}' removed from the allow list", name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_validated(config_path: &Path) -> Result<WardenConfig> {
    if !config_path.exists() {
        bail!(
            "No config found at {}. Run `warden init` first.",
            config_path.display()
        );
    }
    let cfg = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

fn open_db(cfg: &WardenConfig) -> Result<Database> {
    let db_path = cfg.resolved_db_path();
    let db_path = Path::new(&db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }
    Database::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))
}

fn repo_for(cfg: &WardenConfig) -> GitRepo {
    GitRepo::new(
        Path::new(&cfg.resolved_repo_dir()),
        &cfg.evolution.author_name,
        &cfg.evolution.author_email,
    )
    .with_evolution_prefix(&cfg.evolution.commit_prefix)
}

/// Seed the prompt file, then make sure the workspace is a repo with a
/// baseline commit.
fn prepare_workspace(cfg: &WardenConfig) -> Result<GitRepo> {
    workspace::seed(cfg)?;
    let repo = repo_for(cfg);
    repo.init()?;
    Ok(repo)
}

fn colorize_outcome(outcome: AuditOutcome) -> String {
    match outcome {
        AuditOutcome::Success => "SUCCESS".green().to_string(),
        AuditOutcome::Fail => "FAIL".yellow().to_string(),
        AuditOutcome::Denied => "DENIED".red().bold().to_string(),
    }
}

fn colorize_stage(stage: EvolutionStage) -> String {
    let text = stage.to_string();
    match stage {
        EvolutionStage::Reloaded => text.green().to_string(),
        EvolutionStage::RolledBack | EvolutionStage::Rejected => text.red().to_string(),
        _ => text.yellow().to_string(),
    }
}
