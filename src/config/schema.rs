//! Configuration schema for warden.toml.
//!
//! One value is built at startup, validated eagerly and handed to each
//! component. Every section falls back to its defaults when omitted.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Human-readable agent name, used in prompts and digests.
    pub name: String,

    /// Log level (debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    /// Path to SQLite database.
    pub db_path: String,

    /// Config version.
    pub version: u32,

    pub reasoning: ReasoningConfig,
    pub auth: AuthConfig,
    pub channel: ChannelConfig,
    pub pipeline: PipelineConfig,
    pub reply_guard: ReplyGuardConfig,
    pub evolution: EvolutionConfig,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            name: "warden".into(),
            log_level: "info".into(),
            db_path: "~/.warden/state.db".into(),
            version: 1,
            reasoning: ReasoningConfig::default(),
            auth: AuthConfig::default(),
            channel: ChannelConfig::default(),
            pipeline: PipelineConfig::default(),
            reply_guard: ReplyGuardConfig::default(),
            evolution: EvolutionConfig::default(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Reasoning backend, rate limit and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// OpenAI-compatible API base URL.
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Budget enforced by the rate limiter.
    pub calls_per_minute: u32,
    /// Total attempts per reasoning call, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    /// Tool-call rounds the worker allows per message.
    pub max_tool_rounds: u32,
    pub system_prompt: String,
    /// Reply sent once when the backend reports exhausted balance.
    pub terminal_message: String,
    /// Reply sent when a message could not be answered at all.
    pub apology_message: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            max_tokens: 1024,
            request_timeout_secs: 60,
            calls_per_minute: 15,
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
            max_tool_rounds: 4,
            system_prompt: "You are a helpful assistant living in a chat client. \
                            Answer briefly and in the language of the sender."
                .into(),
            terminal_message: "The reasoning service is out of credit right now. \
                               Please try again later."
                .into(),
            apology_message: "Sorry, something went wrong while I was thinking about that."
                .into(),
        }
    }
}

/// Identity resolution and step-up authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Stable numeric id of the Root operator.
    pub root_uid: Option<u64>,
    /// Display name of the Root operator.
    pub root_name: String,
    pub sudo_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            root_uid: None,
            root_name: String::new(),
            sudo_ttl_secs: 120,
        }
    }
}

/// File-bridge channel and the interaction lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// JSONL file the chat client bridge appends inbound events to.
    pub inbox_path: String,
    /// JSONL file outbound sends are appended to.
    pub outbox_path: String,
    pub poll_interval_ms: u64,
    /// Bound on acquiring the interaction lock and on each driver call.
    pub lock_timeout_ms: u64,
    /// Suffix appended to every reply.
    pub ai_signature: String,
    /// Pause after each outbound send.
    pub cooldown_ms: u64,
    /// Tries per outbound send, the first one included.
    pub send_attempts: u32,
    pub send_retry_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbox_path: "~/.warden/bridge/inbox.jsonl".into(),
            outbox_path: "~/.warden/bridge/outbox.jsonl".into(),
            poll_interval_ms: 500,
            lock_timeout_ms: 10_000,
            ai_signature: " (AI)".into(),
            cooldown_ms: 1_000,
            send_attempts: 3,
            send_retry_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub dedup_window: usize,
    /// Conversation turns sent to the backend as history.
    pub history_window: usize,
    pub pop_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            dedup_window: 200,
            history_window: 10,
            pop_timeout_ms: 1_000,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyGuardConfig {
    pub window_secs: u64,
    pub exact_lookback: usize,
    pub similar_lookback: usize,
    pub similarity_threshold: f64,
    pub context_threshold: f64,
    pub min_similarity_len: usize,
    /// Records kept per recipient.
    pub history_cap: usize,
    /// Substrings that mark a reply as a system or error message.
    pub system_markers: Vec<String>,
}

impl Default for ReplyGuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            exact_lookback: 10,
            similar_lookback: 5,
            similarity_threshold: 0.8,
            context_threshold: 0.05,
            min_similarity_len: 10,
            history_cap: 20,
            system_markers: vec![
                "[Timeout]".into(),
                "[Error]".into(),
                "[System]".into(),
                "Access Denied".into(),
                "Rate limited".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Working tree the agent is allowed to rewrite.
    pub repo_dir: String,
    /// Pending-notification marker, read once after restart.
    pub pending_path: String,
    /// Workspace-relative file holding the system prompt. Seeded from
    /// `reasoning.system_prompt` and read by every worker start.
    pub system_prompt_path: String,
    /// Path fragments that may never be written.
    pub forbidden_paths: Vec<String>,
    pub commit_prefix: String,
    pub author_name: String,
    pub author_email: String,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            repo_dir: "~/.warden/workspace".into(),
            pending_path: "~/.warden/evolution_pending.json".into(),
            system_prompt_path: "prompts/system.md".into(),
            forbidden_paths: vec![
                "config_private".into(),
                "data/".into(),
                ".env".into(),
                "secrets".into(),
                ".git/".into(),
                "warden.toml".into(),
                "state.db".into(),
            ],
            commit_prefix: "[auto-evolve]".into(),
            author_name: "warden".into(),
            author_email: "warden@localhost".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker command line. Empty means this binary with `run`.
    pub command: Vec<String>,
    pub crash_threshold: usize,
    pub crash_window_secs: u64,
    pub restart_delay_ms: u64,
    pub reload_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            crash_threshold: 3,
            crash_window_secs: 60,
            restart_delay_ms: 3_000,
            reload_delay_ms: 1_000,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// YAML file with cron entries; built-in defaults when missing.
    pub schedule_path: String,
    /// Recipient of the daily digest.
    pub digest_receiver: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_path: "~/.warden/schedule.yml".into(),
            digest_receiver: None,
        }
    }
}

impl WardenConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }

    pub fn resolved_repo_dir(&self) -> String {
        self.resolve_path(&self.evolution.repo_dir)
    }

    pub fn resolved_pending_path(&self) -> String {
        self.resolve_path(&self.evolution.pending_path)
    }

    pub fn resolved_schedule_path(&self) -> String {
        self.resolve_path(&self.scheduler.schedule_path)
    }

    /// Check every section and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.reasoning.calls_per_minute == 0 {
            problems.push("reasoning.calls_per_minute must be at least 1".to_string());
        }
        if self.reasoning.max_attempts == 0 {
            problems.push("reasoning.max_attempts must be at least 1".to_string());
        }
        if self.reasoning.base_delay_ms > self.reasoning.max_delay_ms {
            problems.push("reasoning.base_delay_ms exceeds reasoning.max_delay_ms".to_string());
        }
        if self.pipeline.queue_capacity == 0 {
            problems.push("pipeline.queue_capacity must be at least 1".to_string());
        }
        if self.pipeline.dedup_window == 0 {
            problems.push("pipeline.dedup_window must be at least 1".to_string());
        }
        if self.channel.lock_timeout_ms == 0 {
            problems.push("channel.lock_timeout_ms must be positive".to_string());
        }
        for (key, value) in [
            ("reply_guard.similarity_threshold", self.reply_guard.similarity_threshold),
            ("reply_guard.context_threshold", self.reply_guard.context_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                problems.push(format!("{} must be within 0.0..=1.0", key));
            }
        }
        if self.reply_guard.history_cap < self.reply_guard.exact_lookback {
            problems.push("reply_guard.history_cap is smaller than exact_lookback".to_string());
        }
        if self.auth.root_uid.is_none() && self.auth.root_name.trim().is_empty() {
            problems.push("auth needs root_uid or root_name".to_string());
        }
        if self.supervisor.crash_threshold == 0 {
            problems.push("supervisor.crash_threshold must be at least 1".to_string());
        }
        if self.evolution.repo_dir.trim().is_empty() {
            problems.push("evolution.repo_dir is empty".to_string());
        }
        let prompt_path = std::path::Path::new(&self.evolution.system_prompt_path);
        if self.evolution.system_prompt_path.trim().is_empty() || prompt_path.is_absolute() {
            problems.push("evolution.system_prompt_path must be a workspace-relative path".to_string());
        }
        if self.channel.send_attempts == 0 {
            problems.push("channel.send_attempts must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    /// Stricter check for the worker process, which needs a live backend.
    pub fn validate_worker(&self) -> Result<()> {
        self.validate()?;
        if self.reasoning.api_key.trim().is_empty() {
            bail!("Invalid configuration:\n  - reasoning.api_key is required to run the worker");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> WardenConfig {
        let mut config = WardenConfig::default();
        config.auth.root_name = "owner".into();
        config
    }

    #[test]
    fn defaults_pass_once_root_is_named() {
        assert!(WardenConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = valid();
        config.reasoning.calls_per_minute = 0;
        config.pipeline.queue_capacity = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("calls_per_minute"));
        assert!(err.contains("queue_capacity"));
    }

    #[test]
    fn worker_requires_api_key() {
        let mut config = valid();
        assert!(config.validate_worker().is_err());
        config.reasoning.api_key = "sk-test".into();
        assert!(config.validate_worker().is_ok());
    }

    #[test]
    fn prompt_path_must_stay_in_workspace() {
        let mut config = valid();
        config.evolution.system_prompt_path = "/etc/motd".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("system_prompt_path"));
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let config: WardenConfig = toml::from_str(
            r#"
            name = "bot"
            [auth]
            root_uid = 42
            [reply_guard]
            window_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.root_uid, Some(42));
        assert_eq!(config.auth.sudo_ttl_secs, 120);
        assert_eq!(config.reply_guard.window_secs, 60);
        assert_eq!(config.reply_guard.exact_lookback, 10);
        assert_eq!(config.pipeline.queue_capacity, 100);
    }
}
