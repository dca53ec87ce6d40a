//! `#`-prefixed admin commands.
//!
//! Only Root may run them. High-risk commands are parked behind a sudo
//! challenge and run when the same sender answers with `#confirm CODE`.

use crate::audit::{format_entries, AuditLog};
use crate::auth::AuthGate;
use crate::channel::ChannelHandle;
use crate::evolution::EvolutionPipeline;
use crate::runtime::exit::ExitController;
use crate::state::Database;
use crate::types::{AuditOutcome, ExitSignal, IncomingMessage, RoleLevel};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const COMMAND_PREFIX: char = '#';
const DEFAULT_AUDIT_LIMIT: usize = 10;
const MAX_AUDIT_LIMIT: usize = 50;

const HELP: &str = "Commands: #grant <name> <0-3>, #audit [n], #restart, #isolate, #confirm <code>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Grant { name: String, role: RoleLevel },
    Audit { limit: usize },
    Restart,
    Isolate,
    Confirm { code: String },
    Help,
}

impl AdminCommand {
    pub fn parse(text: &str) -> Result<Self> {
        let body = match text.trim().strip_prefix(COMMAND_PREFIX) {
            Some(b) => b,
            None => bail!("not a command"),
        };
        let mut parts = body.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = parts.collect();

        match (verb.as_str(), args.as_slice()) {
            ("grant", [name, level]) => {
                let role = level
                    .parse::<i64>()
                    .ok()
                    .and_then(RoleLevel::from_level)
                    .ok_or_else(|| anyhow::anyhow!("level must be 0-3, got '{}'", level))?;
                Ok(Self::Grant {
                    name: name.to_string(),
                    role,
                })
            }
            ("grant", _) => bail!("usage: #grant <name> <0-3>"),
            ("audit", []) => Ok(Self::Audit {
                limit: DEFAULT_AUDIT_LIMIT,
            }),
            ("audit", [n]) => match n.parse::<usize>() {
                Ok(limit) if limit > 0 => Ok(Self::Audit {
                    limit: limit.min(MAX_AUDIT_LIMIT),
                }),
                _ => bail!("usage: #audit [n]"),
            },
            ("restart", []) => Ok(Self::Restart),
            ("isolate", []) => Ok(Self::Isolate),
            ("confirm", [code]) => Ok(Self::Confirm {
                code: code.to_string(),
            }),
            ("help", _) => Ok(Self::Help),
            ("", _) => bail!("empty command"),
            (other, _) => bail!("unknown command '{}'", other),
        }
    }

    /// Commands that need a sudo confirmation first.
    pub fn is_high_risk(&self) -> bool {
        matches!(
            self,
            Self::Restart
                | Self::Isolate
                | Self::Grant {
                    role: RoleLevel::Root,
                    ..
                }
        )
    }
}

/// What handling one command produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub reply: String,
    pub outcome: AuditOutcome,
    pub exit: Option<ExitSignal>,
}

impl CommandOutcome {
    fn reply(text: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            reply: text.into(),
            outcome,
            exit: None,
        }
    }
}

pub struct CommandHandler {
    auth: Arc<AuthGate>,
    db: Arc<Mutex<Database>>,
    audit: AuditLog,
    evolution: Arc<EvolutionPipeline>,
    exit: ExitController,
    channel: ChannelHandle,
    signature: String,
}

impl CommandHandler {
    pub fn new(
        auth: Arc<AuthGate>,
        db: Arc<Mutex<Database>>,
        audit: AuditLog,
        evolution: Arc<EvolutionPipeline>,
        exit: ExitController,
        channel: ChannelHandle,
        signature: &str,
    ) -> Self {
        Self {
            auth,
            db,
            audit,
            evolution,
            exit,
            channel,
            signature: signature.to_string(),
        }
    }

    /// Handle, audit and answer one command message.
    pub async fn handle(&self, msg: &IncomingMessage) -> CommandOutcome {
        let actor = msg.auth.identity.as_str();
        let result = if msg.auth.role < RoleLevel::Root || msg.auth.spoofed {
            warn!(sender = %actor, role = %msg.auth.role, "Admin command denied");
            CommandOutcome::reply("Access Denied.", AuditOutcome::Denied)
        } else {
            match AdminCommand::parse(&msg.text) {
                Err(e) => CommandOutcome::reply(format!("{}. {}", e, HELP), AuditOutcome::Fail),
                Ok(cmd) if cmd.is_high_risk() => {
                    let code = self.auth.challenge(actor, msg.text.trim());
                    info!(sender = %actor, "Sudo challenge issued");
                    CommandOutcome::reply(
                        format!("Confirm with #confirm {} to run: {}", code, msg.text.trim()),
                        AuditOutcome::Success,
                    )
                }
                Ok(AdminCommand::Confirm { code }) => match self.auth.confirm(actor, &code) {
                    Some(action) => match AdminCommand::parse(&action) {
                        Ok(cmd) => self.execute(actor, msg.reply_target(), cmd).await,
                        Err(e) => CommandOutcome::reply(e.to_string(), AuditOutcome::Fail),
                    },
                    None => CommandOutcome::reply(
                        "Confirmation code invalid or expired.",
                        AuditOutcome::Denied,
                    ),
                },
                Ok(cmd) => self.execute(actor, msg.reply_target(), cmd).await,
            }
        };

        self.audit
            .record(actor, msg.text.trim(), Some(&result.reply), result.outcome)
            .await;

        let text = format!("{}{}", result.reply, self.signature);
        if let Err(e) = self.channel.send_text(msg.reply_target(), &text).await {
            warn!("Failed to answer command from {}: {}", actor, e);
        }
        if let Some(signal) = result.exit {
            self.exit.request(signal);
        }
        result
    }

    async fn execute(&self, actor: &str, reply_target: &str, cmd: AdminCommand) -> CommandOutcome {
        match cmd {
            AdminCommand::Grant { name, role } => {
                let db = self.db.lock().await;
                match db.set_permission(&name, role, actor) {
                    Ok(()) => CommandOutcome::reply(
                        format!("Granted {} to {}.", role, name),
                        AuditOutcome::Success,
                    ),
                    Err(e) => CommandOutcome::reply(format!("Grant failed: {}", e), AuditOutcome::Fail),
                }
            }
            AdminCommand::Audit { limit } => match self.audit.recent(limit).await {
                Ok(entries) => CommandOutcome::reply(format_entries(&entries), AuditOutcome::Success),
                Err(e) => CommandOutcome::reply(format!("Audit read failed: {}", e), AuditOutcome::Fail),
            },
            AdminCommand::Restart => {
                match self
                    .evolution
                    .request_reload("manual restart", Some(reply_target.to_string()), actor)
                    .await
                {
                    Ok(_) => CommandOutcome {
                        reply: "Restarting.".into(),
                        outcome: AuditOutcome::Success,
                        exit: Some(ExitSignal::HotReload),
                    },
                    Err(e) => CommandOutcome::reply(format!("Restart failed: {}", e), AuditOutcome::Fail),
                }
            }
            AdminCommand::Isolate => CommandOutcome {
                reply: "Isolating. Manual intervention required to resume.".into(),
                outcome: AuditOutcome::Success,
                exit: Some(ExitSignal::SelfIsolate),
            },
            AdminCommand::Help => CommandOutcome::reply(HELP, AuditOutcome::Success),
            AdminCommand::Confirm { .. } => {
                CommandOutcome::reply("Nothing to confirm.", AuditOutcome::Fail)
            }
        }
    }
}
