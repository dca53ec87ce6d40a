//! Queue consumer. Each message gets its own task so a panic or error
//! while handling it is logged and the loop moves on.

use crate::audit::AuditLog;
use crate::channel::ChannelHandle;
use crate::config::WardenConfig;
use crate::dedup::{BlockReason, ReplyGuard, Verdict};
use crate::pipeline::{IngestQueue, SharedDedup};
use crate::reasoning::{ReasoningGateway, ReasoningRequest, RetryPolicy, ToolExchange};
use crate::state::Database;
use crate::tools::{self, ToolContext};
use crate::types::{AuditOutcome, ChatRole, IncomingMessage};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker knobs pulled out of [`WardenConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub system_prompt: String,
    pub apology_message: String,
    pub signature: String,
    pub history_window: usize,
    pub max_tool_rounds: u32,
    pub pop_timeout: Duration,
    pub cooldown: Duration,
    pub send_policy: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            system_prompt: config.reasoning.system_prompt.clone(),
            apology_message: config.reasoning.apology_message.clone(),
            signature: config.channel.ai_signature.clone(),
            history_window: config.pipeline.history_window,
            max_tool_rounds: config.reasoning.max_tool_rounds,
            pop_timeout: Duration::from_millis(config.pipeline.pop_timeout_ms),
            cooldown: Duration::from_millis(config.channel.cooldown_ms),
            send_policy: RetryPolicy::fixed(
                config.channel.send_attempts,
                Duration::from_millis(config.channel.send_retry_delay_ms),
            ),
        }
    }
}

/// How one message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Sent(String),
    /// Fixed service text from the gateway, sent without the reply guard.
    Notice(String),
    Suppressed(BlockReason),
    /// Backend produced no text.
    Silent,
    /// Backend failed; the apology was sent instead.
    Apologized,
}

pub struct Worker {
    queue: Arc<IngestQueue<IncomingMessage>>,
    gateway: Arc<ReasoningGateway>,
    tools: ToolContext,
    guard: std::sync::Mutex<ReplyGuard>,
    dedup: SharedDedup,
    db: Arc<Mutex<Database>>,
    audit: AuditLog,
    channel: ChannelHandle,
    settings: WorkerSettings,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<IngestQueue<IncomingMessage>>,
        gateway: Arc<ReasoningGateway>,
        tools: ToolContext,
        guard: ReplyGuard,
        dedup: SharedDedup,
        db: Arc<Mutex<Database>>,
        audit: AuditLog,
        channel: ChannelHandle,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            gateway,
            tools,
            guard: std::sync::Mutex::new(guard),
            dedup,
            db,
            audit,
            channel,
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Worker started");
        while !cancel.is_cancelled() {
            let msg = tokio::select! {
                msg = self.queue.pop_timeout(self.settings.pop_timeout) => msg,
                _ = cancel.cancelled() => break,
            };
            let Some(msg) = msg else { continue };

            let sender = msg.sender.clone();
            let worker = self.clone();
            match tokio::spawn(async move { worker.process(msg).await }).await {
                Ok(Ok(delivery)) => debug!(sender = %sender, "Handled: {:?}", delivery),
                Ok(Err(e)) => error!(sender = %sender, "Message handling failed: {:#}", e),
                Err(e) => error!(sender = %sender, "Message handler panicked: {}", e),
            }
        }
        info!("Worker shutting down");
    }

    /// Answer one message end to end.
    pub async fn process(&self, msg: IncomingMessage) -> Result<Delivery> {
        let target = msg.reply_target().to_string();
        let actor = msg.auth.identity.clone();

        let history = {
            let db = self.db.lock().await;
            db.recent_conversation(&target, self.settings.history_window)
                .unwrap_or_else(|e| {
                    warn!("Could not load history for {}: {}", target, e);
                    Vec::new()
                })
        };

        let mut request = ReasoningRequest {
            system_prompt: self.settings.system_prompt.clone(),
            history,
            input: msg.text.clone(),
            identity: actor.clone(),
            role: msg.auth.role,
            time_context: chrono::Local::now().format("%Y-%m-%d %H:%M (%A)").to_string(),
            tools: tools::definitions_for(msg.auth.role),
            exchanges: Vec::new(),
        };

        let mut rounds = 0;
        let (text, notice) = loop {
            let output = match self.gateway.invoke(&request).await {
                Ok(output) => output,
                Err(e) => {
                    error!(sender = %actor, "Reasoning failed: {}", e);
                    self.send(&target, &self.settings.apology_message).await?;
                    self.audit
                        .record(&actor, &msg.text, Some(&e.to_string()), AuditOutcome::Fail)
                        .await;
                    return Ok(Delivery::Apologized);
                }
            };

            if output.tool_calls.is_empty() || rounds >= self.settings.max_tool_rounds {
                break (output.text.unwrap_or_default(), output.notice);
            }
            rounds += 1;
            for call in output.tool_calls {
                info!(sender = %actor, tool = %call.name, "Tool call");
                let result = tools::execute_tool(&self.tools, &msg.auth, &target, &call).await;
                request.exchanges.push(ToolExchange { call, result });
            }
            // A tool asked the process to stop: report and skip the next round.
            if self.tools.exit.is_stopping() {
                let text = output.text.unwrap_or_else(|| {
                    request
                        .exchanges
                        .last()
                        .map(|x| x.result.output.clone())
                        .unwrap_or_default()
                });
                break (text, false);
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(Delivery::Silent);
        }

        if notice {
            self.send(&target, &text).await?;
            self.audit
                .record(&actor, &msg.text, Some("service notice"), AuditOutcome::Fail)
                .await;
            return Ok(Delivery::Notice(text));
        }

        let verdict = self
            .guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .evaluate(&target, &text, None);
        if let Verdict::Blocked(reason) = verdict {
            warn!(recipient = %target, "Reply suppressed: {}", reason);
            self.audit
                .record(
                    &actor,
                    &msg.text,
                    Some(&format!("reply suppressed: {}", reason)),
                    AuditOutcome::Fail,
                )
                .await;
            return Ok(Delivery::Suppressed(reason));
        }

        self.send(&target, &text).await?;
        self.guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(&target, &text);

        {
            let db = self.db.lock().await;
            let logged = db
                .append_conversation(&target, ChatRole::User, &msg.text)
                .and_then(|_| db.append_conversation(&target, ChatRole::Assistant, &text));
            if let Err(e) = logged {
                warn!("Could not store conversation for {}: {}", target, e);
            }
        }
        self.audit
            .record(&actor, &msg.text, Some("replied"), AuditOutcome::Success)
            .await;

        if !self.settings.cooldown.is_zero() {
            tokio::time::sleep(self.settings.cooldown).await;
        }
        Ok(Delivery::Sent(text))
    }

    /// Send with the signature, retrying per the send policy, and remember
    /// the outbound fingerprint.
    async fn send(&self, target: &str, text: &str) -> Result<()> {
        let full = format!("{}{}", text, self.settings.signature);
        self.settings
            .send_policy
            .retry("Send", || self.channel.send_text(target, &full))
            .await
            .with_context(|| format!("Failed to send reply to {}", target))?;
        self.dedup.lock().register_outbound(target, &full);
        Ok(())
    }
}
