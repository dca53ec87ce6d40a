//! Channel listener: polls the driver, filters and authenticates each
//! event, then either answers an admin command or enqueues the message.

use crate::audit::AuditLog;
use crate::auth::AuthGate;
use crate::channel::ChannelHandle;
use crate::commands::{CommandHandler, CommandOutcome, COMMAND_PREFIX};
use crate::pipeline::{IngestQueue, SharedDedup};
use crate::types::{AuditOutcome, InboundEvent, IncomingMessage, MessageKind, RoleLevel};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the listener did with one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// System notices, our own messages, blanks and signature echoes.
    Ignored,
    Spoofed,
    Stranger,
    Duplicate,
    Command(CommandOutcome),
    Queued { evicted: bool },
}

pub struct Listener {
    channel: ChannelHandle,
    auth: Arc<AuthGate>,
    dedup: SharedDedup,
    queue: Arc<IngestQueue<IncomingMessage>>,
    commands: Arc<CommandHandler>,
    audit: AuditLog,
    signature: String,
    poll_interval: Duration,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: ChannelHandle,
        auth: Arc<AuthGate>,
        dedup: SharedDedup,
        queue: Arc<IngestQueue<IncomingMessage>>,
        commands: Arc<CommandHandler>,
        audit: AuditLog,
        signature: &str,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channel,
            auth,
            dedup,
            queue,
            commands,
            audit,
            signature: signature.trim().to_string(),
            poll_interval,
        }
    }

    fn is_echo(&self, text: &str) -> bool {
        !self.signature.is_empty() && text.trim_end().ends_with(&self.signature)
    }

    pub async fn admit(&self, event: InboundEvent) -> Admission {
        if matches!(event.kind, MessageKind::System | MessageKind::Own)
            || event.text.trim().is_empty()
            || self.is_echo(&event.text)
        {
            return Admission::Ignored;
        }

        let auth = self
            .auth
            .resolve(&event.sender, event.sender_uid, event.room.as_deref())
            .await;

        if auth.spoofed {
            warn!(sender = %event.sender, "Dropping message from spoofed identity");
            self.audit
                .record(
                    &event.sender,
                    event.text.trim(),
                    Some("spoofed identity"),
                    AuditOutcome::Denied,
                )
                .await;
            return Admission::Spoofed;
        }
        if auth.role == RoleLevel::Stranger {
            debug!(sender = %event.sender, "Ignoring stranger");
            return Admission::Stranger;
        }
        if self.dedup.lock().is_duplicate_event(&event) {
            debug!(sender = %event.sender, "Duplicate delivery dropped");
            return Admission::Duplicate;
        }

        let msg = IncomingMessage::from_event(event, auth);
        if msg.text.trim_start().starts_with(COMMAND_PREFIX) {
            return Admission::Command(self.commands.handle(&msg).await);
        }

        info!(sender = %msg.sender, role = %msg.auth.role, "Queued message");
        let evicted = self.queue.push(msg);
        if let Some(old) = &evicted {
            warn!(sender = %old.sender, "Queue full, dropped oldest message");
        }
        Admission::Queued {
            evicted: evicted.is_some(),
        }
    }

    /// Poll the channel once and admit everything it returned.
    pub async fn poll_once(&self) -> Result<Vec<Admission>> {
        let events = self.channel.poll().await?;
        let mut admissions = Vec::with_capacity(events.len());
        for event in events {
            admissions.push(self.admit(event).await);
        }
        Ok(admissions)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Listener started");
        loop {
            if let Err(e) = self.poll_once().await {
                error!("Channel poll failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    info!("Listener shutting down");
                    return;
                }
            }
        }
    }
}
