//! Built-in scheduled task implementations.

use crate::channel::ChannelHandle;
use crate::state::Database;
use crate::types::{ChatRole, ConversationTurn};
use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Handles the tasks may touch.
#[derive(Clone)]
pub struct TaskContext {
    pub db: Arc<Mutex<Database>>,
    pub channel: Option<ChannelHandle>,
    pub signature: String,
    pub digest_receiver: Option<String>,
}

/// Execute a named task.
pub async fn execute_task(
    task_name: &str,
    params: &serde_json::Value,
    ctx: &TaskContext,
) -> Result<String> {
    match task_name {
        "heartbeat_ping" => task_heartbeat_ping(ctx).await,
        "daily_digest" => task_daily_digest(params, ctx).await,
        _ => bail!("Unknown scheduled task: {}", task_name),
    }
}

/// Record that the worker is alive.
async fn task_heartbeat_ping(ctx: &TaskContext) -> Result<String> {
    let db = ctx.db.lock().await;
    db.kv_set("last_heartbeat", &Utc::now().to_rfc3339())?;
    Ok("pong".into())
}

/// Summarize the last day of conversation and send it to the receiver.
///
/// `params.hours` overrides the 24 hour lookback.
async fn task_daily_digest(params: &serde_json::Value, ctx: &TaskContext) -> Result<String> {
    let Some(receiver) = ctx.digest_receiver.as_deref() else {
        return Ok("Skipped: no digest receiver configured".into());
    };
    let Some(channel) = &ctx.channel else {
        return Ok("Skipped: no channel".into());
    };

    let hours = params["hours"].as_i64().unwrap_or(24).max(1);
    let turns = {
        let db = ctx.db.lock().await;
        db.conversation_since(Utc::now() - Duration::hours(hours))?
    };
    let digest = build_digest(&turns, hours);
    channel
        .send_text(receiver, &format!("{}{}", digest, ctx.signature))
        .await?;

    let db = ctx.db.lock().await;
    db.kv_set("last_digest", &Utc::now().to_rfc3339())?;
    Ok(format!("digest sent to {}", receiver))
}

/// Plain-text digest: totals, then one line per conversation.
pub fn build_digest(turns: &[ConversationTurn], hours: i64) -> String {
    if turns.is_empty() {
        return format!("Digest (last {}h): no conversations.", hours);
    }

    let mut per_peer: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for turn in turns {
        let counts = per_peer.entry(turn.peer.as_str()).or_default();
        match turn.role {
            ChatRole::User => counts.0 += 1,
            ChatRole::Assistant => counts.1 += 1,
            _ => {}
        }
    }

    let received: usize = per_peer.values().map(|c| c.0).sum();
    let sent: usize = per_peer.values().map(|c| c.1).sum();
    let mut out = format!(
        "Digest (last {}h): {} conversations, {} received, {} sent.",
        hours,
        per_peer.len(),
        received,
        sent
    );
    for (peer, (r, s)) in &per_peer {
        out.push_str(&format!("\n- {}: {} in / {} out", peer, r, s));
    }
    out
}
