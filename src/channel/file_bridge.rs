//! JSONL file bridge to the chat client.
//!
//! The client-side automation appends one JSON event per line to the
//! inbox; outbound sends are appended to the outbox for it to deliver.
//! On open the reader starts at the current end of the inbox, so a
//! backlog that piled up while the process was down is not replayed.

use super::ChannelDriver;
use crate::types::{InboundEvent, OutboundContent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

/// One line of the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub recipient: String,
    pub content: OutboundContent,
    pub sent_at: DateTime<Utc>,
}

pub struct FileBridge {
    inbox: PathBuf,
    outbox: PathBuf,
    offset: u64,
}

impl FileBridge {
    /// Open the bridge. With `skip_backlog` the inbox is read from its
    /// current end.
    pub async fn open(inbox: &Path, outbox: &Path, skip_backlog: bool) -> Result<Self> {
        for path in [inbox, outbox] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let offset = if skip_backlog {
            match tokio::fs::metadata(inbox).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            }
        } else {
            0
        };
        if offset > 0 {
            info!("Skipping {} bytes of inbox backlog", offset);
        }

        Ok(Self {
            inbox: inbox.to_path_buf(),
            outbox: outbox.to_path_buf(),
            offset,
        })
    }
}

#[async_trait]
impl ChannelDriver for FileBridge {
    async fn poll(&mut self) -> Result<Vec<InboundEvent>> {
        let mut file = match tokio::fs::File::open(&self.inbox).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open inbox"),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            warn!("Inbox shrank ({} < {}), assuming rotation", len, self.offset);
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // Only consume complete lines; a partial tail is read next time.
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let mut events = Vec::new();
        for line in String::from_utf8_lossy(complete).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<InboundEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping malformed inbox line: {}", e),
            }
        }
        Ok(events)
    }

    async fn send(&mut self, recipient: &str, content: &OutboundContent) -> Result<()> {
        let record = OutboundRecord {
            recipient: recipient.to_string(),
            content: content.clone(),
            sent_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox)
            .await
            .context("Failed to open outbox")?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Read every record in an outbox file.
pub fn read_outbox(path: &Path) -> Result<Vec<OutboundRecord>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("Failed to read outbox"),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Malformed outbox line"))
        .collect()
}
