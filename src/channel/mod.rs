//! Chat channel seam and the interaction lock around it.
//!
//! The underlying client is not reentrant, so every poll and send goes
//! through one [`ChannelHandle`]. Acquiring the lock and running the
//! driver call are each bounded by `lock_timeout`; on timeout the call
//! fails and the guard is released.

pub mod file_bridge;

pub use file_bridge::FileBridge;

use crate::types::{InboundEvent, OutboundContent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait ChannelDriver: Send {
    /// Events that arrived since the previous poll.
    async fn poll(&mut self) -> Result<Vec<InboundEvent>>;

    async fn send(&mut self, recipient: &str, content: &OutboundContent) -> Result<()>;
}

#[derive(Clone)]
pub struct ChannelHandle {
    driver: Arc<Mutex<Box<dyn ChannelDriver>>>,
    lock_timeout: Duration,
}

impl ChannelHandle {
    pub fn new(driver: Box<dyn ChannelDriver>, lock_timeout: Duration) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
            lock_timeout,
        }
    }

    pub async fn poll(&self) -> Result<Vec<InboundEvent>> {
        let mut driver = tokio::time::timeout(self.lock_timeout, self.driver.lock())
            .await
            .map_err(|_| anyhow!("Timed out waiting for channel lock (poll)"))?;
        tokio::time::timeout(self.lock_timeout, driver.poll())
            .await
            .map_err(|_| {
                warn!("Channel poll exceeded {:?}", self.lock_timeout);
                anyhow!("Channel poll timed out")
            })?
    }

    pub async fn send(&self, recipient: &str, content: &OutboundContent) -> Result<()> {
        let mut driver = tokio::time::timeout(self.lock_timeout, self.driver.lock())
            .await
            .map_err(|_| anyhow!("Timed out waiting for channel lock (send)"))?;
        tokio::time::timeout(self.lock_timeout, driver.send(recipient, content))
            .await
            .map_err(|_| {
                warn!("Channel send to {} exceeded {:?}", recipient, self.lock_timeout);
                anyhow!("Channel send timed out")
            })?
    }

    pub async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        self.send(recipient, &OutboundContent::Text(text.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stuck;

    #[async_trait]
    impl ChannelDriver for Stuck {
        async fn poll(&mut self) -> Result<Vec<InboundEvent>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn send(&mut self, _: &str, _: &OutboundContent) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hung_driver_call_times_out_and_releases_lock() {
        let handle = ChannelHandle::new(Box::new(Stuck), Duration::from_millis(50));
        assert!(handle.poll().await.is_err());
        // The guard was dropped with the timed-out call.
        assert!(handle.send_text("alice", "hi").await.is_ok());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let handle = ChannelHandle::new(Box::new(Stuck), Duration::from_millis(200));
        let busy = handle.clone();
        let holder = tokio::spawn(async move { busy.poll().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quick = ChannelHandle {
            driver: handle.driver.clone(),
            lock_timeout: Duration::from_millis(30),
        };
        let err = quick.send_text("alice", "hi").await.unwrap_err();
        assert!(err.to_string().contains("channel lock"));
        let _ = holder.await;
    }
}
