//! Cooperative shutdown with a chosen exit signal.

use crate::types::ExitSignal;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared "keep running" flag plus the exit code the process should
/// finish with. When several exits are requested the strongest wins.
#[derive(Clone, Default)]
pub struct ExitController {
    cancel: CancellationToken,
    requested: Arc<Mutex<Option<ExitSignal>>>,
}

impl ExitController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask every task to stop, and remember `signal` unless a stronger
    /// one is already pending.
    pub fn request(&self, signal: ExitSignal) {
        {
            let mut requested = self.requested.lock().unwrap_or_else(|p| p.into_inner());
            let stronger = requested.map_or(true, |current| signal.priority() > current.priority());
            if stronger {
                info!("Exit requested: {}", signal);
                *requested = Some(signal);
            }
        }
        self.cancel.cancel();
    }

    pub fn requested(&self) -> Option<ExitSignal> {
        *self.requested.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The signal to exit with once tasks have stopped.
    pub fn signal(&self) -> ExitSignal {
        self.requested().unwrap_or(ExitSignal::Normal)
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
