//! Inbound message pipeline: listener (producer), bounded queue, worker
//! (consumer).

pub mod listener;
pub mod queue;
pub mod worker;

pub use listener::{Admission, Listener};
pub use queue::IngestQueue;
pub use worker::{Delivery, Worker, WorkerSettings};

use crate::dedup::Deduplicator;
use std::sync::{Arc, Mutex, MutexGuard};

/// Deduplicator shared by the listener (inbound) and the worker
/// (outbound registration).
#[derive(Clone)]
pub struct SharedDedup(Arc<Mutex<Deduplicator>>);

impl SharedDedup {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(Deduplicator::new(capacity))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Deduplicator> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}
