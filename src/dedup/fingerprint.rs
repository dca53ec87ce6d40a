//! Sliding-window fingerprint deduplicator for inbound traffic.
//!
//! A fingerprint is the SHA3-256 of `sender|text|kind`. The window holds
//! the last `capacity` fingerprints in arrival order; the companion set
//! always contains exactly the same elements as the window.

use crate::types::{InboundEvent, MessageKind};
use sha3::{Digest, Sha3_256};
use std::collections::{HashSet, VecDeque};

/// Content hash of one (sender, text, kind) triple.
pub fn fingerprint(sender: &str, text: &str, kind: MessageKind) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Deduplicator {
    capacity: usize,
    window: VecDeque<String>,
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// True if `fp` is already in the window. Otherwise records it,
    /// evicting the oldest fingerprint first when the window is full.
    pub fn is_duplicate(&mut self, fp: &str) -> bool {
        if self.seen.contains(fp) {
            return true;
        }
        if self.window.len() >= self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.window.push_back(fp.to_string());
        self.seen.insert(fp.to_string());
        false
    }

    pub fn is_duplicate_event(&mut self, event: &InboundEvent) -> bool {
        self.is_duplicate(&fingerprint(&event.sender, &event.text, event.kind))
    }

    /// Remember a message we just sent, so the channel echoing it back
    /// under the conversation name is dropped as a duplicate.
    pub fn register_outbound(&mut self, conversation: &str, text: &str) {
        let _ = self.is_duplicate(&fingerprint(conversation, text, MessageKind::Text));
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.seen.clear();
    }
}
