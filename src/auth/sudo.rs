//! One-time step-up challenges for high-risk commands.

use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Wrong codes tolerated before a challenge is discarded.
pub const MAX_FAILED_ATTEMPTS: u32 = 3;

struct Challenge {
    code: String,
    action: String,
    issued_at: Instant,
    failures: u32,
}

/// Pending challenges, at most one per display name.
pub struct SudoChallenges {
    ttl: Duration,
    pending: HashMap<String, Challenge>,
}

impl SudoChallenges {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: HashMap::new(),
        }
    }

    /// Issue a fresh four-digit code for `name`, replacing any older one.
    /// `action` is handed back when the code is confirmed.
    pub fn issue(&mut self, name: &str, action: &str) -> String {
        self.issue_at(name, action, Instant::now())
    }

    pub fn issue_at(&mut self, name: &str, action: &str, now: Instant) -> String {
        let code = rand::thread_rng().gen_range(1000..=9999).to_string();
        self.pending.insert(
            name.to_string(),
            Challenge {
                code: code.clone(),
                action: action.to_string(),
                issued_at: now,
                failures: 0,
            },
        );
        code
    }

    /// Consume the challenge if `code` matches and has not expired.
    /// A wrong code counts against the challenge, which is discarded after
    /// [`MAX_FAILED_ATTEMPTS`].
    pub fn verify(&mut self, name: &str, code: &str) -> Option<String> {
        self.verify_at(name, code, Instant::now())
    }

    pub fn verify_at(&mut self, name: &str, code: &str, now: Instant) -> Option<String> {
        let challenge = self.pending.get_mut(name)?;
        if now.saturating_duration_since(challenge.issued_at) > self.ttl {
            self.pending.remove(name);
            return None;
        }
        if challenge.code != code.trim() {
            challenge.failures += 1;
            if challenge.failures >= MAX_FAILED_ATTEMPTS {
                self.pending.remove(name);
            }
            return None;
        }
        self.pending.remove(name).map(|c| c.action)
    }

    pub fn has_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }
}
