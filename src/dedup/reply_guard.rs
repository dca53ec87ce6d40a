//! Outbound reply guard.
//!
//! Keeps a short per-recipient history of what was sent and refuses
//! replies that repeat or nearly repeat it. A reply can also be checked
//! against the message it answers.

use crate::config::schema::ReplyGuardConfig;
use sha3::{Digest, Sha3_256};
use similar::TextDiff;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// One sent reply.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    pub recipient: String,
    pub hash: String,
    pub text: String,
    pub length: usize,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    Duplicate,
    NearDuplicate { ratio: f64 },
    OffTopic { ratio: f64 },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate reply"),
            Self::NearDuplicate { ratio } => write!(f, "near-duplicate reply ({:.2})", ratio),
            Self::OffTopic { ratio } => write!(f, "off-topic reply ({:.2})", ratio),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Passed every check.
    Allowed,
    /// System or error text, sent without checks or recording.
    Bypassed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn may_send(&self) -> bool {
        !matches!(self, Self::Blocked(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyStats {
    pub total: usize,
    pub unique: usize,
    pub uniqueness_ratio: f64,
    pub avg_length: f64,
}

/// Similarity in `0.0..=1.0` over lowercase characters.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
}

fn content_hash(text: &str) -> String {
    hex::encode(Sha3_256::digest(text.trim().as_bytes()))
}

pub struct ReplyGuard {
    config: ReplyGuardConfig,
    window: Duration,
    history: HashMap<String, VecDeque<ReplyRecord>>,
}

impl ReplyGuard {
    pub fn new(config: ReplyGuardConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            config,
            history: HashMap::new(),
        }
    }

    fn is_system_text(&self, text: &str) -> bool {
        self.config
            .system_markers
            .iter()
            .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
    }

    /// Evaluate `text` and record it when allowed.
    pub fn check(&mut self, recipient: &str, text: &str, context: Option<&str>) -> Verdict {
        self.check_at(recipient, text, context, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock.
    pub fn check_at(
        &mut self,
        recipient: &str,
        text: &str,
        context: Option<&str>,
        now: Instant,
    ) -> Verdict {
        let verdict = self.evaluate_at(recipient, text, context, now);
        if verdict == Verdict::Allowed {
            self.record_at(recipient, text, now);
        }
        verdict
    }

    /// Judge `text` without remembering it. Pair with [`record`](Self::record)
    /// once the reply has actually gone out.
    pub fn evaluate(&self, recipient: &str, text: &str, context: Option<&str>) -> Verdict {
        self.evaluate_at(recipient, text, context, Instant::now())
    }

    pub fn evaluate_at(
        &self,
        recipient: &str,
        text: &str,
        context: Option<&str>,
        now: Instant,
    ) -> Verdict {
        if self.is_system_text(text) {
            return Verdict::Bypassed;
        }

        let hash = content_hash(text);
        let length = text.chars().count();
        let window = self.window;
        let within = |r: &ReplyRecord| now.saturating_duration_since(r.sent_at) < window;

        if let Some(records) = self.history.get(recipient) {
            let exact = records
                .iter()
                .rev()
                .take(self.config.exact_lookback)
                .filter(|r| within(r))
                .any(|r| r.hash == hash);
            if exact {
                return Verdict::Blocked(BlockReason::Duplicate);
            }

            if length >= self.config.min_similarity_len {
                for record in records
                    .iter()
                    .rev()
                    .take(self.config.similar_lookback)
                    .filter(|r| within(r))
                {
                    let ratio = similarity(text, &record.text);
                    if ratio >= self.config.similarity_threshold {
                        return Verdict::Blocked(BlockReason::NearDuplicate { ratio });
                    }
                }
            }
        }

        // Short exchanges share too few characters to judge relevance.
        let min_len = self.config.min_similarity_len;
        if let Some(context) = context.filter(|c| c.trim().chars().count() >= min_len) {
            if length >= min_len {
                let ratio = similarity(text, context);
                if ratio < self.config.context_threshold {
                    return Verdict::Blocked(BlockReason::OffTopic { ratio });
                }
            }
        }

        Verdict::Allowed
    }

    /// Remember a sent reply. System text is never recorded.
    pub fn record(&mut self, recipient: &str, text: &str) {
        self.record_at(recipient, text, Instant::now());
    }

    pub fn record_at(&mut self, recipient: &str, text: &str, now: Instant) {
        if self.is_system_text(text) {
            return;
        }
        let records = self.history.entry(recipient.to_string()).or_default();
        records.push_back(ReplyRecord {
            recipient: recipient.to_string(),
            hash: content_hash(text),
            text: text.to_string(),
            length: text.chars().count(),
            sent_at: now,
        });
        while records.len() > self.config.history_cap.max(1) {
            records.pop_front();
        }
    }

    pub fn stats(&self, recipient: &str) -> ReplyStats {
        let Some(records) = self.history.get(recipient) else {
            return ReplyStats::default();
        };
        let total = records.len();
        if total == 0 {
            return ReplyStats::default();
        }
        let unique = records
            .iter()
            .map(|r| r.hash.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let total_len: usize = records.iter().map(|r| r.length).sum();
        ReplyStats {
            total,
            unique,
            uniqueness_ratio: unique as f64 / total as f64,
            avg_length: total_len as f64 / total as f64,
        }
    }

    /// Forget one recipient's history, or everyone's.
    pub fn clear(&mut self, recipient: Option<&str>) {
        match recipient {
            Some(r) => {
                self.history.remove(r);
            }
            None => self.history.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ReplyGuard {
        ReplyGuard::new(ReplyGuardConfig::default())
    }

    #[test]
    fn identical_reply_inside_window_is_blocked() {
        let mut guard = guard();
        let now = Instant::now();
        assert_eq!(guard.check_at("alice", "Thanks!", None, now), Verdict::Allowed);
        assert_eq!(
            guard.check_at("alice", "Thanks!", None, now + Duration::from_secs(10)),
            Verdict::Blocked(BlockReason::Duplicate)
        );
    }

    #[test]
    fn identical_reply_after_window_is_allowed() {
        let mut guard = guard();
        let now = Instant::now();
        guard.check_at("alice", "Thanks!", None, now);
        assert_eq!(
            guard.check_at("alice", "Thanks!", None, now + Duration::from_secs(301)),
            Verdict::Allowed
        );
    }

    #[test]
    fn recipients_have_separate_histories() {
        let mut guard = guard();
        let now = Instant::now();
        guard.check_at("alice", "Thanks!", None, now);
        assert_eq!(guard.check_at("bob", "Thanks!", None, now), Verdict::Allowed);
    }

    #[test]
    fn near_duplicate_long_reply_is_blocked() {
        let mut guard = guard();
        let now = Instant::now();
        guard.check_at("alice", "The deployment finished at noon.", None, now);
        let verdict = guard.check_at("alice", "The deployment finished at noon!", None, now);
        assert!(matches!(
            verdict,
            Verdict::Blocked(BlockReason::NearDuplicate { .. })
        ));
    }

    #[test]
    fn short_replies_skip_similarity_check() {
        let mut guard = guard();
        let now = Instant::now();
        guard.check_at("alice", "ok!", None, now);
        assert_eq!(guard.check_at("alice", "ok.", None, now), Verdict::Allowed);
    }

    #[test]
    fn unrelated_reply_is_off_topic() {
        let mut config = ReplyGuardConfig::default();
        config.context_threshold = 0.3;
        let mut guard = ReplyGuard::new(config);
        let verdict = guard.check(
            "alice",
            "zzzzzzzzzzzzzzzz",
            Some("what time is the meeting?"),
        );
        assert!(matches!(verdict, Verdict::Blocked(BlockReason::OffTopic { .. })));
        assert_eq!(guard.stats("alice").total, 0);
    }

    #[test]
    fn short_exchanges_are_never_off_topic() {
        let mut guard = guard();
        let now = Instant::now();
        assert_eq!(
            guard.check_at(
                "alice",
                "Could you tell me more about what you need?",
                Some("?"),
                now
            ),
            Verdict::Allowed
        );
        assert_eq!(
            guard.check_at("bob", "Great, option one it is.", Some("1"), now),
            Verdict::Allowed
        );
    }

    #[test]
    fn evaluate_does_not_record_until_sent() {
        let mut guard = guard();
        let now = Instant::now();
        assert_eq!(guard.evaluate_at("alice", "Thanks!", None, now), Verdict::Allowed);
        assert_eq!(guard.evaluate_at("alice", "Thanks!", None, now), Verdict::Allowed);
        assert_eq!(guard.stats("alice").total, 0);

        guard.record_at("alice", "Thanks!", now);
        assert_eq!(
            guard.evaluate_at("alice", "Thanks!", None, now),
            Verdict::Blocked(BlockReason::Duplicate)
        );
    }

    #[test]
    fn system_text_bypasses_and_is_not_recorded() {
        let mut guard = guard();
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(
                guard.check_at("alice", "[Error] backend unavailable", None, now),
                Verdict::Bypassed
            );
        }
        assert_eq!(guard.stats("alice"), ReplyStats::default());
    }

    #[test]
    fn stats_and_clear() {
        let mut guard = guard();
        let now = Instant::now();
        guard.check_at("alice", "first answer", None, now);
        guard.check_at("alice", "a completely different second one", None, now);
        let stats = guard.stats("alice");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unique, 2);
        assert!((stats.uniqueness_ratio - 1.0).abs() < f64::EPSILON);

        guard.clear(Some("alice"));
        assert_eq!(guard.stats("alice").total, 0);
    }

    #[test]
    fn similarity_is_case_insensitive() {
        assert!((similarity("Hello", "hello") - 1.0).abs() < 1e-6);
        assert!(similarity("abc", "xyz") < 0.01);
    }
}
