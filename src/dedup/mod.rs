//! Loop protection in both directions: inbound fingerprints and outbound
//! reply history.

pub mod fingerprint;
pub mod reply_guard;

pub use fingerprint::{fingerprint, Deduplicator};
pub use reply_guard::{BlockReason, ReplyGuard, ReplyStats, Verdict};
