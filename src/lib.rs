//! Warden: an unattended chat agent runtime.
//!
//! A worker process listens on a chat channel, answers through a
//! rate-limited reasoning backend and may rewrite its own workspace
//! through a guarded evolution pipeline. A separate supervisor process
//! restarts it, honours hot-reload and isolation exit codes, and rolls
//! back the last commit when the worker falls into a crash loop.

pub mod audit;
pub mod auth;
pub mod channel;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod evolution;
pub mod git_ops;
pub mod pipeline;
pub mod ratelimit;
pub mod reasoning;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod tools;
pub mod types;
