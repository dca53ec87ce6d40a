//! Shared types used across the warden runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Ordinal permission tier. Ordering follows privilege.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RoleLevel {
    /// Unknown sender, dropped before the queue.
    #[default]
    Stranger = 0,
    /// Basic conversation only.
    Guest = 1,
    /// May query operational data.
    Admin = 2,
    /// Full control, including admin commands and self-evolution.
    Root = 3,
}

impl RoleLevel {
    /// Map a stored numeric level back to a role.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Stranger),
            1 => Some(Self::Guest),
            2 => Some(Self::Admin),
            3 => Some(Self::Root),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for RoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stranger => write!(f, "stranger"),
            Self::Guest => write!(f, "guest"),
            Self::Admin => write!(f, "admin"),
            Self::Root => write!(f, "root"),
        }
    }
}

/// Result of resolving a sender through the auth gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Human-readable display name the channel reported.
    pub identity: String,
    pub role: RoleLevel,
    /// Set when the display name claimed Root but the stable id disagreed.
    pub spoofed: bool,
    /// Stable numeric identifier, when the channel provides one.
    pub uid: Option<u64>,
}

impl AuthInfo {
    pub fn new(identity: &str, role: RoleLevel, uid: Option<u64>) -> Self {
        Self {
            identity: identity.to_string(),
            role,
            spoofed: false,
            uid,
        }
    }

    pub fn stranger(identity: &str, uid: Option<u64>) -> Self {
        Self::new(identity, RoleLevel::Stranger, uid)
    }

    pub fn spoofed(identity: &str, uid: Option<u64>) -> Self {
        Self {
            spoofed: true,
            ..Self::stranger(identity, uid)
        }
    }
}

// ---------------------------------------------------------------------------
// Channel messages
// ---------------------------------------------------------------------------

/// Kind of an inbound channel event. Part of the dedup fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Voice,
    Image,
    File,
    /// Timestamps, recalls and other client chrome.
    System,
    /// The driver saw this message as sent by our own account.
    Own,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
            Self::Own => "own",
        }
    }
}

/// Raw event handed over by a channel driver, before authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub sender: String,
    pub text: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub sender_uid: Option<u64>,
    #[serde(default)]
    pub kind: MessageKind,
    /// Opaque driver handle for the originating event.
    #[serde(default)]
    pub handle: String,
}

/// An authenticated message waiting for the worker.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: String,
    pub text: String,
    pub room: Option<String>,
    pub received_at: DateTime<Utc>,
    pub auth: AuthInfo,
    pub handle: String,
}

impl IncomingMessage {
    pub fn from_event(event: InboundEvent, auth: AuthInfo) -> Self {
        Self {
            sender: event.sender,
            text: event.text,
            room: event.room,
            received_at: Utc::now(),
            auth,
            handle: event.handle,
        }
    }

    /// Where replies go: the room for group messages, else the sender.
    pub fn reply_target(&self) -> &str {
        self.room.as_deref().unwrap_or(&self.sender)
    }
}

/// Payload for an outbound send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum OutboundContent {
    Text(String),
    File(PathBuf),
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Fail,
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Denied => write!(f, "DENIED"),
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            "DENIED" => Ok(Self::Denied),
            other => anyhow::bail!("Unknown audit outcome: {}", other),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,
    pub command: String,
    pub action: Option<String>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reasoning types
// ---------------------------------------------------------------------------

/// A chat message in the multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl FromStr for ChatRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => anyhow::bail!("Unknown chat role: {}", other),
        }
    }
}

/// A tool call request from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: String,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Conversation memory
// ---------------------------------------------------------------------------

/// One stored conversation line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub peer: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Evolution
// ---------------------------------------------------------------------------

/// Lifecycle of one self-proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStage {
    Proposed,
    SyntaxValidated,
    Written,
    Committed,
    ReloadRequested,
    Reloaded,
    RolledBack,
    /// Refused before anything was written.
    Rejected,
}

impl EvolutionStage {
    /// Legal forward edges of the state machine.
    pub fn can_advance_to(self, next: Self) -> bool {
        use EvolutionStage::*;
        matches!(
            (self, next),
            (Proposed, SyntaxValidated)
                | (Proposed, Rejected)
                | (SyntaxValidated, Written)
                | (SyntaxValidated, Rejected)
                | (Written, Committed)
                | (Committed, ReloadRequested)
                | (ReloadRequested, Reloaded)
                | (ReloadRequested, RolledBack)
                | (Reloaded, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reloaded | Self::RolledBack | Self::Rejected)
    }
}

impl fmt::Display for EvolutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::SyntaxValidated => "syntax_validated",
            Self::Written => "written",
            Self::Committed => "committed",
            Self::ReloadRequested => "reload_requested",
            Self::Reloaded => "reloaded",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EvolutionStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "syntax_validated" => Ok(Self::SyntaxValidated),
            "written" => Ok(Self::Written),
            "committed" => Ok(Self::Committed),
            "reload_requested" => Ok(Self::ReloadRequested),
            "reloaded" => Ok(Self::Reloaded),
            "rolled_back" => Ok(Self::RolledBack),
            "rejected" => Ok(Self::Rejected),
            other => anyhow::bail!("Unknown evolution stage: {}", other),
        }
    }
}

/// Persisted bookkeeping for one evolution. The proposed content itself
/// lives in the commit, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionRecord {
    pub id: String,
    pub target_path: String,
    pub reason: String,
    pub requested_by: String,
    /// Who hears about the outcome after restart.
    pub notify: Option<String>,
    pub stage: EvolutionStage,
    pub commit_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvolutionRecord {
    pub fn new(target_path: &str, reason: &str, requested_by: &str, notify: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            target_path: target_path.to_string(),
            reason: reason.to_string(),
            requested_by: requested_by.to_string(),
            notify,
            stage: EvolutionStage::Proposed,
            commit_id: None,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Process exit protocol
// ---------------------------------------------------------------------------

/// Exit codes the worker uses to talk to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// Deliberate shutdown (0).
    Normal,
    /// Restart to pick up an accepted evolution (100).
    HotReload,
    /// Internal safety trip; never restart (999).
    SelfIsolate,
    /// Anything else, including death by signal.
    Crash(Option<i32>),
}

impl ExitSignal {
    pub const NORMAL_CODE: i32 = 0;
    pub const HOT_RELOAD_CODE: i32 = 100;
    pub const SELF_ISOLATE_CODE: i32 = 999;

    /// Unix keeps only the low 8 bits of an exit status.
    const SELF_ISOLATE_TRUNCATED: i32 = Self::SELF_ISOLATE_CODE & 0xff;

    /// Code the worker process exits with.
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => Self::NORMAL_CODE,
            Self::HotReload => Self::HOT_RELOAD_CODE,
            Self::SelfIsolate => Self::SELF_ISOLATE_CODE,
            Self::Crash(code) => code.unwrap_or(1),
        }
    }

    /// Interpret an observed child exit status.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(Self::NORMAL_CODE) => Self::Normal,
            Some(Self::HOT_RELOAD_CODE) => Self::HotReload,
            Some(Self::SELF_ISOLATE_CODE) | Some(Self::SELF_ISOLATE_TRUNCATED) => {
                Self::SelfIsolate
            }
            other => Self::Crash(other),
        }
    }

    /// When several exits are requested the strongest one wins.
    pub fn priority(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Crash(_) => 1,
            Self::HotReload => 2,
            Self::SelfIsolate => 3,
        }
    }
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::HotReload => write!(f, "hot_reload"),
            Self::SelfIsolate => write!(f, "self_isolate"),
            Self::Crash(Some(code)) => write!(f, "crash({})", code),
            Self::Crash(None) => write!(f, "crash(signal)"),
        }
    }
}
