//! Database schema definitions and migrations.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Full DDL for the warden state database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Key-value store for runtime state
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Explicit role grants, keyed by display name
CREATE TABLE IF NOT EXISTS user_permissions (
    name        TEXT PRIMARY KEY,
    level       INTEGER NOT NULL,
    granted_by  TEXT NOT NULL DEFAULT 'system',
    granted_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Groups whose members may chat as guests
CREATE TABLE IF NOT EXISTS group_allowlist (
    name        TEXT PRIMARY KEY,
    allow_guest INTEGER NOT NULL DEFAULT 1,
    added_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS audit_log (
    id          TEXT PRIMARY KEY,
    actor       TEXT NOT NULL,
    command     TEXT NOT NULL,
    action      TEXT,
    outcome     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Conversation memory per peer
CREATE TABLE IF NOT EXISTS conversation_log (
    id          TEXT PRIMARY KEY,
    peer        TEXT NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Self-evolution records
CREATE TABLE IF NOT EXISTS evolutions (
    id          TEXT PRIMARY KEY,
    target_path TEXT NOT NULL,
    reason      TEXT NOT NULL,
    requested_by TEXT NOT NULL,
    notify      TEXT,
    stage       TEXT NOT NULL,
    commit_id   TEXT,
    detail      TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
CREATE INDEX IF NOT EXISTS idx_conversation_peer ON conversation_log(peer, created_at);
CREATE INDEX IF NOT EXISTS idx_evolutions_created ON evolutions(created_at);
"#;

/// Migration from version 1 to version 2.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE evolutions ADD COLUMN detail TEXT;
"#;
