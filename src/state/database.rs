//! SQLite database wrapper with WAL mode and migration support.

use crate::state::schema;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

/// The warden state database.
pub struct Database {
    conn: Connection,
}

/// Fixed-width timestamps so string comparison matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Both processes (worker and supervisor) may touch the file.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema creation and migrations.
    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating database schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else if version < schema::SCHEMA_VERSION {
            if version < 2 {
                info!("Migrating database v1 -> v2");
                self.conn.execute_batch(schema::MIGRATE_V1_TO_V2)?;
            }
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Key-value store
    // -----------------------------------------------------------------------

    /// Get a value from the KV store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a value in the KV store (upsert).
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete a key from the KV store.
    pub fn kv_delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Permissions
    // -----------------------------------------------------------------------

    /// Grant (or overwrite) a role for a display name.
    pub fn set_permission(&self, name: &str, role: RoleLevel, granted_by: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_permissions (name, level, granted_by, granted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET level = ?2, granted_by = ?3, granted_at = ?4",
            params![name, role.level(), granted_by, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Explicit grant for a display name, if any.
    pub fn permission_for(&self, name: &str) -> Result<Option<RoleLevel>> {
        let level: Option<i64> = self
            .conn
            .query_row(
                "SELECT level FROM user_permissions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(level.and_then(RoleLevel::from_level))
    }

    /// All grants, highest role first.
    pub fn list_permissions(&self) -> Result<Vec<(String, RoleLevel)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, level FROM user_permissions ORDER BY level DESC, name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut grants = Vec::new();
        for row in rows {
            let (name, level) = row?;
            if let Some(role) = RoleLevel::from_level(level) {
                grants.push((name, role));
            }
        }
        Ok(grants)
    }

    // -----------------------------------------------------------------------
    // Group allow-list
    // -----------------------------------------------------------------------

    pub fn allow_group(&self, name: &str, allow_guest: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO group_allowlist (name, allow_guest, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET allow_guest = ?2",
            params![name, allow_guest as i32, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Whether members of this group may chat as guests.
    pub fn group_allows_guests(&self, name: &str) -> Result<bool> {
        let allowed: Option<i32> = self
            .conn
            .query_row(
                "SELECT allow_guest FROM group_allowlist WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(allowed.unwrap_or(0) != 0)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log (id, actor, command, action, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.actor,
                entry.command,
                entry.action,
                entry.outcome.to_string(),
                ts(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, actor, command, action, outcome, created_at FROM audit_log
             ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, actor, command, action, outcome, created_at) = row?;
            entries.push(AuditEntry {
                id,
                actor,
                command,
                action,
                outcome: outcome.parse()?,
                timestamp: parse_ts(&created_at),
            });
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Conversation memory
    // -----------------------------------------------------------------------

    pub fn append_conversation(&self, peer: &str, role: ChatRole, content: &str) -> Result<()> {
        let id = ulid::Ulid::new().to_string();
        self.conn.execute(
            "INSERT INTO conversation_log (id, peer, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, peer, role.to_string(), content, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Last `limit` lines with a peer, oldest first.
    pub fn recent_conversation(&self, peer: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content FROM conversation_log WHERE peer = ?1
             ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![peer, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row?;
            messages.push(ChatMessage::new(role.parse()?, content));
        }
        messages.reverse();
        Ok(messages)
    }

    /// Every line since the given instant, oldest first.
    pub fn conversation_since(&self, since: DateTime<Utc>) -> Result<Vec<ConversationTurn>> {
        let mut stmt = self.conn.prepare(
            "SELECT peer, role, content, created_at FROM conversation_log
             WHERE created_at >= ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![ts(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (peer, role, content, created_at) = row?;
            turns.push(ConversationTurn {
                peer,
                role: role.parse()?,
                content,
                created_at: parse_ts(&created_at),
            });
        }
        Ok(turns)
    }

    // -----------------------------------------------------------------------
    // Evolutions
    // -----------------------------------------------------------------------

    pub fn insert_evolution(&self, record: &EvolutionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO evolutions
                (id, target_path, reason, requested_by, notify, stage, commit_id, detail,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.target_path,
                record.reason,
                record.requested_by,
                record.notify,
                record.stage.to_string(),
                record.commit_id,
                record.detail,
                ts(record.created_at),
                ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Persist the stage, commit id and detail of an existing record.
    pub fn update_evolution(&self, record: &EvolutionRecord) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE evolutions SET stage = ?2, commit_id = ?3, detail = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                record.id,
                record.stage.to_string(),
                record.commit_id,
                record.detail,
                ts(record.updated_at),
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("No evolution record with id {}", record.id);
        }
        Ok(())
    }

    pub fn get_evolution(&self, id: &str) -> Result<Option<EvolutionRecord>> {
        Ok(self
            .query_evolutions("WHERE id = ?1", params![id])?
            .into_iter()
            .next())
    }

    /// Newest records first.
    pub fn recent_evolutions(&self, limit: usize) -> Result<Vec<EvolutionRecord>> {
        self.query_evolutions(
            "ORDER BY rowid DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Latest record in the given stage.
    pub fn latest_evolution_in(&self, stage: EvolutionStage) -> Result<Option<EvolutionRecord>> {
        Ok(self
            .query_evolutions(
                "WHERE stage = ?1 ORDER BY rowid DESC LIMIT 1",
                params![stage.to_string()],
            )?
            .into_iter()
            .next())
    }

    fn query_evolutions(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<EvolutionRecord>> {
        let sql = format!(
            "SELECT id, target_path, reason, requested_by, notify, stage, commit_id, detail,
                    created_at, updated_at
             FROM evolutions {}",
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                (
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ),
                (
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ),
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                (id, target_path, reason, requested_by, notify),
                (stage, commit_id, detail, created_at, updated_at),
            ) = row?;
            records.push(EvolutionRecord {
                id,
                target_path,
                reason,
                requested_by,
                notify,
                stage: stage.parse()?,
                commit_id,
                detail,
                created_at: parse_ts(&created_at),
                updated_at: parse_ts(&updated_at),
            });
        }
        Ok(records)
    }
}
