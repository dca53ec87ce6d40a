//! Self-evolution pipeline.
//!
//! A proposed change moves through
//! `Proposed -> SyntaxValidated -> Written -> Committed -> ReloadRequested`
//! and ends as `Reloaded` or `RolledBack` once the supervisor has acted.
//! Forbidden or escaping paths and structurally invalid content are
//! rejected before anything touches the workspace.

pub mod notify;
pub mod validate;
pub mod workspace;

pub use notify::PendingNotification;

use crate::audit::AuditLog;
use crate::config::WardenConfig;
use crate::git_ops::VersionControl;
use crate::state::Database;
use crate::types::{AuditOutcome, EvolutionRecord, EvolutionStage};
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("path is forbidden: {0}")]
    ForbiddenPath(String),
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),
    #[error("invalid structure in {path}: {reason}")]
    InvalidStructure { path: String, reason: String },
    #[error("illegal stage transition {from} -> {to}")]
    InvalidTransition {
        from: EvolutionStage,
        to: EvolutionStage,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("version control error: {0}")]
    VersionControl(anyhow::Error),
    #[error("state store error: {0}")]
    Store(anyhow::Error),
}

impl EvolutionError {
    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::ForbiddenPath(_) | Self::PathEscape(_) | Self::InvalidTransition { .. } => {
                AuditOutcome::Denied
            }
            _ => AuditOutcome::Fail,
        }
    }
}

/// A change the reasoning backend wants to make.
#[derive(Debug, Clone)]
pub struct EvolutionProposal {
    /// Path relative to the workspace root.
    pub path: String,
    pub content: String,
    pub reason: String,
}

/// Move `record` to `next` if the state machine allows it.
pub fn advance(record: &mut EvolutionRecord, next: EvolutionStage) -> Result<(), EvolutionError> {
    if !record.stage.can_advance_to(next) {
        return Err(EvolutionError::InvalidTransition {
            from: record.stage,
            to: next,
        });
    }
    record.stage = next;
    record.updated_at = Utc::now();
    Ok(())
}

/// Move the newest record found in one of `from` to `to`.
fn latest_in(
    db: &Database,
    from: &[EvolutionStage],
) -> anyhow::Result<Option<EvolutionRecord>> {
    let mut latest: Option<EvolutionRecord> = None;
    for stage in from {
        if let Some(record) = db.latest_evolution_in(*stage)? {
            if latest
                .as_ref()
                .map_or(true, |l| record.created_at > l.created_at)
            {
                latest = Some(record);
            }
        }
    }
    Ok(latest)
}

pub fn mark_latest(
    db: &Database,
    from: &[EvolutionStage],
    to: EvolutionStage,
    detail: Option<&str>,
) -> anyhow::Result<Option<EvolutionRecord>> {
    let Some(mut record) = latest_in(db, from)? else {
        return Ok(None);
    };
    advance(&mut record, to)?;
    if let Some(detail) = detail {
        record.detail = Some(detail.to_string());
    }
    db.update_evolution(&record)?;
    Ok(Some(record))
}

/// Attach `detail` to the newest record in one of `from` without moving it.
pub fn annotate_latest(
    db: &Database,
    from: &[EvolutionStage],
    detail: &str,
) -> anyhow::Result<Option<EvolutionRecord>> {
    let Some(mut record) = latest_in(db, from)? else {
        return Ok(None);
    };
    record.detail = Some(detail.to_string());
    db.update_evolution(&record)?;
    Ok(Some(record))
}

pub struct EvolutionPipeline {
    repo_dir: PathBuf,
    forbidden: Vec<String>,
    commit_prefix: String,
    pending_path: PathBuf,
    vcs: Arc<dyn VersionControl>,
    db: Arc<Mutex<Database>>,
    audit: AuditLog,
    /// The one change allowed per restart cycle.
    in_flight: Mutex<Option<EvolutionRecord>>,
}

impl EvolutionPipeline {
    pub fn new(
        config: &WardenConfig,
        vcs: Arc<dyn VersionControl>,
        db: Arc<Mutex<Database>>,
        audit: AuditLog,
    ) -> Self {
        Self {
            repo_dir: PathBuf::from(config.resolved_repo_dir()),
            forbidden: config
                .evolution
                .forbidden_paths
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            commit_prefix: config.evolution.commit_prefix.clone(),
            pending_path: PathBuf::from(config.resolved_pending_path()),
            vcs,
            db,
            audit,
            in_flight: Mutex::new(None),
        }
    }

    pub fn pending_path(&self) -> &Path {
        &self.pending_path
    }

    /// Normalize `path` to a workspace-relative path and check it against
    /// the deny list.
    pub fn resolve_target(&self, path: &str) -> Result<PathBuf, EvolutionError> {
        let raw = Path::new(path.trim());
        let relative = if raw.is_absolute() {
            raw.strip_prefix(&self.repo_dir)
                .map_err(|_| EvolutionError::PathEscape(path.to_string()))?
        } else {
            raw
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(EvolutionError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EvolutionError::PathEscape(path.to_string()))
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(EvolutionError::PathEscape(path.to_string()));
        }

        let parts: Vec<String> = normalized
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
            .collect();
        let dirs = &parts[..parts.len() - 1];
        for fragment in &self.forbidden {
            let hit = match fragment.strip_suffix('/') {
                Some(dir) => dirs.iter().any(|d| d == dir),
                None => parts.iter().any(|p| p.contains(fragment.as_str())),
            };
            if hit {
                return Err(EvolutionError::ForbiddenPath(path.to_string()));
            }
        }
        Ok(normalized)
    }

    async fn save(&self, record: &EvolutionRecord, insert: bool) -> Result<(), EvolutionError> {
        let db = self.db.lock().await;
        let result = if insert {
            db.insert_evolution(record)
        } else {
            db.update_evolution(record)
        };
        result.map_err(EvolutionError::Store)
    }

    async fn reject(&self, mut record: EvolutionRecord, err: EvolutionError) -> EvolutionError {
        let inserted = record.stage != EvolutionStage::Proposed;
        if advance(&mut record, EvolutionStage::Rejected).is_ok() {
            record.detail = Some(err.to_string());
            if let Err(e) = self.save(&record, !inserted).await {
                warn!("Failed to record rejected evolution: {}", e);
            }
        }
        warn!(path = %record.target_path, "Evolution rejected: {}", err);
        self.audit
            .record(
                &record.requested_by,
                &format!("evolve_code {}", record.target_path),
                Some(&err.to_string()),
                err.audit_outcome(),
            )
            .await;
        err
    }

    /// Validate, write and commit one proposed change.
    pub async fn propose(
        &self,
        proposal: &EvolutionProposal,
        requested_by: &str,
        notify: Option<String>,
    ) -> Result<EvolutionRecord, EvolutionError> {
        let mut in_flight = self.in_flight.lock().await;
        let record = EvolutionRecord::new(&proposal.path, &proposal.reason, requested_by, notify);

        if let Some(current) = in_flight.as_ref() {
            let err = EvolutionError::InvalidTransition {
                from: current.stage,
                to: EvolutionStage::Proposed,
            };
            return Err(self.reject(record, err).await);
        }

        let relative = match self.resolve_target(&proposal.path) {
            Ok(p) => p,
            Err(e) => return Err(self.reject(record, e).await),
        };
        if let Err(reason) = validate::check_structure(&relative, &proposal.content) {
            let err = EvolutionError::InvalidStructure {
                path: proposal.path.clone(),
                reason,
            };
            return Err(self.reject(record, err).await);
        }

        let mut record = record;
        advance(&mut record, EvolutionStage::SyntaxValidated)?;
        self.save(&record, true).await?;

        let absolute = self.repo_dir.join(&relative);
        let written = async {
            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&absolute, &proposal.content).await
        }
        .await;
        if let Err(e) = written {
            record.detail = Some(format!("write failed: {}", e));
            self.save(&record, false).await?;
            return Err(EvolutionError::Io(e));
        }
        advance(&mut record, EvolutionStage::Written)?;
        self.save(&record, false).await?;

        let message = format!("{} {}", self.commit_prefix, proposal.reason);
        let vcs = self.vcs.clone();
        let paths = vec![relative.clone()];
        let committed = tokio::task::spawn_blocking(move || vcs.commit(&paths, &message))
            .await
            .map_err(|e| EvolutionError::VersionControl(anyhow::Error::new(e)))
            .and_then(|r| r.map_err(EvolutionError::VersionControl));
        let commit_id = match committed {
            Ok(id) => id,
            Err(e) => {
                record.detail = Some(e.to_string());
                self.save(&record, false).await?;
                self.audit
                    .record(
                        requested_by,
                        &format!("evolve_code {}", proposal.path),
                        Some(&e.to_string()),
                        AuditOutcome::Fail,
                    )
                    .await;
                return Err(e);
            }
        };

        record.commit_id = commit_id.clone();
        if commit_id.is_none() {
            record.detail = Some("no changes".into());
        }
        advance(&mut record, EvolutionStage::Committed)?;
        self.save(&record, false).await?;

        let action = match &commit_id {
            Some(id) => format!("committed {} as {}", relative.display(), id),
            None => format!("{} unchanged", relative.display()),
        };
        info!(path = %relative.display(), "Evolution {}", action);
        self.audit
            .record(
                requested_by,
                &format!("evolve_code {}", proposal.path),
                Some(&action),
                AuditOutcome::Success,
            )
            .await;

        *in_flight = Some(record.clone());
        Ok(record)
    }

    /// Persist the pending notification and mark the in-flight change as
    /// waiting for reload. The caller then exits with the hot-reload code.
    pub async fn request_reload(
        &self,
        reason: &str,
        target: Option<String>,
        requested_by: &str,
    ) -> Result<PendingNotification, EvolutionError> {
        let mut in_flight = self.in_flight.lock().await;

        let pending = PendingNotification::new(reason, target);
        notify::write_pending(&self.pending_path, &pending).map_err(EvolutionError::Store)?;

        if let Some(record) = in_flight.as_mut() {
            if record.stage == EvolutionStage::Committed {
                advance(record, EvolutionStage::ReloadRequested)?;
                self.save(record, false).await?;
            }
        }

        self.audit
            .record(
                requested_by,
                "request_hot_reload",
                Some(reason),
                AuditOutcome::Success,
            )
            .await;
        Ok(pending)
    }
}
