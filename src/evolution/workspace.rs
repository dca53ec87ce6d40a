//! Workspace files the worker reads when it starts.
//!
//! The system prompt is seeded from the config on first use. From then on
//! the committed copy wins, so an accepted evolution takes effect on the
//! next start and a rollback brings the previous prompt back.

use crate::config::WardenConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

pub fn system_prompt_path(config: &WardenConfig) -> PathBuf {
    PathBuf::from(config.resolved_repo_dir()).join(&config.evolution.system_prompt_path)
}

/// Write `reasoning.system_prompt` into the workspace unless a prompt file
/// already exists. Returns whether a file was written.
pub fn seed(config: &WardenConfig) -> Result<bool> {
    let path = system_prompt_path(config);
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, format!("{}\n", config.reasoning.system_prompt.trim()))
        .with_context(|| format!("Failed to seed {}", path.display()))?;
    info!("Seeded system prompt at {}", path.display());
    Ok(true)
}

/// The system prompt for this worker generation.
pub fn load_system_prompt(config: &WardenConfig) -> Result<String> {
    let path = system_prompt_path(config);
    match std::fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Ok(_) => {
            debug!("{} is empty, using configured prompt", path.display());
            Ok(config.reasoning.system_prompt.clone())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(config.reasoning.system_prompt.clone())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> WardenConfig {
        let mut config = WardenConfig::default();
        config.evolution.repo_dir = dir.to_string_lossy().into_owned();
        config.reasoning.system_prompt = "Be kind.".into();
        config
    }

    #[test]
    fn missing_file_falls_back_to_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_system_prompt(&config(dir.path())).unwrap(), "Be kind.");
    }

    #[test]
    fn seed_writes_once_and_workspace_copy_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(seed(&config).unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("prompts/system.md")).unwrap(),
            "Be kind.\n"
        );

        std::fs::write(dir.path().join("prompts/system.md"), "Be brief.\n").unwrap();
        assert!(!seed(&config).unwrap());
        assert_eq!(load_system_prompt(&config).unwrap(), "Be brief.");
    }
}
