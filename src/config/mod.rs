pub mod schema;

pub use schema::WardenConfig;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default warden home directory (~/.warden).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".warden"))
        .unwrap_or_else(|| PathBuf::from(".warden"))
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    default_home_dir().join("warden.toml")
}

/// Load config from the given path, or return defaults.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read warden config file")?;
        let config: WardenConfig =
            toml::from_str(&contents).context("Failed to parse warden config (TOML)")?;
        Ok(config)
    } else {
        Ok(WardenConfig::default())
    }
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &WardenConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}
