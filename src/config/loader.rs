//! Locating, loading, and saving the configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use super::schema::Config;

/// Root directory for config and data (`~/.slotwatch`).
pub fn get_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slotwatch")
}

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    get_home_dir().join("config.json")
}

/// Data directory, honoring the config override.
pub fn get_data_dir(config: &Config) -> PathBuf {
    match config.data_dir.as_deref() {
        Some(dir) if !dir.is_empty() => expand_home(dir),
        _ => get_home_dir().join("data"),
    }
}

/// Path of the JSON file backing the key-value store.
pub fn get_store_path(config: &Config) -> PathBuf {
    get_data_dir(config).join("store.json")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load config from `path` (or the default path).
///
/// A missing file yields the defaults; an unreadable one is logged and also
/// yields the defaults so the CLI stays usable.
pub fn load_config(path: Option<&Path>) -> Config {
    let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
    if !path.exists() {
        return Config::default();
    }
    match read_config(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config from {}: {:#}", path.display(), e);
            Config::default()
        }
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Write config to `path` (or the default path), creating parent directories.
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
