//! Config file read/write with backup rotation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::schema::TubeLensConfig;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Number of rolling backups to keep.
const MAX_BACKUPS: usize = 3;

/// Resolve the TubeLens config directory.
/// Priority: `TUBELENS_CONFIG_DIR` env > `~/.tubelens/`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TUBELENS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".tubelens"),
        None => PathBuf::from(".tubelens"),
    }
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Load and parse the config from disk.
///
/// A missing file is a first run and yields the empty config.
pub async fn load_config(path: &Path) -> Result<TubeLensConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(TubeLensConfig::default());
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file parses as YAML null.
    if raw.trim().is_empty() {
        return Ok(TubeLensConfig::default());
    }

    let config: TubeLensConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Write config to disk through a temp file and rename, keeping a rolling
/// backup of the previous file.
pub async fn write_config(config: &TubeLensConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create config directory: {}", parent.display())
        })?;
    }

    if path.exists() {
        rotate_backups(path).await;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, yaml.as_bytes())
        .await
        .with_context(|| format!("Failed to write temp config: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp config to: {}", path.display()))?;

    info!(path = %path.display(), "Wrote config");
    Ok(())
}

/// config.yaml.bak.1 → .bak.2 → ... → .bak.N; failures only warn.
async fn rotate_backups(path: &Path) {
    for i in (1..MAX_BACKUPS).rev() {
        let old = path.with_extension(format!("yaml.bak.{}", i));
        let new = path.with_extension(format!("yaml.bak.{}", i + 1));
        if old.exists() {
            if let Err(e) = fs::rename(&old, &new).await {
                warn!("Failed to rotate backup {}: {}", old.display(), e);
            }
        }
    }

    let bak = path.with_extension("yaml.bak.1");
    if let Err(e) = fs::copy(path, &bak).await {
        warn!("Failed to create backup {}: {}", bak.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BudgetConfig;

    #[tokio::test]
    async fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config, TubeLensConfig::default());
    }

    #[tokio::test]
    async fn empty_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "\n").await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), TubeLensConfig::default());
    }

    #[tokio::test]
    async fn write_then_load_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_file_path(dir.path());

        let mut config = TubeLensConfig::default();
        write_config(&config, &path).await.unwrap();

        config.budget = Some(BudgetConfig {
            max_tool_calls: Some(12),
            ..Default::default()
        });
        write_config(&config, &path).await.unwrap();

        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.budget_caps().max_tool_calls, 12);
        assert!(path.with_extension("yaml.bak.1").exists());
    }

    #[tokio::test]
    async fn malformed_yaml_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "budget: not-a-map").await.unwrap();
        let err = load_config(&path).await.unwrap_err();
        assert!(format!("{:#}", err).contains("config.yaml"));
    }
}
