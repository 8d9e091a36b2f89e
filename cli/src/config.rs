use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use nibble_core::config::StoreConfig;
use nibble_core::models::{GoalConfiguration, UserId};

const DEFAULT_USER: &str = "local";

/// Settings persisted in `config.json`. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<GoalConfiguration>,
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub file: FileConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "nibble").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir())
    }

    /// Load (or initialise) the configuration rooted at `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let config_path = data_dir.join("config.json");
        let file = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config file: {}", config_path.display()))?
        } else {
            FileConfig::default()
        };

        let db_path = data_dir.join("nibble.db");

        Ok(Config {
            db_path,
            data_dir,
            file,
        })
    }

    pub fn save(&self) -> Result<()> {
        let path = self.data_dir.join("config.json");
        let raw = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Store location and credentials, with `NIBBLE_URL` / `NIBBLE_API_KEY` taking precedence.
    pub fn store_config(&self) -> StoreConfig {
        self.store_config_with(|key| std::env::var(key).ok())
    }

    fn store_config_with(&self, env: impl Fn(&str) -> Option<String>) -> StoreConfig {
        let url = env("NIBBLE_URL")
            .or_else(|| self.file.store_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}", self.db_path.display()));
        let api_key = env("NIBBLE_API_KEY").or_else(|| self.file.api_key.clone());
        StoreConfig::new(url, api_key)
    }

    pub fn user(&self) -> UserId {
        self.user_with(|key| std::env::var(key).ok())
    }

    fn user_with(&self, env: impl Fn(&str) -> Option<String>) -> UserId {
        let id = env("NIBBLE_USER")
            .or_else(|| self.file.user_id.clone())
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        UserId::new(id.trim())
    }

    pub fn goal(&self) -> Option<&GoalConfiguration> {
        self.file.goal.as_ref()
    }

    /// Ids of achievements already shown to the user.
    pub fn load_achievements(&self) -> Result<BTreeSet<String>> {
        let path = self.data_dir.join("achievements.json");
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn save_achievements(&self, unlocked: &BTreeSet<String>) -> Result<()> {
        let path = self.data_dir.join("achievements.json");
        std::fs::write(&path, serde_json::to_string_pretty(unlocked)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Set NIBBLE_API_KEY={key} on clients");
        Ok((key, true))
    }
}
