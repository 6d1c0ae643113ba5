// Registry configuration

use crate::ufi::IdPolicy;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE: &str = "config.yaml";

/// Settings for the registry, read from YAML
///
/// Every key is optional; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base of the profile links encoded in QR codes
    pub origin: String,
    pub id_policy: IdPolicy,
    /// Fresh identifiers to try before giving up on a registration
    pub max_id_attempts: u32,
    /// Show the placeholder profile instead of reporting a miss
    pub placeholder_on_miss: bool,
    pub watch_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:5173".to_string(),
            id_policy: IdPolicy::Alphanumeric,
            max_id_attempts: 8,
            placeholder_on_miss: true,
            watch_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration for a store rooted at `store_root`
    ///
    /// An explicit path must exist. Otherwise the first of
    /// `<store_root>/.ufi/config.yaml` and `<user config dir>/ufi/config.yaml`
    /// that exists is used, falling back to defaults.
    pub fn load(explicit: Option<&Path>, store_root: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in Self::candidates(store_root) {
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn candidates(store_root: &Path) -> Vec<PathBuf> {
        let mut paths = vec![store_root.join(".ufi").join(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("ufi").join(CONFIG_FILE));
        }
        paths
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&content).with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = ?path, "Loaded config");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file deserializes as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(content).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.origin.trim().is_empty() {
            return Err(eyre!("origin cannot be empty"));
        }
        if self.max_id_attempts == 0 {
            return Err(eyre!("max_id_attempts must be at least 1"));
        }
        if self.watch_interval_ms == 0 {
            return Err(eyre!("watch_interval_ms must be at least 1"));
        }
        Ok(())
    }
}
