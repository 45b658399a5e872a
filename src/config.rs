//! Runtime settings.
//!
//! Read once at startup from a TOML file. A missing file at the default
//! location means "use defaults"; a missing file that was asked for
//! explicitly, or any parse error, is fatal.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/isoboot/isoboot.toml";
pub const DEFAULT_CATALOG_PATH: &str = "/etc/isoboot/distros.json";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Distribution catalog (JSON).
    pub catalog_path: PathBuf,
    /// Directory holding downloaded and pre-seeded images.
    pub cache_dir: PathBuf,
    /// Filesystem type passed to `mount -t`.
    pub mount_fstype: String,
    /// Keys copied from the running kernel's command line into the new one.
    pub inherit_params: Vec<String>,
    /// Overall download deadline in seconds.
    pub download_deadline_secs: u64,
    /// Per-mirror connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
            cache_dir: default_cache_dir(),
            mount_fstype: "iso9660".to_string(),
            inherit_params: Vec::new(),
            download_deadline_secs: 30 * 60,
            connect_timeout_secs: 15,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("isoboot"))
        .unwrap_or_else(|| PathBuf::from("/var/cache/isoboot"))
}

/// Load settings from `path`, or from [`DEFAULT_SETTINGS_PATH`] when `None`.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (config_path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_SETTINGS_PATH), false),
    };

    if !required && !config_path.is_file() {
        tracing::debug!(
            "no settings at '{}', using defaults",
            config_path.display()
        );
        return Ok(Settings::default());
    }

    let raw = fs::read_to_string(&config_path)
        .with_context(|| format!("reading settings '{}'", config_path.display()))?;
    parse_settings(&raw).with_context(|| format!("parsing settings '{}'", config_path.display()))
}

pub fn parse_settings(raw: &str) -> Result<Settings> {
    let mut settings: Settings = toml::from_str(raw)?;
    settings.mount_fstype = settings.mount_fstype.trim().to_string();
    if settings.mount_fstype.is_empty() {
        anyhow::bail!("mount_fstype must not be empty");
    }
    if settings.connect_timeout_secs == 0 {
        anyhow::bail!("connect_timeout_secs must be at least 1");
    }
    settings.inherit_params = settings
        .inherit_params
        .into_iter()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect();
    Ok(settings)
}
