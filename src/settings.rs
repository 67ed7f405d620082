use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_DIR_NAME: &str = "studybuddy";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Overrides `api_url` when set and non-empty.
pub const API_URL_ENV: &str = "STUDYBUDDY_API_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the correction service, without trailing slash.
    pub api_url: String,

    /// Time allowed to establish the TCP/TLS connection.
    pub connect_timeout_secs: u64,

    /// Longest silence tolerated between two chunks of a streamed answer.
    /// 0 disables the check.
    pub stall_timeout_secs: u64,

    /// Number of corrections kept in the local history.
    pub history_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            connect_timeout_secs: 10,
            stall_timeout_secs: 90,
            history_limit: 100,
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
    }

    /// `api_url` without trailing slashes
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    /// Apply environment overrides on top of file/default values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.api_url = url.to_string();
            }
        }
        self
    }
}

pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir()
        .ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

/// Load from `path` (or the default location) and apply env overrides.
pub fn resolve_settings(path: Option<&Path>) -> ClientSettings {
    let settings = match path {
        Some(p) => load_settings(p),
        None => match default_settings_path() {
            Ok(p) => load_settings(&p),
            Err(e) => {
                log::warn!("Settings: {}", e);
                ClientSettings::default()
            }
        },
    };
    settings.with_env_overrides()
}

pub fn save_settings(path: &Path, settings: &ClientSettings) -> Result<(), String> {
    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;
    write_atomically(path, &contents)
}

/// Write to a temp file next to `path`, then rename over it, so a crash
/// mid-write never leaves a truncated file behind.
pub(crate) fn write_atomically(path: &Path, contents: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory {:?}: {}", parent, e))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)
        .map_err(|e| format!("Write temp file {:?}: {}", tmp_path, e))?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
