use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::autosave::{DebounceConfig, InFlightPolicy, DEFAULT_QUIET_PERIOD};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const API_URL_ENV: &str = "CALNOTES_API_URL";
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Attempts per request on transport errors and 5xx responses.
    pub max_attempts: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 10,
            max_attempts: 1,
        }
    }
}

impl GeneralConfig {
    /// Base URL with the environment override applied.
    pub fn api_base_url(&self) -> String {
        resolve_api_base_url(&self.api_base_url, std::env::var(API_URL_ENV).ok())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AutosaveConfig {
    pub debounce_ms: u64,
    pub abort_in_flight_on_teardown: bool,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_QUIET_PERIOD.as_millis() as u64,
            abort_in_flight_on_teardown: false,
        }
    }
}

impl AutosaveConfig {
    pub fn debounce_config(&self) -> DebounceConfig {
        DebounceConfig {
            quiet_period: Duration::from_millis(self.debounce_ms),
            in_flight: if self.abort_in_flight_on_teardown {
                InFlightPolicy::Abort
            } else {
                InFlightPolicy::Complete
            },
        }
    }
}

fn resolve_api_base_url(configured: &str, env_override: Option<String>) -> String {
    let url = env_override
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| configured.to_string());
    url.trim().trim_end_matches('/').to_string()
}

pub fn get_config_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".calnotes");
    path
}

pub fn config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

pub fn load_config() -> AppConfig {
    load_config_from(&config_path())
}

/// Load the config at `path`, writing the defaults there if it is missing.
/// A file that fails to parse is moved aside to `config.toml.bak`.
pub fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        let default_config = AppConfig::default();
        if let Err(e) = save_config_to(path, &default_config) {
            tracing::warn!("Failed to write default config: {:#}", e);
        }
        return default_config;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to parse config.toml: {}.", e);
                let backup_path = path.with_extension("toml.bak");
                if let Err(backup_err) = fs::rename(path, &backup_path) {
                    eprintln!("Failed to backup corrupted config: {}", backup_err);
                } else {
                    eprintln!("Corrupted config backed up to {:?}", backup_path);
                }
                eprintln!("Using default configuration.");
                AppConfig::default()
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file: {}. Using default.", e);
            AppConfig::default()
        }
    }
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    write_private(path, toml_str.as_bytes())
}

pub fn set_api_base_url(url: &str) -> anyhow::Result<()> {
    let path = config_path();
    let mut config = load_config_from(&path);
    config.general.api_base_url = url.trim().trim_end_matches('/').to_string();
    save_config_to(&path, &config)
}

/// Write `contents` to `path`, creating parent directories, readable by the
/// owner only on unix.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_config_from(&path);
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let written: AppConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.autosave.debounce_ms, 5000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[autosave]\ndebounce_ms = 750\n").unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.autosave.debounce_ms, 750);
        assert!(!config.autosave.abort_in_flight_on_teardown);
        assert_eq!(config.general, GeneralConfig::default());
    }

    #[test]
    fn corrupt_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[general\napi_base_url = ").unwrap();

        let config = load_config_from(&path);
        assert_eq!(config, AppConfig::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.toml.bak").exists());
    }

    #[test]
    fn autosave_section_maps_to_debounce_config() {
        let autosave = AutosaveConfig {
            debounce_ms: 250,
            abort_in_flight_on_teardown: true,
        };
        let debounce = autosave.debounce_config();
        assert_eq!(debounce.quiet_period, Duration::from_millis(250));
        assert_eq!(debounce.in_flight, InFlightPolicy::Abort);
        assert_eq!(
            AutosaveConfig::default().debounce_config(),
            DebounceConfig::default()
        );
    }

    #[test]
    fn env_override_wins_and_trailing_slash_is_dropped() {
        assert_eq!(
            resolve_api_base_url("http://localhost:8000/", None),
            "http://localhost:8000"
        );
        assert_eq!(
            resolve_api_base_url("http://localhost:8000", Some("https://notes.example/".into())),
            "https://notes.example"
        );
        assert_eq!(
            resolve_api_base_url("http://localhost:8000", Some("  ".into())),
            "http://localhost:8000"
        );
    }
}
