use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::config;

pub const LOG_ENV: &str = "CALNOTES_LOG";
const LOG_FILE: &str = "calnotes.log";

/// Send `tracing` output to `~/.calnotes/logs/calnotes.log`, keeping the
/// previous run's log as `calnotes.log.old`. Verbosity comes from
/// `CALNOTES_LOG` (an `EnvFilter` directive), `info` by default.
pub fn init() -> Result<PathBuf> {
    let log_dir = config::get_config_dir().join("logs");
    let log_path = open_rotated(&log_dir)?;

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let file = options
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {}", e))?;

    Ok(log_path)
}

/// Create `log_dir`, move an existing log aside and return the fresh path.
fn open_rotated(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join(LOG_FILE);
    if log_path.exists() {
        let old_path = log_dir.join(format!("{}.old", LOG_FILE));
        if old_path.exists() {
            let _ = fs::remove_file(&old_path);
        }
        let _ = fs::rename(&log_path, old_path);
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_one_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let path = open_rotated(&logs).unwrap();
        fs::write(&path, "first run").unwrap();

        let path = open_rotated(&logs).unwrap();
        assert!(!path.exists());
        fs::write(&path, "second run").unwrap();

        open_rotated(&logs).unwrap();
        let old = fs::read_to_string(logs.join("calnotes.log.old")).unwrap();
        assert_eq!(old, "second run");
    }
}
