//! Process-level configuration (ambient — not a spec component, but every
//! component reads through this).
//!
//! Priority, highest to lowest: CLI flag / env var > `{home}/config.toml` >
//! built-in default. Mirrors the teacher's `DaemonConfig` layering.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_LOG: &str = "info";
const DEFAULT_BOOTSTRAP_MAX_CHARS: usize = 24_000;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 900;

/// `{home}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    bootstrap_max_chars: Option<usize>,
    provider_timeout_secs: Option<u64>,
    default_provider_id: Option<String>,
    openclaw_cmd: Option<String>,
    openclaw_arguments: Option<String>,
}

fn load_toml(home: &Path) -> Option<TomlConfig> {
    let path = home.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub home: PathBuf,
    pub log: String,
    /// Cap on concatenated bootstrap-file length injected as system prompt.
    pub bootstrap_max_chars: usize,
    /// Wall-clock budget for a provider CLI subprocess, in seconds.
    pub provider_timeout_secs: u64,
    pub default_provider_id: String,
    /// `OPENCLAW_CMD` default, overridden by the caller's env at invoke time.
    pub openclaw_cmd: String,
    pub openclaw_arguments: String,
}

impl DaemonConfig {
    /// Build config from CLI/env args layered over the TOML file.
    pub fn new(port: Option<u16>, home: Option<PathBuf>, log: Option<String>) -> Self {
        let home = home.unwrap_or_else(default_home);
        let toml = load_toml(&home).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| DEFAULT_LOG.to_string());
        let bootstrap_max_chars = toml
            .bootstrap_max_chars
            .unwrap_or(DEFAULT_BOOTSTRAP_MAX_CHARS);
        let provider_timeout_secs = std::env::var("OPENGOAT_PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(toml.provider_timeout_secs)
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS);
        let default_provider_id = toml
            .default_provider_id
            .unwrap_or_else(|| "openclaw".to_string());
        let openclaw_cmd = std::env::var("OPENCLAW_CMD")
            .ok()
            .or(toml.openclaw_cmd)
            .unwrap_or_else(|| "openclaw".to_string());
        let openclaw_arguments = std::env::var("OPENCLAW_ARGUMENTS")
            .ok()
            .or(toml.openclaw_arguments)
            .unwrap_or_default();

        Self {
            port,
            home,
            log,
            bootstrap_max_chars,
            provider_timeout_secs,
            default_provider_id,
            openclaw_cmd,
            openclaw_arguments,
        }
    }
}

pub fn default_home() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("opengoat");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("opengoat");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("opengoat");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("opengoat");
        }
    }
    PathBuf::from(".opengoat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_override_toml_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9000\nlog = \"debug\"\n").unwrap();

        let cfg = DaemonConfig::new(Some(4400), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 4400);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn defaults_apply_with_no_toml_and_no_cli() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.log, DEFAULT_LOG);
        assert_eq!(cfg.default_provider_id, "openclaw");
    }
}
