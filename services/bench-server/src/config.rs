//! Server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides except
//! `LOG_LEVEL` for the tracing filter, handled in `main`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub sqlite_path: String,
    pub poll: PollConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub debounce_ms: u64,
    pub error_threshold: u32,
    pub history_retention_ticks: usize,
    pub status_refresh_ticks: u32,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub candidate_ports: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    sqlite_path: Option<String>,
    poll: Option<RawPollConfig>,
    discovery: Option<RawDiscoveryConfig>,
}

#[derive(Debug, Deserialize)]
struct RawPollConfig {
    interval_ms: Option<u64>,
    debounce_ms: Option<u64>,
    error_threshold: Option<u32>,
    history_retention_ticks: Option<usize>,
    status_refresh_ticks: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryConfig {
    candidate_ports: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(String),
    #[error("parsing TOML: {0}")]
    Parse(String),
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Loads from `BENCH_SERVER_CONFIG` if set, else the conventional system path.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    let path = std::env::var("BENCH_SERVER_CONFIG").unwrap_or_else(|_| "/etc/bench-server/config.toml".to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let poll = match raw.poll {
        Some(p) => PollConfig {
            interval_ms: p.interval_ms.unwrap_or(250),
            debounce_ms: p.debounce_ms.unwrap_or(250),
            error_threshold: p.error_threshold.unwrap_or(3),
            history_retention_ticks: p.history_retention_ticks.unwrap_or(7200),
            status_refresh_ticks: p.status_refresh_ticks.unwrap_or(4),
        },
        None => PollConfig {
            interval_ms: 250,
            debounce_ms: 250,
            error_threshold: 3,
            history_retention_ticks: 7200,
            status_refresh_ticks: 4,
        },
    };

    let discovery = DiscoveryConfig {
        candidate_ports: raw.discovery.and_then(|d| d.candidate_ports).unwrap_or_default(),
    };

    Ok(ServerConfig {
        bind: raw.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        sqlite_path: raw.sqlite_path.unwrap_or_else(|| "bench-server.sqlite3".to_owned()),
        poll,
        discovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_absent() {
        let cfg = load_config_from_str("bind = \"127.0.0.1:9000\"\nsqlite_path = \"db.sqlite3\"\n").unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.poll.interval_ms, 250);
        assert_eq!(cfg.poll.error_threshold, 3);
        assert!(cfg.discovery.candidate_ports.is_empty());
    }

    #[test]
    fn explicit_poll_section_overrides_defaults() {
        let toml_str = r#"
            bind = "0.0.0.0:8080"
            sqlite_path = "bench.sqlite3"
            [poll]
            interval_ms = 100
            error_threshold = 5
            [discovery]
            candidate_ports = ["/dev/ttyUSB0", "/dev/ttyUSB1"]
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.poll.interval_ms, 100);
        assert_eq!(cfg.poll.error_threshold, 5);
        assert_eq!(cfg.discovery.candidate_ports.len(), 2);
    }

    #[test]
    fn invalid_toml_is_rejected() {
        let result = load_config_from_str("not valid toml {{{");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
