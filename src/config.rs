//! Layered configuration: built-in defaults, `~/.moat/config.toml`,
//! `MOAT_`-prefixed environment variables, then CLI flags — the same
//! precedence order the teacher's proxy config loader applies across its
//! credential sources, generalized here to the whole process config.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::paths;

/// Proxy listener and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the injection proxy listens on.
    pub bind_addr: String,
    /// How long the daemon stays up after its registry becomes empty.
    pub idle_timeout_s: u64,
    /// Per-connection read timeout.
    pub read_timeout_s: u64,
    /// Per-connection write timeout.
    pub write_timeout_s: u64,
    /// Upstream connect timeout.
    pub connect_timeout_s: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            idle_timeout_s: 300,
            read_timeout_s: 30,
            write_timeout_s: 30,
            connect_timeout_s: 10,
        }
    }
}

impl ProxyConfig {
    /// `idle_timeout_s` as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }
}

/// Which container runtime to use and how to stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Shell out to the `docker` CLI.
    Docker,
}

impl Default for RuntimeKind {
    fn default() -> Self {
        Self::Docker
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which backend to use.
    pub kind: RuntimeKind,
    /// Grace period between the stop signal and a forced kill.
    pub stop_grace_s: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            stop_grace_s: 10,
        }
    }
}

impl RuntimeConfig {
    /// `stop_grace_s` as a [`Duration`].
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_s)
    }
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `"info"` or `"moat=debug,warn"`.
    pub level: String,
    /// Emit JSON-formatted log lines instead of human-readable ones.
    pub json: bool,
    /// Optional file to additionally write logs to.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// The merged process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for all persisted state (default `~/.moat`).
    pub state_root: PathBuf,
    /// Injection proxy settings.
    pub proxy: ProxyConfig,
    /// Container runtime settings.
    pub runtime: RuntimeConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_root: paths::default_state_root(),
            proxy: ProxyConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load the config by merging, lowest to highest precedence: built-in
    /// defaults, `~/.moat/config.toml` (or the state root's `config.toml`
    /// once `state_root` is known from an earlier layer), then `MOAT_`
    /// environment variables. CLI flags are applied by the caller on top of
    /// the returned value.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        let config_path = paths::config_path(&config.state_root);
        if let Ok(contents) = std::fs::read_to_string(&config_path) {
            config = toml::from_str(&contents)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MOAT_STATE_ROOT") {
            self.state_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MOAT_PROXY_BIND_ADDR") {
            self.proxy.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MOAT_PROXY_IDLE_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                self.proxy.idle_timeout_s = n;
            }
        }
        if let Ok(v) = std::env::var("MOAT_RUNTIME_STOP_GRACE_S") {
            if let Ok(n) = v.parse() {
                self.runtime.stop_grace_s = n;
            }
        }
        if let Ok(v) = std::env::var("MOAT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("MOAT_LOG_JSON") {
            self.logging.json = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.proxy.idle_timeout_s, 300);
        assert_eq!(config.runtime.stop_grace_s, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("MOAT_LOG_LEVEL", "debug");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "debug");
        std::env::remove_var("MOAT_LOG_LEVEL");
    }

    #[test]
    fn toml_round_trips_through_serde() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.proxy.bind_addr, config.proxy.bind_addr);
    }
}
