//! Configuration management for the engine.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observation: ObservationConfig,

    #[serde(default)]
    pub reporting: ReportingConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the daemon is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unix socket the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

/// Timing of the in-page watch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Baseline debounce window for mutation-triggered passes
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Debounce window used when a pass ran within this long
    #[serde(default = "default_report_cooldown")]
    pub report_cooldown_ms: u64,

    /// Delay before re-evaluating after the page becomes visible
    #[serde(default = "default_visibility_delay")]
    pub visibility_delay_ms: u64,

    /// Delay before re-evaluating after the page gains focus
    #[serde(default = "default_focus_delay")]
    pub focus_delay_ms: u64,

    /// Quick scan after the Detector starts
    #[serde(default = "default_initial_scan_delay")]
    pub initial_scan_delay_ms: u64,

    /// Scan this long after the page finished loading
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Settled scan fallback when no load signal arrives
    #[serde(default = "default_load_fallback")]
    pub load_fallback_ms: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            report_cooldown_ms: default_report_cooldown(),
            visibility_delay_ms: default_visibility_delay(),
            focus_delay_ms: default_focus_delay(),
            initial_scan_delay_ms: default_initial_scan_delay(),
            settle_delay_ms: default_settle_delay(),
            load_fallback_ms: default_load_fallback(),
        }
    }
}

impl ObservationConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn report_cooldown(&self) -> Duration {
        Duration::from_millis(self.report_cooldown_ms)
    }

    pub fn visibility_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_delay_ms)
    }

    pub fn focus_delay(&self) -> Duration {
        Duration::from_millis(self.focus_delay_ms)
    }

    pub fn initial_scan_delay(&self) -> Duration {
        Duration::from_millis(self.initial_scan_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn load_fallback(&self) -> Duration {
        Duration::from_millis(self.load_fallback_ms)
    }
}

/// How many candidates a Detector reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPolicy {
    /// Report only the top-ranked candidate (count is 0 or 1)
    #[default]
    BestOnly,
    /// Report every candidate
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default)]
    pub policy: ReportPolicy,

    /// Send a report after every pass, even if the status did not change
    #[serde(default = "default_true")]
    pub report_unchanged: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            policy: ReportPolicy::default(),
            report_unchanged: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Minimum time between forwarded rescans for one tab
    #[serde(default = "default_rescan_cooldown")]
    pub rescan_cooldown_ms: u64,

    /// Upper bound on waiting for a Detector response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// How long to wait for an injected Detector to attach
    #[serde(default = "default_inject_wait")]
    pub inject_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rescan_cooldown_ms: default_rescan_cooldown(),
            response_timeout_ms: default_response_timeout(),
            inject_wait_ms: default_inject_wait(),
        }
    }
}

impl StoreConfig {
    pub fn rescan_cooldown(&self) -> Duration {
        Duration::from_millis(self.rescan_cooldown_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inject_wait(&self) -> Duration {
        Duration::from_millis(self.inject_wait_ms)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/pip-sync.sock")
}

fn default_debounce() -> u64 {
    500
}

fn default_report_cooldown() -> u64 {
    1000
}

fn default_visibility_delay() -> u64 {
    1000
}

fn default_focus_delay() -> u64 {
    1000
}

fn default_initial_scan_delay() -> u64 {
    100
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_load_fallback() -> u64 {
    5000
}

fn default_rescan_cooldown() -> u64 {
    1000
}

fn default_response_timeout() -> u64 {
    3000
}

fn default_inject_wait() -> u64 {
    2000
}

impl Config {
    /// Load from `dirs::config_dir()/pip-sync/config.toml`
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load from `path`. A missing, unreadable or malformed file yields the
    /// defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!("pip-sync configuration loaded from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Ignoring malformed pip-sync config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No pip-sync config at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("Cannot read pip-sync config {:?}: {}, using defaults", path, e);
                Self::default()
            }
        };
        config.sanitized()
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pip-sync")
            .join("config.toml")
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

        std::fs::write(path, contents)?;
        info!("Saved pip-sync configuration to {:?}", path);
        Ok(())
    }

    /// A zero response timeout would fail every Store -> Detector call
    fn sanitized(mut self) -> Self {
        if self.store.response_timeout_ms == 0 {
            warn!(
                "store.response_timeout_ms must be positive, using {}",
                default_response_timeout()
            );
            self.store.response_timeout_ms = default_response_timeout();
        }
        self
    }
}
