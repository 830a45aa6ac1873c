//! Bridge configuration
//!
//! Settings for the host side of the bridge: where the worker lives, how it
//! is launched, which transport both processes use and how often the worker
//! checks on the host.
//!
//! # Priority
//!
//! Values are merged with the following priority (highest first):
//! 1. CLI arguments (applied by the caller via [`ConfigOverrides`])
//! 2. Environment variables (`BRIDGE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Configuration File
//!
//! The default location is `$XDG_CONFIG_HOME/callback-bridge/bridge.toml`,
//! falling back to `~/.config/callback-bridge/bridge.toml`.
//!
//! ```toml
//! [supervisor]
//! enabled = true
//! install_dir = "/opt/engine/custom_nodes/bridge"
//! extension_dir = "/opt/extension"
//! bootstrap = "main.py"
//! forwarded_args = ["--listen", "127.0.0.1"]
//! graceful_timeout_secs = 10
//! fallback_executable = "/usr/bin/python3"
//! stripped_env_vars = ["PYTHONPATH"]
//!
//! [supervisor.runtime]
//! venv_dir = "venv"
//! embedded_dir = "python_embeded"
//! executable = "python"
//!
//! [transport]
//! strategy = "file"
//! ipc_dir = "/opt/extension/.ipc"
//! call_timeout_ms = 30000
//! poll_interval_ms = 20
//! connect_timeout_ms = 5000
//!
//! [watchdog]
//! interval_ms = 1000
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `BRIDGE_ENABLED` | `0`/`false` disables the worker |
//! | `BRIDGE_INSTALL_DIR` | Worker install directory |
//! | `BRIDGE_EXTENSION_DIR` | Shared extension directory |
//! | `BRIDGE_TRANSPORT` | Transport strategy name |
//! | `BRIDGE_IPC_DIR` | Rendezvous directory |
//! | `BRIDGE_CALL_TIMEOUT` | Proxy call timeout (ms) |
//! | `BRIDGE_GRACEFUL_TIMEOUT` | Wait before killing the worker (s) |
//! | `BRIDGE_WATCHDOG_INTERVAL` | Worker liveness poll interval (ms) |

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::{
    RuntimeLayout, SupervisorConfig, DEFAULT_GRACEFUL_TIMEOUT, ENV_EXTENSION_DIR, ENV_IPC_DIR,
    ENV_TRANSPORT, ENV_WATCHDOG_INTERVAL,
};
use crate::transport::{self, TransportConfig, TransportStrategy};
use crate::watchdog;

/// Enables or disables worker supervision
pub const ENV_ENABLED: &str = "BRIDGE_ENABLED";
/// Worker install directory
pub const ENV_INSTALL_DIR: &str = "BRIDGE_INSTALL_DIR";
/// Proxy call timeout in milliseconds
pub const ENV_CALL_TIMEOUT: &str = "BRIDGE_CALL_TIMEOUT";
/// Graceful termination timeout in seconds
pub const ENV_GRACEFUL_TIMEOUT: &str = "BRIDGE_GRACEFUL_TIMEOUT";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the config file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Supervisor section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorToml {
    /// Whether the host launches a worker at all
    pub enabled: Option<bool>,

    /// Worker install directory
    pub install_dir: Option<PathBuf>,

    /// Shared extension directory
    pub extension_dir: Option<PathBuf>,

    /// Script passed to the worker executable
    pub bootstrap: Option<PathBuf>,

    /// Arguments forwarded to the worker
    pub forwarded_args: Option<Vec<String>>,

    /// Seconds to wait for a graceful exit before killing the worker
    pub graceful_timeout_secs: Option<u64>,

    /// Runtime directory layout
    pub runtime: Option<RuntimeLayout>,

    /// Executable used when no bundled runtime is found
    pub fallback_executable: Option<PathBuf>,

    /// Variables removed from the worker environment
    pub stripped_env_vars: Option<Vec<String>>,
}

/// Transport section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Strategy name (`file`, `socket`)
    pub strategy: Option<String>,

    /// Rendezvous directory
    pub ipc_dir: Option<PathBuf>,

    /// Proxy call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,

    /// File spool polling interval in milliseconds
    pub poll_interval_ms: Option<u64>,

    /// Socket connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Watchdog section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogToml {
    /// Host liveness poll interval in milliseconds (0 disables)
    pub interval_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Supervisor configuration section
    pub supervisor: SupervisorToml,

    /// Transport configuration section
    pub transport: TransportToml,

    /// Watchdog configuration section
    pub watchdog: WatchdogToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Merged host configuration
///
/// Use [`load_config`] to load it with proper priority handling, then
/// [`BridgeConfigFile::to_supervisor_config`] to launch a worker.
#[derive(Clone, Debug)]
pub struct BridgeConfigFile {
    /// Whether the worker is launched
    pub enabled: bool,

    /// Worker install directory (required to start)
    pub install_dir: Option<PathBuf>,

    /// Shared extension directory (required to start)
    pub extension_dir: Option<PathBuf>,

    /// Script passed to the worker executable
    pub bootstrap: Option<PathBuf>,

    /// Arguments forwarded to the worker
    pub forwarded_args: Vec<String>,

    /// Wait between the graceful signal and the forced kill
    pub graceful_timeout: Duration,

    /// Runtime directory layout
    pub runtime: RuntimeLayout,

    /// Executable used when no bundled runtime is found (None = `bridge-worker` next to the host)
    pub fallback_executable: Option<PathBuf>,

    /// Variables removed from the worker environment
    pub stripped_env_vars: Vec<String>,

    /// Transport settings shared with the worker
    pub transport: TransportConfig,

    /// Worker liveness poll interval
    pub watchdog_interval: Duration,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for BridgeConfigFile {
    fn default() -> Self {
        Self {
            enabled: true,
            install_dir: None,
            extension_dir: None,
            bootstrap: None,
            forwarded_args: Vec::new(),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            runtime: RuntimeLayout::default(),
            fallback_executable: None,
            stripped_env_vars: vec!["PYTHONPATH".to_string()],
            transport: TransportConfig::default(),
            watchdog_interval: watchdog::DEFAULT_POLL_INTERVAL,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Transport settings with the rendezvous directory resolved
    ///
    /// An unset directory becomes `<extension_dir>/.ipc`, matching what the
    /// worker assumes when `BRIDGE_IPC_DIR` is absent.
    #[must_use]
    pub fn resolved_transport(&self) -> TransportConfig {
        let mut transport = self.transport.clone();
        if transport.ipc_dir.is_none() {
            transport.ipc_dir = self.extension_dir.as_ref().map(|ext| ext.join(".ipc"));
        }
        transport
    }

    /// Build the supervisor settings
    ///
    /// # Errors
    ///
    /// `ValidationError` when the install or extension directory is unset.
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let install_dir = self.install_dir.clone().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "worker install directory is not set (supervisor.install_dir or {ENV_INSTALL_DIR})"
            ))
        })?;
        let extension_dir = self.extension_dir.clone().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "extension directory is not set (supervisor.extension_dir or {ENV_EXTENSION_DIR})"
            ))
        })?;

        let mut config = SupervisorConfig::new(install_dir, extension_dir);
        config.enabled = self.enabled;
        config.bootstrap.clone_from(&self.bootstrap);
        config.forwarded_args.clone_from(&self.forwarded_args);
        config.runtime = self.runtime.clone();
        if let Some(exe) = &self.fallback_executable {
            config.fallback_executable.clone_from(exe);
        }
        config.graceful_timeout = self.graceful_timeout;
        config.stripped_env_vars.clone_from(&self.stripped_env_vars);
        config.watchdog_interval = Some(self.watchdog_interval);
        Ok(config)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/callback-bridge/bridge.toml` or
/// `~/.config/callback-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("callback-bridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BridgeConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfigFile, ConfigError> {
    load_config_with(path, |name| std::env::var_os(name))
}

/// Load configuration, reading environment variables through `lookup`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with<F>(path: Option<PathBuf>, lookup: F) -> Result<BridgeConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<OsString>,
{
    let mut config = BridgeConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);

    Ok(config)
}

fn parse_strategy(name: &str, origin: ConfigSource) -> Option<TransportStrategy> {
    match transport::lookup(name) {
        Ok(strategy) => Some(strategy),
        Err(e) => {
            tracing::warn!(
                strategy = name,
                source = %origin,
                error = %e,
                "Ignoring unknown transport strategy"
            );
            None
        }
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfigFile, toml: &BridgeToml) {
    let sup = &toml.supervisor;
    if let Some(enabled) = sup.enabled {
        config.enabled = enabled;
    }
    if let Some(dir) = &sup.install_dir {
        config.install_dir = Some(dir.clone());
    }
    if let Some(dir) = &sup.extension_dir {
        config.extension_dir = Some(dir.clone());
    }
    if let Some(bootstrap) = &sup.bootstrap {
        config.bootstrap = Some(bootstrap.clone());
    }
    if let Some(args) = &sup.forwarded_args {
        config.forwarded_args.clone_from(args);
    }
    if let Some(secs) = sup.graceful_timeout_secs {
        config.graceful_timeout = Duration::from_secs(secs);
    }
    if let Some(runtime) = &sup.runtime {
        config.runtime = runtime.clone();
    }
    if let Some(exe) = &sup.fallback_executable {
        config.fallback_executable = Some(exe.clone());
    }
    if let Some(vars) = &sup.stripped_env_vars {
        config.stripped_env_vars.clone_from(vars);
    }

    let tr = &toml.transport;
    if let Some(strategy) = tr
        .strategy
        .as_deref()
        .and_then(|name| parse_strategy(name, ConfigSource::File))
    {
        config.transport.strategy = strategy;
    }
    if let Some(dir) = &tr.ipc_dir {
        config.transport.ipc_dir = Some(dir.clone());
    }
    if let Some(ms) = tr.call_timeout_ms {
        config.transport.call_timeout_ms = ms;
    }
    if let Some(ms) = tr.poll_interval_ms {
        config.transport.poll_interval_ms = ms;
    }
    if let Some(ms) = tr.connect_timeout_ms {
        config.transport.connect_timeout_ms = ms;
    }

    if let Some(ms) = toml.watchdog.interval_ms {
        config.watchdog_interval = Duration::from_millis(ms);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut BridgeConfigFile, lookup: F)
where
    F: Fn(&str) -> Option<OsString>,
{
    let text = |name: &str| -> Option<String> {
        lookup(name)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string_lossy().trim().to_string())
    };
    let number = |name: &str| -> Option<u64> {
        let raw = text(name)?;
        match raw.parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring non-numeric value");
                None
            }
        }
    };

    if let Some(enabled) = text(ENV_ENABLED) {
        config.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = lookup(ENV_INSTALL_DIR).filter(|v| !v.is_empty()) {
        config.install_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = lookup(ENV_EXTENSION_DIR).filter(|v| !v.is_empty()) {
        config.extension_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Some(strategy) = text(ENV_TRANSPORT).and_then(|name| parse_strategy(&name, ConfigSource::Env)) {
        config.transport.strategy = strategy;
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = lookup(ENV_IPC_DIR).filter(|v| !v.is_empty()) {
        config.transport.ipc_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = number(ENV_CALL_TIMEOUT) {
        config.transport.call_timeout_ms = ms;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = number(ENV_GRACEFUL_TIMEOUT) {
        config.graceful_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = number(ENV_WATCHDOG_INTERVAL) {
        config.watchdog_interval = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Install directory override
    pub install_dir: Option<PathBuf>,

    /// Extension directory override
    pub extension_dir: Option<PathBuf>,

    /// Transport strategy override
    pub strategy: Option<TransportStrategy>,

    /// Rendezvous directory override
    pub ipc_dir: Option<PathBuf>,

    /// Bootstrap script override
    pub bootstrap: Option<PathBuf>,

    /// Graceful timeout override (seconds)
    pub graceful_timeout_secs: Option<u64>,

    /// Forwarded argument override; replaces the configured list
    pub forwarded_args: Option<Vec<String>>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set install directory override
    #[must_use]
    pub fn with_install_dir(mut self, dir: PathBuf) -> Self {
        self.install_dir = Some(dir);
        self
    }

    /// Set extension directory override
    #[must_use]
    pub fn with_extension_dir(mut self, dir: PathBuf) -> Self {
        self.extension_dir = Some(dir);
        self
    }

    /// Set transport strategy override
    #[must_use]
    pub fn with_strategy(mut self, strategy: TransportStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set rendezvous directory override
    #[must_use]
    pub fn with_ipc_dir(mut self, dir: PathBuf) -> Self {
        self.ipc_dir = Some(dir);
        self
    }

    /// Set bootstrap script override
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: PathBuf) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Set graceful timeout override
    #[must_use]
    pub fn with_graceful_timeout_secs(mut self, secs: u64) -> Self {
        self.graceful_timeout_secs = Some(secs);
        self
    }

    /// Set forwarded argument override
    #[must_use]
    pub fn with_forwarded_args(mut self, args: Vec<String>) -> Self {
        self.forwarded_args = Some(args);
        self
    }

    fn is_empty(&self) -> bool {
        self.install_dir.is_none()
            && self.extension_dir.is_none()
            && self.strategy.is_none()
            && self.ipc_dir.is_none()
            && self.bootstrap.is_none()
            && self.graceful_timeout_secs.is_none()
            && self.forwarded_args.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfigFile) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref dir) = self.install_dir {
            config.install_dir = Some(dir.clone());
        }
        if let Some(ref dir) = self.extension_dir {
            config.extension_dir = Some(dir.clone());
        }
        if let Some(strategy) = self.strategy {
            config.transport.strategy = strategy;
        }
        if let Some(ref dir) = self.ipc_dir {
            config.transport.ipc_dir = Some(dir.clone());
        }
        if let Some(ref bootstrap) = self.bootstrap {
            config.bootstrap = Some(bootstrap.clone());
        }
        if let Some(secs) = self.graceful_timeout_secs {
            config.graceful_timeout = Duration::from_secs(secs);
        }
        if let Some(ref args) = self.forwarded_args {
            config.forwarded_args.clone_from(args);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
