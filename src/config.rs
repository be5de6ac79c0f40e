use crate::bus::{BusScope, SuperuserPolicy};
use crate::endpoints::RHSM_SERVICE;
use crate::orchestrator::ServiceOptions;
use crate::service::Timeouts;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// How to reach the RHSM1 service
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-step time bounds
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Locale handed to RegisterServer.Start
    #[serde(default)]
    pub locale: LocaleConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusConfig {
    /// Well-known bus name of the subscription-manager service
    #[serde(default = "default_service")]
    pub service: String,

    /// Bus to connect to: system, session or user
    #[serde(default)]
    pub scope: BusScope,

    /// Superuser policy: require or try
    #[serde(default)]
    pub superuser: SuperuserPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            scope: BusScope::System,
            superuser: SuperuserPolicy::Require,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Seconds to wait for a remote object to become ready (0 = forever)
    #[serde(default = "default_ready_secs")]
    pub ready_secs: u64,

    /// Seconds to wait for each remote call (0 = forever)
    #[serde(default = "default_call_secs")]
    pub call_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_secs: default_ready_secs(),
            call_secs: default_call_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn timeouts(&self) -> Timeouts {
        let bound = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Timeouts {
            ready: bound(self.ready_secs),
            call: bound(self.call_secs),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LocaleConfig {
    /// Fixed locale such as "de_DE"; empty derives it from the environment
    #[serde(default, rename = "override")]
    pub forced: String,
}

/// Output format of the console log.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console format: text or json
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for daily log files; empty disables file logging
    #[serde(default)]
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            directory: String::new(),
        }
    }
}

fn default_service() -> String {
    RHSM_SERVICE.to_string()
}

fn default_ready_secs() -> u64 {
    30
}

fn default_call_secs() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Locale used when the environment does not name one.
pub const FALLBACK_LOCALE: &str = "en_US";

/// Turn a POSIX locale like `de_DE.UTF-8@euro` into `de_DE`.
///
/// `C` and `POSIX` carry no language and yield `None`.
pub fn normalize_locale(raw: &str) -> Option<String> {
    let base = raw.split(['.', '@']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "C" || base == "POSIX" {
        return None;
    }
    Some(base.replace('-', "_"))
}

/// First usable locale from `LC_ALL`, `LC_MESSAGES`, `LANG`.
fn locale_from<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| lookup(var))
        .find_map(|value| normalize_locale(&value))
        .unwrap_or_else(|| FALLBACK_LOCALE.to_string())
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "redhat", "rhsm-register")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let service = self.bus.service.trim();
        if service.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus service name must not be empty".into(),
            ));
        }
        if !service.contains('.') || service.starts_with('.') || service.ends_with('.') {
            return Err(ConfigError::ValidationError(format!(
                "bus service name '{}' is not a dotted bus name",
                service
            )));
        }

        if self.bus.scope == BusScope::None {
            return Err(ConfigError::ValidationError(
                "bus scope must be system, session or user".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }

        if self.locale.forced.contains('/') || self.locale.forced.contains("..") {
            return Err(ConfigError::ValidationError(
                "locale override contains invalid characters".into(),
            ));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// Locale for RegisterServer.Start: the override, else the environment.
    pub fn effective_locale(&self) -> String {
        normalize_locale(&self.locale.forced)
            .unwrap_or_else(|| locale_from(|var| std::env::var(var).ok()))
    }

    /// Everything the registration service needs from the config.
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            service: self.bus.service.trim().to_string(),
            scope: self.bus.scope,
            superuser: self.bus.superuser,
            locale: self.effective_locale(),
            timeouts: self.timeouts.timeouts(),
        }
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

/// Update configuration
pub fn update(
    locale: Option<String>,
    ready_timeout: Option<u64>,
    call_timeout: Option<u64>,
    superuser: Option<SuperuserPolicy>,
    scope: Option<BusScope>,
) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    let mut changed = false;

    if let Some(tag) = locale {
        config.locale.forced = tag;
        changed = true;
    }

    if let Some(secs) = ready_timeout {
        config.timeouts.ready_secs = secs;
        changed = true;
    }

    if let Some(secs) = call_timeout {
        config.timeouts.call_secs = secs;
        changed = true;
    }

    if let Some(policy) = superuser {
        config.bus.superuser = policy;
        changed = true;
    }

    if let Some(scope) = scope {
        config.bus.scope = scope;
        changed = true;
    }

    if changed {
        config.validate()?;
        config.save()?;
        println!("Configuration updated.");
    } else {
        println!("No changes specified. Use --show to view current config.");
    }

    Ok(())
}
