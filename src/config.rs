use anyhow::{bail, Context, Result};
use dirs::config_dir;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for rm-syncd
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root of the sync directory layout
    #[serde(default = "default_sync_dir")]
    pub sync_dir: String,

    /// Downstream viewer notification settings
    #[serde(default)]
    pub viewer: ViewerConfig,

    /// Processing collaborator settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Mirroring tool settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Reconciliation loop settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Viewer configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ViewerConfig {
    /// Base URL of the viewer instance
    #[serde(default = "default_viewer_url")]
    pub url: String,

    /// Path appended to `url` for rebuild notifications
    #[serde(default = "default_rebuild_path")]
    pub rebuild_path: String,

    /// Upper bound for a single notification call
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout: String, // "5s"

    /// Send rebuild notifications at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Processing configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProcessingConfig {
    /// Program and leading arguments; source and output directories are appended
    #[serde(default = "default_processing_command")]
    pub command: Vec<String>,
}

/// Transfer configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransferConfig {
    /// rsync executable
    #[serde(default = "default_rsync_path")]
    pub rsync_path: String,

    /// Extra arguments passed to rsync before the source and destination
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Longest idle wait between passes that produced no change
    #[serde(default = "default_max_wait")]
    pub max_wait: String, // "5s"

    /// How often the idle wait re-checks its wake conditions
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String, // "500ms"
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_sync_dir() -> String {
    "~/rm-viewer-sync/sync".to_string()
}
fn default_viewer_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_rebuild_path() -> String {
    "/api/rebuild".to_string()
}
fn default_notify_timeout() -> String {
    "5s".to_string()
}
fn default_processing_command() -> Vec<String> {
    vec!["rm-viewer".to_string(), "process".to_string()]
}
fn default_rsync_path() -> String {
    "rsync".to_string()
}
fn default_max_wait() -> String {
    "5s".to_string()
}
fn default_poll_interval() -> String {
    "500ms".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            url: default_viewer_url(),
            rebuild_path: default_rebuild_path(),
            notify_timeout: default_notify_timeout(),
            enabled: default_true(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            command: default_processing_command(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_path: default_rsync_path(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_wait: default_max_wait(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("rm-syncd").join("config.yml"))
    }

    /// Expand `~` and environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.sync_dir = expand_path(&self.sync_dir)
            .context("Failed to expand sync_dir path")?
            .to_string_lossy()
            .into_owned();

        self.transfer.rsync_path = shellexpand::full(&self.transfer.rsync_path)
            .context("Failed to expand rsync_path")?
            .into_owned();

        Ok(())
    }

    /// Reject settings the daemon cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.processing.command.is_empty() {
            bail!("processing.command must name a program");
        }
        self.notify_timeout()?;
        if self.max_wait()?.is_zero() {
            bail!("daemon.max_wait must be greater than zero");
        }
        if self.poll_interval()?.is_zero() {
            bail!("daemon.poll_interval must be greater than zero");
        }
        Ok(())
    }

    pub fn sync_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.sync_dir)
    }

    /// Full URL of the viewer's rebuild endpoint
    pub fn rebuild_url(&self) -> String {
        format!(
            "{}/{}",
            self.viewer.url.trim_end_matches('/'),
            self.viewer.rebuild_path.trim_start_matches('/')
        )
    }

    pub fn notify_timeout(&self) -> Result<Duration> {
        parse_duration(&self.viewer.notify_timeout).context("Invalid viewer.notify_timeout")
    }

    pub fn max_wait(&self) -> Result<Duration> {
        parse_duration(&self.daemon.max_wait).context("Invalid daemon.max_wait")
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.daemon.poll_interval).context("Invalid daemon.poll_interval")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_dir: default_sync_dir(),
            viewer: ViewerConfig::default(),
            processing: ProcessingConfig::default(),
            transfer: TransferConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Expand `~`/`$VARS` and normalise `.`/`..` components
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("Failed to expand {raw}"))?;
    Ok(PathBuf::from(expanded.as_ref()).clean())
}

/// Parse duration strings like "500ms", "5s", "2m", "1h"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();
    let invalid =
        || format!("Invalid duration '{duration_str}'. Use a format like '500ms', '5s', '2m'");

    let (value, unit_ms) = if let Some(value) = duration_str.strip_suffix("ms") {
        (value, 1)
    } else if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1_000)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60_000)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3_600_000)
    } else {
        // Bare number means seconds
        (duration_str.as_str(), 1_000)
    };

    let value: u64 = value.parse().with_context(invalid)?;
    let millis = value
        .checked_mul(unit_ms)
        .with_context(|| format!("Duration '{duration_str}' is too large"))?;
    Ok(Duration::from_millis(millis))
}
