//! Configuration loading and constants.
//!
//! Loads the host configuration from a TOML file and defines the constants for
//! listener addresses, identity generation, shutdown timing and default paths.
//! `AppConfig` is the root configuration struct. A missing file is not an error:
//! every field has a default so a first launch runs with no configuration at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// =============================================================================
// Application Identity
// =============================================================================

/// Application name; used for data directories and the certificate subject
pub const APP_NAME: &str = "homeport";

/// Default key for the single-instance lock and activation channel
pub const DEFAULT_APP_KEY: &str = "homeport";

// =============================================================================
// Listener Constants
// =============================================================================

/// Fixed port of the export (TLS) listener
pub const DEFAULT_EXPORT_PORT: u16 = 5001;

/// Grace period in seconds for in-flight requests during shutdown
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Directory served as the static web root
pub const DEFAULT_WEB_ROOT: &str = "wwwroot";

// =============================================================================
// HTTP Cache Control
// =============================================================================

/// Status and control responses reflect live state and are never cached
pub const CACHE_CONTROL_API: &str = "no-store";

/// The UI bundle is revalidated on every load so a reinstall shows up at once
pub const CACHE_CONTROL_STATIC: &str = "no-cache";

// =============================================================================
// TLS Identity Constants
// =============================================================================

/// RSA modulus size for generated identities
pub const IDENTITY_KEY_BITS: u32 = 4096;

/// Days the validity window starts before the generation day (absorbs clock skew)
pub const IDENTITY_BACKDATE_DAYS: i64 = 1;

/// Years the validity window extends past the generation day
pub const IDENTITY_VALIDITY_YEARS: i32 = 5;

/// File name of the persisted identity inside the data directory
pub const IDENTITY_FILE_NAME: &str = "cert.pfx";

// =============================================================================
// Activation Channel Constants
// =============================================================================

/// How long a forwarding process keeps trying to reach the owner (milliseconds)
pub const ACTIVATION_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Delay between connection attempts while the owner binds its channel
pub const ACTIVATION_RETRY_DELAY_MS: u64 = 50;

/// Upper bound on a single forwarded activation message
pub const ACTIVATION_MAX_MESSAGE_BYTES: u64 = 64 * 1024;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// File name of the configuration inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "homeport=debug,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Per-user data directory for this application (`<local data dir>/homeport`).
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    data_dir().join(CONFIG_FILE_NAME)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Listener and lifecycle settings
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS identity settings
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Single-instance settings
    #[serde(default)]
    pub instance: InstanceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Expose the API to other devices over TLS
    #[serde(default)]
    pub export: bool,
    /// Port of the export listener
    #[serde(default = "ServerConfig::default_export_port")]
    pub export_port: u16,
    /// Exit the host process once the server has been stopped (off by default;
    /// a stopped host keeps its window open)
    #[serde(default = "ServerConfig::default_exit_on_stop")]
    pub exit_process_on_server_stop: bool,
    /// Grace period for in-flight requests on stop
    #[serde(default = "ServerConfig::default_grace")]
    pub shutdown_grace_seconds: u64,
    /// Static files served at `/`
    #[serde(default = "ServerConfig::default_web_root")]
    pub web_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            export: false,
            export_port: Self::default_export_port(),
            exit_process_on_server_stop: Self::default_exit_on_stop(),
            shutdown_grace_seconds: Self::default_grace(),
            web_root: Self::default_web_root(),
        }
    }
}

impl ServerConfig {
    fn default_export_port() -> u16 {
        DEFAULT_EXPORT_PORT
    }

    fn default_exit_on_stop() -> bool {
        false
    }

    fn default_grace() -> u64 {
        DEFAULT_SHUTDOWN_GRACE_SECS
    }

    fn default_web_root() -> PathBuf {
        PathBuf::from(DEFAULT_WEB_ROOT)
    }

    /// Grace period as a `Duration`
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// TLS identity configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Override for the persisted identity file
    pub path: Option<PathBuf>,
    /// Common name of generated certificates
    #[serde(default = "IdentityConfig::default_subject")]
    pub subject: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: None,
            subject: Self::default_subject(),
        }
    }
}

impl IdentityConfig {
    fn default_subject() -> String {
        APP_NAME.to_string()
    }

    /// Effective identity path (configured or `<data dir>/cert.pfx`)
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| data_dir().join(IDENTITY_FILE_NAME))
    }
}

/// Single-instance configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Stable identifier for the lock and activation channel
    #[serde(default = "InstanceConfig::default_app_key")]
    pub app_key: String,
    /// Directory holding the lock file and channel socket
    pub runtime_dir: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_key: Self::default_app_key(),
            runtime_dir: None,
        }
    }
}

impl InstanceConfig {
    fn default_app_key() -> String {
        DEFAULT_APP_KEY.to_string()
    }

    /// Instance settings for the single-instance decision.
    ///
    /// A config that failed to load yields the defaults, so a later launch can
    /// still reach a running instance instead of failing on its own copy.
    pub fn from_loaded(loaded: &Result<AppConfig, ConfigError>) -> Self {
        match loaded {
            Ok(config) => config.instance.clone(),
            Err(_) => Self::default(),
        }
    }

    /// Effective runtime directory (configured, XDG runtime dir, or data dir)
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .or_else(|| dirs::runtime_dir().map(|dir| dir.join(APP_NAME)))
            .unwrap_or_else(data_dir)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.export_port == 0 {
            return Err(ConfigError::Validation(
                "server.export_port must be a fixed, non-zero port".to_string(),
            ));
        }

        let key = &self.instance.app_key;
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(ConfigError::Validation(format!(
                "instance.app_key '{}' must be non-empty and contain only [A-Za-z0-9._-]",
                key
            )));
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got \"{}\"",
                other
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(!config.server.export);
        assert_eq!(config.server.export_port, DEFAULT_EXPORT_PORT);
        assert!(!config.server.exit_process_on_server_stop);
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.instance.app_key, DEFAULT_APP_KEY);
        assert_eq!(config.identity.subject, APP_NAME);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::parse(
            r#"
            [server]
            export = true
            export_port = 6001
            exit_process_on_server_stop = true
            shutdown_grace_seconds = 3
            web_root = "/srv/ui"

            [identity]
            path = "/tmp/id.pfx"
            subject = "bench"

            [instance]
            app_key = "bench-host"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert!(config.server.export);
        assert_eq!(config.server.export_port, 6001);
        assert!(config.server.exit_process_on_server_stop);
        assert_eq!(config.server.web_root, PathBuf::from("/srv/ui"));
        assert_eq!(config.identity.path(), PathBuf::from("/tmp/id.pfx"));
        assert_eq!(config.identity.subject, "bench");
        assert_eq!(config.instance.app_key, "bench-host");
    }

    #[test]
    fn test_default_identity_path_is_under_data_dir() {
        let config = AppConfig::default();
        let path = config.identity.path();
        assert!(path.ends_with(Path::new(APP_NAME).join(IDENTITY_FILE_NAME)));
    }

    #[test]
    fn test_zero_export_port_rejected() {
        let err = AppConfig::parse("[server]\nexport_port = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_app_key_with_separator_rejected() {
        let err = AppConfig::parse("[instance]\napp_key = \"../evil\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let err = AppConfig::parse("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.export_port, DEFAULT_EXPORT_PORT);
    }

    #[test]
    fn test_malformed_file_keeps_default_instance_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[server\nexport = yes\n").unwrap();

        let loaded = AppConfig::load_or_default(&path);
        assert!(matches!(loaded, Err(ConfigError::Parse(_))));

        let instance = InstanceConfig::from_loaded(&loaded);
        assert_eq!(instance.app_key, DEFAULT_APP_KEY);
        assert!(instance.runtime_dir.is_none());
    }

    #[test]
    fn test_loaded_file_supplies_instance_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[instance]\napp_key = \"bench-host\"\nruntime_dir = \"/run/bench\"\n",
        )
        .unwrap();

        let instance = InstanceConfig::from_loaded(&AppConfig::load_or_default(&path));
        assert_eq!(instance.app_key, "bench-host");
        assert_eq!(instance.runtime_dir(), PathBuf::from("/run/bench"));
    }
}
