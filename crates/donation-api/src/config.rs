use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use donation_store_mysql::MySqlSettings;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETENTION: usize = 500;
pub const DEFAULT_NOTIFY_SUBJECT: &str = "New crypto donation received";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which relational backend holds the records of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    Mysql(MySqlSettings),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite { path: PathBuf::from("./donations.sqlite") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub csv_path: PathBuf,
    pub json_path: PathBuf,
    /// Most recent records kept in the structured sink.
    pub retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("./donations.csv"),
            json_path: PathBuf::from("./donations.json"),
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub to: String,
    pub from: String,
    pub subject: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            to: String::new(),
            from: String::new(),
            subject: DEFAULT_NOTIFY_SUBJECT.to_string(),
        }
    }
}

impl NotifyConfig {
    /// Notifications go out only when switched on and addressed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.to.trim().is_empty()
    }
}

/// Process-wide settings, built once at startup and handed to each component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DonationConfig {
    pub store: StoreConfig,
    /// Bound on connection setup and lock waits against the store.
    pub timeout_ms: u64,
    pub backup: BackupConfig,
    pub notify: NotifyConfig,
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            backup: BackupConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl DonationConfig {
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, is not valid YAML for
    /// this shape, or holds out-of-range values.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.checked()
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the structured sink would retain nothing.
    pub fn checked(self) -> Result<Self, ConfigError> {
        if self.backup.retention == 0 {
            return Err(ConfigError::Invalid("backup retention must be at least 1".to_string()));
        }
        Ok(self)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Sqlite,
    Mysql,
}

/// Command-line and environment sources for [`DonationConfig`], shared by the
/// service and the operator CLI.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// YAML config file. When given, the flags below are ignored.
    #[arg(long, env = "DONATION_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "DONATION_BACKEND", value_enum, default_value_t = BackendKind::Sqlite)]
    pub backend: BackendKind,
    #[arg(long, env = "DONATION_SQLITE_PATH", default_value = "./donations.sqlite")]
    pub sqlite_path: PathBuf,
    #[arg(long, env = "DONATION_MYSQL_HOST", default_value = "127.0.0.1")]
    pub mysql_host: String,
    #[arg(long, env = "DONATION_MYSQL_PORT", default_value_t = 3306)]
    pub mysql_port: u16,
    #[arg(long, env = "DONATION_MYSQL_DATABASE", default_value = "donations_db")]
    pub mysql_database: String,
    #[arg(long, env = "DONATION_MYSQL_USER", default_value = "root")]
    pub mysql_user: String,
    #[arg(long, env = "DONATION_MYSQL_PASSWORD", default_value = "", hide_env_values = true)]
    pub mysql_password: String,
    #[arg(long, env = "DONATION_MYSQL_CHARSET", default_value = "utf8mb4")]
    pub mysql_charset: String,
    #[arg(long, env = "DONATION_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,
    #[arg(long, env = "DONATION_CSV_PATH", default_value = "./donations.csv")]
    pub csv_path: PathBuf,
    #[arg(long, env = "DONATION_JSON_PATH", default_value = "./donations.json")]
    pub json_path: PathBuf,
    #[arg(long, env = "DONATION_RETENTION", default_value_t = DEFAULT_RETENTION)]
    pub retention: usize,
    #[arg(long, env = "DONATION_NOTIFY_ENABLED")]
    pub notify_enabled: bool,
    #[arg(long, env = "DONATION_NOTIFY_TO", default_value = "")]
    pub notify_to: String,
    #[arg(long, env = "DONATION_NOTIFY_FROM", default_value = "")]
    pub notify_from: String,
    #[arg(long, env = "DONATION_NOTIFY_SUBJECT", default_value = DEFAULT_NOTIFY_SUBJECT)]
    pub notify_subject: String,
}

impl ConfigArgs {
    /// # Errors
    /// Returns [`ConfigError`] when a `--config` file is given and cannot be loaded,
    /// or when a value is out of range.
    pub fn load(&self) -> Result<DonationConfig, ConfigError> {
        if let Some(path) = &self.config {
            return DonationConfig::from_yaml_file(path);
        }

        let store = match self.backend {
            BackendKind::Sqlite => StoreConfig::Sqlite { path: self.sqlite_path.clone() },
            BackendKind::Mysql => StoreConfig::Mysql(MySqlSettings {
                host: self.mysql_host.clone(),
                port: self.mysql_port,
                database: self.mysql_database.clone(),
                user: self.mysql_user.clone(),
                password: self.mysql_password.clone(),
                charset: self.mysql_charset.clone(),
            }),
        };
        DonationConfig {
            store,
            timeout_ms: self.timeout_ms,
            backup: BackupConfig {
                csv_path: self.csv_path.clone(),
                json_path: self.json_path.clone(),
                retention: self.retention,
            },
            notify: NotifyConfig {
                enabled: self.notify_enabled,
                to: self.notify_to.clone(),
                from: self.notify_from.clone(),
                subject: self.notify_subject.clone(),
            },
        }
        .checked()
    }
}
