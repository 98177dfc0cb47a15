use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/backsmith/config.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub backsmith: String,
    pub dir: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const BACKSMITH_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            backsmith: Self::BACKSMITH_LEVEL.to_string(),
            dir: "/var/log/backsmith".to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.backsmith.clone();
        self.backsmith = self.backsmith.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.backsmith.as_str()) {
            eprintln!(
                "Config error: backsmith log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::BACKSMITH_LEVEL
            );
            self.backsmith = Self::BACKSMITH_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
    pub pool_size: u32,
}

impl DatabaseConfig {
    const BUSY_TIMEOUT_MS: u64 = 5000;
    const POOL_SIZE: u32 = 4;

    fn default() -> Self {
        DatabaseConfig {
            path: "/var/lib/backsmith/backsmith.db".to_string(),
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
            pool_size: Self::POOL_SIZE,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: database pool_size must be at least 1 - using default of {}",
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
    }
}

/// Socket framing parameters. There is no length prefix on the wire: a
/// request ends when the peer goes quiet for `idle_timeout_ms` or closes its
/// write half. Pipelined requests on one connection are not supported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SocketConfig {
    pub database_path: String,
    pub system_path: String,
    pub idle_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_message_bytes: usize,
    pub mode: u32,
}

impl SocketConfig {
    const IDLE_TIMEOUT_MS: u64 = 200;
    const REQUEST_TIMEOUT_MS: u64 = 5000;
    const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

    fn default() -> Self {
        SocketConfig {
            database_path: "/run/backsmith/database.sock".to_string(),
            system_path: "/run/backsmith/system.sock".to_string(),
            idle_timeout_ms: Self::IDLE_TIMEOUT_MS,
            request_timeout_ms: Self::REQUEST_TIMEOUT_MS,
            max_message_bytes: Self::MAX_MESSAGE_BYTES,
            mode: 0o660,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        if self.idle_timeout_ms == 0 {
            eprintln!(
                "Config error: socket idle_timeout_ms must be positive - using default of {}",
                Self::IDLE_TIMEOUT_MS
            );
            self.idle_timeout_ms = Self::IDLE_TIMEOUT_MS;
        }
        if self.request_timeout_ms < self.idle_timeout_ms {
            self.request_timeout_ms = Self::REQUEST_TIMEOUT_MS.max(self.idle_timeout_ms);
        }
        if self.max_message_bytes == 0 {
            eprintln!(
                "Config error: socket max_message_bytes must be positive - using default of {}",
                Self::MAX_MESSAGE_BYTES
            );
            self.max_message_bytes = Self::MAX_MESSAGE_BYTES;
        }
    }
}

/// Optional streaming pipeline for backups. Empty commands disable a stage.
/// Without a forward command the stream lands in `output_name` inside the
/// backup's own directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub compress_command: String,
    pub forward_command: String,
    pub output_name: String,
}

impl StreamingConfig {
    const OUTPUT_NAME: &str = "backup.xbstream";

    fn ensure_valid(&mut self) {
        let name = self.output_name.trim();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            eprintln!(
                "Config error: streaming output_name of '{}' is not a file name - using default of '{}'",
                self.output_name,
                Self::OUTPUT_NAME
            );
            self.output_name = Self::OUTPUT_NAME.to_owned();
        } else {
            self.output_name = name.to_owned();
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            enabled: false,
            compress_command: String::new(),
            forward_command: String::new(),
            output_name: Self::OUTPUT_NAME.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub root: String,
    pub tool: String,
    pub credentials_file: String,
    pub client_section: String,
    pub data_dir: String,
    pub probe_command: String,
    pub streaming: StreamingConfig,
}

impl BackupConfig {
    const CLIENT_SECTION: &str = "client";

    fn default() -> Self {
        BackupConfig {
            root: "/var/backups/backsmith".to_string(),
            tool: "xtrabackup".to_string(),
            credentials_file: "/etc/backsmith/my.cnf".to_string(),
            client_section: Self::CLIENT_SECTION.to_string(),
            data_dir: "/var/lib/mysql".to_string(),
            probe_command: "mysqladmin".to_string(),
            streaming: StreamingConfig::default(),
        }
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    pub fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.root_path().join(backup_id)
    }

    fn ensure_valid(&mut self) {
        let trimmed = self
            .client_section
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if trimmed.is_empty() {
            self.client_section = Self::CLIENT_SECTION.to_owned();
        } else {
            self.client_section = trimmed;
        }
        self.streaming.ensure_valid();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestoreConfig {
    pub staging_root: String,
    pub version_threshold: String,
}

impl RestoreConfig {
    const VERSION_THRESHOLD: &str = "8.0.0";

    fn default() -> Self {
        RestoreConfig {
            staging_root: "/var/lib/backsmith/restore".to_string(),
            version_threshold: Self::VERSION_THRESHOLD.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        if crate::builder::Version::parse(&self.version_threshold).is_none() {
            eprintln!(
                "Config error: restore version_threshold of '{}' is invalid - using default of '{}'",
                self.version_threshold,
                Self::VERSION_THRESHOLD
            );
            self.version_threshold = Self::VERSION_THRESHOLD.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CronConfig {
    pub file_path: String,
    pub user: String,
    pub binary: String,
    pub cleanup_hour: u32,
    pub cleanup_minute: u32,
}

impl CronConfig {
    fn default() -> Self {
        CronConfig {
            file_path: "/etc/cron.d/backsmith".to_string(),
            user: "root".to_string(),
            binary: "/usr/local/bin/backsmith".to_string(),
            cleanup_hour: 3,
            cleanup_minute: 15,
        }
    }

    fn ensure_valid(&mut self) {
        if self.cleanup_hour > 23 {
            eprintln!(
                "Config error: cron cleanup_hour of {} is invalid - using 3",
                self.cleanup_hour
            );
            self.cleanup_hour = 3;
        }
        if self.cleanup_minute > 59 {
            eprintln!(
                "Config error: cron cleanup_minute of {} is invalid - using 15",
                self.cleanup_minute
            );
            self.cleanup_minute = 15;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub safe_library_path: String,
    pub cleanup_poll_ms: u64,
    pub cleanup_wait_secs: u64,
}

impl RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            safe_library_path: "/usr/lib64:/usr/lib:/lib64:/lib".to_string(),
            cleanup_poll_ms: 500,
            cleanup_wait_secs: 3600,
        }
    }

    fn ensure_valid(&mut self) {
        if self.cleanup_poll_ms == 0 {
            self.cleanup_poll_ms = 500;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub socket: SocketConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub cron: CronConfig,
    pub runner: RunnerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            socket: SocketConfig::default(),
            backup: BackupConfig::default(),
            restore: RestoreConfig::default(),
            cron: CronConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file, overlaid with `BACKSMITH_`
    /// environment variables (`__` separates sections, e.g.
    /// `BACKSMITH_SOCKET__IDLE_TIMEOUT_MS`).
    /// If the file is missing the defaults are written to it; if it fails to
    /// parse, defaults are used.
    pub fn load_config(config_path: &Path) -> Self {
        let default_config = Config::default();

        if !config_path.exists() {
            Self::write_default(config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("BACKSMITH_").split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.socket.ensure_valid();
        self.backup.ensure_valid();
        self.restore.ensure_valid();
        self.cron.ensure_valid();
        self.runner.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_missing_file_writes_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("config.toml");

            let config = Config::load_config(&path);

            assert!(path.exists());
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [socket]
                idle_timeout_ms = 350

                [backup]
                root = "/srv/backups"
                client_section = "[xtrabackup]"
                "#,
            )?;

            let config = Config::load_config(&jail.directory().join("config.toml"));
            assert_eq!(config.socket.idle_timeout_ms, 350);
            assert_eq!(config.backup.root, "/srv/backups");
            assert_eq!(config.backup.client_section, "xtrabackup");
            assert_eq!(config.socket.max_message_bytes, 1024 * 1024);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[database]\nbusy_timeout_ms = 100\n")?;
            jail.set_env("BACKSMITH_DATABASE__BUSY_TIMEOUT_MS", "900");

            let config = Config::load_config(&jail.directory().join("config.toml"));
            assert_eq!(config.database.busy_timeout_ms, 900);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_repaired() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                backsmith = "LOUD"

                [restore]
                version_threshold = "not-a-version"

                [cron]
                cleanup_hour = 42

                [backup.streaming]
                enabled = true
                output_name = "/mnt/shared/out.xbstream"
                "#,
            )?;

            let config = Config::load_config(&jail.directory().join("config.toml"));
            assert_eq!(config.logging.backsmith, "info");
            assert!(config.backup.streaming.enabled);
            assert_eq!(config.backup.streaming.output_name, "backup.xbstream");
            assert_eq!(config.restore.version_threshold, "8.0.0");
            assert_eq!(config.cron.cleanup_hour, 3);
            Ok(())
        });
    }

    #[test]
    fn test_backup_dir_joins_root() {
        let config = Config::default();
        assert_eq!(
            config.backup.backup_dir("20261016_023000"),
            PathBuf::from("/var/backups/backsmith/20261016_023000")
        );
    }
}
