//! User configuration file (`config.ini`).
//!
//! ```ini
//! [sync]
//! base_url = https://terrasync.invalid/ws2
//! dest = /home/me/TerraSync
//! installed_copy = /usr/share/games/fgdata/Scenery
//! concurrency = 4
//! max_attempts = 3
//! recheck_timeout = true
//! request_timeout_secs = 30
//!
//! [logging]
//! file = /home/me/.cache/scenesync/scenesync.log
//! level = info
//! ```
//!
//! Every value is optional. Command-line flags override file values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::repository::RepoConfig;

const SYNC_SECTION: &str = "sync";
const LOGGING_SECTION: &str = "logging";

/// Errors loading, saving or editing the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: ini::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
}

/// `[sync]` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSettings {
    pub base_url: Option<String>,
    pub dest: Option<PathBuf>,
    pub installed_copy: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub recheck_timeout: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

/// `[logging]` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    pub file: Option<PathBuf>,
    pub level: Option<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

/// Default location of the configuration file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scenesync")
        .join("config.ini")
}

impl ConfigFile {
    /// Load from [`config_file_path`]. A missing file gives the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`. A missing file gives the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Save to [`config_file_path`].
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Save to `path`, creating its parent directory.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_failed = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failed)?;
        }
        self.to_ini().write_to_file(path).map_err(write_failed)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ConfigKey::all() {
            let value = ini
                .section(Some(key.section()))
                .and_then(|section| section.get(key.key_name()));
            if let Some(value) = value {
                if !value.trim().is_empty() {
                    key.set(&mut config, value.trim())?;
                }
            }
        }
        Ok(config)
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            let value = key.get(self);
            if !value.is_empty() {
                ini.with_section(Some(key.section()))
                    .set(key.key_name(), value);
            }
        }
        ini
    }

    /// Overlay file values onto `config`.
    pub fn apply_to(&self, mut config: RepoConfig) -> RepoConfig {
        if let Some(url) = &self.sync.base_url {
            config.base_url = url.clone();
        }
        if let Some(dest) = &self.sync.dest {
            config.fs_base = dest.clone();
        }
        if let Some(installed) = &self.sync.installed_copy {
            config.installed_copy_path = Some(installed.clone());
        }
        if let Some(limit) = self.sync.concurrency {
            config = config.with_concurrency_limit(limit);
        }
        if let Some(attempts) = self.sync.max_attempts {
            config = config.with_max_attempts(attempts);
        }
        if let Some(enabled) = self.sync.recheck_timeout {
            config.recheck_timeout_enabled = enabled;
        }
        if let Some(secs) = self.sync.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Addressable configuration keys, written `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    SyncBaseUrl,
    SyncDest,
    SyncInstalledCopy,
    SyncConcurrency,
    SyncMaxAttempts,
    SyncRecheckTimeout,
    SyncRequestTimeoutSecs,
    LoggingFile,
    LoggingLevel,
}

impl ConfigKey {
    /// Every key, grouped by section.
    pub fn all() -> &'static [ConfigKey] {
        &[
            ConfigKey::SyncBaseUrl,
            ConfigKey::SyncDest,
            ConfigKey::SyncInstalledCopy,
            ConfigKey::SyncConcurrency,
            ConfigKey::SyncMaxAttempts,
            ConfigKey::SyncRecheckTimeout,
            ConfigKey::SyncRequestTimeoutSecs,
            ConfigKey::LoggingFile,
            ConfigKey::LoggingLevel,
        ]
    }

    pub fn section(&self) -> &'static str {
        match self {
            ConfigKey::LoggingFile | ConfigKey::LoggingLevel => LOGGING_SECTION,
            _ => SYNC_SECTION,
        }
    }

    pub fn key_name(&self) -> &'static str {
        match self {
            ConfigKey::SyncBaseUrl => "base_url",
            ConfigKey::SyncDest => "dest",
            ConfigKey::SyncInstalledCopy => "installed_copy",
            ConfigKey::SyncConcurrency => "concurrency",
            ConfigKey::SyncMaxAttempts => "max_attempts",
            ConfigKey::SyncRecheckTimeout => "recheck_timeout",
            ConfigKey::SyncRequestTimeoutSecs => "request_timeout_secs",
            ConfigKey::LoggingFile => "file",
            ConfigKey::LoggingLevel => "level",
        }
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value as a string; empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        let num = |n: Option<String>| n.unwrap_or_default();

        match self {
            ConfigKey::SyncBaseUrl => config.sync.base_url.clone().unwrap_or_default(),
            ConfigKey::SyncDest => path(&config.sync.dest),
            ConfigKey::SyncInstalledCopy => path(&config.sync.installed_copy),
            ConfigKey::SyncConcurrency => num(config.sync.concurrency.map(|v| v.to_string())),
            ConfigKey::SyncMaxAttempts => num(config.sync.max_attempts.map(|v| v.to_string())),
            ConfigKey::SyncRecheckTimeout => {
                num(config.sync.recheck_timeout.map(|v| v.to_string()))
            }
            ConfigKey::SyncRequestTimeoutSecs => {
                num(config.sync.request_timeout_secs.map(|v| v.to_string()))
            }
            ConfigKey::LoggingFile => path(&config.logging.file),
            ConfigKey::LoggingLevel => config.logging.level.clone().unwrap_or_default(),
        }
    }

    /// Parse and store `value`.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        match self {
            ConfigKey::SyncBaseUrl => config.sync.base_url = Some(value.to_string()),
            ConfigKey::SyncDest => config.sync.dest = Some(PathBuf::from(value)),
            ConfigKey::SyncInstalledCopy => {
                config.sync.installed_copy = Some(PathBuf::from(value))
            }
            ConfigKey::SyncConcurrency => config.sync.concurrency = Some(self.parse(value)?),
            ConfigKey::SyncMaxAttempts => config.sync.max_attempts = Some(self.parse(value)?),
            ConfigKey::SyncRecheckTimeout => {
                config.sync.recheck_timeout = Some(self.parse(value)?)
            }
            ConfigKey::SyncRequestTimeoutSecs => {
                config.sync.request_timeout_secs = Some(self.parse(value)?)
            }
            ConfigKey::LoggingFile => config.logging.file = Some(PathBuf::from(value)),
            ConfigKey::LoggingLevel => config.logging.level = Some(value.to_string()),
        }
        Ok(())
    }

    fn parse<T>(&self, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}
