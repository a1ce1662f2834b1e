//! Configuration file.
//!
//! Settings live in an INI file at `~/.config/sidecar/config.ini`:
//!
//! ```ini
//! [bridge]
//! max_concurrent = 3
//! default_timeout_secs = 120
//! init_timeout_secs = 30
//!
//! [cache]
//! enabled = true
//! backend = directory
//! directory = /home/user/.cache/sidecar/artifacts
//! max_size = 2GB
//! schema_version = 1
//!
//! [logging]
//! level = info
//! directory = /home/user/.local/state/sidecar/logs
//! ```
//!
//! Missing keys fall back to defaults; unknown keys are ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::bridge::BridgeConfig;
use crate::cache::{default_cache_dir, CacheConfig, StorageBackend};
use crate::logging::LoggingConfig;

const BRIDGE_SECTION: &str = "bridge";
const CACHE_SECTION: &str = "cache";
const LOGGING_SECTION: &str = "logging";

/// Errors from reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration directory on this platform")]
    NoConfigDir,

    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid size '{0}' (expected e.g. 512MB, 2GB)")]
    InvalidSize(String),
}

/// Returns `~/.config/sidecar/config.ini` (platform equivalent).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("sidecar").join("config.ini"))
        .ok_or(ConfigError::NoConfigDir)
}

/// All settings read from the configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub bridge: BridgeConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Loads the default file, or defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Writes every setting, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        self.to_ini().write_to_file(path).map_err(write_err)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max) = parse_key::<usize>(ini, BRIDGE_SECTION, "max_concurrent")? {
            config.bridge = config.bridge.with_max_concurrent(max);
        }
        if let Some(secs) = parse_key::<u64>(ini, BRIDGE_SECTION, "default_timeout_secs")? {
            config.bridge = config
                .bridge
                .with_default_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_key::<u64>(ini, BRIDGE_SECTION, "init_timeout_secs")? {
            config.bridge = config.bridge.with_init_timeout(Duration::from_secs(secs));
        }

        if let Some(enabled) = parse_key::<bool>(ini, CACHE_SECTION, "enabled")? {
            config.cache.enabled = enabled;
        }
        if let Some(max_size) = get(ini, CACHE_SECTION, "max_size") {
            config.cache.max_total_bytes =
                parse_size(max_size).map_err(|e| invalid(CACHE_SECTION, "max_size", max_size, e))?;
        }
        if let Some(version) = parse_key::<u32>(ini, CACHE_SECTION, "schema_version")? {
            config.cache.schema_version = version;
        }
        let directory = get(ini, CACHE_SECTION, "directory")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);
        config.cache.backend = match get(ini, CACHE_SECTION, "backend") {
            None | Some("directory") => StorageBackend::Directory(directory),
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(invalid(
                    CACHE_SECTION,
                    "backend",
                    other,
                    "expected 'directory' or 'memory'",
                ))
            }
        };

        if let Some(level) = get(ini, LOGGING_SECTION, "level") {
            config.logging.level = level.to_string();
        }
        config.logging.directory = get(ini, LOGGING_SECTION, "directory")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// Renders every setting, including defaults.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();

        ini.with_section(Some(BRIDGE_SECTION))
            .set("max_concurrent", self.bridge.max_concurrent.to_string())
            .set(
                "default_timeout_secs",
                self.bridge.default_timeout.as_secs().to_string(),
            )
            .set(
                "init_timeout_secs",
                self.bridge.init_timeout.as_secs().to_string(),
            );

        let (backend, directory) = match &self.cache.backend {
            StorageBackend::Memory => ("memory", String::new()),
            StorageBackend::Directory(dir) => ("directory", dir.display().to_string()),
        };
        ini.with_section(Some(CACHE_SECTION))
            .set("enabled", self.cache.enabled.to_string())
            .set("backend", backend)
            .set("directory", directory)
            .set("max_size", format_size(self.cache.max_total_bytes))
            .set("schema_version", self.cache.schema_version.to_string());

        ini.with_section(Some(LOGGING_SECTION))
            .set("level", self.logging.level.clone())
            .set(
                "directory",
                self.logging
                    .directory
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_default(),
            );

        ini
    }
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|props| props.get(key))
        .map(str::trim)
}

fn parse_key<T>(ini: &Ini, section: &str, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(ini, section, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(section, key, raw, e)),
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Size Helpers
// =============================================================================

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Parses a human-readable size such as `512MB`, `2 GB` or `1.5g`.
///
/// Units are binary (1 KB = 1024 bytes). A bare number is bytes.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KB,
        "M" | "MB" | "MIB" => MB,
        "G" | "GB" | "GIB" => GB,
        "T" | "TB" | "TIB" => TB,
        _ => return Err(ConfigError::InvalidSize(input.to_string())),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidSize(input.to_string()));
    }
    Ok((value * multiplier as f64).round() as u64)
}

/// Formats a byte count with the largest fitting binary unit.
pub fn format_size(bytes: u64) -> String {
    let (value, unit) = match bytes {
        b if b >= TB => (b as f64 / TB as f64, "TB"),
        b if b >= GB => (b as f64 / GB as f64, "GB"),
        b if b >= MB => (b as f64 / MB as f64, "MB"),
        b if b >= KB => (b as f64 / KB as f64, "KB"),
        b => return format!("{} B", b),
    };
    if value.fract() == 0.0 {
        format!("{}{}", value as u64, unit)
    } else {
        format!("{:.1}{}", value, unit)
    }
}
