//! TOML configuration for the head unit.
//!
//! Read from `--config <path>` or the platform config file:
//! - Linux:    `$XDG_CONFIG_HOME/headunit/config.toml` (or `~/.config/...`)
//! - Windows:  `%APPDATA%\headunit\config.toml`
//! - macOS:    `~/Library/Application Support/headunit/config.toml`
//!
//! Every field has a serde default, so a missing file or a file with only
//! some sections yields a working configuration:
//!
//! ```toml
//! [session]
//! protocol_revision = "rev2"      # "rev1" advertises audio-input instead of av-input
//! rearm_policy = "after-send"     # or "immediate"
//!
//! [watcher]
//! poll_interval_ms = 1000
//! event_wait_ms = 100             # 1..=100; bounds how long stop() waits
//!
//! [fallback]
//! frame_interval_ms = 100
//! width = 800
//! height = 480
//!
//! [executor]
//! worker_threads = 1
//! shutdown_timeout_ms = 500
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use headunit_core::{PixelFormat, SurfaceFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::protocol_handler::ProtocolSettings;
use crate::infrastructure::device_watcher::{DeviceWatcherConfig, STOP_CHECK_INTERVAL};
use crate::infrastructure::fallback_renderer::FallbackConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeadUnitConfig {
    #[serde(default)]
    pub session: ProtocolSettings,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherSection {
    /// Device-count polling period when hot-plug is unavailable.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Longest single wait for hot-plug events.
    #[serde(default = "default_event_wait_ms")]
    pub event_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackSection {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSection {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// How long destruction waits for in-flight work.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` level or filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_event_wait_ms() -> u64 {
    100
}
fn default_frame_interval_ms() -> u64 {
    100
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    480
}
fn default_worker_threads() -> usize {
    1
}
fn default_shutdown_timeout_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            event_wait_ms: default_event_wait_ms(),
        }
    }
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl HeadUnitConfig {
    /// Checks values serde cannot reject on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.executor.worker_threads == 0 {
            return invalid("executor.worker_threads", "must be at least 1");
        }
        if self.fallback.frame_interval_ms == 0 {
            return invalid("fallback.frame_interval_ms", "must be at least 1");
        }
        if self.fallback.width == 0 || self.fallback.height == 0 {
            return invalid("fallback.width/height", "must be non-zero");
        }
        if self.watcher.poll_interval_ms == 0 {
            return invalid("watcher.poll_interval_ms", "must be at least 1");
        }
        let max_event_wait = STOP_CHECK_INTERVAL.as_millis() as u64;
        if self.watcher.event_wait_ms == 0 || self.watcher.event_wait_ms > max_event_wait {
            return invalid("watcher.event_wait_ms", "must be between 1 and 100");
        }
        Ok(())
    }

    pub fn watcher_config(&self) -> DeviceWatcherConfig {
        DeviceWatcherConfig {
            poll_interval: Duration::from_millis(self.watcher.poll_interval_ms),
            event_wait: Duration::from_millis(self.watcher.event_wait_ms),
        }
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            frame_interval: Duration::from_millis(self.fallback.frame_interval_ms),
            format: SurfaceFormat::new(self.fallback.width, self.fallback.height, PixelFormat::Rgb32),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.executor.shutdown_timeout_ms)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the platform config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn platform_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] for out-of-range values.
pub fn load_config(path: &Path) -> Result<HeadUnitConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<HeadUnitConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HeadUnitConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &HeadUnitConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("headunit"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("headunit"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("headunit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::protocol_handler::{ProtocolRevision, RearmPolicy};

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("headunit-config-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_default_config_matches_documented_values() {
        // Arrange / Act
        let cfg = HeadUnitConfig::default();

        // Assert
        assert_eq!(cfg.session.protocol_revision, ProtocolRevision::Rev2);
        assert_eq!(cfg.session.rearm_policy, RearmPolicy::AfterSend);
        assert_eq!(cfg.watcher.poll_interval_ms, 1000);
        assert_eq!(cfg.watcher.event_wait_ms, 100);
        assert_eq!(cfg.fallback.frame_interval_ms, 100);
        assert_eq!((cfg.fallback.width, cfg.fallback.height), (800, 480));
        assert_eq!(cfg.executor.worker_threads, 1);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let cfg: HeadUnitConfig = toml::from_str(
            r#"
            [session]
            protocol_revision = "rev1"

            [fallback]
            width = 1024
            "#,
        )
        .unwrap();

        assert_eq!(cfg.session.protocol_revision, ProtocolRevision::Rev1);
        assert_eq!(cfg.session.rearm_policy, RearmPolicy::AfterSend);
        assert_eq!(cfg.fallback.width, 1024);
        assert_eq!(cfg.fallback.height, 480);
        assert_eq!(cfg.executor, ExecutorSection::default());
    }

    #[test]
    fn test_conversions_use_milliseconds() {
        let mut cfg = HeadUnitConfig::default();
        cfg.watcher.poll_interval_ms = 250;
        cfg.fallback.frame_interval_ms = 40;

        assert_eq!(cfg.watcher_config().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.fallback_config().frame_interval, Duration::from_millis(40));
        assert_eq!(cfg.fallback_config().format.pixel_format, PixelFormat::Rgb32);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let mut cfg = HeadUnitConfig::default();
        cfg.executor.worker_threads = 0;

        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "executor.worker_threads", .. })
        ));
    }

    #[test]
    fn test_event_wait_outside_stop_check_bound_is_rejected() {
        for wait in [0, 101, 3000] {
            let mut cfg = HeadUnitConfig::default();
            cfg.watcher.event_wait_ms = wait;

            assert!(
                matches!(cfg.validate(), Err(ConfigError::Invalid { field: "watcher.event_wait_ms", .. })),
                "event_wait_ms = {wait}"
            );
        }
    }

    #[test]
    fn test_event_wait_at_bounds_is_accepted() {
        for wait in [1, 100] {
            let mut cfg = HeadUnitConfig::default();
            cfg.watcher.event_wait_ms = wait;

            assert!(cfg.validate().is_ok(), "event_wait_ms = {wait}");
        }
    }

    #[test]
    fn test_load_rejects_long_event_wait() {
        let path = scratch_file("slow-watcher.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[watcher]\nevent_wait_ms = 3000\n").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Invalid { .. })));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = load_config(Path::new("/nonexistent/headunit/config.toml")).unwrap();
        assert_eq!(cfg, HeadUnitConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let path = scratch_file("saved.toml");
        let mut cfg = HeadUnitConfig::default();
        cfg.session.rearm_policy = RearmPolicy::Immediate;
        cfg.logging.level = "debug".into();

        // Act
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let path = scratch_file("broken.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[session\nprotocol_revision = ").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_file(path).ok();
    }
}
