//! Global configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Session lifecycle thresholds: capacity, timers, and memory tiers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct LifecycleConfig {
    /// Maximum concurrently registered sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Inactivity timeout before a session is eligible for cleanup.
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,
    /// Heartbeat-loss threshold, independent of (and shorter than) the
    /// inactivity timeout.
    #[serde(default = "default_heartbeat_loss_minutes")]
    pub heartbeat_loss_minutes: u64,
    /// Interval between background sweep passes.
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,
    /// Absolute ceiling on session age regardless of activity.
    #[serde(default = "default_max_session_age_minutes")]
    pub max_session_age_minutes: u64,
    /// Minimum age of an unowned workspace directory before the orphan
    /// sweep removes it.
    #[serde(default = "default_orphan_grace_minutes")]
    pub orphan_grace_minutes: u64,
    /// Memory usage percent at which shortened-timeout cleanup engages.
    #[serde(default = "default_memory_pressure_percent")]
    pub memory_pressure_percent: f64,
    /// Memory usage percent at which forced LRU eviction engages.
    #[serde(default = "default_force_cleanup_percent")]
    pub force_cleanup_percent: f64,
}

fn default_max_sessions() -> usize {
    10
}

fn default_session_timeout_minutes() -> u64 {
    30
}

fn default_heartbeat_loss_minutes() -> u64 {
    2
}

fn default_cleanup_interval_minutes() -> u64 {
    5
}

fn default_max_session_age_minutes() -> u64 {
    240
}

fn default_orphan_grace_minutes() -> u64 {
    60
}

fn default_memory_pressure_percent() -> f64 {
    75.0
}

fn default_force_cleanup_percent() -> f64 {
    85.0
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_minutes: default_session_timeout_minutes(),
            heartbeat_loss_minutes: default_heartbeat_loss_minutes(),
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
            max_session_age_minutes: default_max_session_age_minutes(),
            orphan_grace_minutes: default_orphan_grace_minutes(),
            memory_pressure_percent: default_memory_pressure_percent(),
            force_cleanup_percent: default_force_cleanup_percent(),
        }
    }
}

impl LifecycleConfig {
    /// Inactivity timeout as a [`Duration`].
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    /// Heartbeat-loss threshold as a [`Duration`].
    #[must_use]
    pub fn heartbeat_loss(&self) -> Duration {
        Duration::from_secs(self.heartbeat_loss_minutes * 60)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }

    /// Absolute session age ceiling as a [`Duration`].
    #[must_use]
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_minutes * 60)
    }

    /// Orphan-directory grace window as a [`Duration`].
    #[must_use]
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_minutes * 60)
    }
}

/// Event broadcast queue sizing and timer intervals.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BroadcastConfig {
    /// Per-subscriber bounded queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Interval between proactive heartbeat broadcasts.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Interval between sweeps reclaiming empty channels.
    #[serde(default = "default_channel_sweep_interval_seconds")]
    pub channel_sweep_interval_seconds: u64,
}

fn default_queue_capacity() -> usize {
    500
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_channel_sweep_interval_seconds() -> u64 {
    300
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            channel_sweep_interval_seconds: default_channel_sweep_interval_seconds(),
        }
    }
}

impl BroadcastConfig {
    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Empty-channel sweep interval as a [`Duration`].
    #[must_use]
    pub fn channel_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.channel_sweep_interval_seconds)
    }
}

/// Turn execution limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TurnConfig {
    /// Deadline for a single agent turn.
    #[serde(default = "default_turn_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Maximum concurrently executing turns across all sessions.
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent: usize,
}

fn default_turn_timeout_seconds() -> u64 {
    1200
}

fn default_max_concurrent_turns() -> usize {
    10
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_turn_timeout_seconds(),
            max_concurrent: default_max_concurrent_turns(),
        }
    }
}

impl TurnConfig {
    /// Turn deadline as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_http_port() -> u16 {
    8000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory under which every per-session workspace lives.
    /// Safe-delete checks and the orphan sweep are scoped to this tree.
    pub workspace_root: PathBuf,
    /// Agent engine binary launched per session.
    pub engine_command: String,
    /// Default arguments for the engine binary.
    #[serde(default)]
    pub engine_args: Vec<String>,
    /// HTTP port for the API and SSE transport.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Default engine configuration template; per-session overrides merge
    /// over a deep copy of this table.
    #[serde(default)]
    pub session_defaults: BTreeMap<String, serde_json::Value>,
    /// Session lifecycle thresholds.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Broadcast queue sizing and timers.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Turn execution limits.
    #[serde(default)]
    pub turn: TurnConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn validate(&mut self) -> Result<()> {
        if self.lifecycle.max_sessions == 0 {
            return Err(AppError::Config(
                "lifecycle.max_sessions must be greater than zero".into(),
            ));
        }

        if self.broadcast.queue_capacity == 0 {
            return Err(AppError::Config(
                "broadcast.queue_capacity must be greater than zero".into(),
            ));
        }

        let pressure = self.lifecycle.memory_pressure_percent;
        let force = self.lifecycle.force_cleanup_percent;
        if !(0.0..=100.0).contains(&pressure) || !(0.0..=100.0).contains(&force) {
            return Err(AppError::Config(
                "memory thresholds must be percentages between 0 and 100".into(),
            ));
        }
        if pressure >= force {
            return Err(AppError::Config(
                "lifecycle.memory_pressure_percent must be below force_cleanup_percent".into(),
            ));
        }

        if self.engine_command.trim().is_empty() {
            return Err(AppError::Config("engine_command must not be empty".into()));
        }

        // The workspace root is created on first start so the safe-delete
        // guard always has a real directory to canonicalize against.
        fs::create_dir_all(&self.workspace_root)
            .map_err(|err| AppError::Config(format!("workspace_root not creatable: {err}")))?;
        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
