//! Controller configuration.
//!
//! `ControllerOptions` is the single recognized option bag: every field here
//! is named in the controller's public contract, each with the documented
//! default. The serializable subset (`ControllerOptionsData`) rejects
//! unknown fields at deserialization time rather than silently ignoring
//! them — a config file with a typo'd field name is a construction-time
//! error, not a silently-defaulted option.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// PID gains and setpoint, see `PIDController`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Target measured signal (percent CPU).
    pub setpoint: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.05,
            kd: 0.1,
            setpoint: 90.0,
        }
    }
}

/// Hard ceilings. Crossing any of these clamps the recommendation to 1
/// regardless of anything else in flight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmergencyLimits {
    pub cpu_temp: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
}

impl Default for EmergencyLimits {
    fn default() -> Self {
        Self {
            cpu_temp: 95.0,
            cpu_usage: 98.0,
            memory_usage: 95.0,
            gpu_temp: 95.0,
            gpu_usage: 98.0,
        }
    }
}

/// Soft ceilings used for the "near emergency" / scale-down signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HighThresholds {
    pub cpu_usage: f64,
    pub cpu_temp: f64,
    pub memory_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
}

impl Default for HighThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 85.0,
            cpu_temp: 85.0,
            memory_usage: 85.0,
            gpu_temp: 85.0,
            gpu_usage: 85.0,
        }
    }
}

/// Where (and whether) scaling decisions and usage history are persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceConfig {
    /// No durable sink; the in-memory fallback is used exclusively.
    InMemory,
    /// SQLite-backed store. `path: None` resolves to the platform data
    /// directory (`dirs::data_dir()/llm-threader/scaling.db`).
    Sqlite { path: Option<PathBuf> },
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig::Sqlite { path: None }
    }
}

/// Invoked from the supervisor tick whenever the effective limit changes:
/// `(new_limit, previous_limit)`. Never invoked while the admission lock is
/// held.
pub type ScalingUpdateCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Full controller configuration.
#[derive(Clone)]
pub struct ControllerOptions {
    /// Hard cap on concurrency. `None` means autotune with no ceiling.
    pub max_threads: Option<u32>,
    pub monitoring_interval: Duration,
    pub max_history_age: Duration,
    pub max_data_points: usize,
    pub max_history_size: usize,
    pub max_performance_history: usize,
    pub max_demand_history: usize,
    pub emergency_absolute_limits: EmergencyLimits,
    pub high_thresholds: HighThresholds,
    pub pid: PidGains,
    pub scale_cooldown: Duration,
    pub scaling_history_retention: Duration,
    pub on_scaling_update: Option<ScalingUpdateCallback>,
    pub persistence: PersistenceConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_threads: None,
            monitoring_interval: Duration::from_millis(1000),
            max_history_age: Duration::from_secs(5 * 60),
            max_data_points: 300,
            max_history_size: 100,
            max_performance_history: 200,
            max_demand_history: 50,
            emergency_absolute_limits: EmergencyLimits::default(),
            high_thresholds: HighThresholds::default(),
            pid: PidGains::default(),
            scale_cooldown: Duration::from_millis(10_000),
            scaling_history_retention: Duration::from_secs_f64(3600.0 / 3.0),
            on_scaling_update: None,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ControllerOptions {
    /// Construction-time validation. Never panics; an invalid combination
    /// is a `Configuration` error, not a silently-substituted default.
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_threads {
            if max == 0 {
                return Err(ControllerError::Configuration(
                    "max_threads must be >= 1 when set".to_string(),
                ));
            }
        }
        if self.monitoring_interval.is_zero() {
            return Err(ControllerError::Configuration(
                "monitoring_interval must be > 0".to_string(),
            ));
        }
        if self.max_data_points == 0 || self.max_history_size == 0 {
            return Err(ControllerError::Configuration(
                "max_data_points and max_history_size must be > 0".to_string(),
            ));
        }
        if self.pid.outputs_invalid() {
            return Err(ControllerError::Configuration(
                "pid gains must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Build options from the serializable subset plus the programmatic
    /// (non-serializable) fields that a config file cannot express.
    pub fn from_data(
        data: ControllerOptionsData,
        on_scaling_update: Option<ScalingUpdateCallback>,
        persistence: PersistenceConfig,
    ) -> Result<Self> {
        let opts = Self {
            max_threads: data.max_threads,
            monitoring_interval: Duration::from_millis(data.monitoring_interval_ms),
            max_history_age: Duration::from_secs(data.max_history_age_minutes * 60),
            max_data_points: data.max_data_points,
            max_history_size: data.max_history_size,
            max_performance_history: data.max_performance_history,
            max_demand_history: data.max_demand_history,
            emergency_absolute_limits: data.emergency_absolute_limits,
            high_thresholds: data.high_thresholds,
            pid: data.pid,
            scale_cooldown: Duration::from_millis(data.scale_cooldown_ms),
            scaling_history_retention: Duration::from_secs_f64(
                data.scaling_history_retention_hours * 3600.0,
            ),
            on_scaling_update,
            persistence,
        };
        opts.validate()?;
        Ok(opts)
    }
}

impl PidGains {
    fn outputs_invalid(&self) -> bool {
        !self.kp.is_finite() || !self.ki.is_finite() || !self.kd.is_finite() || !self.setpoint.is_finite()
    }
}

/// Serializable mirror of the numeric/threshold fields in
/// `ControllerOptions`. Deliberately excludes `on_scaling_update` (a
/// closure) and `persistence` (resolved programmatically) — those aren't
/// things a config file should express. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerOptionsData {
    #[serde(default)]
    pub max_threads: Option<u32>,
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    #[serde(default = "default_max_history_age_minutes")]
    pub max_history_age_minutes: u64,
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    #[serde(default = "default_max_performance_history")]
    pub max_performance_history: usize,
    #[serde(default = "default_max_demand_history")]
    pub max_demand_history: usize,
    #[serde(default)]
    pub emergency_absolute_limits: EmergencyLimits,
    #[serde(default)]
    pub high_thresholds: HighThresholds,
    #[serde(default)]
    pub pid: PidGains,
    #[serde(default = "default_scale_cooldown_ms")]
    pub scale_cooldown_ms: u64,
    #[serde(default = "default_scaling_history_retention_hours")]
    pub scaling_history_retention_hours: f64,
}

impl Default for ControllerOptionsData {
    fn default() -> Self {
        Self {
            max_threads: None,
            monitoring_interval_ms: default_monitoring_interval_ms(),
            max_history_age_minutes: default_max_history_age_minutes(),
            max_data_points: default_max_data_points(),
            max_history_size: default_max_history_size(),
            max_performance_history: default_max_performance_history(),
            max_demand_history: default_max_demand_history(),
            emergency_absolute_limits: EmergencyLimits::default(),
            high_thresholds: HighThresholds::default(),
            pid: PidGains::default(),
            scale_cooldown_ms: default_scale_cooldown_ms(),
            scaling_history_retention_hours: default_scaling_history_retention_hours(),
        }
    }
}

fn default_monitoring_interval_ms() -> u64 {
    1000
}
fn default_max_history_age_minutes() -> u64 {
    5
}
fn default_max_data_points() -> usize {
    300
}
fn default_max_history_size() -> usize {
    100
}
fn default_max_performance_history() -> usize {
    200
}
fn default_max_demand_history() -> usize {
    50
}
fn default_scale_cooldown_ms() -> u64 {
    10_000
}
fn default_scaling_history_retention_hours() -> f64 {
    1.0 / 3.0
}

/// Per-submission options.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    pub priority: i32,
    pub emergency: bool,
    pub timeout: Option<Duration>,
    pub cancel_token: Option<tokio_util::sync::CancellationToken>,
    /// Optional tag used to build the operation-mix / per-type profile
    /// history consumed by `TrendAnalyzer::operation_mix_diff`.
    pub operation_type: Option<String>,
}
