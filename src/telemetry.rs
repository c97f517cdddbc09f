//! Host telemetry sampling.
//!
//! `TelemetrySource::sample` must never fail: a probe that cannot reach a
//! sensor reports that field as absent (`None`), never `0.0` — absent and
//! zero are different facts about the host, and the decision engine's
//! averages must be computed over defined values only.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sysinfo::{ComponentExt, System, SystemExt};

/// A single telemetry reading. Every metric is optional; `ts` is always
/// present (milliseconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub ts_ms: u64,
    pub cpu_usage: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub mem_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub gpu_temp: Option<f64>,
}

impl TelemetrySample {
    /// An all-absent sample stamped with the current time, used when a
    /// probe fails outright rather than partially.
    pub fn absent() -> Self {
        Self {
            ts_ms: now_ms(),
            cpu_usage: None,
            cpu_temp: None,
            mem_usage: None,
            gpu_usage: None,
            gpu_temp: None,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Abstract probe for host metrics. Implementations must be cheap enough to
/// call on every supervisor tick and must never panic or block on I/O for
/// longer than a sample interval.
pub trait TelemetrySource: Send + Sync {
    fn sample(&self) -> TelemetrySample;
}

/// Default telemetry source backed by `sysinfo`.
///
/// CPU temperature is the arithmetic mean of whichever of {a component
/// labeled as the package sensor, the per-core sensors, the component
/// reporting the highest reading} are present — mirroring the "mean of
/// available sensors" contract rather than picking just one. GPU fields are
/// always absent: no GPU-capable crate is part of this build, and the
/// contract requires absence (not zero) when a primary GPU controller isn't
/// discoverable.
pub struct SysinfoTelemetrySource {
    system: Mutex<System>,
}

impl SysinfoTelemetrySource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_components_list();
        Self {
            system: Mutex::new(system),
        }
    }

    fn cpu_temperature(system: &System) -> Option<f64> {
        let components = system.components();
        if components.is_empty() {
            return None;
        }

        let mut package: Option<f64> = None;
        let mut core_readings: Vec<f64> = Vec::new();
        let mut max_reading: Option<f64> = None;

        for component in components {
            let label = component.label().to_lowercase();
            let temp = component.temperature() as f64;
            if temp.is_nan() {
                continue;
            }
            if label.contains("package") || label.contains("tctl") {
                package = Some(package.map_or(temp, |p: f64| (p + temp) / 2.0));
            }
            if label.contains("core") {
                core_readings.push(temp);
            }
            max_reading = Some(max_reading.map_or(temp, f64::max));
        }

        let core_avg = if core_readings.is_empty() {
            None
        } else {
            Some(core_readings.iter().sum::<f64>() / core_readings.len() as f64)
        };

        let present: Vec<f64> = [package, core_avg, max_reading]
            .into_iter()
            .flatten()
            .collect();
        if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<f64>() / present.len() as f64)
        }
    }
}

impl Default for SysinfoTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SysinfoTelemetrySource {
    fn sample(&self) -> TelemetrySample {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return TelemetrySample::absent(),
        };

        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_components();

        let cpu_usage = if system.cpus().is_empty() {
            None
        } else {
            Some(system.global_cpu_info().cpu_usage() as f64)
        };

        let mem_usage = if system.total_memory() == 0 {
            None
        } else {
            Some(system.used_memory() as f64 / system.total_memory() as f64 * 100.0)
        };

        TelemetrySample {
            ts_ms: now_ms(),
            cpu_usage,
            cpu_temp: Self::cpu_temperature(&system),
            mem_usage,
            gpu_usage: None,
            gpu_temp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_sample_has_no_metrics_but_has_timestamp() {
        let sample = TelemetrySample::absent();
        assert!(sample.cpu_usage.is_none());
        assert!(sample.cpu_temp.is_none());
        assert!(sample.mem_usage.is_none());
        assert!(sample.gpu_usage.is_none());
        assert!(sample.gpu_temp.is_none());
        assert!(sample.ts_ms > 0);
    }

    #[test]
    fn sysinfo_source_never_panics_and_tags_gpu_absent() {
        let source = SysinfoTelemetrySource::new();
        let sample = source.sample();
        assert!(sample.gpu_usage.is_none());
        assert!(sample.gpu_temp.is_none());
    }
}
