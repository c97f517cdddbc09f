//! Bounded telemetry, performance, and scaling-decision history.
//!
//! Three independent rings (telemetry, performance, demand) plus an
//! in-memory scaling-decision log that always exists regardless of whether
//! a durable `ScalingStore` is configured — persistence, when present, is a
//! write-through in addition to the ring, never a replacement for it, since
//! `TrendAnalyzer`/`DecisionEngine` need fast synchronous reads.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetrySample;

/// A telemetry sample plus the concurrency/queue context in effect when it
/// was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfPoint {
    pub sample: TelemetrySample,
    pub thread_count: u32,
    pub active_threads: u32,
    pub queue_pressure: u32,
    pub backlog: u32,
    pub utilization: f64,
    pub throughput: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    /// Share of recent operations contributed by each operation type.
    pub operation_mix: HashMap<String, f64>,
    /// Caller-reported or inferred relative resource weight in [0, 1].
    pub intensity: f64,
}

/// A lighter-weight point used purely for unmet-demand tracking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemandPoint {
    pub ts_ms: u64,
    pub queue_pressure: u32,
    pub active_threads: u32,
    pub utilization: f64,
    pub has_unmet_demand: bool,
    pub backlog: u32,
}

/// A recorded scale event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub ts_ms: u64,
    pub recommended_threads: u32,
    pub previous_threads: u32,
    pub reason: String,
    pub confidence: f64,
}

/// Summary statistics over the telemetry ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub data_points: usize,
    pub time_span_sec: f64,
    pub avg_cpu_usage: Option<f64>,
    pub avg_cpu_temp: Option<f64>,
    pub avg_mem_usage: Option<f64>,
    pub min_cpu_usage: Option<f64>,
    pub max_cpu_usage: Option<f64>,
    pub min_cpu_temp: Option<f64>,
    pub max_cpu_temp: Option<f64>,
}

/// Running per-operation-type accumulator feeding the operation-mix
/// context consumed by the decision engine and `TrendAnalyzer`.
#[derive(Debug, Clone, Default)]
pub struct OperationProfileAccumulator {
    pub count: u64,
    pub avg_duration_ms: f64,
    pub last_updated_ms: u64,
}

impl OperationProfileAccumulator {
    fn record(&mut self, duration_ms: f64, now_ms: u64) {
        self.count += 1;
        // running mean, grounded in the teacher's incremental-average style
        // (`PerformanceMonitor::get_report`'s latency averaging).
        self.avg_duration_ms += (duration_ms - self.avg_duration_ms) / self.count as f64;
        self.last_updated_ms = now_ms;
    }
}

/// Snapshot fed into `DecisionEngine::decide`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationMixContext {
    pub current_intensity: f64,
    pub total_operations: u64,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn min_max(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        (None, None)
    } else {
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        (Some(min), Some(max))
    }
}

/// Single-writer (the supervisor), multi-reader bounded history.
pub struct HistoryStore {
    telemetry: RwLock<VecDeque<TelemetrySample>>,
    perf: RwLock<VecDeque<PerfPoint>>,
    demand: RwLock<VecDeque<DemandPoint>>,
    scaling_log: RwLock<VecDeque<ScalingDecision>>,
    operation_profiles: DashMap<String, OperationProfileAccumulator>,

    max_history_age: Duration,
    max_data_points: usize,
    max_performance_history: usize,
    max_demand_history: usize,
    scaling_history_retention: Duration,
}

impl HistoryStore {
    pub fn new(
        max_history_age: Duration,
        max_data_points: usize,
        max_performance_history: usize,
        max_demand_history: usize,
        scaling_history_retention: Duration,
    ) -> Self {
        Self {
            telemetry: RwLock::new(VecDeque::new()),
            perf: RwLock::new(VecDeque::new()),
            demand: RwLock::new(VecDeque::new()),
            scaling_log: RwLock::new(VecDeque::new()),
            operation_profiles: DashMap::new(),
            max_history_age,
            max_data_points,
            max_performance_history,
            max_demand_history,
            scaling_history_retention,
        }
    }

    fn evict_telemetry(&self, ring: &mut VecDeque<TelemetrySample>) {
        let cutoff = crate::telemetry::now_ms().saturating_sub(self.max_history_age.as_millis() as u64);
        while ring.front().map(|s| s.ts_ms < cutoff).unwrap_or(false) {
            ring.pop_front();
        }
        while ring.len() > self.max_data_points {
            ring.pop_front();
        }
    }

    pub fn append_telemetry(&self, sample: TelemetrySample) {
        let mut ring = self.telemetry.write();
        ring.push_back(sample);
        self.evict_telemetry(&mut ring);
    }

    pub fn append_perf(&self, point: PerfPoint) {
        let mut ring = self.perf.write();
        ring.push_back(point);
        while ring.len() > self.max_performance_history {
            ring.pop_front();
        }
    }

    pub fn append_demand(&self, point: DemandPoint) {
        let mut ring = self.demand.write();
        ring.push_back(point);
        while ring.len() > self.max_demand_history {
            ring.pop_front();
        }
    }

    /// Telemetry samples within the last `window` of now.
    pub fn recent(&self, window: Duration) -> Vec<TelemetrySample> {
        let mut ring = self.telemetry.write();
        self.evict_telemetry(&mut ring);
        let cutoff = crate::telemetry::now_ms().saturating_sub(window.as_millis() as u64);
        ring.iter().filter(|s| s.ts_ms >= cutoff).cloned().collect()
    }

    /// All telemetry samples, after lazy eviction.
    pub fn all(&self) -> Vec<TelemetrySample> {
        let mut ring = self.telemetry.write();
        self.evict_telemetry(&mut ring);
        ring.iter().cloned().collect()
    }

    pub fn perf_points(&self) -> Vec<PerfPoint> {
        self.perf.read().iter().cloned().collect()
    }

    pub fn demand_points(&self) -> Vec<DemandPoint> {
        self.demand.read().iter().cloned().collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let samples = self.all();
        if samples.is_empty() {
            return HistoryStats::default();
        }

        let cpu_usage: Vec<f64> = samples.iter().filter_map(|s| s.cpu_usage).collect();
        let cpu_temp: Vec<f64> = samples.iter().filter_map(|s| s.cpu_temp).collect();
        let mem_usage: Vec<f64> = samples.iter().filter_map(|s| s.mem_usage).collect();

        let (min_cpu_usage, max_cpu_usage) = min_max(&cpu_usage);
        let (min_cpu_temp, max_cpu_temp) = min_max(&cpu_temp);

        let time_span_sec = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (last.ts_ms.saturating_sub(first.ts_ms)) as f64 / 1000.0,
            _ => 0.0,
        };

        HistoryStats {
            data_points: samples.len(),
            time_span_sec,
            avg_cpu_usage: mean(&cpu_usage),
            avg_cpu_temp: mean(&cpu_temp),
            avg_mem_usage: mean(&mem_usage),
            min_cpu_usage,
            max_cpu_usage,
            min_cpu_temp,
            max_cpu_temp,
        }
    }

    /// Append to the in-memory scaling log, evicting by age, and hand the
    /// decision to the durable store if the caller has one — the store's
    /// own fallback-on-failure is the caller's responsibility (it happens
    /// in `Controller`/`Supervisor`, which hold the `ScalingStore` handle).
    pub fn record_scaling_decision(&self, decision: ScalingDecision) {
        let mut log = self.scaling_log.write();
        log.push_back(decision);
        let cutoff =
            crate::telemetry::now_ms().saturating_sub(self.scaling_history_retention.as_millis() as u64);
        while log.front().map(|d| d.ts_ms < cutoff).unwrap_or(false) {
            log.pop_front();
        }
    }

    pub fn scaling_history(&self) -> Vec<ScalingDecision> {
        self.scaling_log.read().iter().cloned().collect()
    }

    /// Record a completed operation's duration against its type tag,
    /// feeding `operation_mix_context` and `TrendAnalyzer::operation_mix_diff`.
    pub fn record_operation(&self, operation_type: &str, duration_ms: f64) {
        let now = crate::telemetry::now_ms();
        self.operation_profiles
            .entry(operation_type.to_string())
            .or_default()
            .record(duration_ms, now);
    }

    /// Point-in-time copy of every tracked operation type's accumulator,
    /// for the supervisor to flush to the durable store once per tick.
    pub fn operation_profiles_snapshot(&self) -> Vec<(String, OperationProfileAccumulator)> {
        self.operation_profiles
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Current operation-mix snapshot: each type's share of recorded
    /// operations, used by `TrendAnalyzer::operation_mix_diff`.
    pub fn operation_mix(&self) -> HashMap<String, f64> {
        let total: u64 = self.operation_profiles.iter().map(|e| e.count).sum();
        if total == 0 {
            return HashMap::new();
        }
        self.operation_profiles
            .iter()
            .map(|e| (e.key().clone(), e.value().count as f64 / total as f64))
            .collect()
    }

    /// `{currentIntensity, totalOperations}` fed to `DecisionEngine::decide`.
    /// Intensity is the count-weighted average of each type's normalized
    /// duration (relative to the slowest known type) — a proxy for "how
    /// resource-heavy is the current mix", in the same spirit as the
    /// caller-supplied `intensity` field on `PerfPoint`.
    pub fn operation_mix_context(&self) -> OperationMixContext {
        let total: u64 = self.operation_profiles.iter().map(|e| e.count).sum();
        if total == 0 {
            return OperationMixContext::default();
        }
        let max_duration = self
            .operation_profiles
            .iter()
            .map(|e| e.avg_duration_ms)
            .fold(0.0_f64, f64::max);
        if max_duration <= 0.0 {
            return OperationMixContext {
                current_intensity: 0.0,
                total_operations: total,
            };
        }
        let weighted: f64 = self
            .operation_profiles
            .iter()
            .map(|e| (e.avg_duration_ms / max_duration) * (e.count as f64 / total as f64))
            .sum();
        OperationMixContext {
            current_intensity: weighted.clamp(0.0, 1.0),
            total_operations: total,
        }
    }

    pub fn max_performance_history(&self) -> usize {
        self.max_performance_history
    }
}
