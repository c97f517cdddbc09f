//! Orchestrates the PID controller, Bayesian search, rule-based guards,
//! scale-up validation, and emergency handling into one recommended
//! concurrency limit per tick.

use std::collections::{HashMap, VecDeque};

use rand::Rng;

use crate::config::{ControllerOptions, EmergencyLimits, HighThresholds};
use crate::history::{DemandPoint, OperationMixContext, PerfPoint};
use crate::perf_by_threads::PerformanceByThreadCount;
use crate::pid::PIDController;
use crate::reward::{RewardCalculator, RewardInputs, RewardThresholds};
use crate::telemetry::TelemetrySample;
use crate::trend::{TrendAction, TrendAnalyzer, TrendSample, TrendThresholds};

const RECENT_MIX_WINDOW: usize = 5;
const RECENT_DEMAND_WINDOW: usize = 5;
const STABLE_RESET_WINDOW_MS: u64 = 30_000;

/// Per-tick demand/throughput snapshot reported by the admission manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSnapshot {
    pub queue_pressure: u32,
    pub active_threads: u32,
    pub limit: u32,
    pub backlog: u32,
    pub throughput: Option<f64>,
    pub latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
}

/// Guardrails governing how long / how much data must accumulate before
/// another upward step past a freshly raised limit is allowed.
#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
    pub thermal_constant_ms: f64,
    pub samples_required: usize,
    pub degradation_tolerance: f64,
    pub validation_window_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingValidation {
    target_threads: u32,
    baseline_threads: u32,
    guardrails: Guardrails,
}

/// A tick's recommendation.
#[derive(Debug, Clone)]
pub struct ScalingRecommendation {
    pub threads: u32,
    pub reason: String,
    pub confidence: f64,
}

struct LoadPrediction {
    cpu: f64,
    temp: f64,
    mem: Option<f64>,
    #[allow(dead_code)]
    confidence: f64,
}

/// Intermediate result before the demand cap / bookkeeping pass applied by
/// `decide`.
struct RawDecision {
    threads: u32,
    reason: &'static str,
    confidence: f64,
    /// Guardrails already computed for an upward move, so `decide` doesn't
    /// recompute them when creating the pending validation.
    guardrails: Option<Guardrails>,
}

pub struct DecisionEngine {
    pid: PIDController,
    perf_by_threads: PerformanceByThreadCount,
    max_threads: Option<u32>,
    emergency: EmergencyLimits,
    high: HighThresholds,
    scale_cooldown_ms: u64,
    monitoring_interval_ms: u64,
    max_performance_history: usize,
    reward_thresholds: RewardThresholds,

    perf_history: VecDeque<PerfPoint>,
    recent_mixes: VecDeque<HashMap<String, f64>>,

    last_recommended: u32,
    last_scaling_decision_ms: u64,
    consecutive_emergencies: u32,
    stable_since_ms: Option<u64>,
    pending_validation: Option<PendingValidation>,
}

impl DecisionEngine {
    pub fn new(options: &ControllerOptions) -> Self {
        Self {
            pid: PIDController::new(options.pid, 1, 1_000_000),
            perf_by_threads: PerformanceByThreadCount::new(),
            max_threads: options.max_threads,
            emergency: options.emergency_absolute_limits,
            high: options.high_thresholds,
            scale_cooldown_ms: options.scale_cooldown.as_millis() as u64,
            monitoring_interval_ms: options.monitoring_interval.as_millis().max(1) as u64,
            max_performance_history: options.max_performance_history.max(1),
            reward_thresholds: RewardThresholds {
                high_cpu_usage: options.high_thresholds.cpu_usage,
                emergency_cpu_usage: options.emergency_absolute_limits.cpu_usage,
                high_temp: options.high_thresholds.cpu_temp,
                emergency_temp: options.emergency_absolute_limits.cpu_temp,
                high_gpu_usage: options.high_thresholds.gpu_usage,
                emergency_gpu_usage: options.emergency_absolute_limits.gpu_usage,
                high_gpu_temp: options.high_thresholds.gpu_temp,
                emergency_gpu_temp: options.emergency_absolute_limits.gpu_temp,
            },
            perf_history: VecDeque::new(),
            recent_mixes: VecDeque::new(),
            last_recommended: 1,
            last_scaling_decision_ms: 0,
            consecutive_emergencies: 0,
            stable_since_ms: None,
            pending_validation: None,
        }
    }

    pub fn last_recommended(&self) -> u32 {
        self.last_recommended
    }

    /// Feed a tick's `PerfPoint` into the engine's own history window
    /// (mirrors, but is independent of, the `HistoryStore`'s longer-lived
    /// ring — the engine only needs enough to drive guardrail/load-model
    /// math).
    pub fn record(&mut self, point: &PerfPoint) {
        self.perf_by_threads.record(
            point.thread_count,
            point.throughput,
            point.avg_latency_ms,
            Some(point.backlog as f64),
        );
        self.perf_history.push_back(point.clone());
        while self.perf_history.len() > self.max_performance_history {
            self.perf_history.pop_front();
        }
        if !point.operation_mix.is_empty() {
            self.recent_mixes.push_back(point.operation_mix.clone());
            while self.recent_mixes.len() > RECENT_MIX_WINDOW {
                self.recent_mixes.pop_front();
            }
        }
        self.perf_by_threads.update_optimal(self.perf_history.len());
    }

    fn exceeds(value: Option<f64>, limit: f64) -> bool {
        value.map(|v| v >= limit).unwrap_or(false)
    }

    fn is_hard_emergency(&self, telemetry: &TelemetrySample) -> bool {
        Self::exceeds(telemetry.cpu_temp, self.emergency.cpu_temp)
            || Self::exceeds(telemetry.cpu_usage, self.emergency.cpu_usage)
            || Self::exceeds(telemetry.mem_usage, self.emergency.memory_usage)
            || Self::exceeds(telemetry.gpu_usage, self.emergency.gpu_usage)
            || Self::exceeds(telemetry.gpu_temp, self.emergency.gpu_temp)
    }

    fn is_near_emergency(&self, telemetry: &TelemetrySample) -> bool {
        Self::exceeds(telemetry.cpu_usage, self.high.cpu_usage)
            || Self::exceeds(telemetry.cpu_temp, self.high.cpu_temp)
            || Self::exceeds(telemetry.mem_usage, self.high.memory_usage)
            || Self::exceeds(telemetry.gpu_usage, self.high.gpu_usage)
            || Self::exceeds(telemetry.gpu_temp, self.high.gpu_temp)
    }

    /// Exploration ceiling and the intensity-adjusted ceiling derived from
    /// it, per spec: `ceiling = max(4, ceil(max(historyMax*2, optimalBias,
    /// demandPush+historyMax+1)))`, `adjustedMax = floor(ceiling *
    /// clamp(1 - 0.3*intensity, 0.5, 1.5))`.
    fn ceilings(&self, demand_history: &[DemandPoint], intensity: f64) -> (u32, u32) {
        if let Some(max) = self.max_threads {
            let adjusted = ((max as f64) * (1.0 - 0.3 * intensity).clamp(0.5, 1.5))
                .floor()
                .max(1.0) as u32;
            return (max, adjusted.min(max));
        }

        let history_max = self
            .perf_history
            .iter()
            .map(|p| p.thread_count)
            .max()
            .unwrap_or(0)
            .max(self.last_recommended) as f64;
        let optimal_bias = self.perf_by_threads.optimal().map(|o| o as f64 + 4.0);
        let demand_push = demand_history
            .iter()
            .map(|d| (d.queue_pressure + d.active_threads) as f64)
            .fold(0.0_f64, f64::max);

        let mut candidate = (history_max * 2.0).max(demand_push + history_max + 1.0);
        if let Some(bias) = optimal_bias {
            candidate = candidate.max(bias);
        }
        let ceiling = candidate.max(4.0).ceil() as u32;
        let adjusted = ((ceiling as f64) * (1.0 - 0.3 * intensity).clamp(0.5, 1.5))
            .floor()
            .max(1.0) as u32;
        (ceiling, adjusted.min(ceiling))
    }

    fn thermal_constant_ms(&self) -> f64 {
        let mut deltas = Vec::new();
        for pair in self.perf_history.iter().collect::<Vec<_>>().windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            if curr.thread_count <= prev.thread_count {
                continue;
            }
            let (Some(prev_temp), Some(curr_temp)) = (prev.sample.cpu_temp, curr.sample.cpu_temp) else {
                continue;
            };
            if curr_temp - prev_temp > 2.0 {
                deltas.push((curr.sample.ts_ms.saturating_sub(prev.sample.ts_ms)) as f64);
            }
        }
        if deltas.is_empty() {
            5000.0
        } else {
            (deltas.iter().sum::<f64>() / deltas.len() as f64).clamp(2000.0, 20000.0)
        }
    }

    fn get_scale_up_guardrails(&self, prev: u32, next: u32) -> Guardrails {
        let thermal_constant_ms = self.thermal_constant_ms();

        let sample_density = self
            .perf_by_threads
            .sample_count(prev)
            .max(self.perf_by_threads.sample_count(next))
            .max((self.perf_history.len() as f64 * 0.1).ceil() as usize);
        let samples_required =
            (((sample_density + next as usize) as f64).sqrt().ceil() as usize).clamp(2, 25);

        let (cov_level, cov_samples) = if self.perf_by_threads.sample_count(prev)
            >= self.perf_by_threads.sample_count(next)
        {
            (prev, self.perf_by_threads.sample_count(prev))
        } else {
            (next, self.perf_by_threads.sample_count(next))
        };
        let cov = if cov_samples > 0 {
            self.perf_by_threads.cumulative_time_cov(cov_level).unwrap_or(0.0)
        } else {
            0.0
        };
        let avg_util = self.perf_by_threads.avg_utilization_proxy(next).unwrap_or(0.0);
        let degradation_tolerance =
            (1.0 / (prev as f64 + next as f64).max(1.0)).max(cov + avg_util / (next as f64).max(1.0));

        let avg_latency = {
            let latencies: Vec<f64> = self
                .perf_history
                .iter()
                .filter_map(|p| p.avg_latency_ms)
                .collect();
            if latencies.is_empty() {
                100.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            }
        };

        let min_data_window_ms =
            self.monitoring_interval_ms as f64 * self.max_performance_history as f64;
        let upper = (min_data_window_ms * 0.5).max(5000.0);
        let raw = (avg_latency * samples_required as f64)
            .max(self.scale_cooldown_ms as f64 * 0.5)
            .max(thermal_constant_ms * 0.75)
            .max(1000.0);
        let validation_window_ms = raw.min(upper).max(self.scale_cooldown_ms as f64) as u64;

        Guardrails {
            thermal_constant_ms,
            samples_required,
            degradation_tolerance,
            validation_window_ms,
        }
    }

    /// Whether an upward move from `prev` to `next` may proceed right now.
    /// On success returns the guardrails computed for this move (reused to
    /// seed the resulting `PendingValidation`).
    fn evaluate_scale_up(&self, prev: u32, next: u32, now_ms: u64) -> Result<Guardrails, &'static str> {
        if self.pending_validation.is_some() {
            return Err("awaiting_scale_up_validation_window");
        }
        let guardrails = self.get_scale_up_guardrails(prev, next);
        if self
            .perf_by_threads
            .shows_regression(prev, next, guardrails.degradation_tolerance)
        {
            return Err("historical_block_scale_up");
        }
        let min_wait = guardrails.validation_window_ms.max(self.scale_cooldown_ms);
        if now_ms.saturating_sub(self.last_scaling_decision_ms) < min_wait {
            return Err("awaiting_scale_up_validation_window");
        }
        Ok(guardrails)
    }

    fn predict_load_with_threads(&self, t: u32) -> LoadPrediction {
        if self.perf_history.len() < 10 {
            return match self.perf_history.back() {
                None => LoadPrediction {
                    cpu: 0.0,
                    temp: 0.0,
                    mem: None,
                    confidence: 0.3,
                },
                Some(last) => {
                    let ratio = t as f64 / (last.thread_count.max(1) as f64);
                    LoadPrediction {
                        cpu: last.sample.cpu_usage.unwrap_or(0.0) * ratio,
                        temp: last.sample.cpu_temp.unwrap_or(0.0) + (ratio - 1.0) * 5.0,
                        mem: last.sample.mem_usage.map(|m| m * ratio.sqrt()),
                        confidence: 0.3,
                    }
                }
            };
        }

        let last = self.perf_history.back().expect("checked len >= 10 above");
        let similar: Vec<&PerfPoint> = self
            .perf_history
            .iter()
            .filter(|p| {
                let cpu_diff = (p.sample.cpu_usage.unwrap_or(0.0) - last.sample.cpu_usage.unwrap_or(0.0)).abs();
                let temp_diff = (p.sample.cpu_temp.unwrap_or(0.0) - last.sample.cpu_temp.unwrap_or(0.0)).abs();
                let stable = !Self::exceeds(p.sample.cpu_usage, self.high.cpu_usage)
                    && !Self::exceeds(p.sample.cpu_temp, self.high.cpu_temp);
                cpu_diff < 20.0 && temp_diff < 10.0 && stable
            })
            .collect();

        if similar.len() >= 3 {
            let dt_for = |p: &PerfPoint| p.thread_count as f64 - last.thread_count as f64;
            let cpu_impacts: Vec<f64> = similar
                .iter()
                .filter(|p| dt_for(p) != 0.0)
                .map(|p| (p.sample.cpu_usage.unwrap_or(0.0) - last.sample.cpu_usage.unwrap_or(0.0)) / dt_for(p))
                .collect();
            let temp_impacts: Vec<f64> = similar
                .iter()
                .filter(|p| dt_for(p) != 0.0)
                .map(|p| (p.sample.cpu_temp.unwrap_or(0.0) - last.sample.cpu_temp.unwrap_or(0.0)) / dt_for(p))
                .collect();
            let mem_impacts: Vec<f64> = similar
                .iter()
                .filter(|p| dt_for(p) != 0.0 && p.sample.mem_usage.is_some() && last.sample.mem_usage.is_some())
                .map(|p| {
                    (p.sample.mem_usage.unwrap() - last.sample.mem_usage.unwrap()) / dt_for(p)
                })
                .collect();

            let dt = t as f64 - last.thread_count as f64;
            let cpu = last.sample.cpu_usage.unwrap_or(0.0) + median(&cpu_impacts).unwrap_or(3.0) * dt;
            let temp = last.sample.cpu_temp.unwrap_or(0.0) + median(&temp_impacts).unwrap_or(1.0) * dt;
            let mem = last
                .sample
                .mem_usage
                .map(|m| m + median(&mem_impacts).unwrap_or(2.0) * dt);

            LoadPrediction {
                cpu,
                temp,
                mem,
                confidence: (similar.len() as f64 / 10.0).min(0.9),
            }
        } else {
            let ratio = t as f64 / (last.thread_count.max(1) as f64);
            LoadPrediction {
                cpu: last.sample.cpu_usage.unwrap_or(0.0) * ratio.powf(0.8),
                temp: last.sample.cpu_temp.unwrap_or(0.0) * ratio.powf(0.6),
                mem: last.sample.mem_usage.map(|m| m * ratio.powf(0.7)),
                confidence: 0.4,
            }
        }
    }

    fn bayesian_search(&self, pid_target: i64, adjusted_max: u32, queue: &QueueSnapshot) -> u32 {
        let search_min = (pid_target - 1).max(1) as u32;
        let search_max = (pid_target.max(adjusted_max as i64)).max(search_min as i64) as u32;

        let mut best_t = search_min;
        let mut best_reward = f64::NEG_INFINITY;
        let mut rng = rand::thread_rng();

        for _ in 0..5 {
            let t = if search_max > search_min {
                rng.gen_range(search_min..=search_max)
            } else {
                search_min
            };
            let prediction = self.predict_load_with_threads(t);
            let effective_throughput = match (queue.throughput, self.last_recommended) {
                (Some(measured), last) if last > 0 => measured * (t as f64 / last as f64),
                _ => {
                    let latency_sec = queue.latency_ms.unwrap_or(100.0).max(1.0) / 1000.0;
                    t as f64 / latency_sec
                }
            };
            let reward = RewardCalculator::reward(
                RewardInputs {
                    throughput: effective_throughput,
                    latency_ms: queue.latency_ms.unwrap_or(100.0),
                    backlog: queue.backlog as f64,
                    predicted_cpu: prediction.cpu,
                    predicted_temp: prediction.temp,
                    predicted_gpu_usage: None,
                    predicted_gpu_temp: None,
                },
                self.reward_thresholds,
            );
            if reward > best_reward {
                best_reward = reward;
                best_t = t;
            }
        }
        best_t.clamp(search_min, search_max)
    }

    fn trend_threads(&self, trend_samples: &[TrendSample], adjusted_max: u32) -> u32 {
        let thresholds = TrendThresholds {
            high_cpu_usage: self.high.cpu_usage,
            high_temp: self.high.cpu_temp,
        };
        let rec = TrendAnalyzer::recommendation(trend_samples, thresholds);
        let mut threads = self.last_recommended as i64;
        match rec.action {
            TrendAction::ScaleUp => threads += 1,
            TrendAction::ScaleDown => threads -= 1,
            TrendAction::Maintain => {}
        }
        threads = threads.clamp(1, adjusted_max.max(1) as i64);

        let mixes: Vec<HashMap<String, f64>> = self.recent_mixes.iter().cloned().collect();
        if let Some(diff) = TrendAnalyzer::operation_mix_diff(&mixes).last() {
            if diff.intensity_change > 0.0 {
                threads -= 1;
            } else if diff.intensity_change < 0.0 {
                threads += 1;
            }
            threads = threads.clamp(1, adjusted_max.max(1) as i64);
        }
        threads as u32
    }

    /// The core per-tick decision, before the universal demand cap and
    /// bookkeeping pass applied by `decide`.
    #[allow(clippy::too_many_arguments)]
    fn decide_core(
        &mut self,
        telemetry: &TelemetrySample,
        queue: &QueueSnapshot,
        operation_mix: OperationMixContext,
        trend_samples: &[TrendSample],
        demand_history: &[DemandPoint],
        now_ms: u64,
    ) -> RawDecision {
        let is_emergency = self.is_hard_emergency(telemetry);
        let is_near_emergency = !is_emergency && self.is_near_emergency(telemetry);

        if is_emergency || is_near_emergency {
            self.consecutive_emergencies += 1;
            self.stable_since_ms = None;
        } else {
            let since = *self.stable_since_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(since) >= STABLE_RESET_WINDOW_MS {
                self.consecutive_emergencies = 0;
            }
        }

        // Step 1: hard emergency clamp.
        if is_emergency {
            return RawDecision {
                threads: 1,
                reason: "hard_emergency_clamp",
                confidence: 1.0,
                guardrails: None,
            };
        }

        // Step 2: emergency adaptation.
        if (is_emergency && self.consecutive_emergencies > 3)
            || (is_near_emergency && self.consecutive_emergencies > 10)
        {
            return RawDecision {
                threads: 1,
                reason: "emergency_override",
                confidence: 0.95,
                guardrails: None,
            };
        }

        // Step 3: scale-up validation rollback.
        if let Some(pending) = self.pending_validation {
            let matured =
                self.perf_by_threads.sample_count(pending.target_threads) >= pending.guardrails.samples_required;
            if matured
                && self.perf_by_threads.shows_regression(
                    pending.baseline_threads,
                    pending.target_threads,
                    pending.guardrails.degradation_tolerance,
                )
            {
                self.pending_validation = None;
                return RawDecision {
                    threads: pending.baseline_threads,
                    reason: "validation_regression",
                    confidence: 0.85,
                    guardrails: None,
                };
            }
            if matured {
                // validated successfully, stop tracking it.
                self.pending_validation = None;
            }
        }

        let (_ceiling, adjusted_max) = self.ceilings(demand_history, operation_mix.current_intensity);

        // Step 4: demand-driven decision.
        let limit = queue.limit.max(1);
        let utilization = queue.active_threads as f64 / limit as f64;
        let has_unmet_demand =
            queue.backlog >= limit || (queue.queue_pressure > 0 && queue.active_threads >= limit);

        if (has_unmet_demand || utilization > 0.8) && limit < adjusted_max {
            let next = limit + 1;
            return match self.evaluate_scale_up(limit, next, now_ms) {
                Ok(guardrails) => RawDecision {
                    threads: next,
                    reason: "demand_driven_scale_up",
                    confidence: 0.75,
                    guardrails: Some(guardrails),
                },
                Err(reason) => RawDecision {
                    threads: limit,
                    reason,
                    confidence: 0.5,
                    guardrails: None,
                },
            };
        }

        let low_utilization_threshold = if operation_mix.current_intensity > 0.7 {
            0.4
        } else {
            0.3
        };
        let recent_high_demand = demand_history
            .iter()
            .rev()
            .take(RECENT_DEMAND_WINDOW)
            .any(|d| d.has_unmet_demand || d.utilization > 0.8);

        if utilization < low_utilization_threshold
            && queue.queue_pressure == 0
            && !recent_high_demand
            && limit > 1
        {
            return RawDecision {
                threads: limit - 1,
                reason: "demand_driven_scale_down",
                confidence: 0.6,
                guardrails: None,
            };
        }

        // Step 5: model blend (demand yielded "maintain").
        self.pid.set_output_max(adjusted_max.max(1) as i64);
        let pid_target = self.pid.update(telemetry.cpu_usage.unwrap_or(self.high.cpu_usage - 5.0), now_ms);
        let bayes_threads = self.bayesian_search(pid_target, adjusted_max, queue);
        let trend_threads = self.trend_threads(trend_samples, adjusted_max);

        let mut proposed =
            (0.2 * trend_threads as f64 + 0.5 * bayes_threads as f64 + 0.3 * pid_target as f64).round() as i64;
        if proposed > self.last_recommended as i64 {
            proposed = proposed.min(self.last_recommended as i64 + 1);
        }
        let mut proposed = proposed.clamp(1, adjusted_max.max(1) as i64) as u32;

        // Step 6: scale-up gating.
        let mut guardrails = None;
        if proposed > self.last_recommended {
            match self.evaluate_scale_up(self.last_recommended, proposed, now_ms) {
                Ok(g) => guardrails = Some(g),
                Err(_) => proposed = self.last_recommended,
            }
        }

        RawDecision {
            threads: proposed,
            reason: "model_blend",
            confidence: 0.55,
            guardrails,
        }
    }

    /// Run the full decision for one tick.
    pub fn decide(
        &mut self,
        telemetry: &TelemetrySample,
        queue: &QueueSnapshot,
        operation_mix: OperationMixContext,
        trend_samples: &[TrendSample],
        demand_history: &[DemandPoint],
        now_ms: u64,
    ) -> ScalingRecommendation {
        let raw = self.decide_core(telemetry, queue, operation_mix, trend_samples, demand_history, now_ms);

        // Step 7: demand cap.
        let capped = raw.threads.min(queue.backlog.max(1)).max(1);

        // Step 8: record and return.
        if capped != self.last_recommended {
            self.last_scaling_decision_ms = now_ms;
            if capped > self.last_recommended {
                let guardrails = raw
                    .guardrails
                    .unwrap_or_else(|| self.get_scale_up_guardrails(self.last_recommended, capped));
                self.pending_validation = Some(PendingValidation {
                    target_threads: capped,
                    baseline_threads: self.last_recommended,
                    guardrails,
                });
            }
        }
        self.last_recommended = capped;

        ScalingRecommendation {
            threads: capped,
            reason: raw.reason.to_string(),
            confidence: raw.confidence,
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(cpu_usage: f64, cpu_temp: f64) -> TelemetrySample {
        TelemetrySample {
            ts_ms: 0,
            cpu_usage: Some(cpu_usage),
            cpu_temp: Some(cpu_temp),
            mem_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
        }
    }

    fn queue(limit: u32, active: u32, backlog: u32) -> QueueSnapshot {
        QueueSnapshot {
            queue_pressure: backlog.saturating_sub(active),
            active_threads: active,
            limit,
            backlog,
            throughput: Some(10.0),
            latency_ms: Some(50.0),
            p95_latency_ms: None,
        }
    }

    #[test]
    fn hard_emergency_clamps_to_one() {
        let options = ControllerOptions::default();
        let mut engine = DecisionEngine::new(&options);
        engine.last_recommended = 8;
        let rec = engine.decide(
            &telemetry(99.0, 96.0),
            &queue(8, 8, 8),
            OperationMixContext::default(),
            &[],
            &[],
            1000,
        );
        assert_eq!(rec.threads, 1);
        assert_eq!(rec.reason, "hard_emergency_clamp");
    }

    #[test]
    fn demand_cap_never_exceeds_backlog() {
        let options = ControllerOptions::default();
        let mut engine = DecisionEngine::new(&options);
        engine.last_recommended = 1;
        let rec = engine.decide(
            &telemetry(50.0, 50.0),
            &queue(1, 1, 1),
            OperationMixContext::default(),
            &[],
            &[],
            1000,
        );
        assert!(rec.threads <= 1);
    }

    #[test]
    fn scale_down_requires_idle_queue_and_low_utilization() {
        let options = ControllerOptions::default();
        let mut engine = DecisionEngine::new(&options);
        engine.last_recommended = 4;
        let rec = engine.decide(
            &telemetry(20.0, 40.0),
            &queue(4, 1, 1),
            OperationMixContext::default(),
            &[],
            &[],
            1000,
        );
        assert_eq!(rec.threads, 3);
        assert_eq!(rec.reason, "demand_driven_scale_down");
    }
}
