//! Per-concurrency-level performance tracking and the efficiency
//! comparison used to lock in an "optimal" ceiling.

use std::collections::{HashMap, VecDeque};

const WINDOW_SIZE: usize = 20;

/// One normalized sample recorded against a thread count.
#[derive(Debug, Clone, Copy)]
struct ThreadSample {
    throughput: f64,
    latency_ms: f64,
    cumulative_time: f64,
    #[allow(dead_code)]
    backlog: f64,
}

#[derive(Default)]
struct ThreadWindow {
    samples: VecDeque<ThreadSample>,
}

impl ThreadWindow {
    fn push(&mut self, sample: ThreadSample) {
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW_SIZE {
            self.samples.pop_front();
        }
    }

    fn avg_cumulative_time(&self) -> Option<f64> {
        self.avg(|s| s.cumulative_time)
    }

    fn avg_throughput(&self) -> Option<f64> {
        self.avg(|s| s.throughput)
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        self.avg(|s| s.latency_ms)
    }

    fn avg(&self, f: impl Fn(&ThreadSample) -> f64) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().map(f).sum::<f64>() / self.samples.len() as f64)
        }
    }
}

/// Tracks per-thread-count performance windows and searches them for the
/// concurrency level with the best efficiency score.
pub struct PerformanceByThreadCount {
    windows: HashMap<u32, ThreadWindow>,
    optimal: Option<u32>,
    optimal_efficiency: Option<f64>,
}

impl PerformanceByThreadCount {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
            optimal: None,
            optimal_efficiency: None,
        }
    }

    /// Record a tick's measurement against `thread_count`, when throughput
    /// and latency are both defined — matching the "on each sample with
    /// defined throughput and latency" gate in the spec.
    pub fn record(
        &mut self,
        thread_count: u32,
        throughput: Option<f64>,
        latency_ms: Option<f64>,
        backlog_arg: Option<f64>,
    ) {
        let (Some(measured), Some(latency_ms)) = (throughput, latency_ms) else {
            return;
        };

        let latency_sec = latency_ms.max(1.0) / 1000.0;
        let effective_throughput = if measured > 0.0 {
            measured
        } else {
            thread_count as f64 / latency_sec
        };
        let backlog = backlog_arg
            .map(|b| b.max(1.0))
            .unwrap_or(thread_count as f64);
        let cumulative_time = backlog / effective_throughput.max(1e-6);

        self.windows
            .entry(thread_count)
            .or_default()
            .push(ThreadSample {
                throughput: measured,
                latency_ms,
                cumulative_time,
                backlog,
            });
    }

    pub fn sample_count(&self, thread_count: u32) -> usize {
        self.windows
            .get(&thread_count)
            .map(|w| w.samples.len())
            .unwrap_or(0)
    }

    /// Efficiency score for `t`, or `None` if there is no data for it.
    pub fn efficiency(&self, t: u32) -> Option<f64> {
        let window = self.windows.get(&t)?;
        let avg_cum = window.avg_cumulative_time()?;
        let avg_thr = window.avg_throughput()?;
        let avg_lat_ms = window.avg_latency_ms()?;
        let avg_lat_sec = avg_lat_ms / 1000.0;

        let mut score =
            -avg_cum + (avg_thr + 1.0).ln() - 0.1 * (avg_lat_sec + 1.0).ln() - 0.02 * ((t as f64) + 1.0).ln();

        if let Some(prev_t) = self.next_lower_with_data(t) {
            let prev_window = &self.windows[&prev_t];
            if let (Some(prev_cum), Some(prev_thr), Some(prev_lat_ms)) = (
                prev_window.avg_cumulative_time(),
                prev_window.avg_throughput(),
                prev_window.avg_latency_ms(),
            ) {
                if avg_cum > prev_cum * 1.03 {
                    score -= 5.0 * (avg_cum - prev_cum);
                }
                if avg_thr < prev_thr * 0.97 {
                    score -= 10.0 * (prev_thr - avg_thr);
                }
                if avg_lat_ms > prev_lat_ms * 1.05 {
                    score -= 5.0 * ((avg_lat_ms - prev_lat_ms) / 1000.0);
                }
            }
        }

        Some(score)
    }

    fn next_lower_with_data(&self, t: u32) -> Option<u32> {
        self.windows
            .keys()
            .copied()
            .filter(|&k| k < t && !self.windows[&k].samples.is_empty())
            .max()
    }

    /// Re-evaluate the recorded optimum against `total_history_len`, the
    /// overall performance-history length used to derive the minimum
    /// sample requirement (`max(5, ceil(history * 0.05))`).
    pub fn update_optimal(&mut self, total_history_len: usize) {
        let required = (5usize).max((total_history_len as f64 * 0.05).ceil() as usize);

        let best = self
            .windows
            .keys()
            .copied()
            .filter(|&t| self.sample_count(t) >= required)
            .filter_map(|t| self.efficiency(t).map(|eff| (t, eff)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((best_t, best_eff)) = best else {
            return;
        };

        match self.optimal_efficiency {
            None => {
                self.optimal = Some(best_t);
                self.optimal_efficiency = Some(best_eff);
            }
            Some(prev_eff) => {
                let margin = (5.0_f64).max(0.02 * prev_eff.abs().max(best_eff.abs()).max(1.0));
                if best_eff > prev_eff + margin {
                    self.optimal = Some(best_t);
                    self.optimal_efficiency = Some(best_eff);
                }
            }
        }
    }

    /// The locked-in optimal concurrency level, if one has been found.
    pub fn optimal(&self) -> Option<u32> {
        self.optimal
    }

    /// Whether per-thread-count data shows a regression at `candidate`
    /// relative to `baseline` beyond `tolerance` — used by the decision
    /// engine's scale-up gate.
    pub fn shows_regression(&self, baseline: u32, candidate: u32, tolerance: f64) -> bool {
        let (Some(baseline_cum), Some(candidate_cum)) = (
            self.windows.get(&baseline).and_then(|w| w.avg_cumulative_time()),
            self.windows.get(&candidate).and_then(|w| w.avg_cumulative_time()),
        ) else {
            return false;
        };
        if baseline_cum <= 0.0 {
            return false;
        }
        (candidate_cum - baseline_cum) / baseline_cum > tolerance
    }

    pub fn avg_cumulative_time(&self, t: u32) -> Option<f64> {
        self.windows.get(&t).and_then(|w| w.avg_cumulative_time())
    }

    pub fn avg_utilization_proxy(&self, t: u32) -> Option<f64> {
        // avg backlog / t, used by the guardrail degradation-tolerance formula
        let window = self.windows.get(&t)?;
        let avg_backlog = window.avg(|s| s.cumulative_time * s.throughput.max(1e-6))?;
        Some((avg_backlog / (t as f64).max(1.0)).min(1.0))
    }

    /// Coefficient of variation of cumulative time at `t`, used by the
    /// guardrail degradation-tolerance formula.
    pub fn cumulative_time_cov(&self, t: u32) -> Option<f64> {
        let window = self.windows.get(&t)?;
        if window.samples.len() < 2 {
            return None;
        }
        let mean = window.avg_cumulative_time()?;
        if mean <= 0.0 {
            return Some(0.0);
        }
        let variance = window
            .samples
            .iter()
            .map(|s| (s.cumulative_time - mean).powi(2))
            .sum::<f64>()
            / window.samples.len() as f64;
        Some(variance.sqrt() / mean)
    }
}

impl Default for PerformanceByThreadCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ignores_samples_missing_throughput_or_latency() {
        let mut p = PerformanceByThreadCount::new();
        p.record(4, None, Some(50.0), None);
        p.record(4, Some(10.0), None, None);
        assert_eq!(p.sample_count(4), 0);
    }

    #[test]
    fn window_is_capped_at_twenty_samples() {
        let mut p = PerformanceByThreadCount::new();
        for _ in 0..30 {
            p.record(4, Some(10.0), Some(50.0), Some(4.0));
        }
        assert_eq!(p.sample_count(4), 20);
    }

    #[test]
    fn optimal_lock_in_prefers_lower_thread_count_with_better_efficiency() {
        let mut p = PerformanceByThreadCount::new();
        for _ in 0..10 {
            p.record(2, Some(20.0), Some(50.0), None);
        }
        for _ in 0..10 {
            p.record(4, Some(25.0), Some(120.0), None);
        }
        // required samples = max(5, ceil(20*0.05)) = 5, both levels qualify
        p.update_optimal(20);
        assert_eq!(p.optimal(), Some(2));
    }

    #[test]
    fn optimal_requires_minimum_sample_count() {
        let mut p = PerformanceByThreadCount::new();
        p.record(2, Some(20.0), Some(50.0), None);
        p.update_optimal(200); // required = max(5, ceil(10)) = 10, only 1 sample present
        assert_eq!(p.optimal(), None);
    }
}
