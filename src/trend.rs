//! Pure functions over telemetry history.
//!
//! Nothing in this module touches a lock or performs I/O; every function
//! takes its inputs by value/reference and returns a result, which keeps
//! the quantified properties in the test suite trivial to state.

use std::collections::HashMap;

/// Urgency of a trend-based recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Suggested direction from `TrendAnalyzer::recommendation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendAction {
    ScaleDown,
    ScaleUp,
    Maintain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendRecommendation {
    pub action: TrendAction,
    pub urgency: Option<Urgency>,
    pub confidence: f64,
    pub reason: &'static str,
}

/// Thresholds consulted by `recommendation`.
#[derive(Debug, Clone, Copy)]
pub struct TrendThresholds {
    pub high_cpu_usage: f64,
    pub high_temp: f64,
}

/// Per-tick `{cpu, temp}` reading passed to `recommendation`.
#[derive(Debug, Clone, Copy)]
pub struct TrendSample {
    pub cpu_usage: f64,
    pub cpu_temp: f64,
}

/// A per-step diff between consecutive operation-mix snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationMixDiff {
    pub new_types: Vec<String>,
    pub removed_types: Vec<String>,
    pub intensity_change: f64,
}

pub struct TrendAnalyzer;

impl TrendAnalyzer {
    /// Least-squares slope over indices `0..n`. Zero if fewer than two
    /// points or the denominator is zero (all-equal indices never happens
    /// here, but a single repeated x would).
    pub fn slope(values: &[f64]) -> f64 {
        let n = values.len();
        if n < 2 {
            return 0.0;
        }
        let n_f = n as f64;
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let x_mean = xs.iter().sum::<f64>() / n_f;
        let y_mean = values.iter().sum::<f64>() / n_f;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for i in 0..n {
            let dx = xs[i] - x_mean;
            numerator += dx * (values[i] - y_mean);
            denominator += dx * dx;
        }

        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    /// Mean of successive differences over the last 10 values.
    pub fn rate_of_change(values: &[f64]) -> f64 {
        let window = if values.len() > 10 {
            &values[values.len() - 10..]
        } else {
            values
        };
        if window.len() < 2 {
            return 0.0;
        }
        let diffs: Vec<f64> = window.windows(2).map(|w| w[1] - w[0]).collect();
        diffs.iter().sum::<f64>() / diffs.len() as f64
    }

    /// Seconds until `current` crosses `threshold` at the given `rate`, or
    /// `None` if the rate is non-positive or the threshold is already
    /// crossed.
    pub fn predict_time_to_threshold(current: f64, rate: f64, threshold: f64) -> Option<f64> {
        if rate > 0.0 && current < threshold {
            Some((threshold - current) / rate)
        } else {
            None
        }
    }

    /// Per-step diff over the last 5 operation-mix snapshots.
    pub fn operation_mix_diff(mixes: &[HashMap<String, f64>]) -> Vec<OperationMixDiff> {
        let window = if mixes.len() > 5 {
            &mixes[mixes.len() - 5..]
        } else {
            mixes
        };
        window
            .windows(2)
            .map(|pair| {
                let (prev, curr) = (&pair[0], &pair[1]);
                let new_types: Vec<String> = curr
                    .keys()
                    .filter(|k| !prev.contains_key(*k))
                    .cloned()
                    .collect();
                let removed_types: Vec<String> = prev
                    .keys()
                    .filter(|k| !curr.contains_key(*k))
                    .cloned()
                    .collect();
                let curr_sum: f64 = curr.values().sum();
                let prev_sum: f64 = prev.values().sum();
                OperationMixDiff {
                    new_types,
                    removed_types,
                    intensity_change: curr_sum - prev_sum,
                }
            })
            .collect()
    }

    /// `{action, urgency, confidence, reason}` recommendation from recent
    /// telemetry, per the branch order in the controller's decision spec.
    pub fn recommendation(samples: &[TrendSample], thresholds: TrendThresholds) -> TrendRecommendation {
        if samples.len() < 10 {
            return TrendRecommendation {
                action: TrendAction::Maintain,
                urgency: None,
                confidence: 0.3,
                reason: "insufficient_data",
            };
        }

        let current = samples.last().expect("checked len >= 10 above");
        let cpu_values: Vec<f64> = samples.iter().map(|s| s.cpu_usage).collect();
        let cpu_slope = Self::slope(&cpu_values);
        let cpu_rate = Self::rate_of_change(&cpu_values);
        let time_to_high_cpu =
            Self::predict_time_to_threshold(current.cpu_usage, cpu_rate, thresholds.high_cpu_usage);

        if current.cpu_usage > thresholds.high_cpu_usage || current.cpu_temp > thresholds.high_temp {
            return TrendRecommendation {
                action: TrendAction::ScaleDown,
                urgency: Some(Urgency::High),
                confidence: 0.9,
                reason: "high_cpu_or_temp",
            };
        }

        if time_to_high_cpu.map(|t| t < 30.0).unwrap_or(false) {
            return TrendRecommendation {
                action: TrendAction::ScaleDown,
                urgency: Some(Urgency::Medium),
                confidence: 0.7,
                reason: "predicted_threshold_breach",
            };
        }

        if current.cpu_usage < 50.0 && current.cpu_temp < 70.0 && cpu_slope < 0.0 {
            return TrendRecommendation {
                action: TrendAction::ScaleUp,
                urgency: Some(Urgency::Low),
                confidence: 0.6,
                reason: "cooling_and_underutilized",
            };
        }

        TrendRecommendation {
            action: TrendAction::Maintain,
            urgency: None,
            confidence: 0.5,
            reason: "stable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slope_of_constant_series_is_zero() {
        assert_eq!(TrendAnalyzer::slope(&[5.0, 5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn slope_of_single_point_is_zero() {
        assert_eq!(TrendAnalyzer::slope(&[5.0]), 0.0);
    }

    #[test]
    fn slope_detects_a_clean_linear_increase() {
        let slope = TrendAnalyzer::slope(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!((slope - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_of_change_windows_to_last_ten() {
        let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
        // last 10 values are 10..19, each step +1
        assert!((TrendAnalyzer::rate_of_change(&values) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn predict_time_to_threshold_requires_positive_rate_and_headroom() {
        assert_eq!(TrendAnalyzer::predict_time_to_threshold(80.0, -1.0, 90.0), None);
        assert_eq!(TrendAnalyzer::predict_time_to_threshold(95.0, 1.0, 90.0), None);
        assert_eq!(
            TrendAnalyzer::predict_time_to_threshold(80.0, 2.0, 90.0),
            Some(5.0)
        );
    }

    #[test]
    fn recommendation_needs_ten_points() {
        let samples = vec![TrendSample { cpu_usage: 50.0, cpu_temp: 60.0 }; 5];
        let thresholds = TrendThresholds { high_cpu_usage: 85.0, high_temp: 85.0 };
        let rec = TrendAnalyzer::recommendation(&samples, thresholds);
        assert_eq!(rec.action, TrendAction::Maintain);
        assert_eq!(rec.reason, "insufficient_data");
        assert_eq!(rec.confidence, 0.3);
    }

    #[test]
    fn recommendation_scales_down_on_high_cpu() {
        let mut samples = vec![TrendSample { cpu_usage: 50.0, cpu_temp: 60.0 }; 9];
        samples.push(TrendSample { cpu_usage: 90.0, cpu_temp: 60.0 });
        let thresholds = TrendThresholds { high_cpu_usage: 85.0, high_temp: 85.0 };
        let rec = TrendAnalyzer::recommendation(&samples, thresholds);
        assert_eq!(rec.action, TrendAction::ScaleDown);
        assert_eq!(rec.urgency, Some(Urgency::High));
    }

    #[test]
    fn recommendation_scales_up_when_cool_and_trending_down() {
        let samples: Vec<TrendSample> = (0..10)
            .map(|i| TrendSample { cpu_usage: 40.0 - i as f64, cpu_temp: 60.0 })
            .collect();
        let thresholds = TrendThresholds { high_cpu_usage: 85.0, high_temp: 85.0 };
        let rec = TrendAnalyzer::recommendation(&samples, thresholds);
        assert_eq!(rec.action, TrendAction::ScaleUp);
    }

    #[test]
    fn operation_mix_diff_reports_new_and_removed_types() {
        let mut prev = HashMap::new();
        prev.insert("chat".to_string(), 0.6);
        prev.insert("embed".to_string(), 0.4);
        let mut curr = HashMap::new();
        curr.insert("chat".to_string(), 0.5);
        curr.insert("summarize".to_string(), 0.5);

        let diffs = TrendAnalyzer::operation_mix_diff(&[prev, curr]);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].new_types, vec!["summarize".to_string()]);
        assert_eq!(diffs[0].removed_types, vec!["embed".to_string()]);
    }
}
