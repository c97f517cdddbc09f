//! Closed-form reward over predicted metrics and measured
//! throughput/latency/backlog, used by the decision engine's Bayesian
//! search to compare candidate thread counts.

/// Inputs to a single reward evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RewardInputs {
    pub throughput: f64,
    pub latency_ms: f64,
    pub backlog: f64,
    pub predicted_cpu: f64,
    pub predicted_temp: f64,
    pub predicted_gpu_usage: Option<f64>,
    pub predicted_gpu_temp: Option<f64>,
}

/// Soft/hard ceilings the reward penalizes against.
#[derive(Debug, Clone, Copy)]
pub struct RewardThresholds {
    pub high_cpu_usage: f64,
    pub emergency_cpu_usage: f64,
    pub high_temp: f64,
    pub emergency_temp: f64,
    pub high_gpu_usage: f64,
    pub emergency_gpu_usage: f64,
    pub high_gpu_temp: f64,
    pub emergency_gpu_temp: f64,
}

pub struct RewardCalculator;

impl RewardCalculator {
    /// `0` if `v <= hi` or `v` is non-finite; a hard `-1e6` once `v >= em`;
    /// otherwise a quadratic penalty scaled by `w`.
    fn penal(v: f64, hi: f64, em: f64, w: f64) -> f64 {
        if !v.is_finite() || v <= hi {
            return 0.0;
        }
        if v >= em {
            return -1_000_000.0;
        }
        -w * (v - hi).powi(2)
    }

    pub fn reward(inputs: RewardInputs, thresholds: RewardThresholds) -> f64 {
        let mut total = inputs.throughput
            - 0.2 * (inputs.latency_ms.max(1.0) / 1000.0)
            - 0.1 * inputs.backlog.max(0.0);

        total += Self::penal(
            inputs.predicted_cpu,
            thresholds.high_cpu_usage,
            thresholds.emergency_cpu_usage,
            0.5,
        );
        total += Self::penal(
            inputs.predicted_temp,
            thresholds.high_temp,
            thresholds.emergency_temp,
            0.7,
        );
        if let Some(gpu_usage) = inputs.predicted_gpu_usage {
            total += Self::penal(
                gpu_usage,
                thresholds.high_gpu_usage,
                thresholds.emergency_gpu_usage,
                0.3,
            );
        }
        if let Some(gpu_temp) = inputs.predicted_gpu_temp {
            total += Self::penal(
                gpu_temp,
                thresholds.high_gpu_temp,
                thresholds.emergency_gpu_temp,
                0.5,
            );
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> RewardThresholds {
        RewardThresholds {
            high_cpu_usage: 85.0,
            emergency_cpu_usage: 98.0,
            high_temp: 85.0,
            emergency_temp: 95.0,
            high_gpu_usage: 85.0,
            emergency_gpu_usage: 98.0,
            high_gpu_temp: 85.0,
            emergency_gpu_temp: 95.0,
        }
    }

    #[test]
    fn no_penalty_below_high_threshold() {
        let reward = RewardCalculator::reward(
            RewardInputs {
                throughput: 10.0,
                latency_ms: 100.0,
                backlog: 0.0,
                predicted_cpu: 50.0,
                predicted_temp: 50.0,
                predicted_gpu_usage: None,
                predicted_gpu_temp: None,
            },
            thresholds(),
        );
        assert!((reward - (10.0 - 0.02)).abs() < 1e-9);
    }

    #[test]
    fn hard_penalty_at_emergency_threshold() {
        let reward = RewardCalculator::reward(
            RewardInputs {
                throughput: 10.0,
                latency_ms: 100.0,
                backlog: 0.0,
                predicted_cpu: 99.0,
                predicted_temp: 50.0,
                predicted_gpu_usage: None,
                predicted_gpu_temp: None,
            },
            thresholds(),
        );
        assert!(reward < -900_000.0);
    }

    #[test]
    fn quadratic_penalty_between_high_and_emergency() {
        let reward = RewardCalculator::reward(
            RewardInputs {
                throughput: 10.0,
                latency_ms: 100.0,
                backlog: 0.0,
                predicted_cpu: 90.0,
                predicted_temp: 50.0,
                predicted_gpu_usage: None,
                predicted_gpu_temp: None,
            },
            thresholds(),
        );
        let expected = 10.0 - 0.02 - 0.5 * (90.0_f64 - 85.0).powi(2);
        assert!((reward - expected).abs() < 1e-9);
    }
}
