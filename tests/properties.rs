//! Property-based tests for the quantified invariants in the controller's
//! testable-properties list: PID output bounds and the `maxThreads` ceiling
//! on every decision-engine recommendation.

use std::time::Duration;

use adaptive_concurrency_controller::{
    ControllerOptions, DecisionEngine, DemandPoint, OperationMixContext, PIDController, PidGains,
    QueueSnapshot, TelemetrySample,
};
use proptest::prelude::*;

proptest! {
    // `PIDController::update`'s output is always clamped into
    // `[output_min, output_max]`, regardless of the measured signal, the
    // gains, or how much wall-clock time has elapsed between calls.
    #[test]
    fn pid_output_always_within_bounds(
        measured in -50.0f64..200.0,
        kp in 0.0f64..5.0,
        ki in 0.0f64..2.0,
        kd in 0.0f64..2.0,
        setpoint in 0.0f64..100.0,
        dt_ms in 1u64..10_000,
        output_max in 1i64..256,
    ) {
        let gains = PidGains { kp, ki, kd, setpoint };
        let mut pid = PIDController::new(gains, 1, output_max);
        let mut now = 0u64;
        for _ in 0..5 {
            now += dt_ms;
            let out = pid.update(measured, now);
            prop_assert!(out >= 1 && out <= output_max);
        }
    }

    // With `max_threads = Some(m)` fixed, no recommendation the decision
    // engine produces across a run of ticks may exceed `m`, regardless of
    // telemetry or queue pressure.
    #[test]
    fn recommendations_never_exceed_a_finite_max_threads(
        max_threads in 1u32..16,
        cpu_usage in 0.0f64..100.0,
        cpu_temp in 30.0f64..99.0,
        backlog in 0u32..50,
        queue_pressure in 0u32..50,
    ) {
        let mut options = ControllerOptions::default();
        options.max_threads = Some(max_threads);
        let mut engine = DecisionEngine::new(&options);

        let telemetry = TelemetrySample {
            ts_ms: 0,
            cpu_usage: Some(cpu_usage),
            cpu_temp: Some(cpu_temp),
            mem_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
        };

        let mut now = 0u64;
        for tick in 0..20u32 {
            now += options.monitoring_interval.as_millis() as u64;
            let limit = engine.last_recommended();
            let queue = QueueSnapshot {
                queue_pressure,
                active_threads: limit.min(backlog.max(1)),
                limit,
                backlog,
                throughput: Some(10.0),
                latency_ms: Some(50.0),
                p95_latency_ms: None,
            };
            let demand_history = vec![DemandPoint {
                ts_ms: now,
                queue_pressure,
                active_threads: limit,
                utilization: 1.0,
                has_unmet_demand: tick % 2 == 0,
                backlog,
            }];
            let rec = engine.decide(
                &telemetry,
                &queue,
                OperationMixContext::default(),
                &[],
                &demand_history,
                now,
            );
            prop_assert!(rec.threads <= max_threads);
            prop_assert!(rec.threads >= 1);
        }
    }

    // A hard thermal emergency always clamps the recommendation to exactly
    // one thread, on the very next tick, regardless of anything else in
    // flight.
    #[test]
    fn hard_thermal_emergency_always_clamps_to_one(
        cpu_usage in 0.0f64..100.0,
        limit in 1u32..16,
    ) {
        let options = ControllerOptions::default();
        let mut engine = DecisionEngine::new(&options);
        let telemetry = TelemetrySample {
            ts_ms: 0,
            cpu_usage: Some(cpu_usage),
            cpu_temp: Some(options.emergency_absolute_limits.cpu_temp),
            mem_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
        };
        let queue = QueueSnapshot {
            queue_pressure: 0,
            active_threads: limit,
            limit,
            backlog: 0,
            throughput: Some(5.0),
            latency_ms: Some(20.0),
            p95_latency_ms: None,
        };
        let rec = engine.decide(
            &telemetry,
            &queue,
            OperationMixContext::default(),
            &[],
            &[],
            Duration::from_secs(1000).as_millis() as u64,
        );
        prop_assert_eq!(rec.threads, 1);
    }
}
