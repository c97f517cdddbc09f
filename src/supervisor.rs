//! Periodic control-loop ticker: sample → record → decide → apply.
//!
//! The tick handler is single-flight (an `AtomicBool` guard, not a lock
//! held across the whole body) so a slow telemetry probe or decision pass
//! never queues up a backlog of overlapping ticks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;

use crate::admission::AdmissionManager;
use crate::config::ControllerOptions;
use crate::decision::{DecisionEngine, QueueSnapshot, ScalingRecommendation};
use crate::history::{DemandPoint, HistoryStore, PerfPoint, ScalingDecision};
use crate::persistence::ScalingStore;
use crate::telemetry::{now_ms, TelemetrySource};
use crate::trend::TrendSample;

const TREND_WINDOW: usize = 120;

/// Drives the control loop on a fixed interval. Cheap to hold behind an
/// `Arc`; `start`/`stop` are idempotent.
pub struct Supervisor {
    telemetry: Arc<dyn TelemetrySource>,
    history: Arc<HistoryStore>,
    admission: AdmissionManager,
    store: Arc<dyn ScalingStore>,
    engine: Mutex<DecisionEngine>,
    interval: Duration,
    scaling_history_retention: Duration,

    in_flight: AtomicBool,
    last_tick_ms: AtomicU64,
    trend_samples: Mutex<VecDeque<TrendSample>>,
    last_recommendation: Mutex<Option<ScalingRecommendation>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        options: &ControllerOptions,
        telemetry: Arc<dyn TelemetrySource>,
        history: Arc<HistoryStore>,
        admission: AdmissionManager,
        store: Arc<dyn ScalingStore>,
    ) -> Self {
        Self {
            telemetry,
            history,
            admission,
            store,
            engine: Mutex::new(DecisionEngine::new(options)),
            interval: options.monitoring_interval,
            scaling_history_retention: options.scaling_history_retention,
            in_flight: AtomicBool::new(false),
            last_tick_ms: AtomicU64::new(now_ms()),
            trend_samples: Mutex::new(VecDeque::new()),
            last_recommendation: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic ticker. Idempotent: a second call while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let supervisor = Arc::clone(self);
        let interval = self.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.tick();
            }
        }));
    }

    /// Stop the ticker. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn last_recommendation(&self) -> Option<ScalingRecommendation> {
        self.last_recommendation.lock().clone()
    }

    /// Run one tick of the control loop. Dropped (not queued) if the
    /// previous tick is still running.
    fn tick(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("supervisor tick skipped: previous tick still in flight");
            return;
        }
        let tick_started = now_ms();
        self.run_tick(tick_started);
        histogram!("controller_tick_duration_ms", (now_ms().saturating_sub(tick_started)) as f64);
        counter!("controller_ticks_total", 1);
        self.in_flight.store(false, Ordering::Release);
    }

    fn run_tick(&self, now: u64) {
        let since_ms = self.last_tick_ms.swap(now, Ordering::AcqRel);

        let sample = self.telemetry.sample();
        self.history.append_telemetry(sample);

        {
            let mut trend = self.trend_samples.lock();
            trend.push_back(TrendSample {
                cpu_usage: sample.cpu_usage.unwrap_or(0.0),
                cpu_temp: sample.cpu_temp.unwrap_or(0.0),
            });
            while trend.len() > TREND_WINDOW {
                trend.pop_front();
            }
        }

        let tick_metrics = self.admission.tick_metrics(since_ms);
        let queue_stats = self.admission.queue_stats();
        let limit = queue_stats.limit.max(1);
        let utilization = queue_stats.active as f64 / limit as f64;
        let has_unmet_demand = tick_metrics.backlog >= limit
            || (tick_metrics.queue_pressure > 0 && queue_stats.active >= limit);

        let queue_snapshot = QueueSnapshot {
            queue_pressure: tick_metrics.queue_pressure,
            active_threads: queue_stats.active,
            limit,
            backlog: tick_metrics.backlog,
            throughput: tick_metrics.throughput,
            latency_ms: tick_metrics.avg_latency_ms,
            p95_latency_ms: tick_metrics.p95_latency_ms,
        };

        let operation_mix = self.history.operation_mix_context();
        let perf_point = PerfPoint {
            sample,
            thread_count: limit,
            active_threads: queue_stats.active,
            queue_pressure: tick_metrics.queue_pressure,
            backlog: tick_metrics.backlog,
            utilization,
            throughput: tick_metrics.throughput,
            avg_latency_ms: tick_metrics.avg_latency_ms,
            p95_latency_ms: tick_metrics.p95_latency_ms,
            operation_mix: self.history.operation_mix(),
            intensity: operation_mix.current_intensity,
        };
        self.history.append_perf(perf_point.clone());
        self.history.append_demand(DemandPoint {
            ts_ms: now,
            queue_pressure: tick_metrics.queue_pressure,
            active_threads: queue_stats.active,
            utilization,
            has_unmet_demand,
            backlog: tick_metrics.backlog,
        });
        if let Err(err) = self.store.persist_usage(&perf_point) {
            tracing::warn!(error = %err, "failed to persist usage sample");
        }
        for (operation_type, profile) in self.history.operation_profiles_snapshot() {
            if let Err(err) = self.store.upsert_operation_profile(&operation_type, &profile) {
                tracing::warn!(error = %err, operation_type = %operation_type, "failed to upsert operation profile");
            }
        }
        if let Err(err) = self.store.prune(self.scaling_history_retention.as_millis() as u64) {
            tracing::warn!(error = %err, "failed to prune durable history");
        }

        let demand_history = self.history.demand_points();
        let trend_samples: Vec<TrendSample> = self.trend_samples.lock().iter().copied().collect();

        let recommendation = {
            let mut engine = self.engine.lock();
            engine.record(&perf_point);
            engine.decide(&perf_point.sample, &queue_snapshot, operation_mix, &trend_samples, &demand_history, now)
        };

        // Fallback safety: a non-finite or sub-1 recommendation never
        // reaches the admission manager.
        let recommendation = if recommendation.threads < 1 || !recommendation.confidence.is_finite() {
            tracing::warn!(threads = recommendation.threads, "decision engine produced an invalid recommendation, applying fallback safety");
            ScalingRecommendation {
                threads: 1,
                reason: "fallback_safety".to_string(),
                confidence: 0.5,
            }
        } else {
            recommendation
        };

        gauge!("controller_concurrency_limit", recommendation.threads as f64);
        gauge!("controller_active_threads", queue_stats.active as f64);
        gauge!("controller_queue_pressure", tick_metrics.queue_pressure as f64);

        if recommendation.threads != limit {
            self.history.record_scaling_decision(ScalingDecision {
                ts_ms: now,
                recommended_threads: recommendation.threads,
                previous_threads: limit,
                reason: recommendation.reason.clone(),
                confidence: recommendation.confidence,
            });
            if let Err(err) = self.store.persist_scaling(&ScalingDecision {
                ts_ms: now,
                recommended_threads: recommendation.threads,
                previous_threads: limit,
                reason: recommendation.reason.clone(),
                confidence: recommendation.confidence,
            }) {
                tracing::warn!(error = %err, "failed to persist scaling decision");
            }
            // The admission manager is the sole emitter of `on_scaling_update`:
            // it alone knows the limit actually in effect after a deferred
            // downscale, so firing the callback here too would double-fire it
            // (and on a deferred downscale, fire it early with the wrong
            // value).
            self.admission.update_limit(recommendation.threads as i64);
        }

        *self.last_recommendation.lock() = Some(recommendation);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryScalingStore;
    use crate::telemetry::TelemetrySample;

    struct FixedTelemetry {
        cpu_usage: f64,
        cpu_temp: f64,
    }

    impl TelemetrySource for FixedTelemetry {
        fn sample(&self) -> TelemetrySample {
            TelemetrySample {
                ts_ms: now_ms(),
                cpu_usage: Some(self.cpu_usage),
                cpu_temp: Some(self.cpu_temp),
                mem_usage: Some(40.0),
                gpu_usage: None,
                gpu_temp: None,
            }
        }
    }

    fn test_supervisor(cpu_usage: f64, cpu_temp: f64) -> Supervisor {
        let options = ControllerOptions::default();
        let history = Arc::new(HistoryStore::new(
            Duration::from_secs(300),
            options.max_data_points,
            options.max_performance_history,
            options.max_demand_history,
            options.scaling_history_retention,
        ));
        let admission = AdmissionManager::new(4, options.max_history_size, Arc::clone(&history), None);
        Supervisor::new(
            &options,
            Arc::new(FixedTelemetry { cpu_usage, cpu_temp }),
            history,
            admission,
            Arc::new(InMemoryScalingStore),
        )
    }

    #[test]
    fn a_single_tick_records_history_without_panicking() {
        let supervisor = test_supervisor(50.0, 60.0);
        supervisor.tick();
        assert!(supervisor.last_recommendation().is_some());
    }

    #[test]
    fn hard_emergency_telemetry_drives_the_limit_to_one() {
        let supervisor = test_supervisor(99.0, 97.0);
        supervisor.tick();
        let rec = supervisor.last_recommendation().unwrap();
        assert_eq!(rec.threads, 1);
        assert_eq!(supervisor.admission.queue_stats().limit, 1);
    }

    #[test]
    fn overlapping_ticks_are_single_flight() {
        let supervisor = test_supervisor(50.0, 60.0);
        supervisor.in_flight.store(true, Ordering::SeqCst);
        supervisor.tick();
        // the tick above was skipped entirely: no recommendation recorded.
        assert!(supervisor.last_recommendation().is_none());
        supervisor.in_flight.store(false, Ordering::SeqCst);
    }

    struct RecordingStore {
        usage_calls: AtomicU64,
        profile_calls: AtomicU64,
        prune_calls: AtomicU64,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                usage_calls: AtomicU64::new(0),
                profile_calls: AtomicU64::new(0),
                prune_calls: AtomicU64::new(0),
            }
        }
    }

    impl ScalingStore for RecordingStore {
        fn persist_usage(&self, _point: &PerfPoint) -> crate::error::Result<()> {
            self.usage_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn persist_scaling(&self, _decision: &ScalingDecision) -> crate::error::Result<()> {
            Ok(())
        }
        fn upsert_operation_profile(
            &self,
            _operation_type: &str,
            _profile: &crate::history::OperationProfileAccumulator,
        ) -> crate::error::Result<()> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn prune(&self, _retention_ms: u64) -> crate::error::Result<()> {
            self.prune_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn each_tick_persists_usage_flushes_operation_profiles_and_prunes() {
        let options = ControllerOptions::default();
        let history = Arc::new(HistoryStore::new(
            Duration::from_secs(300),
            options.max_data_points,
            options.max_performance_history,
            options.max_demand_history,
            options.scaling_history_retention,
        ));
        let admission = AdmissionManager::new(4, options.max_history_size, Arc::clone(&history), None);
        history.record_operation("chat", 42.0);
        history.record_operation("embed", 10.0);

        let store = Arc::new(RecordingStore::new());
        let supervisor = Supervisor::new(
            &options,
            Arc::new(FixedTelemetry { cpu_usage: 50.0, cpu_temp: 60.0 }),
            history,
            admission,
            Arc::clone(&store) as Arc<dyn ScalingStore>,
        );

        supervisor.tick();

        assert_eq!(store.usage_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.profile_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.prune_calls.load(Ordering::SeqCst), 1);
    }
}
