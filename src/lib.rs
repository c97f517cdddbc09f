//! # Adaptive Concurrency Controller
//!
//! An adaptive concurrency controller for host-local workloads whose
//! individual units of work are expensive, bursty, and thermally sensitive
//! — the motivating case is driving a local large language model, but
//! nothing in the design is specific to that workload.
//!
//! The public surface is one primitive: [`Controller::execute`] submits an
//! opaque asynchronous operation and returns a [`CompletionHandle`] for its
//! eventual result. Internally the controller admits operations into a
//! bounded pool whose size is continually retuned by a feedback loop:
//!
//! 1. a [`telemetry`] sampler gathers host metrics (CPU load/temperature,
//!    memory pressure, optional GPU load/temperature) on a fixed cadence;
//! 2. a [`decision`] engine combines a PID controller, a Bayesian search,
//!    rule-based guards, and per-thread-count performance tracking to pick
//!    a recommended concurrency limit;
//! 3. an [`admission`] manager owns a priority queue and enforces that
//!    limit, honoring emergency bypass and "never shrink below active
//!    work" invariants;
//! 4. a [`history`] store keeps bounded, time-windowed telemetry and
//!    optionally persists scaling decisions via [`persistence`].
//!
//! The [`supervisor`] ties these together behind a fixed-interval ticker;
//! [`Controller`] is the façade callers actually construct.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use adaptive_concurrency_controller::{Controller, ControllerOptions, SubmitOptions};
//!
//! # async fn run() -> adaptive_concurrency_controller::error::Result<()> {
//! let controller = Controller::new(ControllerOptions::default())?;
//! controller.initialize()?;
//!
//! let handle = controller.execute(
//!     || async {
//!         // ... expensive work ...
//!         Ok::<_, adaptive_concurrency_controller::error::ControllerError>(42)
//!     },
//!     SubmitOptions::default(),
//! );
//! let result = handle.await?;
//! assert_eq!(result, 42);
//!
//! controller.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! Distributed coordination, multi-host scaling, hard real-time guarantees,
//! accurate per-operation resource accounting, and modeling of workloads
//! other than "opaque async operations with measurable latency" are all out
//! of scope. Logging is a side-effect channel only — nothing here reads
//! back from it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub mod admission;
pub mod config;
pub mod decision;
pub mod error;
pub mod history;
pub mod logging;
pub mod perf_by_threads;
pub mod persistence;
pub mod pid;
pub mod reward;
pub mod supervisor;
pub mod telemetry;
pub mod trend;

pub use admission::{AdmissionManager, CompletionHandle, QueueStats, TickMetrics};
pub use config::{
    ControllerOptions, ControllerOptionsData, EmergencyLimits, HighThresholds, PersistenceConfig,
    PidGains, ScalingUpdateCallback, SubmitOptions,
};
pub use decision::{DecisionEngine, Guardrails, QueueSnapshot, ScalingRecommendation};
pub use error::{ControllerError, Result};
pub use history::{
    DemandPoint, HistoryStats, HistoryStore, OperationMixContext, OperationProfileAccumulator,
    PerfPoint, ScalingDecision,
};
pub use persistence::{build_store, InMemoryScalingStore, ScalingStore, SqliteScalingStore};
pub use pid::PIDController;
pub use reward::{RewardCalculator, RewardInputs, RewardThresholds};
pub use supervisor::Supervisor;
pub use telemetry::{SysinfoTelemetrySource, TelemetrySample, TelemetrySource};
pub use trend::{
    OperationMixDiff, TrendAction, TrendAnalyzer, TrendRecommendation, TrendSample,
    TrendThresholds, Urgency,
};

/// Concurrency version marker. Bumped whenever the tick/decision protocol
/// between [`Supervisor`] and [`DecisionEngine`] changes in a way that would
/// make a persisted [`ScalingDecision`] log from a previous version
/// misleading to replay.
pub const PROTOCOL_VERSION: u32 = 1;

/// Point-in-time snapshot returned by [`Controller::state`]: the admission
/// queue's current counters plus the most recent scaling recommendation, if
/// the supervisor has ticked at least once.
///
/// The spec's external-interface sketch lists `{admission, scaling,
/// queueStats}` as three keys; in this binding `admission` and `queueStats`
/// collapse into the single [`QueueStats`] snapshot the admission manager
/// already exposes; see `DESIGN.md` for the rationale.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub queue_stats: QueueStats,
    pub scaling: Option<ScalingRecommendation>,
}

/// Owns the full feedback loop and is the crate's only required entry
/// point. Cheap to share behind an `Arc` (every field is itself already
/// reference-counted or `Copy`-sized).
pub struct Controller {
    options: ControllerOptions,
    admission: AdmissionManager,
    history: Arc<HistoryStore>,
    #[allow(dead_code)]
    store: Arc<dyn ScalingStore>,
    supervisor: Arc<Supervisor>,
}

impl Controller {
    /// Construct a controller backed by the default [`SysinfoTelemetrySource`].
    /// `options` is validated before anything is built; an invalid
    /// combination is a [`ControllerError::Configuration`], never a
    /// silently-substituted default.
    pub fn new(options: ControllerOptions) -> Result<Self> {
        Self::with_telemetry(options, Arc::new(SysinfoTelemetrySource::new()))
    }

    /// Construct a controller against a caller-supplied telemetry source.
    /// Exists so tests (and embedders who already have host metrics from
    /// elsewhere) can drive the control loop deterministically instead of
    /// going through `sysinfo`.
    pub fn with_telemetry(options: ControllerOptions, telemetry: Arc<dyn TelemetrySource>) -> Result<Self> {
        options.validate()?;

        let history = Arc::new(HistoryStore::new(
            options.max_history_age,
            options.max_data_points,
            options.max_performance_history,
            options.max_demand_history,
            options.scaling_history_retention,
        ));
        let store = persistence::build_store(&options.persistence);
        // Conservative starting point: the first tick's recommendation
        // (which starts from `DecisionEngine::last_recommended == 1`) drives
        // the limit upward as soon as demand warrants it.
        let admission = AdmissionManager::new(
            1,
            options.max_history_size,
            Arc::clone(&history),
            options.on_scaling_update.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(
            &options,
            telemetry,
            Arc::clone(&history),
            admission.clone(),
            Arc::clone(&store),
        ));

        Ok(Self {
            options,
            admission,
            history,
            store,
            supervisor,
        })
    }

    /// Start the supervisor's periodic tick. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        self.supervisor.start();
        Ok(())
    }

    /// Stop the supervisor's periodic tick. Idempotent; in-flight operations
    /// already admitted are left to run to completion.
    pub fn shutdown(&self) -> Result<()> {
        self.supervisor.stop();
        Ok(())
    }

    /// Submit an operation for execution under the controller's current
    /// concurrency limit. Returns immediately with a handle; admission
    /// (priority ordering, emergency bypass) happens asynchronously.
    pub fn execute<T, F, Fut>(&self, op: F, opts: SubmitOptions) -> CompletionHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.admission.submit(op, opts)
    }

    /// Current admission/scaling snapshot.
    pub fn state(&self) -> ControllerState {
        ControllerState {
            queue_stats: self.admission.queue_stats(),
            scaling: self.supervisor.last_recommendation(),
        }
    }

    /// All retained telemetry samples, oldest first, after lazy eviction.
    pub fn usage_history(&self) -> Vec<TelemetrySample> {
        self.history.all()
    }

    /// Telemetry samples taken within the last `window`.
    pub fn usage_history_recent(&self, window: Duration) -> Vec<TelemetrySample> {
        self.history.recent(window)
    }

    /// Summary statistics (averages, ranges, time span) over retained
    /// telemetry.
    pub fn usage_statistics(&self) -> HistoryStats {
        self.history.stats()
    }

    /// A trend-based recommendation (`scale_up`/`scale_down`/`maintain`)
    /// derived from retained telemetry — the same computation the decision
    /// engine itself blends into its per-tick proposal, exposed read-only
    /// for introspection/dashboards.
    pub fn usage_trends(&self) -> TrendRecommendation {
        let samples: Vec<TrendSample> = self
            .history
            .all()
            .iter()
            .map(|s| TrendSample {
                cpu_usage: s.cpu_usage.unwrap_or(0.0),
                cpu_temp: s.cpu_temp.unwrap_or(0.0),
            })
            .collect();
        let thresholds = TrendThresholds {
            high_cpu_usage: self.options.high_thresholds.cpu_usage,
            high_temp: self.options.high_thresholds.cpu_temp,
        };
        TrendAnalyzer::recommendation(&samples, thresholds)
    }

    /// The full scaling-decision log retained in memory (bounded by
    /// `scaling_history_retention`).
    pub fn scaling_history(&self) -> Vec<ScalingDecision> {
        self.history.scaling_history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedTelemetry;
    impl TelemetrySource for FixedTelemetry {
        fn sample(&self) -> TelemetrySample {
            TelemetrySample {
                ts_ms: crate::telemetry::now_ms(),
                cpu_usage: Some(40.0),
                cpu_temp: Some(55.0),
                mem_usage: Some(30.0),
                gpu_usage: None,
                gpu_temp: None,
            }
        }
    }

    fn controller() -> Controller {
        Controller::with_telemetry(ControllerOptions::default(), Arc::new(FixedTelemetry)).unwrap()
    }

    #[tokio::test]
    async fn execute_runs_the_operation_and_returns_its_result() {
        let controller = controller();
        let handle = controller.execute(
            || async { Ok::<_, ControllerError>(7) },
            SubmitOptions::default(),
        );
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_starts_exactly_one_ticker() {
        let controller = controller();
        controller.initialize().unwrap();
        controller.initialize().unwrap();
        controller.shutdown().unwrap();
        controller.shutdown().unwrap();
    }

    #[tokio::test]
    async fn state_reflects_admission_activity() {
        let controller = controller();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let _handle = controller.execute(
            move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ControllerError>(())
            },
            SubmitOptions::default(),
        );
        let state = controller.state();
        assert!(state.queue_stats.active <= 1);
    }

    #[test]
    fn usage_statistics_on_a_fresh_controller_is_empty() {
        let controller = controller();
        let stats = controller.usage_statistics();
        assert_eq!(stats.data_points, 0);
    }
}
