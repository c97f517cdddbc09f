//! Durable scaling history, usage history, and per-operation-type
//! profiles, with an in-memory fallback when no durable sink is
//! configured or available.
//!
//! Schema and connection setup mirror the pack's `bitlyte-ai-apples2oranges`
//! persistence layer (`rusqlite`, WAL mode, a single `Mutex<Connection>`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::config::PersistenceConfig;
use crate::history::{OperationProfileAccumulator, PerfPoint, ScalingDecision};

/// Durable sink for scaling decisions, usage samples, and operation
/// profiles. Implementations must be safe to call from the single
/// supervisor tick thread; none of these calls may block the tick for
/// long.
pub trait ScalingStore: Send + Sync {
    fn persist_usage(&self, point: &PerfPoint) -> crate::error::Result<()>;
    fn persist_scaling(&self, decision: &ScalingDecision) -> crate::error::Result<()>;
    fn upsert_operation_profile(&self, operation_type: &str, profile: &OperationProfileAccumulator) -> crate::error::Result<()>;
    /// Delete rows older than `retention_ms` from both history relations.
    fn prune(&self, retention_ms: u64) -> crate::error::Result<()>;
}

/// Zero-config fallback: nothing is written anywhere, every call succeeds.
pub struct InMemoryScalingStore;

impl ScalingStore for InMemoryScalingStore {
    fn persist_usage(&self, _point: &PerfPoint) -> crate::error::Result<()> {
        Ok(())
    }
    fn persist_scaling(&self, _decision: &ScalingDecision) -> crate::error::Result<()> {
        Ok(())
    }
    fn upsert_operation_profile(
        &self,
        _operation_type: &str,
        _profile: &OperationProfileAccumulator,
    ) -> crate::error::Result<()> {
        Ok(())
    }
    fn prune(&self, _retention_ms: u64) -> crate::error::Result<()> {
        Ok(())
    }
}

/// SQLite-backed store: `usage_history`, `scaling_history`,
/// `operation_profiles`, as specified.
pub struct SqliteScalingStore {
    conn: Mutex<Connection>,
}

impl SqliteScalingStore {
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS usage_history (
                ts INTEGER NOT NULL,
                cpu_usage REAL,
                cpu_temp REAL,
                memory_usage REAL,
                gpu_usage REAL,
                gpu_temp REAL,
                concurrent_threads INTEGER NOT NULL,
                active_threads INTEGER NOT NULL,
                queue_pressure INTEGER NOT NULL,
                operation_mix TEXT NOT NULL,
                operation_intensity REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_history_ts ON usage_history(ts);

            CREATE TABLE IF NOT EXISTS scaling_history (
                ts INTEGER NOT NULL,
                thread_count INTEGER NOT NULL,
                cpu_usage REAL,
                gpu_usage REAL,
                memory_usage REAL,
                temperature REAL,
                active_operations INTEGER,
                queue_length INTEGER,
                scaling_decision TEXT NOT NULL,
                pid_output REAL,
                bayes_optimization REAL,
                demand_score REAL
            );
            CREATE INDEX IF NOT EXISTS idx_scaling_history_ts ON scaling_history(ts);

            CREATE TABLE IF NOT EXISTS operation_profiles (
                operation_type TEXT PRIMARY KEY,
                cpu_avg REAL,
                gpu_avg REAL,
                memory_avg REAL,
                temperature_avg REAL,
                duration_avg REAL NOT NULL,
                count INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;

        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl ScalingStore for SqliteScalingStore {
    fn persist_usage(&self, point: &PerfPoint) -> crate::error::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::ControllerError::PersistenceUnavailable("poisoned lock".to_string()))?;
        let mix_json = serde_json::to_string(&point.operation_mix).unwrap_or_default();
        conn.execute(
            "INSERT INTO usage_history (ts, cpu_usage, cpu_temp, memory_usage, gpu_usage, gpu_temp,
                concurrent_threads, active_threads, queue_pressure, operation_mix, operation_intensity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                point.sample.ts_ms as i64,
                point.sample.cpu_usage,
                point.sample.cpu_temp,
                point.sample.mem_usage,
                point.sample.gpu_usage,
                point.sample.gpu_temp,
                point.thread_count,
                point.active_threads,
                point.queue_pressure,
                mix_json,
                point.intensity,
            ],
        )
        .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }

    fn persist_scaling(&self, decision: &ScalingDecision) -> crate::error::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::ControllerError::PersistenceUnavailable("poisoned lock".to_string()))?;
        conn.execute(
            "INSERT INTO scaling_history (ts, thread_count, scaling_decision, demand_score)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                decision.ts_ms as i64,
                decision.recommended_threads,
                decision.reason,
                decision.confidence,
            ],
        )
        .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }

    fn upsert_operation_profile(&self, operation_type: &str, profile: &OperationProfileAccumulator) -> crate::error::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::ControllerError::PersistenceUnavailable("poisoned lock".to_string()))?;
        conn.execute(
            "INSERT INTO operation_profiles (operation_type, duration_avg, count, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(operation_type) DO UPDATE SET
                duration_avg = excluded.duration_avg,
                count = excluded.count,
                last_updated = excluded.last_updated",
            params![
                operation_type,
                profile.avg_duration_ms,
                profile.count as i64,
                profile.last_updated_ms as i64,
            ],
        )
        .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }

    fn prune(&self, retention_ms: u64) -> crate::error::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| crate::error::ControllerError::PersistenceUnavailable("poisoned lock".to_string()))?;
        let cutoff = crate::telemetry::now_ms().saturating_sub(retention_ms) as i64;
        conn.execute("DELETE FROM usage_history WHERE ts < ?1", params![cutoff])
            .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        conn.execute("DELETE FROM scaling_history WHERE ts < ?1", params![cutoff])
            .map_err(|e| crate::error::ControllerError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// Resolve `dirs::data_dir()/llm-threader/scaling.db`, or the caller's
/// explicit override.
pub fn resolve_db_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| dirs::data_dir().map(|dir| dir.join("llm-threader").join("scaling.db")))
}

/// Build the configured store, falling back to the in-memory store (with a
/// single warning) on any failure to open it — never propagated to
/// `Controller::new`'s caller.
pub fn build_store(config: &PersistenceConfig) -> std::sync::Arc<dyn ScalingStore> {
    match config {
        PersistenceConfig::InMemory => std::sync::Arc::new(InMemoryScalingStore),
        PersistenceConfig::Sqlite { path } => match resolve_db_path(path.clone()) {
            Some(resolved) => match SqliteScalingStore::open(&resolved) {
                Ok(store) => std::sync::Arc::new(store),
                Err(err) => {
                    tracing::warn!(error = %err, path = %resolved.display(), "failed to open scaling store, falling back to in-memory");
                    std::sync::Arc::new(InMemoryScalingStore)
                }
            },
            None => {
                tracing::warn!("could not resolve a platform data directory, falling back to in-memory scaling store");
                std::sync::Arc::new(InMemoryScalingStore)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetrySample;

    fn sample_point() -> PerfPoint {
        PerfPoint {
            sample: TelemetrySample {
                ts_ms: 1,
                cpu_usage: Some(50.0),
                cpu_temp: Some(60.0),
                mem_usage: Some(40.0),
                gpu_usage: None,
                gpu_temp: None,
            },
            thread_count: 4,
            active_threads: 3,
            queue_pressure: 0,
            backlog: 3,
            utilization: 0.75,
            throughput: Some(10.0),
            avg_latency_ms: Some(50.0),
            p95_latency_ms: None,
            operation_mix: HashMap::new(),
            intensity: 0.5,
        }
    }

    #[test]
    fn sqlite_store_round_trips_a_usage_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteScalingStore::open(&dir.path().join("scaling.db")).unwrap();
        store.persist_usage(&sample_point()).unwrap();
    }

    #[test]
    fn sqlite_store_upserts_operation_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteScalingStore::open(&dir.path().join("scaling.db")).unwrap();
        let mut profile = OperationProfileAccumulator::default();
        profile.count = 3;
        profile.avg_duration_ms = 42.0;
        profile.last_updated_ms = 1000;
        store.upsert_operation_profile("chat", &profile).unwrap();
        store.upsert_operation_profile("chat", &profile).unwrap();
    }

    #[test]
    fn in_memory_store_accepts_everything() {
        let store = InMemoryScalingStore;
        store.persist_usage(&sample_point()).unwrap();
        store
            .persist_scaling(&ScalingDecision {
                ts_ms: 1,
                recommended_threads: 2,
                previous_threads: 1,
                reason: "test".to_string(),
                confidence: 0.5,
            })
            .unwrap();
        store.prune(1000).unwrap();
    }
}
