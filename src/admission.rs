//! Priority queue, active-count bookkeeping, deferred scale-down,
//! emergency bypass, timeouts, and cancellation for submitted operations.
//!
//! The type-erasure trick below is the same one `kirapilot`'s llama resource
//! manager uses to hold heterogeneous guarded tasks in one queue: each
//! queued entry closes over its own `oneshot::Sender` and operation inside
//! a single `FnOnce(InvokeOutcome)`, so the queue itself never needs to be
//! generic over the operation's output type.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{ScalingUpdateCallback, SubmitOptions};
use crate::error::{ControllerError, Result};
use crate::history::HistoryStore;
use crate::telemetry::now_ms;

enum InvokeOutcome {
    Dispatch,
    Fail(ControllerError),
}

struct QueueEntry {
    id: Uuid,
    priority: i32,
    emergency: bool,
    seq: u64,
    queued_at_ms: u64,
    cancel_token: Option<tokio_util::sync::CancellationToken>,
    invoke: Box<dyn FnOnce(InvokeOutcome) + Send>,
}

#[derive(Debug, Clone)]
struct RequestRecord {
    id: Uuid,
    priority: i32,
    emergency: bool,
    queued_at_ms: u64,
    started_at_ms: Option<u64>,
    ended_at_ms: Option<u64>,
    outcome: Option<&'static str>,
}

struct State {
    queue: Vec<QueueEntry>,
    active: u32,
    active_emergency: u32,
    limit: u32,
    desired_limit: Option<u32>,
    emergency_bypass_active: bool,
    dispatching: bool,
    next_seq: u64,
    history: VecDeque<RequestRecord>,
}

struct Inner {
    state: Mutex<State>,
    history_store: Arc<HistoryStore>,
    on_scaling_update: Option<ScalingUpdateCallback>,
    max_history_size: usize,
}

/// Priority queue + admission loop for submitted operations. Cheap to
/// clone: internally an `Arc`.
#[derive(Clone)]
pub struct AdmissionManager {
    inner: Arc<Inner>,
}

/// A handle to a submitted operation's eventual outcome.
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ControllerError::RequestCanceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Point-in-time queue/active-count snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub active: u32,
    pub limit: u32,
    pub emergency_bypass_active: bool,
}

/// Throughput/latency facts derived from completions since a tick's last
/// sample, handed to the decision engine as part of its `QueueSnapshot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickMetrics {
    pub queue_pressure: u32,
    pub backlog: u32,
    pub throughput: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
}

fn best_candidate_index(queue: &[QueueEntry], emergency_only: bool) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, e)| !emergency_only || e.emergency)
        .max_by_key(|(_, e)| (e.emergency, e.priority, std::cmp::Reverse(e.seq)))
        .map(|(i, _)| i)
}

impl AdmissionManager {
    pub fn new(
        initial_limit: u32,
        max_history_size: usize,
        history_store: Arc<HistoryStore>,
        on_scaling_update: Option<ScalingUpdateCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: Vec::new(),
                    active: 0,
                    active_emergency: 0,
                    limit: initial_limit.max(1),
                    desired_limit: None,
                    emergency_bypass_active: false,
                    dispatching: false,
                    next_seq: 0,
                    history: VecDeque::new(),
                }),
                history_store,
                on_scaling_update,
                max_history_size: max_history_size.max(1),
            }),
        }
    }

    /// Submit an operation for execution. Admission, including priority
    /// ordering and emergency bypass, happens asynchronously via the
    /// dispatch loop; the returned handle resolves when the operation (or
    /// its timeout/cancellation) settles.
    pub fn submit<T, F, Fut>(&self, op: F, opts: SubmitOptions) -> CompletionHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let now = now_ms();

        let manager = self.clone();
        let emergency = opts.emergency;
        let operation_type = opts.operation_type.clone();
        let timeout = opts.timeout;
        let cancel_token_for_queue = opts.cancel_token.clone();
        let cancel_token = opts.cancel_token.clone();

        let invoke: Box<dyn FnOnce(InvokeOutcome) + Send> = Box::new(move |outcome| match outcome {
            InvokeOutcome::Fail(err) => {
                let _ = tx.send(Err(err));
            }
            InvokeOutcome::Dispatch => {
                tokio::spawn(async move {
                    let op_fut = op();
                    tokio::pin!(op_fut);
                    let started_at = now_ms();

                    let cancel_wait = async {
                        match &cancel_token {
                            Some(token) => token.cancelled().await,
                            None => futures::future::pending::<()>().await,
                        }
                    };
                    tokio::pin!(cancel_wait);

                    let result = if let Some(timeout_dur) = timeout {
                        tokio::select! {
                            res = &mut op_fut => res,
                            _ = tokio::time::sleep(timeout_dur) => Err(ControllerError::RequestTimeout(timeout_dur.as_millis() as u64)),
                            _ = &mut cancel_wait => Err(ControllerError::RequestCanceled),
                        }
                    } else {
                        tokio::select! {
                            res = &mut op_fut => res,
                            _ = &mut cancel_wait => Err(ControllerError::RequestCanceled),
                        }
                    };

                    let duration_ms = now_ms().saturating_sub(started_at) as f64;
                    let outcome_tag = if result.is_ok() { "completed" } else { "failed" };
                    let _ = tx.send(result);
                    manager.on_terminal(id, emergency, outcome_tag, operation_type, duration_ms);
                });
            }
        });

        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueueEntry {
                id,
                priority: opts.priority,
                emergency,
                seq,
                queued_at_ms: now,
                cancel_token: cancel_token_for_queue,
                invoke,
            });
            Self::push_history(
                &mut state.history,
                self.inner.max_history_size,
                RequestRecord {
                    id,
                    priority: opts.priority,
                    emergency,
                    queued_at_ms: now,
                    started_at_ms: None,
                    ended_at_ms: None,
                    outcome: None,
                },
            );
        }

        self.dispatch();
        CompletionHandle { rx }
    }

    fn push_history(history: &mut VecDeque<RequestRecord>, max: usize, record: RequestRecord) {
        history.push_back(record);
        while history.len() > max {
            history.pop_front();
        }
    }

    fn extract_canceled(state: &mut State) -> Vec<(QueueEntry, ControllerError)> {
        let mut failed = Vec::new();
        let mut i = 0;
        while i < state.queue.len() {
            let canceled = state.queue[i]
                .cancel_token
                .as_ref()
                .map(|t| t.is_cancelled())
                .unwrap_or(false);
            if canceled {
                let entry = state.queue.remove(i);
                failed.push((entry, ControllerError::RequestCanceled));
            } else {
                i += 1;
            }
        }
        failed
    }

    fn extract_startable(state: &mut State) -> Vec<QueueEntry> {
        let mut started = Vec::new();
        loop {
            if state.queue.is_empty() {
                break;
            }
            if state.active < state.limit {
                match best_candidate_index(&state.queue, false) {
                    Some(idx) => {
                        let entry = state.queue.remove(idx);
                        if entry.emergency {
                            state.active_emergency += 1;
                        }
                        state.active += 1;
                        started.push(entry);
                    }
                    None => break,
                }
            } else if state.active < state.limit + 1 && state.active_emergency < 2 {
                match best_candidate_index(&state.queue, true) {
                    Some(idx) => {
                        let entry = state.queue.remove(idx);
                        state.active_emergency += 1;
                        state.active += 1;
                        state.emergency_bypass_active = true;
                        started.push(entry);
                    }
                    None => break,
                }
            } else {
                break;
            }
        }
        started
    }

    /// Run the admission loop until nothing more can be canceled or
    /// started. Re-entrancy guarded; never suspends while holding the
    /// state lock — it snapshots work to do, releases the lock, then
    /// performs it.
    fn dispatch(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let (to_fail, to_start, now) = {
                let mut state = self.inner.state.lock();
                let to_fail = Self::extract_canceled(&mut state);
                let to_start = Self::extract_startable(&mut state);
                let now = now_ms();
                for entry in &to_start {
                    if let Some(record) = state.history.iter_mut().rev().find(|r| r.id == entry.id) {
                        record.started_at_ms = Some(now);
                    }
                }
                (to_fail, to_start, now)
            };

            if to_fail.is_empty() && to_start.is_empty() {
                break;
            }

            for (entry, err) in to_fail {
                let mut state = self.inner.state.lock();
                if let Some(record) = state.history.iter_mut().rev().find(|r| r.id == entry.id) {
                    record.ended_at_ms = Some(now);
                    record.outcome = Some("canceled_while_queued");
                }
                drop(state);
                (entry.invoke)(InvokeOutcome::Fail(err));
            }
            for entry in to_start {
                (entry.invoke)(InvokeOutcome::Dispatch);
            }
        }

        let mut state = self.inner.state.lock();
        state.dispatching = false;
    }

    fn on_terminal(
        &self,
        id: Uuid,
        was_emergency: bool,
        outcome: &'static str,
        operation_type: Option<String>,
        duration_ms: f64,
    ) {
        let callback_args = {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            if was_emergency {
                state.active_emergency = state.active_emergency.saturating_sub(1);
                if state.active_emergency == 0 {
                    state.emergency_bypass_active = false;
                }
            }
            let now = now_ms();
            if let Some(record) = state.history.iter_mut().rev().find(|r| r.id == id) {
                record.ended_at_ms = Some(now);
                record.outcome = Some(outcome);
            }

            let mut callback_args = None;
            if let Some(desired) = state.desired_limit {
                if state.active <= desired {
                    let old = state.limit;
                    state.limit = desired;
                    state.desired_limit = None;
                    callback_args = Some((state.limit, old));
                }
            }
            callback_args
        };

        if let Some((new, old)) = callback_args {
            if let Some(cb) = &self.inner.on_scaling_update {
                cb(new, old);
            }
        }
        if let Some(op_type) = operation_type {
            self.inner.history_store.record_operation(&op_type, duration_ms);
        }
        self.dispatch();
    }

    /// Apply a new recommended limit. Downward moves that would kill active
    /// work are deferred (`desired_limit`) until enough work drains.
    pub fn update_limit(&self, n: i64) {
        let (changed, new, old, upscale) = {
            let mut state = self.inner.state.lock();
            let mut sanitized = if !(n >= 1) {
                tracing::warn!(requested = n, "update_limit received a non-positive value, coercing to 1");
                1u32
            } else {
                n as u32
            };

            if state.emergency_bypass_active {
                let queued_emergencies = state.queue.iter().filter(|e| e.emergency).count() as u32;
                let min_needed = (queued_emergencies + state.active_emergency).clamp(1, 2);
                sanitized = sanitized.max(min_needed);
            }

            let old = state.limit;
            if sanitized < state.active {
                state.desired_limit = Some(sanitized);
                state.limit = state.active.max(1);
            } else {
                state.desired_limit = None;
                state.limit = sanitized;
            }
            let changed = state.limit != old;
            let upscale = state.limit > old;
            (changed, state.limit, old, upscale)
        };

        if changed {
            if let Some(cb) = &self.inner.on_scaling_update {
                cb(new, old);
            }
        }
        if upscale {
            self.dispatch();
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            queued: state.queue.len(),
            active: state.active,
            limit: state.limit,
            emergency_bypass_active: state.emergency_bypass_active,
        }
    }

    /// Throughput (completions/sec) and latency percentiles over requests
    /// that completed since `since_ms`, plus the current backlog/pressure.
    /// Called once per supervisor tick to build the `QueueSnapshot` fed to
    /// the decision engine.
    pub fn tick_metrics(&self, since_ms: u64) -> TickMetrics {
        let state = self.inner.state.lock();
        let now = now_ms();
        let elapsed_sec = (now.saturating_sub(since_ms) as f64 / 1000.0).max(0.001);

        let mut latencies: Vec<f64> = state
            .history
            .iter()
            .filter(|r| r.ended_at_ms.map(|t| t >= since_ms).unwrap_or(false))
            .filter_map(|r| match (r.started_at_ms, r.ended_at_ms) {
                (Some(started), Some(ended)) => Some(ended.saturating_sub(started) as f64),
                _ => None,
            })
            .collect();

        let throughput = if latencies.is_empty() {
            None
        } else {
            Some(latencies.len() as f64 / elapsed_sec)
        };
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };
        let p95_latency_ms = if latencies.is_empty() {
            None
        } else {
            latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((latencies.len() as f64) * 0.95).ceil() as usize;
            Some(latencies[idx.saturating_sub(1).min(latencies.len() - 1)])
        };

        let queued = state.queue.len() as u32;
        TickMetrics {
            queue_pressure: queued,
            backlog: queued + state.active,
            throughput,
            avg_latency_ms,
            p95_latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmitOptions;
    use std::time::Duration as StdDuration;

    fn test_manager(limit: u32) -> AdmissionManager {
        let history = Arc::new(HistoryStore::new(
            StdDuration::from_secs(60),
            100,
            100,
            50,
            StdDuration::from_secs(60),
        ));
        AdmissionManager::new(limit, 100, history, None)
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let manager = test_manager(1);
        let handle1 = manager.submit(
            || async {
                tokio::time::sleep(StdDuration::from_millis(30)).await;
                Ok::<_, ControllerError>(1)
            },
            SubmitOptions::default(),
        );
        let stats = manager.queue_stats();
        assert_eq!(stats.active, 1);
        let handle2 = manager.submit(
            || async { Ok::<_, ControllerError>(2) },
            SubmitOptions::default(),
        );
        let stats = manager.queue_stats();
        assert_eq!(stats.queued, 1);

        assert_eq!(handle1.await.unwrap(), 1);
        assert_eq!(handle2.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn emergency_request_bypasses_a_full_limit() {
        let manager = test_manager(1);
        let _busy = manager.submit(
            || async {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                Ok::<_, ControllerError>(())
            },
            SubmitOptions::default(),
        );
        tokio::task::yield_now().await;
        let emergency = manager.submit(
            || async { Ok::<_, ControllerError>(7) },
            SubmitOptions {
                emergency: true,
                priority: 10,
                ..Default::default()
            },
        );
        assert_eq!(emergency.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn timeout_fails_the_handle_with_request_timeout() {
        let manager = test_manager(2);
        let handle = manager.submit(
            || async {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
                Ok::<_, ControllerError>(())
            },
            SubmitOptions {
                timeout: Some(StdDuration::from_millis(20)),
                ..Default::default()
            },
        );
        let err = handle.await.unwrap_err();
        assert!(matches!(err, ControllerError::RequestTimeout(_)));
    }

    #[tokio::test]
    async fn scale_down_below_active_is_deferred() {
        let manager = test_manager(4);
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(manager.submit(
                || async {
                    tokio::time::sleep(StdDuration::from_millis(40)).await;
                    Ok::<_, ControllerError>(())
                },
                SubmitOptions::default(),
            ));
        }
        manager.update_limit(1);
        // active work is not killed: limit stays at active count until drained.
        assert_eq!(manager.queue_stats().limit, 4);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(manager.queue_stats().limit, 1);
    }
}
