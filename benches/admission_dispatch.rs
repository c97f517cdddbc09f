use std::sync::Arc;

use adaptive_concurrency_controller::{AdmissionManager, ControllerError, HistoryStore, SubmitOptions};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

fn history() -> Arc<HistoryStore> {
    Arc::new(HistoryStore::new(
        std::time::Duration::from_secs(300),
        300,
        200,
        50,
        std::time::Duration::from_secs(1200),
    ))
}

fn benchmark_submit_under_available_capacity(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("submit_dispatches_immediately", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = AdmissionManager::new(64, 100, history(), None);
                let handle = admission.submit(
                    || async { Ok::<_, ControllerError>(()) },
                    SubmitOptions::default(),
                );
                handle.await.unwrap();
            })
        })
    });
}

fn benchmark_submit_under_contention(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("submit_under_full_limit_queues_and_drains", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = AdmissionManager::new(4, 100, history(), None);
                let mut handles = Vec::with_capacity(32);
                for _ in 0..32 {
                    handles.push(admission.submit(
                        || async { Ok::<_, ControllerError>(()) },
                        SubmitOptions::default(),
                    ));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            })
        })
    });
}

fn benchmark_emergency_bypass_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("emergency_submit_bypasses_full_limit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = AdmissionManager::new(1, 100, history(), None);
                let blocking = admission.submit(
                    || async {
                        tokio::time::sleep(std::time::Duration::from_micros(50)).await;
                        Ok::<_, ControllerError>(())
                    },
                    SubmitOptions::default(),
                );
                let emergency = admission.submit(
                    || async { Ok::<_, ControllerError>(()) },
                    SubmitOptions {
                        priority: 10,
                        emergency: true,
                        ..SubmitOptions::default()
                    },
                );
                emergency.await.unwrap();
                blocking.await.unwrap();
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_submit_under_available_capacity,
    benchmark_submit_under_contention,
    benchmark_emergency_bypass_dispatch
);
criterion_main!(benches);
