use adaptive_concurrency_controller::PIDController;
use adaptive_concurrency_controller::PidGains;
use criterion::{criterion_group, criterion_main, Criterion};

fn benchmark_pid_update(c: &mut Criterion) {
    c.bench_function("pid_update_steady_state", |b| {
        let mut pid = PIDController::new(PidGains::default(), 1, 64);
        let mut now = 0u64;
        b.iter(|| {
            now += 1000;
            pid.update(72.5, now)
        })
    });
}

fn benchmark_pid_update_with_output_max_churn(c: &mut Criterion) {
    c.bench_function("pid_update_with_ceiling_changes", |b| {
        let mut pid = PIDController::new(PidGains::default(), 1, 64);
        let mut now = 0u64;
        let mut ceiling = 8i64;
        b.iter(|| {
            now += 1000;
            ceiling = if ceiling >= 32 { 8 } else { ceiling + 4 };
            pid.set_output_max(ceiling);
            pid.update(65.0, now)
        })
    });
}

criterion_group!(
    benches,
    benchmark_pid_update,
    benchmark_pid_update_with_output_max_churn
);
criterion_main!(benches);
