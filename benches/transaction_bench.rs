// Transaction engine performance benchmarks: insert/commit cycles, lock
// acquisition, isolation levels, and concurrent commits against the same
// table.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lynxdb::query::{compile, Query};
use lynxdb::transaction::{IsolationLevel, LockKind, LockManager};
use lynxdb::value::Value;
use lynxdb::{record, Config, Database};
use std::sync::Arc;

fn bench_insert_commit_cycle(c: &mut Criterion) {
    let db = Database::new();
    db.create_table("users", vec!["id".to_string()], Config::default())
        .unwrap();
    let mut next_id = 0i64;

    c.bench_function("insert_commit_cycle", |b| {
        b.iter(|| {
            next_id += 1;
            let result: Result<(), lynxdb::Error> = db.transaction(|tx| {
                let users = tx.get("users")?;
                users.insert(record! { "id" => next_id, "name" => "bench" })?;
                Ok(())
            });
            black_box(result.ok());
        });
    });
}

fn bench_isolation_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("isolation_levels");

    let levels = [
        IsolationLevel::ReadLatest,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    for level in levels {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{level:?}")),
            &level,
            |b, &level| {
                let db = Database::new();
                let table = db
                    .create_table("users", vec!["id".to_string()], Config::default())
                    .unwrap();
                table.insert(record! { "id" => 1i64, "stock" => 10i64 }).unwrap();
                let cfg = Config {
                    isolation_level: level,
                    ..Config::default()
                };
                let q = compile(Query::Eq("id".into(), Value::Int(1)));
                b.iter(|| {
                    let result: Result<Vec<_>, lynxdb::Error> = db.transaction_with_config(cfg, |tx| {
                        let users = tx.get("users")?;
                        Ok(users.select(None, &q)?)
                    });
                    black_box(result.ok());
                });
            },
        );
    }

    group.finish();
}

fn bench_lock_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_acquisition");

    let kinds = [LockKind::Shared, LockKind::Exclusive];
    for kind in kinds {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{kind:?}")),
            &kind,
            |b, &kind| {
                let lm = LockManager::new();
                let mut txn_id = 0u64;
                b.iter(|| {
                    txn_id += 1;
                    let key = format!("row_{txn_id}");
                    lm.acquire_lock_with_timeout(txn_id, &key, kind, 1000).ok();
                    lm.release_lock(txn_id, &key);
                });
            },
        );
    }

    group.finish();
}

fn bench_lock_contention(c: &mut Criterion) {
    let lm = Arc::new(LockManager::new());

    c.bench_function("lock_contention_hotspot", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4u64)
                .map(|tid| {
                    let lm = lm.clone();
                    std::thread::spawn(move || {
                        for i in 0..10 {
                            let txn_id = tid * 1000 + i;
                            if lm
                                .acquire_lock_with_timeout(txn_id, "hotspot", LockKind::Exclusive, 200)
                                .is_ok()
                            {
                                black_box(i);
                                lm.release_lock(txn_id, "hotspot");
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().ok();
            }
        });
    });
}

fn bench_concurrent_commits(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_commits");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let db = Arc::new(Database::new());
                    db.create_table("users", vec!["id".to_string()], Config::default())
                        .unwrap();

                    let handles: Vec<_> = (0..num_threads)
                        .map(|t| {
                            let db = db.clone();
                            std::thread::spawn(move || {
                                for i in 0..10i64 {
                                    let id = (t as i64) * 1000 + i;
                                    let _: Result<(), lynxdb::Error> = db.transaction(|tx| {
                                        let users = tx.get("users")?;
                                        users.insert(record! { "id" => id })?;
                                        Ok(())
                                    });
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().ok();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_commit_cycle,
    bench_isolation_levels,
    bench_lock_acquire_release,
    bench_lock_contention,
    bench_concurrent_commits
);
criterion_main!(benches);
