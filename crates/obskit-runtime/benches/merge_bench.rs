//! Benchmarks for observable writes and merge recomputation.
//!
//! Run with: cargo bench -p obskit-runtime --bench merge_bench

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use obskit_core::dispatch::MainLoop;
use obskit_runtime::reactive::{Observable, merge_all, merge2};
use std::hint::black_box;

fn sink<T: Copy>(value: &T) {
    black_box(*value);
}

// =============================================================================
// Observable writes
// =============================================================================

fn bench_observable_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("observable/set");
    let main = MainLoop::new();
    let d = main.dispatcher();

    for observers in [0usize, 1, 8] {
        let holder = Observable::new(&d, 0u64);
        let subs: Vec<_> = (0..observers)
            .map(|_| holder.subscribe(sink))
            .collect();
        let mut i = 0u64;
        group.bench_with_input(
            BenchmarkId::new("observers", observers),
            &observers,
            |b, _| {
                b.iter(|| {
                    i += 1;
                    holder.set(black_box(i));
                })
            },
        );
        drop(subs);
    }

    let distinct = Observable::distinct(&d, 7u64);
    let _sub = distinct.subscribe(sink);
    group.bench_function("distinct_equal", |b| {
        b.iter(|| distinct.set(black_box(7)))
    });

    group.finish();
}

fn bench_post_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("observable/post");
    let main = MainLoop::new();
    let d = main.dispatcher();
    let holder = Observable::new(&d, 0u64);
    let _sub = holder.subscribe(sink);

    for burst in [1u64, 16, 256] {
        group.bench_with_input(BenchmarkId::new("burst", burst), &burst, |b, &burst| {
            b.iter(|| {
                for i in 0..burst {
                    let _ = holder.post(black_box(i));
                }
                black_box(main.run_until_idle())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Merge recomputation
// =============================================================================

fn bench_merge2(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge/two");
    let main = MainLoop::new();
    let d = main.dispatcher();
    let a = Observable::new(&d, 0i64);
    let b2 = Observable::new(&d, 0i64);
    let sum = merge2(&d, &a, &b2, |x, y| x + y);
    let _sub = sum.subscribe(sink);
    main.run_until_idle();

    let mut i = 0i64;
    group.bench_function("publish", |b| {
        b.iter(|| {
            i += 1;
            a.set(black_box(i));
            main.run_until_idle();
        })
    });

    // Alternating sign on one side with an abs merge hits the suppression path.
    let abs = merge2(&d, &a, &b2, |x, y: &i64| x + y.abs());
    let _abs_sub = abs.subscribe(sink);
    b2.set(1);
    main.run_until_idle();
    let mut sign = 1i64;
    group.bench_function("suppressed", |b| {
        b.iter(|| {
            sign = -sign;
            b2.set(black_box(sign));
        })
    });

    group.finish();
}

fn bench_merge_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge/all");
    let main = MainLoop::new();
    let d = main.dispatcher();

    for n in [4usize, 16, 64] {
        let sources: Vec<Observable<u32>> = (0..n).map(|_| Observable::new(&d, 1)).collect();
        let total = merge_all(&d, sources.clone(), |vs| vs.iter().sum::<u32>());
        let _sub = total.subscribe(sink);
        main.run_until_idle();

        let mut i = 0u32;
        group.bench_with_input(BenchmarkId::new("sources", n), &n, |b, _| {
            b.iter(|| {
                i = i.wrapping_add(1);
                sources[0].set(black_box(i));
                main.run_until_idle();
            })
        });
    }

    group.finish();
}

fn bench_activation(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge/activation");
    let main = MainLoop::new();
    let d = main.dispatcher();
    let sources: Vec<Observable<u32>> = (0..8).map(|_| Observable::new(&d, 1)).collect();
    let total = merge_all(&d, sources, |vs| vs.len());

    group.bench_function("subscribe_unsubscribe", |b| {
        b.iter(|| {
            let sub = total.subscribe(|_| {});
            sub.unsubscribe();
            main.run_until_idle();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_observable_set,
    bench_post_and_drain,
    bench_merge2,
    bench_merge_all,
    bench_activation
);
criterion_main!(benches);
