use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use subscription_core::collections::{IntrusiveList, ListOptions};
use subscription_core::config::ThrottleConfig;
use subscription_core::{Dispatch, EndpointPool, RateThrottle, ThrottleOwner, TimerRuntime};
use tokio::runtime::Builder;

const LIST_CHURN_OPS: usize = 256;
const QUEUED_ACTIONS: usize = 512;
const POOL_TOPICS: usize = 128;
const ENDPOINTS_PER_TOPIC: usize = 4;

fn throttle_criterion(c: &mut Criterion) {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime should build");
    let timers = TimerRuntime::from_handle(runtime.handle().clone());

    let mut list_group = c.benchmark_group("intrusive_list");
    list_group.bench_function("allocate_push_pop_free", |b| {
        let list = IntrusiveList::new(ListOptions::named("bench"));
        b.iter(|| {
            for value in 0..LIST_CHURN_OPS {
                if let Some(handle) = list.add_element(value) {
                    black_box(handle);
                }
            }
            while let Some(handle) = list.pop_front() {
                black_box(list.free_element(handle));
            }
        });
    });
    list_group.bench_function("remove_from_middle", |b| {
        b.iter_batched(
            || {
                let list = IntrusiveList::new(ListOptions::named("bench"));
                let handles: Vec<_> = (0..LIST_CHURN_OPS)
                    .filter_map(|value| list.add_element(value))
                    .collect();
                (list, handles)
            },
            |(list, handles)| {
                for handle in handles.iter().step_by(2) {
                    black_box(list.remove_element(*handle));
                }
                black_box(list.len());
            },
            BatchSize::SmallInput,
        );
    });
    list_group.finish();

    let mut throttle_group = c.benchmark_group("rate_throttle");
    throttle_group.bench_function("dispatch_inline", |b| {
        let throttle = RateThrottle::new("bench-inline", ThrottleConfig::disabled(), timers.clone());
        let owner = ThrottleOwner::next();
        let counter = Arc::new(AtomicUsize::new(0));
        b.iter(|| {
            let counter = Arc::clone(&counter);
            let outcome = throttle
                .dispatch(owner, false, move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("disabled throttle accepts actions");
            black_box(outcome);
        });
    });
    throttle_group.bench_function("queue_then_cancel_owner", |b| {
        let throttle = RateThrottle::new("bench-queued", ThrottleConfig::default(), timers.clone());
        b.iter(|| {
            let owner = ThrottleOwner::next();
            for _ in 0..QUEUED_ACTIONS {
                match throttle.dispatch(owner, false, || {}) {
                    Ok(Dispatch::Queued(handle)) => {
                        black_box(handle);
                    }
                    Ok(Dispatch::Executed) => {}
                    Err(err) => panic!("dispatch failed: {err}"),
                }
            }
            let removed = throttle.remove_messages_for_owner(owner);
            assert_eq!(removed, QUEUED_ACTIONS);
        });
        throttle.destroy();
    });
    throttle_group.finish();

    let pool = EndpointPool::new("bench");
    for topic in 0..POOL_TOPICS {
        for endpoint in 0..ENDPOINTS_PER_TOPIC {
            pool.register_with_identifier(
                &format!("NASDAQ.SYM{topic}"),
                &format!("ep-{endpoint}"),
                Arc::new(endpoint),
            )
            .expect("benchmark registration should succeed");
        }
    }
    let mut pool_group = c.benchmark_group("endpoint_pool");
    pool_group.bench_function("get_registered", |b| {
        b.iter(|| {
            for topic in 0..POOL_TOPICS {
                let endpoints = pool.get_registered(black_box("NASDAQ.SYM7"));
                black_box((topic, endpoints.len()));
            }
        });
    });
    pool_group.bench_function("register_unregister", |b| {
        b.iter(|| {
            pool.register_with_identifier("NASDAQ.CHURN", "ep", Arc::new(0))
                .expect("register should succeed");
            black_box(pool.unregister("NASDAQ.CHURN", "ep"));
        });
    });
    pool_group.finish();
}

criterion_group!(benches, throttle_criterion);
criterion_main!(benches);
