//! Work-stealing deque benchmark using criterion.
//!
//! Owner push/pop against the shared-memory deque, alone and with thieves
//! contending on the top end.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rendershard::{SharedRegion, WorkStealingDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

const CAPACITY: u32 = 1024;

fn bench_owner_only(c: &mut Criterion) {
    let region = SharedRegion::new(WorkStealingDeque::required_bytes(CAPACITY)).unwrap();
    let deque = WorkStealingDeque::new(&region, 0, CAPACITY).unwrap();

    let mut group = c.benchmark_group("deque_owner");
    group.throughput(Throughput::Elements(CAPACITY as u64));
    group.bench_function("push_pop", |b| {
        b.iter(|| {
            for handle in 0..CAPACITY {
                deque.push(handle);
            }
            while let Some(handle) = deque.pop() {
                std::hint::black_box(handle);
            }
        });
    });
    group.bench_function("push_steal", |b| {
        b.iter(|| {
            for handle in 0..CAPACITY {
                deque.push(handle);
            }
            while let Some(handle) = deque.steal() {
                std::hint::black_box(handle);
            }
        });
    });
    group.finish();
}

fn bench_contended_steal(c: &mut Criterion) {
    let mut group = c.benchmark_group("deque_contended");
    group.sample_size(10);

    for thieves in [1usize, 2, 4] {
        let handles = 50_000u32;
        group.throughput(Throughput::Elements(handles as u64));
        group.bench_function(BenchmarkId::new("thieves", thieves), |b| {
            b.iter(|| {
                let region = SharedRegion::new(WorkStealingDeque::required_bytes(CAPACITY)).unwrap();
                let owner = WorkStealingDeque::new(&region, 0, CAPACITY).unwrap();
                let done = Arc::new(AtomicBool::new(false));
                let taken = Arc::new(AtomicUsize::new(0));

                let workers: Vec<_> = (0..thieves)
                    .map(|_| {
                        let deque = WorkStealingDeque::attach(&region, 0, CAPACITY).unwrap();
                        let done = Arc::clone(&done);
                        let taken = Arc::clone(&taken);
                        thread::spawn(move || {
                            loop {
                                match deque.steal() {
                                    Some(_) => {
                                        taken.fetch_add(1, Ordering::Relaxed);
                                    }
                                    None if done.load(Ordering::Acquire) && deque.is_empty() => break,
                                    None => std::hint::spin_loop(),
                                }
                            }
                        })
                    })
                    .collect();

                let mut next = 0;
                while next < handles {
                    if owner.push(next) {
                        next += 1;
                    } else if owner.pop().is_some() {
                        taken.fetch_add(1, Ordering::Relaxed);
                    }
                }
                done.store(true, Ordering::Release);
                for worker in workers {
                    worker.join().unwrap();
                }
                while owner.pop().is_some() {
                    taken.fetch_add(1, Ordering::Relaxed);
                }
                assert_eq!(taken.load(Ordering::Relaxed), handles as usize);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_owner_only, bench_contended_steal);
criterion_main!(benches);
