use rendershard::{BoundedRingQueue, SharedRegion};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn ring(capacity: u32) -> (SharedRegion, BoundedRingQueue) {
    let region = SharedRegion::new(BoundedRingQueue::required_bytes(capacity)).unwrap();
    let queue = BoundedRingQueue::new(&region, 0, capacity).unwrap();
    (region, queue)
}

#[test]
fn test_single_thread_fifo() {
    let (_region, q) = ring(8);
    for v in 10..18 {
        assert!(q.try_enqueue(v));
    }
    assert!(q.is_full());
    assert!(!q.try_enqueue(99));
    for v in 10..18 {
        assert_eq!(q.try_dequeue(), Some(v));
    }
    assert!(q.is_empty());
    assert_eq!(q.try_dequeue(), None);
}

#[test]
fn test_concurrent_producers_consumers_multiset() {
    const PRODUCERS: u32 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u32 = 5_000;

    let region = SharedRegion::new(BoundedRingQueue::required_bytes(64)).unwrap();
    BoundedRingQueue::new(&region, 0, 64).unwrap();
    let consumed = Arc::new(AtomicUsize::new(0));
    let total = (PRODUCERS * PER_PRODUCER) as usize;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = BoundedRingQueue::attach(&region, 0, 64).unwrap();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.enqueue(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let q = BoundedRingQueue::attach(&region, 0, 64).unwrap();
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut values = Vec::new();
                while consumed.load(Ordering::SeqCst) < total {
                    if let Some(v) = q.dequeue(Some(Duration::from_millis(10))) {
                        consumed.fetch_add(1, Ordering::SeqCst);
                        values.push(v);
                    }
                }
                values
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for consumer in consumers {
        for v in consumer.join().unwrap() {
            *counts.entry(v).or_default() += 1;
        }
    }
    assert_eq!(counts.len(), total);
    assert!(counts.values().all(|&c| c == 1));
}

#[test]
fn test_per_producer_order_preserved() {
    let (region, q) = ring(16);
    let producer = {
        let q = BoundedRingQueue::attach(&region, 0, 16).unwrap();
        thread::spawn(move || {
            for v in 0..2_000 {
                q.enqueue(v);
            }
        })
    };

    let mut expected = 0;
    while expected < 2_000 {
        if let Some(v) = q.dequeue(Some(Duration::from_secs(1))) {
            assert_eq!(v, expected);
            expected += 1;
        }
    }
    producer.join().unwrap();
}

#[test]
fn test_blocking_dequeue_wakes_on_enqueue() {
    let (region, q) = ring(4);
    let consumer = {
        let q = BoundedRingQueue::attach(&region, 0, 4).unwrap();
        thread::spawn(move || q.dequeue(Some(Duration::from_secs(5))))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(q.try_enqueue(7));
    assert_eq!(consumer.join().unwrap(), Some(7));
}

#[test]
fn test_dequeue_timeout() {
    let (_region, q) = ring(4);
    let started = Instant::now();
    assert_eq!(q.dequeue(Some(Duration::from_millis(30))), None);
    assert!(started.elapsed() >= Duration::from_millis(30));
}
