//! Queue saturation and shutdown behavior through the dictionary.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cachedict::prelude::*;
use common::*;

#[test]
fn test_queue_full_is_observed_quickly() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    // The first request parks its worker inside the source.
    source.set_delay(Some(Duration::from_millis(800)));

    let storage = memory_storage::<u64>(
        &schema,
        64,
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(120),
    );
    let queue = UpdateQueueConfig {
        max_update_queue_size: 1,
        max_threads_for_updates: 1,
        push_timeout: Duration::from_millis(10),
        query_wait_timeout: Duration::from_secs(10),
    };
    let dictionary = Arc::new(
        CacheDictionary::new(
            "saturated",
            schema,
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            storage,
            queue,
            false,
        )
        .unwrap(),
    );

    // First reader: its unit is popped by the only worker, which then sleeps
    // inside the source.
    let first = {
        let dictionary = Arc::clone(&dictionary);
        std::thread::spawn(move || dictionary.get_column("name", &[id_column(&[1])], None))
    };
    std::thread::sleep(Duration::from_millis(100));

    // Second reader: its unit occupies the single queue slot.
    let second = {
        let dictionary = Arc::clone(&dictionary);
        std::thread::spawn(move || dictionary.get_column("name", &[id_column(&[2])], None))
    };
    std::thread::sleep(Duration::from_millis(100));

    // Third reader: the queue is full and the push times out within ~10ms.
    let started = Instant::now();
    let err = dictionary
        .get_column("name", &[id_column(&[3])], None)
        .unwrap_err();
    assert!(matches!(err, CacheError::QueueFull { .. }));
    assert!(started.elapsed() < Duration::from_millis(200));

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
}

#[test]
fn test_wait_timeout_surfaces_as_update_timeout() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    source.set_delay(Some(Duration::from_millis(500)));

    let storage = memory_storage::<u64>(
        &schema,
        64,
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(120),
    );
    let queue = UpdateQueueConfig {
        max_update_queue_size: 4,
        max_threads_for_updates: 1,
        push_timeout: Duration::from_millis(100),
        query_wait_timeout: Duration::from_millis(50),
    };
    let dictionary = CacheDictionary::new(
        "slow",
        schema,
        Arc::clone(&source) as Arc<dyn DictionarySource>,
        storage,
        queue,
        false,
    )
    .unwrap();

    let err = dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap_err();
    assert!(matches!(err, CacheError::UpdateTimeout { .. }));
}

#[test]
fn test_reads_after_stop_are_cancelled() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);

    let storage = memory_storage::<u64>(
        &schema,
        64,
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(120),
    );
    let dictionary = CacheDictionary::new(
        "stopped",
        schema,
        Arc::clone(&source) as Arc<dyn DictionarySource>,
        storage,
        queue_config(),
        false,
    )
    .unwrap();

    // A fresh key keeps working after the stop (fast path, no queue).
    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();

    dictionary.stop_and_wait();

    let column = dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(strings(&column), vec!["a"]);

    // A miss would need the queue, which is gone.
    let err = dictionary
        .get_column("name", &[id_column(&[2])], None)
        .unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));

    // Stopping again is a no-op.
    dictionary.stop_and_wait();
}

#[test]
fn test_concurrent_readers_converge() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    for id in 0..50 {
        source.set_row(id, vec![AttributeValue::String(format!("v{id}"))]);
    }

    let storage = memory_storage::<u64>(
        &schema,
        1024,
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(120),
    );
    let dictionary = Arc::new(
        CacheDictionary::new(
            "concurrent",
            schema,
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            storage,
            queue_config(),
            false,
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let dictionary = Arc::clone(&dictionary);
            std::thread::spawn(move || {
                for round in 0..20u64 {
                    let id = (worker * 7 + round) % 50;
                    let column = dictionary
                        .get_column("name", &[id_column(&[id])], None)
                        .unwrap();
                    assert_eq!(strings(&column), vec![format!("v{id}")]);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Every key is cached at most once.
    assert!(dictionary.element_count() <= 50);
}
