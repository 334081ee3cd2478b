//! Serve-stale behavior: expired entries are returned immediately while a
//! background refresh runs.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cachedict::prelude::*;
use common::*;

fn dictionary(source: Arc<MockSource>) -> CacheDictionary<u64> {
    let schema = simple_schema();
    let storage = memory_storage::<u64>(
        &schema,
        1024,
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(10),
    );
    CacheDictionary::new("stale", schema, source, storage, queue_config(), true).unwrap()
}

#[test]
fn test_expired_key_served_stale_and_refreshed() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(source.calls(), 1);

    std::thread::sleep(Duration::from_secs(3));
    source.set_row(1, vec![AttributeValue::String("a2".into())]);

    // The expired entry is usable: the stale value comes back immediately
    // and a background refresh is scheduled.
    let started = Instant::now();
    let column = dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(strings(&column), vec!["a"]);
    assert!(started.elapsed() < Duration::from_millis(500));

    // The refresh lands shortly after.
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.calls() < 2 {
        assert!(Instant::now() < deadline, "background refresh never ran");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Once refreshed, reads observe the new value without another fetch.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let column = dictionary
            .get_column("name", &[id_column(&[1])], None)
            .unwrap();
        if strings(&column) == vec!["a2"] {
            break;
        }
        assert!(Instant::now() < deadline, "refresh result never observed");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_sync_update_when_stale_reads_disallowed() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);

    let storage = memory_storage::<u64>(
        &schema,
        1024,
        Duration::from_millis(50),
        Duration::from_millis(50),
        Duration::from_secs(10),
    );
    let dictionary =
        CacheDictionary::new("no-stale", schema, Arc::clone(&source) as Arc<dyn DictionarySource>, storage, queue_config(), false)
            .unwrap();

    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(source.calls(), 1);

    std::thread::sleep(Duration::from_millis(120));
    source.set_row(1, vec![AttributeValue::String("a2".into())]);

    // With stale reads disallowed the caller waits for the refresh and
    // observes the new value right away.
    let column = dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(strings(&column), vec!["a2"]);
    assert_eq!(source.calls(), 2);
}

#[test]
fn test_stale_value_beyond_strict_lifetime_is_missing() {
    let schema = simple_schema();
    let source = Arc::new(MockSource::new(schema.clone()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);

    let storage = memory_storage::<u64>(
        &schema,
        1024,
        Duration::from_millis(50),
        Duration::from_millis(50),
        Duration::from_millis(50),
    );
    let dictionary =
        CacheDictionary::new("strict", schema, Arc::clone(&source) as Arc<dyn DictionarySource>, storage, queue_config(), true)
            .unwrap();

    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();

    // Past deadline + strict_max_lifetime the entry is invalid, so even with
    // stale reads allowed the caller waits for a synchronous update.
    std::thread::sleep(Duration::from_millis(200));
    source.set_row(1, vec![AttributeValue::String("a2".into())]);

    let column = dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(strings(&column), vec!["a2"]);
    assert_eq!(source.calls(), 2);
}
