//! Existence checks through the cache.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cachedict::prelude::*;
use common::*;

fn dictionary(source: Arc<MockSource>) -> CacheDictionary<u64> {
    let schema = simple_schema();
    let storage = memory_storage::<u64>(
        &schema,
        1024,
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(120),
    );
    CacheDictionary::new("has-keys", schema, source, storage, queue_config(), false).unwrap()
}

#[test]
fn test_has_keys_mixes_present_and_absent() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    source.set_row(3, vec![AttributeValue::String("c".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    let result = dictionary.has_keys(&[id_column(&[1, 2, 3])]).unwrap();
    assert_eq!(result, vec![true, false, true]);
    assert_eq!(source.calls(), 1);
}

#[test]
fn test_has_keys_fast_path_after_get() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(source.calls(), 1);

    // All keys fresh in storage: no source call.
    let result = dictionary.has_keys(&[id_column(&[1])]).unwrap();
    assert_eq!(result, vec![true]);
    assert_eq!(source.calls(), 1);
}

#[test]
fn test_negative_entries_report_false_from_cache() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    // Key 2 is absent; the miss is cached as a negative entry.
    let result = dictionary.has_keys(&[id_column(&[1, 2])]).unwrap();
    assert_eq!(result, vec![true, false]);
    assert_eq!(source.calls(), 1);

    // The repeated check is answered from cache, still false.
    let result = dictionary.has_keys(&[id_column(&[1, 2])]).unwrap();
    assert_eq!(result, vec![true, false]);
    assert_eq!(source.calls(), 1);
}

#[test]
fn test_has_keys_sees_keys_fetched_during_update() {
    let source = Arc::new(MockSource::new(simple_schema()));
    for id in 0..4 {
        source.set_row(id, vec![AttributeValue::String(format!("v{id}"))]);
    }
    let dictionary = dictionary(Arc::clone(&source));

    let result = dictionary.has_keys(&[id_column(&[0, 1, 2, 3, 99])]).unwrap();
    assert_eq!(result, vec![true, true, true, true, false]);
}

#[test]
fn test_has_keys_duplicates_stay_on_fast_path_when_fresh() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    dictionary
        .get_column("name", &[id_column(&[1])], None)
        .unwrap();
    assert_eq!(source.calls(), 1);

    // The key is cached fresh: duplicates in the batch must not push the
    // check off the fast path.
    let result = dictionary.has_keys(&[id_column(&[1, 1])]).unwrap();
    assert_eq!(result, vec![true, true]);
    assert_eq!(source.calls(), 1);
}

#[test]
fn test_has_keys_counts_queries() {
    let source = Arc::new(MockSource::new(simple_schema()));
    source.set_row(1, vec![AttributeValue::String("a".into())]);
    let dictionary = dictionary(Arc::clone(&source));

    dictionary.has_keys(&[id_column(&[1, 2])]).unwrap();
    let stats = dictionary.stats();
    assert_eq!(stats.query_count, 2);
    assert_eq!(stats.keys_not_found, 2);
}
