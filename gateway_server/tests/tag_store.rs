//! Integration coverage for the tag arena: creation, subscription fan-out,
//! and the breadth-first reevaluation queue in `TagStore::update`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use gateway_server::tags::expression::{analyze, tokenize};
use gateway_server::tags::store::{Subscription, TagSink, TagStore};
use gateway_server::tags::structures::TagValue;

struct CountingSink {
    calls: Arc<AtomicUsize>,
    last: std::sync::Mutex<Option<TagValue>>,
}

#[async_trait]
impl TagSink for CountingSink {
    async fn notify(&self, _key: &str, value: &TagValue) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(value.clone());
    }
}

#[tokio::test]
async fn direct_tag_skips_unchanged_updates() {
    let store = TagStore::new();
    store.create("a", "", None, None, None, true);

    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(CountingSink {
        calls: calls.clone(),
        last: std::sync::Mutex::new(None),
    });
    store.subscribe("a", Subscription::Sink(sink)).unwrap();

    store.update("a", TagValue::Int(1)).await.unwrap();
    store.update("a", TagValue::Int(1)).await.unwrap();
    store.update("a", TagValue::Int(2)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expression_cascades_through_a_chain() {
    let store = TagStore::new();
    store.create("base", "", None, None, None, true);
    store.create_expression("doubled", "", "base * 2", tokenize("base * 2"), false);
    store.create_expression("plus_one", "", "doubled + 1", tokenize("doubled + 1"), false);

    analyze(&store, "doubled").unwrap();
    analyze(&store, "plus_one").unwrap();

    store.update("base", TagValue::Int(5)).await.unwrap();

    assert_eq!(store.get("doubled").unwrap().value.read().clone(), TagValue::Int(10));
    assert_eq!(store.get("plus_one").unwrap().value.read().clone(), TagValue::Int(11));
}

#[tokio::test]
async fn unknown_subscribe_target_is_rejected() {
    let store = TagStore::new();
    let err = store.subscribe("missing", Subscription::Reevaluate("also-missing".to_string()));
    assert!(err.is_err());
}
