//! Integration coverage for alarm edge detection and output fan-out:
//! an alarm only fires its outputs on a truthiness transition, not on
//! every recompute, and only to the groups it belongs to.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_server::outputs::{Output, OutputInfo};
use gateway_server::tags::alarm::AlarmRegistry;
use gateway_server::tags::expression::{analyze, tokenize};
use gateway_server::tags::store::{TagKind, TagStore};
use gateway_server::tags::structures::TagValue;

struct CountingOutput {
    edges: Arc<AtomicUsize>,
}

#[async_trait]
impl Output for CountingOutput {
    async fn write(&self, _store: &TagStore, _expr_key: &str, _ts: DateTime<Utc>, value: &TagValue, _info: &OutputInfo) {
        assert!(value.is_truthy() || matches!(value, TagValue::Bool(false)));
        self.edges.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn alarm_fires_only_on_truthiness_transition() {
    let store = Arc::new(TagStore::new());
    let alarms = Arc::new(AlarmRegistry::new());
    store.attach_alarm_registry(alarms.clone());

    store.create("level", "", None, None, None, true);
    let tokens = tokenize("level > 100");
    let entry = store.create_expression("high_level", "tank too full", "level > 100", tokens, true);
    if let TagKind::Expression(state) = &entry.kind {
        state.alarm.as_ref().unwrap().write().groups.push("tank".to_string());
    }

    let group = alarms.get_or_create("tank");
    group.add_alarm("high_level");
    let edges = Arc::new(AtomicUsize::new(0));
    group.add_output(Arc::new(CountingOutput { edges: edges.clone() }));

    analyze(&store, "high_level").unwrap();

    store.update("level", TagValue::Int(50)).await.unwrap();
    assert_eq!(edges.load(Ordering::SeqCst), 0, "still below threshold, no edge yet");

    store.update("level", TagValue::Int(150)).await.unwrap();
    assert_eq!(edges.load(Ordering::SeqCst), 1, "crossed into alarm");

    store.update("level", TagValue::Int(200)).await.unwrap();
    assert_eq!(edges.load(Ordering::SeqCst), 1, "still alarmed, no repeat edge");

    store.update("level", TagValue::Int(10)).await.unwrap();
    assert_eq!(edges.load(Ordering::SeqCst), 2, "dropped back below threshold");
}

#[tokio::test]
async fn active_alarms_reports_only_currently_true_members() {
    let store = TagStore::new();
    let alarms = AlarmRegistry::new();

    store.create("p", "", None, None, None, true);
    let entry = store.create_expression("p_alarm", "", "p > 10", tokenize("p > 10"), true);
    if let TagKind::Expression(state) = &entry.kind {
        state.alarm.as_ref().unwrap().write().groups.push("g".to_string());
    }
    let group = alarms.get_or_create("g");
    group.add_alarm("p_alarm");
    analyze(&store, "p_alarm").unwrap();

    assert!(alarms.active_alarms("g", &store).is_empty());

    store.update("p", TagValue::Int(20)).await.unwrap();
    let active = alarms.active_alarms("g", &store);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].0, "p_alarm");
}
