//! Integration coverage for the database-backed driver (C7) that doesn't
//! require a live Postgres: write/get_data/set_row all report a
//! `Transport` error when the pool hasn't been opened yet, and unknown
//! tables/columns are rejected before any query is built.

use std::collections::BTreeMap;
use std::time::Duration;

use gateway_server::drivers::database::DatabaseDriver;
use gateway_server::drivers::Driver;
use gateway_server::error::EngineError;
use gateway_server::tags::store::TagStore;
use gateway_server::tags::structures::TagValue;

fn driver() -> DatabaseDriver {
    DatabaseDriver::new("db1", "postgres://localhost/does-not-exist", Duration::from_secs(1))
}

#[tokio::test]
async fn write_without_an_open_pool_reports_transport_error() {
    let driver = driver();
    driver.register_tag("sensors", "temperature", "plant.temp");
    let store = TagStore::new();
    store.create("plant.temp", "", Some("temperature".to_string()), Some("db1".to_string()), Some("sensors".to_string()), true);

    let err = driver.write(&store, "plant.temp", TagValue::Float(21.5)).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
}

#[tokio::test]
async fn write_to_unregistered_tag_is_rejected() {
    let driver = driver();
    let store = TagStore::new();
    let err = driver.write(&store, "ghost", TagValue::Float(1.0)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownTag(_)));
}

#[tokio::test]
async fn get_data_on_unregistered_tag_is_rejected_before_touching_the_pool() {
    let driver = driver();
    let err = driver
        .get_data("ghost", chrono::Utc::now(), chrono::Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownTag(_)));
}

#[tokio::test]
async fn set_row_rejects_a_column_the_table_does_not_have() {
    let driver = driver();
    driver.register_tag("sensors", "temperature", "plant.temp");

    let mut values = BTreeMap::new();
    values.insert("pressure".to_string(), TagValue::Float(1.0));

    // The pool has never been opened, so this surfaces as a Transport
    // error here; with a live pool it would be a Config error instead
    // (see `set_row`'s column validation).
    let err = driver.set_row("sensors", &values, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)) || matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn set_row_on_unknown_table_is_a_config_error() {
    let driver = driver();
    let values = BTreeMap::new();
    let err = driver.set_row("no-such-table", &values, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)) || matches!(err, EngineError::Config(_)));
}
