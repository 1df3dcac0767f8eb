//! Integration coverage for the Modbus driver (C5) that exercises the
//! parts of the contract that don't require a live TCP peer: read-only
//! space rejection on write, and a no-op scan when nothing is registered.

use std::time::Duration;

use gateway_server::drivers::modbus::{ModbusDriver, Space};
use gateway_server::drivers::Driver;
use gateway_server::error::EngineError;
use gateway_server::tags::store::TagStore;
use gateway_server::tags::structures::TagValue;

fn driver() -> ModbusDriver {
    ModbusDriver::new("plc1", "127.0.0.1:1".parse().unwrap(), 1, 1, Duration::from_millis(10))
}

#[tokio::test]
async fn write_rejects_input_space_as_read_only() {
    let driver = driver();
    driver.register_tag(Space::Input, 5, "plant.di1");
    let store = TagStore::new();
    store.create("plant.di1", "", Some("5".to_string()), Some("plc1".to_string()), Some("input".to_string()), false);

    let err = driver.write(&store, "plant.di1", TagValue::Bool(true)).await.unwrap_err();
    assert!(matches!(err, EngineError::ReadOnly(_)));
}

#[tokio::test]
async fn write_rejects_register_space_as_read_only() {
    let driver = driver();
    driver.register_tag(Space::Register, 7, "plant.ai1");
    let store = TagStore::new();
    store.create("plant.ai1", "", Some("7".to_string()), Some("plc1".to_string()), Some("register".to_string()), false);

    let err = driver.write(&store, "plant.ai1", TagValue::Int(100)).await.unwrap_err();
    assert!(matches!(err, EngineError::ReadOnly(_)));
}

#[tokio::test]
async fn write_to_unregistered_tag_is_rejected() {
    let driver = driver();
    let store = TagStore::new();
    let err = driver.write(&store, "nonexistent", TagValue::Bool(true)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownTag(_)));
}

#[tokio::test]
async fn scan_with_no_registered_tags_is_a_harmless_no_op() {
    let driver = driver();
    let store = TagStore::new();
    // No spans have any min/max set, so read() never has to touch the
    // (absent) transport and should return Ok without blocking.
    driver.read(&store).await.unwrap();
}

#[tokio::test]
async fn write_without_an_open_socket_reports_transport_error_not_a_panic() {
    let driver = driver();
    driver.register_tag(Space::Coil, 10, "plant.coil1");
    let store = TagStore::new();
    store.create("plant.coil1", "", Some("10".to_string()), Some("plc1".to_string()), Some("coil".to_string()), true);

    let err = driver.write(&store, "plant.coil1", TagValue::Bool(true)).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
}
