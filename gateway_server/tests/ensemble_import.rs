//! Integration coverage for `Ensemble::import_tags`/`import_alarms`: CSV
//! rows become registered tags on the right driver and alarms end up in
//! the right group, without ever opening a real PLC connection.

use std::io::Write;
use std::time::Duration;

use gateway_server::config::{AlarmImportConfig, TagImportConfig};
use gateway_server::drivers::database::DatabaseDriver;
use gateway_server::drivers::modbus::ModbusDriver;
use gateway_server::ensemble::Ensemble;
use std::sync::Arc;

fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn import_tags_registers_across_driver_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let csv = "key;plc;memory;address;description\n\
               plant.coil1;mb1;coil;10;pump enabled\n\
               plant.reading1;db1;sensors;temperature;raw sensor reading\n";
    let path = write_csv(&dir, "tags.csv", csv);

    let ensemble = Ensemble::new();
    ensemble.add_plc(
        "mb1",
        Arc::new(ModbusDriver::new("mb1", "127.0.0.1:1502".parse().unwrap(), 1, 3, Duration::from_secs(1))),
    );
    ensemble.add_plc(
        "db1",
        Arc::new(DatabaseDriver::new("db1", "postgres://localhost/test", Duration::from_secs(5))),
    );

    let cfg = TagImportConfig {
        filename: path.clone(),
        prefix: String::new(),
        delimiter: ';',
        quotechar: '"',
        encoding: "utf8".to_string(),
    };
    let count = ensemble.import_tags(&path, &cfg).unwrap();
    assert_eq!(count, 2);

    let coil = ensemble.store.get("plant.coil1").unwrap();
    assert_eq!(coil.plc_key.as_deref(), Some("mb1"));
    assert!(coil.writable);

    let reading = ensemble.store.get("plant.reading1").unwrap();
    assert_eq!(reading.plc_key.as_deref(), Some("db1"));
    assert_eq!(reading.memory_key.as_deref(), Some("sensors"));
}

#[test]
fn import_tags_skips_rows_with_unknown_plc() {
    let dir = tempfile::tempdir().unwrap();
    let csv = "key;plc;memory;address;description\n\
               ghost.tag;no-such-plc;coil;1;orphaned\n";
    let path = write_csv(&dir, "tags.csv", csv);

    let ensemble = Ensemble::new();
    let cfg = TagImportConfig {
        filename: path.clone(),
        prefix: String::new(),
        delimiter: ';',
        quotechar: '"',
        encoding: "utf8".to_string(),
    };
    let count = ensemble.import_tags(&path, &cfg).unwrap();
    assert_eq!(count, 0);
    assert!(!ensemble.store.contains("ghost.tag"));
}

#[test]
fn import_alarms_creates_expression_and_joins_group() {
    let dir = tempfile::tempdir().unwrap();
    let csv = "key;definition;description\n\
               high_temp;plant.reading1 > 90;temperature too high\n";
    let path = write_csv(&dir, "alarms.csv", csv);

    let ensemble = Ensemble::new();
    ensemble.store.create("plant.reading1", "", None, None, None, true);

    let cfg = AlarmImportConfig {
        filename: path.clone(),
        alarmgroup: "thermal".to_string(),
        delimiter: ';',
        quotechar: '"',
        encoding: "utf8".to_string(),
    };
    let count = ensemble.import_alarms(&path, &cfg).unwrap();
    assert_eq!(count, 1);

    let group = ensemble.alarms.get("thermal").unwrap();
    assert_eq!(group.alarm_keys(), vec!["high_temp".to_string()]);
    assert!(ensemble.store.get("high_temp").unwrap().is_alarm());

    ensemble.analyze_alarms();
}
