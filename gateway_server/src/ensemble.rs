//! Ensemble orchestrator (C9): owns PLCs, tags, and alarm groups, and wires
//! them together with `deploy()`.
//!
//! Grounded on `EnsembleModule.py`'s `Ensemble`: `setplc`/`getplc`,
//! `settag`/`gettag`, `setalarmgroup`/`getalarmgroup`, `import_tags`,
//! `import_alarms`, and the two-phase `deploy()` (`analyze_alarms()` then
//! `connect()` on every PLC). `plc`/`tag`/`alarmgroup` dictionaries become
//! `DashMap`s; tag/alarmgroup membership lives in the shared `TagStore`/
//! `AlarmRegistry` rather than the Ensemble itself, since those are the
//! structures drivers and outputs already hold references to.

use std::collections::HashSet;
use std::sync::Arc;

use csv::ReaderBuilder;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::config::{AlarmImportConfig, TagImportConfig};
use crate::drivers::database::DatabaseDriver;
use crate::drivers::modbus::{self as modbus_driver, ModbusDriver};
use crate::drivers::opcua::OpcUaDriver;
use crate::drivers::Driver;
use crate::error::{EngineError, EngineResult};
use crate::tags::alarm::AlarmRegistry;
use crate::tags::expression::{self, is_identifier, tokenize};
use crate::tags::store::TagKind;
use crate::tags::TagStore;

/// The root aggregate: PLCs by key, the global tag store, and alarm groups.
pub struct Ensemble {
    pub store: Arc<TagStore>,
    pub alarms: Arc<AlarmRegistry>,
    plcs: DashMap<String, Arc<dyn Driver>>,
}

impl Ensemble {
    pub fn new() -> Self {
        let store = Arc::new(TagStore::new());
        let alarms = Arc::new(AlarmRegistry::new());
        store.attach_alarm_registry(alarms.clone());
        Ensemble {
            store,
            alarms,
            plcs: DashMap::new(),
        }
    }

    pub fn add_plc(&self, plc_key: &str, driver: Arc<dyn Driver>) {
        self.plcs.insert(plc_key.to_string(), driver);
    }

    pub fn get_plc(&self, plc_key: &str) -> Option<Arc<dyn Driver>> {
        self.plcs.get(plc_key).map(|e| e.value().clone())
    }

    pub fn plc_keys(&self) -> Vec<String> {
        self.plcs.iter().map(|e| e.key().clone()).collect()
    }

    /// Runs the two deploy phases from the original: wire every alarm's
    /// subscriptions first, then start every PLC's background poller. Doing
    /// it in this order means no driver can deliver a value before the
    /// alarm graph that depends on it is ready to react.
    pub async fn deploy(&self) {
        self.analyze_alarms();

        for entry in self.plcs.iter() {
            let plc_key = entry.key().clone();
            let driver = entry.value().clone();
            let store = self.store.clone();
            info!(plc = %plc_key, "connecting");
            // `connect()` spawns the scan loop itself and returns once it's
            // running, so this await is short-lived regardless of how long
            // the PLC stays connected.
            driver.connect(store).await;
        }
    }

    /// Analyzes every alarm's expression, wiring its subscriptions. A
    /// circular reference is detected with a DFS over raw tokens before
    /// `analyze()` runs, and the offending alarm is skipped with a logged
    /// `BadExpression` rather than recursing without bound.
    pub fn analyze_alarms(&self) {
        for group_key in self.alarms.keys() {
            let Some(group) = self.alarms.get(&group_key) else { continue };
            for alarm_key in group.alarm_keys() {
                if has_cycle(&self.store, &alarm_key) {
                    error!(alarm = %alarm_key, "circular expression reference, skipping analyze");
                    continue;
                }
                if let Err(e) = expression::analyze(&self.store, &alarm_key) {
                    error!(alarm = %alarm_key, error = %e, "failed to analyze alarm");
                }
            }
        }
    }

    /// Imports tags from a CSV with header row and rows
    /// `(tag_key, plc_key, memory_key, address, description)`, creating
    /// each tag in the target driver's memory under `prefix+tag_key` and
    /// registering it in the global tag index under `tag_key`.
    pub fn import_tags(&self, filename: &str, cfg: &TagImportConfig) -> EngineResult<usize> {
        let mut reader = ReaderBuilder::new()
            .delimiter(cfg.delimiter as u8)
            .quote(cfg.quotechar as u8)
            .has_headers(true)
            .from_path(filename)
            .map_err(|e| EngineError::Config(format!("opening {filename}: {e}")))?;

        let mut count = 0;
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(file = %filename, error = %e, "skipping malformed tag row");
                    continue;
                }
            };
            if record.len() < 5 {
                warn!(file = %filename, "skipping short tag row");
                continue;
            }
            let tag_key = record[0].to_string();
            let plc_key = record[1].to_string();
            let memory_key = record[2].to_string();
            let address = record[3].to_string();
            let description = record[4].to_string();
            let full_key = format!("{}{}", cfg.prefix, tag_key);

            let Some(driver) = self.get_plc(&plc_key) else {
                warn!(plc = %plc_key, tag = %full_key, "unknown PLC, skipping tag import");
                continue;
            };

            if let Err(e) = self.register_tag_on_driver(&driver, &memory_key, &address, &full_key, &description) {
                warn!(tag = %full_key, memory = %memory_key, plc = %plc_key, error = %e, "error importing tag");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    fn register_tag_on_driver(
        &self,
        driver: &Arc<dyn Driver>,
        memory_key: &str,
        address: &str,
        tag_key: &str,
        description: &str,
    ) -> EngineResult<()> {
        if let Some(modbus) = driver.as_any().downcast_ref::<ModbusDriver>() {
            let space = match memory_key {
                "coil" => modbus_driver::Space::Coil,
                "input" => modbus_driver::Space::Input,
                "holding" => modbus_driver::Space::Holding,
                "register" => modbus_driver::Space::Register,
                other => return Err(EngineError::Config(format!("unknown modbus memory '{other}'"))),
            };
            let addr: u16 = address
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid modbus address '{address}'")))?;
            let writable = matches!(space, modbus_driver::Space::Coil | modbus_driver::Space::Holding);
            self.store.create(
                tag_key,
                description,
                Some(address.to_string()),
                Some(driver.key().to_string()),
                Some(memory_key.to_string()),
                writable,
            );
            modbus.register_tag(space, addr, tag_key);
            Ok(())
        } else if let Some(opcua) = driver.as_any().downcast_ref::<OpcUaDriver>() {
            self.store.create(
                tag_key,
                description,
                Some(address.to_string()),
                Some(driver.key().to_string()),
                None,
                true,
            );
            opcua.register_tag(address, tag_key);
            Ok(())
        } else if let Some(db) = driver.as_any().downcast_ref::<DatabaseDriver>() {
            self.store.create(
                tag_key,
                description,
                Some(address.to_string()),
                Some(driver.key().to_string()),
                Some(memory_key.to_string()),
                true,
            );
            db.register_tag(memory_key, address, tag_key);
            Ok(())
        } else {
            Err(EngineError::Config("unrecognized driver implementation".to_string()))
        }
    }

    /// Imports alarms from a CSV with header row and rows
    /// `(alarm_key, definition, description)`, creating the named
    /// AlarmGroup if missing.
    pub fn import_alarms(&self, filename: &str, cfg: &AlarmImportConfig) -> EngineResult<usize> {
        let group = self.alarms.get_or_create(&cfg.alarmgroup);

        let mut reader = ReaderBuilder::new()
            .delimiter(cfg.delimiter as u8)
            .quote(cfg.quotechar as u8)
            .has_headers(true)
            .from_path(filename)
            .map_err(|e| EngineError::Config(format!("opening {filename}: {e}")))?;

        let mut count = 0;
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(file = %filename, error = %e, "skipping malformed alarm row");
                    continue;
                }
            };
            if record.len() < 3 {
                warn!(file = %filename, "skipping short alarm row");
                continue;
            }
            let alarm_key = record[0].to_string();
            let definition = record[1].to_string();
            let description = record[2].to_string();

            let tokens = tokenize(&definition);
            let entry = self
                .store
                .create_expression(&alarm_key, &description, &definition, tokens, true);
            if let TagKind::Expression(state) = &entry.kind {
                if let Some(alarm) = &state.alarm {
                    alarm.write().groups.push(cfg.alarmgroup.clone());
                }
            }
            group.add_alarm(&alarm_key);
            count += 1;
        }
        Ok(count)
    }
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new()
    }
}

/// Detects whether `root`'s expression transitively references itself
/// through other expressions' raw identifier tokens, walked before any
/// subscription is wired (so an unresolved cycle never reaches
/// `expression::analyze`, which would otherwise recurse without bound
/// when it tries to re-evaluate one of its own inputs).
fn has_cycle(store: &TagStore, root: &str) -> bool {
    let mut visiting = HashSet::new();
    visiting.insert(root.to_string());
    visit(store, root, root, &mut visiting)
}

fn visit(store: &TagStore, key: &str, root: &str, visiting: &mut HashSet<String>) -> bool {
    let Some(entry) = store.get(key) else { return false };
    let TagKind::Expression(state) = &entry.kind else {
        return false;
    };
    for token in &state.tokens {
        if !is_identifier(token) {
            continue;
        }
        if token == root {
            return true;
        }
        if visiting.contains(token) {
            continue;
        }
        visiting.insert(token.clone());
        if visit(store, token, root, visiting) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_direct_self_reference() {
        let store = TagStore::new();
        let tokens = tokenize("a + 1");
        store.create_expression("a", "", "a + 1", tokens, false);
        assert!(has_cycle(&store, "a"));
    }

    #[test]
    fn detects_indirect_cycle() {
        let store = TagStore::new();
        store.create_expression("a", "", "b + 1", tokenize("b + 1"), false);
        store.create_expression("b", "", "a + 1", tokenize("a + 1"), false);
        assert!(has_cycle(&store, "a"));
    }

    #[test]
    fn no_false_positive_on_diamond_dependency() {
        let store = TagStore::new();
        store.create("x", "", None, None, None, false);
        store.create_expression("a", "", "x + 1", tokenize("x + 1"), false);
        store.create_expression("b", "", "x + 2", tokenize("x + 2"), false);
        store.create_expression("c", "", "a + b", tokenize("a + b"), false);
        assert!(!has_cycle(&store, "c"));
    }
}
