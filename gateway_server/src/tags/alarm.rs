use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::outputs::{Output, OutputInfo};
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

/// Per-alarm edge-detection state: the last value observed (its truthiness
/// is the sign of the next transition) and the groups it belongs to.
#[derive(Default)]
pub struct AlarmMeta {
    pub previous: TagValue,
    pub groups: Vec<String>,
}

/// A named set of alarms sharing output sinks. Membership is append-only
/// at load time, with one runtime exception: a websocket subscription may
/// add an output while edges are being dispatched, so both lists are
/// guarded by their own lock rather than the group as a whole.
pub struct AlarmGroup {
    pub key: String,
    alarms: RwLock<Vec<String>>,
    outputs: RwLock<Vec<Arc<dyn Output>>>,
}

impl AlarmGroup {
    pub fn new(key: &str) -> Self {
        AlarmGroup {
            key: key.to_string(),
            alarms: RwLock::new(Vec::new()),
            outputs: RwLock::new(Vec::new()),
        }
    }

    pub fn add_alarm(&self, alarm_key: &str) {
        self.alarms.write().push(alarm_key.to_string());
    }

    pub fn add_output(&self, output: Arc<dyn Output>) {
        self.outputs.write().push(output);
    }

    pub fn alarm_keys(&self) -> Vec<String> {
        self.alarms.read().clone()
    }
}

/// Owns every AlarmGroup by key and fans an alarm edge out to each group's
/// outputs.
pub struct AlarmRegistry {
    groups: DashMap<String, Arc<AlarmGroup>>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        AlarmRegistry {
            groups: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<AlarmGroup> {
        self.groups
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AlarmGroup::new(key)))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<AlarmGroup>> {
        self.groups.get(key).map(|g| g.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }

    /// Active alarms (those whose most recent value was truthy) within a
    /// group, for the websocket gateway's subscribe response.
    pub fn active_alarms(&self, group_key: &str, store: &TagStore) -> Vec<(String, TagValue)> {
        let Some(group) = self.get(group_key) else {
            return Vec::new();
        };
        group
            .alarm_keys()
            .into_iter()
            .filter_map(|alarm_key| {
                let entry = store.get(&alarm_key)?;
                let value = entry.value.read().clone();
                value.is_truthy().then_some((alarm_key, value))
            })
            .collect()
    }

    pub async fn dispatch(
        &self,
        store: &TagStore,
        alarm_key: &str,
        group_keys: &[String],
        ts: DateTime<Utc>,
        state: bool,
    ) {
        let value = TagValue::Bool(state);
        for group_key in group_keys {
            let Some(group) = self.get(group_key) else {
                continue;
            };
            let outputs = group.outputs.read().clone();
            let info = OutputInfo {
                alarmgroup: Some(group_key.clone()),
            };
            for output in outputs {
                output.write(store, alarm_key, ts, &value, &info).await;
            }
        }
    }
}

impl Default for AlarmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
