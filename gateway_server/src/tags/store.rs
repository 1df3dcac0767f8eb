use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::tags::alarm::{AlarmMeta, AlarmRegistry};
use crate::tags::structures::TagValue;

/// How a value reaching a tag propagates further: either it causes another
/// tag (an expression or alarm that references it) to re-evaluate, or it is
/// pushed straight to a sink such as a websocket connection.
pub enum Subscription {
    Reevaluate(String),
    Sink(Arc<dyn TagSink>),
}

fn clone_subscription(sub: &Subscription) -> Subscription {
    match sub {
        Subscription::Reevaluate(key) => Subscription::Reevaluate(key.clone()),
        Subscription::Sink(sink) => Subscription::Sink(sink.clone()),
    }
}

#[async_trait]
pub trait TagSink: Send + Sync {
    async fn notify(&self, key: &str, value: &TagValue);
}

/// Distinguishes a driver-backed tag from a derived one. An alarm is an
/// expression whose `alarm` slot is populated.
pub enum TagKind {
    Direct,
    Expression(ExprState),
}

pub struct ExprState {
    pub definition: String,
    pub tokens: Vec<String>,
    pub usedtags: RwLock<Vec<String>>,
    pub alarm: Option<RwLock<AlarmMeta>>,
}

pub struct TagEntry {
    pub key: String,
    pub description: RwLock<String>,
    pub address: Option<String>,
    pub plc_key: Option<String>,
    pub memory_key: Option<String>,
    pub writable: bool,
    pub value: RwLock<TagValue>,
    pub kind: TagKind,
    pub subscribers: RwLock<Vec<Subscription>>,
}

impl TagEntry {
    pub fn is_alarm(&self) -> bool {
        matches!(&self.kind, TagKind::Expression(e) if e.alarm.is_some())
    }
}

/// Flat arena of every tag in the Ensemble, keyed by its globally-unique
/// string key. Direct tags are driver-backed; Expression tags (including
/// Alarms) are derived and re-evaluate when a referenced tag changes.
pub struct TagStore {
    tags: DashMap<String, Arc<TagEntry>>,
    alarms: RwLock<Option<Arc<AlarmRegistry>>>,
}

impl TagStore {
    pub fn new() -> Self {
        TagStore {
            tags: DashMap::new(),
            alarms: RwLock::new(None),
        }
    }

    /// Wired in after construction, once the Ensemble has built its
    /// AlarmRegistry — mirrors the two-phase deploy() wiring of alarms
    /// before any driver connects.
    pub fn attach_alarm_registry(&self, registry: Arc<AlarmRegistry>) {
        *self.alarms.write() = Some(registry);
    }

    pub fn create(
        &self,
        key: &str,
        description: &str,
        address: Option<String>,
        plc_key: Option<String>,
        memory_key: Option<String>,
        writable: bool,
    ) -> Arc<TagEntry> {
        let entry = Arc::new(TagEntry {
            key: key.to_string(),
            description: RwLock::new(description.to_string()),
            address,
            plc_key,
            memory_key,
            writable,
            value: RwLock::new(TagValue::Null),
            kind: TagKind::Direct,
            subscribers: RwLock::new(Vec::new()),
        });
        self.tags.insert(key.to_string(), entry.clone());
        entry
    }

    pub fn create_expression(
        &self,
        key: &str,
        description: &str,
        definition: &str,
        tokens: Vec<String>,
        is_alarm: bool,
    ) -> Arc<TagEntry> {
        let alarm = is_alarm.then(|| RwLock::new(AlarmMeta::default()));
        let entry = Arc::new(TagEntry {
            key: key.to_string(),
            description: RwLock::new(description.to_string()),
            address: None,
            plc_key: None,
            memory_key: None,
            writable: false,
            value: RwLock::new(TagValue::Null),
            kind: TagKind::Expression(ExprState {
                definition: definition.to_string(),
                tokens,
                usedtags: RwLock::new(Vec::new()),
                alarm,
            }),
            subscribers: RwLock::new(Vec::new()),
        });
        self.tags.insert(key.to_string(), entry.clone());
        entry
    }

    pub fn get(&self, key: &str) -> Option<Arc<TagEntry>> {
        self.tags.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.tags.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn subscribe(&self, key: &str, sub: Subscription) -> EngineResult<()> {
        let entry = self
            .get(key)
            .ok_or_else(|| EngineError::UnknownTag(key.to_string()))?;
        entry.subscribers.write().push(sub);
        Ok(())
    }

    /// Writes a new value and, on inequality, notifies subscribers in
    /// registration order. Expression/alarm subscribers are reevaluated
    /// breadth-first from a work queue rather than recursively, so a long
    /// dependency chain does not grow the call stack.
    pub async fn update(&self, key: &str, new_value: TagValue) -> EngineResult<()> {
        let mut queue = VecDeque::new();
        queue.push_back((key.to_string(), new_value));

        while let Some((k, v)) = queue.pop_front() {
            let entry = match self.get(&k) {
                Some(e) => e,
                None => continue,
            };

            let changed = {
                let mut slot = entry.value.write();
                if *slot == v {
                    false
                } else {
                    *slot = v.clone();
                    true
                }
            };
            if !changed {
                continue;
            }

            if let TagKind::Expression(state) = &entry.kind {
                if let Some(alarm_lock) = &state.alarm {
                    self.dispatch_alarm_edge(&k, alarm_lock, &v).await;
                }
            }

            let subs: Vec<_> = entry
                .subscribers
                .read()
                .iter()
                .map(clone_subscription)
                .collect();
            for sub in subs {
                match sub {
                    Subscription::Reevaluate(other) => {
                        if let Ok(next) = crate::tags::expression::evaluate(self, &other) {
                            queue.push_back((other, next));
                        }
                    }
                    Subscription::Sink(sink) => sink.notify(&k, &v).await,
                }
            }
        }
        Ok(())
    }

    /// Calls into a driver's write path via the caller; the store itself
    /// only knows how to record the post-write value. Drivers call
    /// `update` directly once their write has been confirmed.
    async fn dispatch_alarm_edge(
        &self,
        key: &str,
        alarm_lock: &RwLock<AlarmMeta>,
        new_value: &TagValue,
    ) {
        let (old_truthy, groups) = {
            let meta = alarm_lock.read();
            (meta.previous.is_truthy(), meta.groups.clone())
        };
        let new_truthy = new_value.is_truthy();
        {
            let mut meta = alarm_lock.write();
            meta.previous = new_value.clone();
        }
        if old_truthy == new_truthy {
            return;
        }

        let registry = self.alarms.read().clone();
        if let Some(registry) = registry {
            let ts = Utc::now();
            registry.dispatch(self, key, &groups, ts, new_truthy).await;
        }
    }
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}
