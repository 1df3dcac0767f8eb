//! OPC-UA push driver (C6): rather than polling, the server pushes data
//! change notifications over a subscription and the driver only has to
//! relay them into the tag store.
//!
//! Grounded on `OPCPLCModule.py`: `objects.get_child(address)` resolves a
//! backslash-separated browse path under the Objects node, node values are
//! pushed through a single subscription shared by every tag
//! (`tagbynodeid` routes notifications back to the originating tag), and
//! `print_tree()` walks the address space for diagnostics. `opctype`'s
//! 1-13 numeric type table becomes `coerce_variant` below for writes.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opcua::client::prelude::*;
use parking_lot::RwLock as PLRwLock;
use tokio::sync::mpsc;
use tracing::error;

use crate::drivers::traits::Driver;
use crate::error::{EngineError, EngineResult};
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

struct Notification {
    tag_key: String,
    value: TagValue,
}

pub struct OpcUaDriver {
    key: String,
    endpoint_url: String,
    publishing_interval_ms: f64,
    polling_time: Duration,
    session: PLRwLock<Option<Arc<tokio::sync::RwLock<Session>>>>,
    connected: AtomicBool,
    /// browse path ("2:Data\2:Static\2:Variable") -> tag key, resolved at
    /// connect time into `tagbynodeid`.
    tag_address: DashMap<String, String>,
    tagbynodeid: Arc<DashMap<String, String>>,
    /// tag key -> resolved numeric OPC type (1-13), needed to build a
    /// correctly-typed `Variant` on write.
    tag_type: Arc<DashMap<String, u32>>,
    tag_nodeid: DashMap<String, NodeId>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: PLRwLock<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl OpcUaDriver {
    pub fn new(key: impl Into<String>, endpoint_url: impl Into<String>, publishing_interval_ms: f64, polling_time: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        OpcUaDriver {
            key: key.into(),
            endpoint_url: endpoint_url.into(),
            publishing_interval_ms,
            polling_time,
            session: PLRwLock::new(None),
            connected: AtomicBool::new(false),
            tag_address: DashMap::new(),
            tagbynodeid: Arc::new(DashMap::new()),
            tag_type: Arc::new(DashMap::new()),
            tag_nodeid: DashMap::new(),
            notify_tx: tx,
            notify_rx: PLRwLock::new(Some(rx)),
        }
    }

    /// Registers a tag's browse path, e.g. `2:Data\2:Static\2:Variable`.
    /// Resolution against the live address space happens in `try_connect`.
    pub fn register_tag(&self, address: &str, tag_key: &str) {
        self.tag_address.insert(address.to_string(), tag_key.to_string());
    }

    fn parse_segment(segment: &str) -> EngineResult<(u16, &str)> {
        let (ns, name) = segment
            .split_once(':')
            .ok_or_else(|| EngineError::Config(format!("malformed browse segment '{segment}'")))?;
        let ns: u16 = ns
            .parse()
            .map_err(|_| EngineError::Config(format!("malformed namespace in '{segment}'")))?;
        Ok((ns, name))
    }

    async fn resolve_and_subscribe(&self, session: Arc<tokio::sync::RwLock<Session>>) -> EngineResult<()> {
        let mut items_to_create = Vec::new();

        for entry in self.tag_address.iter() {
            let (address, tag_key) = (entry.key().clone(), entry.value().clone());
            let segments: Vec<&str> = address.split('\\').collect();
            let mut relative = Vec::with_capacity(segments.len());
            for segment in &segments {
                let (ns, name) = Self::parse_segment(segment)?;
                relative.push(QualifiedName::new(ns, name));
            }
            let node_id = {
                let session = session.read().await;
                session
                    .translate_browse_paths_to_node_ids(&[BrowsePath {
                        starting_node: ObjectId::ObjectsFolder.into(),
                        relative_path: relative.into(),
                    }])
                    .await
                    .ok()
                    .and_then(|mut results| results.pop())
                    .and_then(|r| r.targets)
                    .and_then(|mut t| t.pop())
                    .map(|t| t.target_id.node_id)
                    .ok_or_else(|| EngineError::Config(format!("could not resolve OPC-UA path '{address}'")))?
            };

            self.tagbynodeid.insert(node_id.to_string(), tag_key.clone());
            self.tag_nodeid.insert(tag_key.clone(), node_id.clone());
            items_to_create.push(MonitoredItemCreateRequest::new(
                node_id.into(),
                AttributeId::Value,
                MonitoringMode::Reporting,
            ));
        }

        if items_to_create.is_empty() {
            return Ok(());
        }

        let tx = self.notify_tx.clone();
        let tagbynodeid = self.tagbynodeid.clone();
        let subscription_id = {
            let mut session = session.write().await;
            session
                .create_subscription(
                    Duration::from_millis(self.publishing_interval_ms as u64),
                    10,
                    30,
                    0,
                    0,
                    true,
                    DataChangeCallback::new(move |items: &[MonitoredItem]| {
                        for item in items {
                            let Some(value) = item.value().value.clone() else { continue };
                            let node_key = item.item_to_monitor().node_id.to_string();
                            let Some(tag_key) = tagbynodeid.get(&node_key).map(|e| e.clone()) else {
                                continue;
                            };
                            let tag_value = variant_to_tag_value(&value);
                            let _ = tx.send(Notification { tag_key, value: tag_value });
                        }
                    }),
                )
                .await
                .map_err(|e| EngineError::Transport(format!("{e:?}")))?
        };

        let mut session = session.write().await;
        session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, items_to_create)
            .await
            .map_err(|e| EngineError::Transport(format!("{e:?}")))?;

        Ok(())
    }

    /// Diagnostic tree walk, kept reachable through the REST surface
    /// (`print_tree()` in the original).
    pub async fn browse_tree(&self) -> EngineResult<Vec<String>> {
        let session = self
            .session
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("opc-ua session not open".to_string()))?;
        let mut lines = Vec::new();
        let session = session.read().await;
        Self::walk(&session, ObjectId::ObjectsFolder.into(), 0, &mut lines).await;
        Ok(lines)
    }

    #[async_recursion::async_recursion]
    async fn walk(session: &Session, node: NodeId, level: usize, lines: &mut Vec<String>) {
        let Ok(refs) = session
            .browse(&[BrowseDescription {
                node_id: node,
                browse_direction: BrowseDirection::Forward,
                reference_type_id: ReferenceTypeId::Organizes.into(),
                include_subtypes: true,
                node_class_mask: 0,
                result_mask: BrowseDescriptionResultMask::all(),
            }])
            .await
        else {
            return;
        };
        for result in refs.into_iter().flatten() {
            for reference in result.references.into_iter().flatten() {
                lines.push(format!("{}{}", "  ".repeat(level), reference.browse_name.name));
                Self::walk(session, reference.node_id.node_id.clone(), level + 1, lines).await;
            }
        }
    }
}

fn variant_to_tag_value(variant: &Variant) -> TagValue {
    match variant {
        Variant::Boolean(b) => TagValue::Bool(*b),
        Variant::SByte(i) => TagValue::Int(*i as i64),
        Variant::Byte(u) => TagValue::Int(*u as i64),
        Variant::Int16(i) => TagValue::Int(*i as i64),
        Variant::UInt16(u) => TagValue::Int(*u as i64),
        Variant::Int32(i) => TagValue::Int(*i as i64),
        Variant::UInt32(u) => TagValue::Int(*u as i64),
        Variant::Int64(i) => TagValue::Int(*i),
        Variant::UInt64(u) => TagValue::Int(*u as i64),
        Variant::Float(f) => TagValue::Float(*f as f64),
        Variant::Double(d) => TagValue::Float(*d),
        Variant::String(s) => TagValue::Str(s.to_string()),
        _ => TagValue::Null,
    }
}

fn tag_value_to_variant(opc_type: u32, value: &TagValue) -> EngineResult<Variant> {
    Ok(match opc_type {
        1 => Variant::Boolean(value.is_truthy()),
        2..=9 => match value {
            TagValue::Int(i) => Variant::Int64(*i),
            TagValue::Float(f) => Variant::Int64(*f as i64),
            _ => return Err(EngineError::UnsupportedType(format!("{value:?}"))),
        },
        10 | 11 => match value {
            TagValue::Float(f) => Variant::Double(*f),
            TagValue::Int(i) => Variant::Double(*i as f64),
            _ => return Err(EngineError::UnsupportedType(format!("{value:?}"))),
        },
        12 => Variant::String(value.to_string().into()),
        13 => match value {
            TagValue::Timestamp(ts) => Variant::DateTime(Box::new((*ts).into())),
            _ => return Err(EngineError::UnsupportedType(format!("{value:?}"))),
        },
        other => return Err(EngineError::UnsupportedType(format!("unknown OPC type {other}"))),
    })
}

#[async_trait]
impl Driver for OpcUaDriver {
    fn key(&self) -> &str {
        &self.key
    }

    fn polling_time(&self) -> Duration {
        self.polling_time
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>, store: Arc<TagStore>) {
        let rx = self.notify_rx.write().take();
        let Some(mut rx) = rx else {
            // Already connected once; a second call is a no-op.
            return;
        };
        let store_for_relay = store.clone();
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                if let Err(e) = store_for_relay.update(&n.tag_key, n.value).await {
                    error!(tag = %n.tag_key, error = %e, "failed applying opc-ua data change");
                }
            }
        });
        tokio::spawn(crate::tasks::spawn_scan_loop(self, store));
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.session.write() = None;
    }

    async fn try_connect(&self) -> EngineResult<()> {
        let mut client = ClientBuilder::new()
            .application_name("gateway_server")
            .application_uri("urn:gateway_server")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(3)
            .client()
            .ok_or_else(|| EngineError::Config("invalid opc-ua client configuration".to_string()))?;

        let endpoint: EndpointDescription = (
            self.endpoint_url.as_str(),
            SecurityPolicy::None.to_str(),
            MessageSecurityMode::None,
            UserTokenPolicy::anonymous(),
        )
            .into();

        let (session, event_loop) = client
            .new_session_from_endpoint(endpoint, IdentityToken::Anonymous)
            .await
            .map_err(|e| EngineError::Transport(format!("{e:?}")))?;

        tokio::spawn(event_loop.run());

        self.resolve_and_subscribe(session.clone()).await?;

        *self.session.write() = Some(session);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// No-op: values arrive through the subscription callback, not a scan.
    /// `spawn_scan_loop` still calls this once per polling interval purely
    /// as a connectivity heartbeat.
    async fn read(&self, _store: &TagStore) -> EngineResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("not connected".to_string()));
        }
        Ok(())
    }

    async fn write(&self, store: &TagStore, tag_key: &str, value: TagValue) -> EngineResult<()> {
        let session = self
            .session
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("opc-ua session not open".to_string()))?;
        let node_id = self
            .tag_nodeid
            .get(tag_key)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::UnknownTag(tag_key.to_string()))?;
        let opc_type = self.tag_type.get(tag_key).map(|e| *e).unwrap_or(12);
        let variant = tag_value_to_variant(opc_type, &value)?;

        let write_value = WriteValue {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::value_only(variant),
        };
        let session = session.write().await;
        session
            .write(&[write_value])
            .await
            .map_err(|e| EngineError::Transport(format!("{e:?}")))?;
        drop(session);

        store.update(tag_key, value).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browse_segment() {
        let (ns, name) = OpcUaDriver::parse_segment("2:Static").unwrap();
        assert_eq!(ns, 2);
        assert_eq!(name, "Static");
    }

    #[test]
    fn rejects_malformed_segment() {
        assert!(OpcUaDriver::parse_segment("Static").is_err());
    }
}
