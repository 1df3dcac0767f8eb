//! Modbus TCP driver (C5): coalesced block reads of coil/input/holding/
//! input-register address spans.
//!
//! Grounded on `MBPLCModule.py`: each of the four memory spaces tracks the
//! lowest and highest address registered across its tags (`minindex`/
//! `maxindex`), and `read()` issues exactly one block request per non-empty
//! space, scattering the reply back to the tags at each address present in
//! the span.

use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::drivers::traits::Driver;
use crate::error::{EngineError, EngineResult};
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Coil,
    Input,
    Holding,
    Register,
}

impl Space {
    fn is_bit_space(self) -> bool {
        matches!(self, Space::Coil | Space::Input)
    }

    fn is_writable(self) -> bool {
        matches!(self, Space::Coil | Space::Holding)
    }
}

#[derive(Default)]
struct Span {
    min: Option<u16>,
    max: Option<u16>,
    tagbyaddress: BTreeMap<u16, String>,
}

impl Span {
    fn register(&mut self, address: u16, tag_key: &str) {
        self.min = Some(self.min.map_or(address, |m| m.min(address)));
        self.max = Some(self.max.map_or(address, |m| m.max(address)));
        self.tagbyaddress.insert(address, tag_key.to_string());
    }
}

/// A Modbus TCP PLC. Tags are registered before `connect()` via
/// `register_tag`, the way the original builds its `coil`/`input`/
/// `holding`/`register` memories at Ensemble-construction time.
pub struct ModbusDriver {
    key: String,
    addr: SocketAddr,
    unit: u8,
    retries: u32,
    polling_time: Duration,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    scan_loop_started: AtomicBool,
    coil: RwLock<Span>,
    input: RwLock<Span>,
    holding: RwLock<Span>,
    register: RwLock<Span>,
    tag_location: DashMap<String, (Space, u16)>,
}

impl ModbusDriver {
    pub fn new(key: impl Into<String>, addr: SocketAddr, unit: u8, retries: u32, polling_time: Duration) -> Self {
        ModbusDriver {
            key: key.into(),
            addr,
            unit,
            retries,
            polling_time,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            scan_loop_started: AtomicBool::new(false),
            coil: RwLock::new(Span::default()),
            input: RwLock::new(Span::default()),
            holding: RwLock::new(Span::default()),
            register: RwLock::new(Span::default()),
            tag_location: DashMap::new(),
        }
    }

    pub fn register_tag(&self, space: Space, address: u16, tag_key: &str) {
        match space {
            Space::Coil => self.coil.write().register(address, tag_key),
            Space::Input => self.input.write().register(address, tag_key),
            Space::Holding => self.holding.write().register(address, tag_key),
            Space::Register => self.register.write().register(address, tag_key),
        }
        self.tag_location.insert(tag_key.to_string(), (space, address));
    }

    async fn request_response(&self, request: &[u8]) -> EngineResult<Vec<u8>> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| EngineError::Transport("modbus socket not open".to_string()))?;
        // parking_lot's MutexGuard is not held across .await; re-borrow per
        // call by operating on the raw fd-owning stream synchronously below
        // is not possible with async IO, so this driver serializes requests
        // through a tokio Mutex instead of parking_lot in the hot path.
        drop(guard);
        self.request_response_locked(request).await
    }

    async fn request_response_locked(&self, request: &[u8]) -> EngineResult<Vec<u8>> {
        // Re-acquire for the actual IO; parking_lot::Mutex forbids holding
        // the guard across .await, so the stream is taken out, used, and
        // put back.
        let mut stream = {
            let mut guard = self.stream.lock();
            guard.take()
        }
        .ok_or_else(|| EngineError::Transport("modbus socket not open".to_string()))?;

        let result = async {
            stream
                .write_all(request)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            let mut buf = vec![0u8; 6];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            let len = guess_response_frame_len(&buf, ModbusProto::TcpUdp)
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            if len > 6 {
                let mut rest = vec![0u8; (len - 6) as usize];
                stream
                    .read_exact(&mut rest)
                    .await
                    .map_err(|e| EngineError::Transport(e.to_string()))?;
                buf.extend_from_slice(&rest);
            }
            Ok(buf)
        }
        .await;

        *self.stream.lock() = Some(stream);
        result
    }

    /// Takes `min`/`max` rather than a `&Span` so callers never need to
    /// hold the `Span`'s lock guard across the `.await` inside — the guard
    /// is a `parking_lot::RwLockReadGuard`, which is `!Send` by default and
    /// must not live across a suspension point reached from a spawned task.
    async fn read_bits(&self, space: Space, min: u16, max: u16) -> EngineResult<Vec<(u16, bool)>> {
        let count = max - min + 1;
        let mut mreq = ModbusRequest::new(self.unit, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        match space {
            Space::Coil => mreq
                .generate_get_coils(min, count, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?,
            Space::Input => mreq
                .generate_get_discretes(min, count, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?,
            _ => unreachable!(),
        }
        let response = self.request_response(&request).await?;
        let mut data = Vec::new();
        mreq.parse_bool(&response, &mut data)
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok((min..=max).zip(data).collect())
    }

    async fn read_words(&self, space: Space, min: u16, max: u16) -> EngineResult<Vec<(u16, u16)>> {
        let count = max - min + 1;
        let mut mreq = ModbusRequest::new(self.unit, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        match space {
            Space::Holding => mreq
                .generate_get_holdings(min, count, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?,
            Space::Register => mreq
                .generate_get_inputs(min, count, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?,
            _ => unreachable!(),
        }
        let response = self.request_response(&request).await?;
        let mut data = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok((min..=max).zip(data).collect())
    }
}

#[async_trait]
impl Driver for ModbusDriver {
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
        if self.scan_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(crate::tasks::spawn_scan_loop(self, store));
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.stream.lock() = None;
    }

    async fn try_connect(&self) -> EngineResult<()> {
        let mut last_err = None;
        for attempt in 0..self.retries.max(1) {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    *self.stream.lock() = Some(stream);
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    warn!(plc = %self.key, attempt, error = %e, "modbus connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(EngineError::Transport(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn read(&self, store: &TagStore) -> EngineResult<()> {
        // Each span's lock guard is `parking_lot::RwLockReadGuard`, which is
        // `!Send` without the `send_guard` feature. Clone out min/max/
        // tagbyaddress and drop the guard before the first `.await` below —
        // a guard alive across an await point here would make this future
        // non-Send and break under `tokio::spawn`.
        let (coil_min, coil_max, coil_map) = {
            let span = self.coil.read();
            (span.min, span.max, span.tagbyaddress.clone())
        };
        let (input_min, input_max, input_map) = {
            let span = self.input.read();
            (span.min, span.max, span.tagbyaddress.clone())
        };
        let (holding_min, holding_max, holding_map) = {
            let span = self.holding.read();
            (span.min, span.max, span.tagbyaddress.clone())
        };
        let (register_min, register_max, register_map) = {
            let span = self.register.read();
            (span.min, span.max, span.tagbyaddress.clone())
        };

        let result: EngineResult<()> = async {
            if let (Some(min), Some(max)) = (coil_min, coil_max) {
                for (addr, value) in self.read_bits(Space::Coil, min, max).await? {
                    if let Some(key) = coil_map.get(&addr) {
                        store.update(key, TagValue::Bool(value)).await?;
                    }
                }
            }
            if let (Some(min), Some(max)) = (input_min, input_max) {
                for (addr, value) in self.read_bits(Space::Input, min, max).await? {
                    if let Some(key) = input_map.get(&addr) {
                        store.update(key, TagValue::Bool(value)).await?;
                    }
                }
            }
            if let (Some(min), Some(max)) = (holding_min, holding_max) {
                for (addr, value) in self.read_words(Space::Holding, min, max).await? {
                    if let Some(key) = holding_map.get(&addr) {
                        store.update(key, TagValue::Int(value as i64)).await?;
                    }
                }
            }
            if let (Some(min), Some(max)) = (register_min, register_max) {
                for (addr, value) in self.read_words(Space::Register, min, max).await? {
                    if let Some(key) = register_map.get(&addr) {
                        store.update(key, TagValue::Int(value as i64)).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn write(&self, store: &TagStore, tag_key: &str, value: TagValue) -> EngineResult<()> {
        let (space, address) = *self
            .tag_location
            .get(tag_key)
            .ok_or_else(|| EngineError::UnknownTag(tag_key.to_string()))?;

        if !space.is_writable() {
            return Err(EngineError::ReadOnly(tag_key.to_string()));
        }

        let mut mreq = ModbusRequest::new(self.unit, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        if space.is_bit_space() {
            let b = coerce_bool(&value)?;
            mreq.generate_set_coil(address, b, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?;
        } else {
            let w = coerce_u16(&value)?;
            mreq.generate_set_holding(address, w, &mut request)
                .map_err(|e| EngineError::Transport(e.to_string()))?;
        }
        self.request_response(&request).await?;

        let stored = if space.is_bit_space() {
            TagValue::Bool(coerce_bool(&value)?)
        } else {
            TagValue::Int(coerce_u16(&value)? as i64)
        };
        store.update(tag_key, stored).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn coerce_bool(value: &TagValue) -> EngineResult<bool> {
    match value {
        TagValue::Bool(b) => Ok(*b),
        TagValue::Str(s) => match s.to_uppercase().as_str() {
            "TRUE" | "1" => Ok(true),
            "FALSE" | "0" => Ok(false),
            _ => Err(EngineError::Eval(format!("invalid coil value '{s}'"))),
        },
        TagValue::Int(i) => Ok(*i != 0),
        _ => Err(EngineError::Eval("invalid coil value".to_string())),
    }
}

fn coerce_u16(value: &TagValue) -> EngineResult<u16> {
    match value {
        TagValue::Int(i) => u16::try_from(*i).map_err(|_| EngineError::Eval("holding value out of range".to_string())),
        TagValue::Str(s) => s
            .parse::<u16>()
            .map_err(|_| EngineError::Eval(format!("invalid holding value '{s}'"))),
        TagValue::Float(f) => Ok(*f as u16),
        _ => Err(EngineError::Eval("invalid holding value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_tracks_min_max() {
        let mut span = Span::default();
        span.register(10, "a");
        span.register(5, "b");
        span.register(20, "c");
        assert_eq!(span.min, Some(5));
        assert_eq!(span.max, Some(20));
    }

    #[test]
    fn coerces_string_coil_values() {
        assert_eq!(coerce_bool(&TagValue::Str("true".to_string())).unwrap(), true);
        assert_eq!(coerce_bool(&TagValue::Str("0".to_string())).unwrap(), false);
    }
}
