use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

/// Uniform connect/read/write/poll lifecycle every PLC driver exposes
/// (Modbus, OPC-UA, database). The Ensemble holds drivers as
/// `Arc<dyn Driver>` and drives them identically; `tasks::spawn_scan_loop`
/// is the shared scan-loop algorithm built on `try_connect`/`read`/
/// `is_connected` below.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The PLC key this driver was registered under in the Ensemble.
    fn key(&self) -> &str;

    /// Interval between scan cycles while connected.
    fn polling_time(&self) -> Duration;

    fn is_connected(&self) -> bool;

    /// Begins background polling. Idempotent: a second call while a scan
    /// loop is already running for this driver is a no-op.
    async fn connect(self: Arc<Self>, store: Arc<TagStore>);

    /// Clears the connected flag and releases the transport. The scan
    /// loop observes this at its next iteration and exits.
    async fn disconnect(&self);

    /// Opens (or re-opens) the transport. Called by the scan loop when
    /// not connected; on success the driver marks itself connected.
    async fn try_connect(&self) -> EngineResult<()>;

    /// One full scan cycle. A failure marks the driver disconnected so
    /// the scan loop enters its reconnect branch on the next iteration.
    async fn read(&self, store: &TagStore) -> EngineResult<()>;

    /// Pushes `value` to the controller for `tag_key`, then calls
    /// `store.update` on success. Drivers reject unsupported
    /// combinations (`ReadOnly`, `UnsupportedType`) without touching the
    /// transport.
    async fn write(&self, store: &TagStore, tag_key: &str, value: TagValue) -> EngineResult<()>;

    /// Enables downcasting to a concrete driver for operations outside
    /// the shared contract (DB `get_data`/`set_row`, OPC-UA `browse_tree`).
    fn as_any(&self) -> &dyn Any;
}

/// Reconnect backoff shared by drivers that need more than a fixed retry
/// delay. The Modbus driver's flat `retries` knob and the OPC-UA driver's
/// `connect_retry_*` fields both resolve to one of these.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.min(8) as i32);
        Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff: 2.0,
        }
    }
}
