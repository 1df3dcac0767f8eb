//! Scan-loop spawn helper shared by every driver's `connect()`.
//!
//! Mirrors the `__Polling` loop each Python driver module defined for
//! itself (`MBPLCModule.__Polling`, `DBPLCModule.__Polling`, ...): while
//! connected, read and sleep; otherwise attempt a reconnect and retry.
//! Generalizing it here means a driver only has to implement
//! `try_connect`/`read`/`is_connected`.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::drivers::traits::Driver;
use crate::tags::store::TagStore;

/// Runs until `driver.disconnect()` is called from elsewhere and the
/// current cycle finishes; there is no external cancellation handle
/// beyond that, matching the spec's "no per-operation timeouts defined
/// by the core" stance.
pub async fn spawn_scan_loop(driver: Arc<dyn Driver>, store: Arc<TagStore>) {
    loop {
        if driver.is_connected() {
            if let Err(e) = driver.read(&store).await {
                error!(plc = driver.key(), error = %e, "scan cycle failed");
            }
            tokio::time::sleep(driver.polling_time()).await;
        } else {
            info!(plc = driver.key(), "attempting (re)connect");
            match driver.try_connect().await {
                Ok(()) => {
                    info!(plc = driver.key(), "connected");
                }
                Err(e) => {
                    warn!(plc = driver.key(), error = %e, "connect failed, will retry");
                }
            }
            tokio::time::sleep(driver.polling_time()).await;
        }
        debug!(plc = driver.key(), connected = driver.is_connected(), "scan tick");
    }
}
