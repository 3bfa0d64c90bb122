//! Pooled backend client factory.
//!
//! Devices share a fixed number of upstream connections. A device is pinned
//! to a slot by hashing its id, so all of its messages travel over the same
//! connection in order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::auth::DeviceIdentity;
use crate::bridge::{BackendClient, BackendClientFactory, BackendMessage};
use crate::config::BackendConfig;
use crate::error::BackendError;

use super::upstream::UpstreamConnection;

/// Wire envelope written to the backend, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    device_id: &'a str,
    address: &'a str,
    properties: &'a std::collections::BTreeMap<String, String>,
    /// Base64 of the raw payload bytes.
    payload: String,
}

/// Backend client factory over a shared connection pool.
#[derive(Debug)]
pub struct PooledClientFactory {
    endpoint: String,
    pool_size: usize,
    slots: DashMap<usize, Arc<UpstreamConnection>>,
    connect_timeout: Duration,
    send_timeout: Duration,
    idle_timeout: Duration,
}

impl PooledClientFactory {
    /// Create a factory for `endpoint` using the pool settings in `config`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, config: &BackendConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool_size: config.connection_pool_size.max(1),
            slots: DashMap::new(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            idle_timeout: Duration::from_secs(config.connection_idle_timeout_secs),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of slots with a connection object created.
    #[must_use]
    pub fn open_slots(&self) -> usize {
        self.slots.len()
    }

    /// Slot a device is pinned to.
    #[must_use]
    pub fn slot_for(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        // Modulo in u64 first so the result always fits the pool size.
        (hasher.finish() % self.pool_size as u64) as usize
    }

    fn connection_for(&self, device_id: &str) -> Arc<UpstreamConnection> {
        let slot = self.slot_for(device_id);
        let entry = self.slots.entry(slot).or_insert_with(|| {
            Arc::new(UpstreamConnection::new(
                self.endpoint.clone(),
                slot,
                self.connect_timeout,
                self.send_timeout,
                self.idle_timeout,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Close every pooled connection.
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        for connection in connections {
            connection.disconnect().await;
        }
        self.slots.clear();
        info!(endpoint = %self.endpoint, "Backend pool disconnected");
    }
}

#[async_trait]
impl BackendClientFactory for PooledClientFactory {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn BackendClient>, BackendError> {
        let connection = self.connection_for(&identity.id);
        connection.ensure_connected().await?;
        debug!(device_id = %identity.id, slot = connection.slot(), "Backend client opened");

        Ok(Arc::new(PooledClient {
            device_id: identity.id.clone(),
            connection,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client for one device over a shared pooled connection.
#[derive(Debug)]
pub struct PooledClient {
    device_id: String,
    connection: Arc<UpstreamConnection>,
    closed: AtomicBool,
}

impl PooledClient {
    fn encode(&self, message: &BackendMessage) -> Result<Vec<u8>, BackendError> {
        let envelope = Envelope {
            device_id: &self.device_id,
            address: &message.address,
            properties: &message.properties,
            payload: BASE64.encode(message.payload.bytes()),
        };
        let mut frame = serde_json::to_vec(&envelope)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

#[async_trait]
impl BackendClient for PooledClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send(&self, message: BackendMessage) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            message.payload.release();
            return Err(BackendError::Closed {
                device_id: self.device_id.clone(),
            });
        }

        let frame = self.encode(&message);
        message.payload.release();
        self.connection.send_frame(&frame?).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        // The pooled connection is shared; only this client is retired.
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(device_id = %self.device_id, "Backend client closed");
        }
        Ok(())
    }
}
