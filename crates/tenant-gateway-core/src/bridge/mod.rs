//! Messaging bridge between an authenticated device and its backend client.
//!
//! A bridge is created once per authenticated connection and owns exactly one
//! [`BackendClient`]. The only destination it serves is [`EVENTS_DESTINATION`].

pub mod address;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::DeviceIdentity;
use crate::error::{BackendError, GatewayError};
use crate::packet::PayloadBuffer;

pub use address::{AddressTemplate, AddressTemplates};

/// Destination name device-to-cloud messages are sent to.
pub const EVENTS_DESTINATION: &str = "Events";

/// Outbound message built by a [`BackendClient`].
#[derive(Debug)]
pub struct BackendMessage {
    /// Resolved outbound address; may be empty.
    pub address: String,
    pub payload: PayloadBuffer,
    /// Application properties stamped by the adapter.
    pub properties: BTreeMap<String, String>,
}

impl BackendMessage {
    #[must_use]
    pub fn new(address: impl Into<String>, payload: PayloadBuffer) -> Self {
        Self {
            address: address.into(),
            payload,
            properties: BTreeMap::new(),
        }
    }

    /// Set an application property, replacing any previous value.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

/// A backend client bound to one device.
#[async_trait]
pub trait BackendClient: Send + Sync + fmt::Debug {
    /// Device this client sends for.
    fn device_id(&self) -> &str;

    /// Wrap a payload for sending. Ownership of the payload moves into the message.
    fn create_message(&self, address: &str, payload: PayloadBuffer) -> BackendMessage {
        BackendMessage::new(address, payload)
    }

    /// Send a message. The payload is released whether or not the send succeeds.
    async fn send(&self, message: BackendMessage) -> Result<(), BackendError>;

    /// Close the client. Idempotent.
    async fn close(&self) -> Result<(), BackendError>;
}

/// Creates backend clients for authenticated devices.
#[async_trait]
pub trait BackendClientFactory: Send + Sync + fmt::Debug {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn BackendClient>, BackendError>;
}

/// Destination lookup for one connection.
#[async_trait]
pub trait MessagingBridge: Send + Sync + fmt::Debug {
    /// Client serving `destination`, if any.
    fn try_resolve_client(&self, destination: &str) -> Option<Arc<dyn BackendClient>>;

    /// Close the owned client. Safe to call more than once.
    async fn dispose(&self, cause: Option<&GatewayError>);
}

/// Creates the bridge for a newly authenticated connection.
#[async_trait]
pub trait BridgeFactory: Send + Sync + fmt::Debug {
    async fn create_bridge(
        &self,
        tenant_id: &str,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn MessagingBridge>, GatewayError>;
}

/// Bridge wrapping a single client that serves only [`EVENTS_DESTINATION`].
#[derive(Debug)]
pub struct SingleClientBridge {
    client: Arc<dyn BackendClient>,
    disposed: AtomicBool,
}

impl SingleClientBridge {
    #[must_use]
    pub fn new(client: Arc<dyn BackendClient>) -> Self {
        Self {
            client,
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessagingBridge for SingleClientBridge {
    fn try_resolve_client(&self, destination: &str) -> Option<Arc<dyn BackendClient>> {
        (destination == EVENTS_DESTINATION).then(|| Arc::clone(&self.client))
    }

    async fn dispose(&self, cause: Option<&GatewayError>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        match cause {
            Some(cause) => debug!(
                device_id = %self.client.device_id(),
                code = %cause.code(),
                tracking_id = %cause.tracking_id(),
                "Disposing bridge after error"
            ),
            None => debug!(device_id = %self.client.device_id(), "Disposing bridge"),
        }
        if let Err(e) = self.client.close().await {
            warn!(device_id = %self.client.device_id(), error = %e, "Failed to close backend client");
        }
    }
}

/// Bridge factory that picks a backend client factory by tenant id.
#[derive(Debug)]
pub struct TenantRoutedBridgeFactory {
    default: Arc<dyn BackendClientFactory>,
    per_tenant: HashMap<String, Arc<dyn BackendClientFactory>>,
}

impl TenantRoutedBridgeFactory {
    #[must_use]
    pub fn new(default: Arc<dyn BackendClientFactory>) -> Self {
        Self {
            default,
            per_tenant: HashMap::new(),
        }
    }

    /// Route a tenant to its own client factory.
    #[must_use]
    pub fn with_tenant(
        mut self,
        tenant_id: impl Into<String>,
        factory: Arc<dyn BackendClientFactory>,
    ) -> Self {
        self.per_tenant.insert(tenant_id.into(), factory);
        self
    }

    fn factory_for(&self, tenant_id: &str) -> &Arc<dyn BackendClientFactory> {
        self.per_tenant.get(tenant_id).unwrap_or(&self.default)
    }
}

#[async_trait]
impl BridgeFactory for TenantRoutedBridgeFactory {
    async fn create_bridge(
        &self,
        tenant_id: &str,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn MessagingBridge>, GatewayError> {
        let client = self.factory_for(tenant_id).connect(identity).await?;
        Ok(Box::new(SingleClientBridge::new(client)))
    }
}
