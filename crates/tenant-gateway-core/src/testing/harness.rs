//! Test harness for end-to-end testing of the gateway.
//!
//! Provides a running gateway with:
//! - A device listener bound to an ephemeral port (plain TCP, optionally TLS)
//! - A [`RecordingBackend`] capturing everything relayed
//! - The shared buffer ledger and metrics, for leak and counter checks

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bridge::TenantRoutedBridgeFactory;
use crate::codec::TextLayout;
use crate::config::{
    DeviceConfig, GatewayConfig, TenantConfig, TenantDevicesConfig, TenantFormat,
    TlsListenerConfig,
};
use crate::metrics::GatewayMetrics;
use crate::network::{GatewayListener, GatewayServices};
use crate::packet::BufferLedger;
use crate::tls::TlsServerAcceptor;

use super::backend::RecordingBackend;

/// A running gateway wired to a recording backend.
pub struct GatewayTestHarness {
    /// Everything the gateway relayed.
    pub backend: RecordingBackend,
    pub metrics: Arc<GatewayMetrics>,
    pub config: GatewayConfig,
    ledger: BufferLedger,
    address: String,
    shutdown_tx: broadcast::Sender<()>,
    listener: Arc<GatewayListener>,
    task: Option<JoinHandle<()>>,
}

impl GatewayTestHarness {
    /// Start a gateway with one self-identifying device, `T1/dev42`.
    ///
    /// # Panics
    ///
    /// Panics if the gateway cannot be started.
    pub async fn new() -> Self {
        TestHarnessBuilder::new()
            .device("T1", "dev42", "hub.example.net", "sig")
            .build()
            .await
    }

    /// Start a gateway for `config` on an ephemeral port.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid or the listener cannot bind.
    pub async fn with_config(config: GatewayConfig) -> Self {
        Self::start(config, None).await
    }

    async fn start(mut config: GatewayConfig, tls: Option<TlsListenerConfig>) -> Self {
        let backend = RecordingBackend::new();
        let metrics = Arc::new(GatewayMetrics::new());
        let bridges = Arc::new(TenantRoutedBridgeFactory::new(Arc::new(backend.clone())));
        let services = GatewayServices::with_bridges(&config, bridges)
            .expect("invalid harness configuration")
            .with_metrics(Arc::clone(&metrics));
        let ledger = services.ledger.clone();

        let acceptor = tls
            .as_ref()
            .map(|tls| TlsServerAcceptor::new(tls).expect("invalid harness TLS configuration"));
        let listener = GatewayListener::bind(
            "127.0.0.1:0",
            acceptor,
            Arc::new(services),
            config.listen.max_connections,
        )
        .await
        .expect("failed to bind harness listener");

        let address = listener.local_addr().to_string();
        config.listen.address = address.clone();
        config.listen.tls = tls;

        let shutdown_tx = listener.shutdown_handle();
        let listener = Arc::new(listener);
        let task = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run().await })
        };

        Self {
            backend,
            metrics,
            config,
            ledger,
            address,
            shutdown_tx,
            listener,
            task: Some(task),
        }
    }

    /// Address devices connect to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open a plain TCP connection to the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(&self.address).await
    }

    /// Connections the listener is currently serving.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.listener.active_connections()
    }

    /// Wait until the gateway serves exactly `count` connections, or `timeout` passes.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.active_connections();
            if active == count || tokio::time::Instant::now() >= deadline {
                return active;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Payload buffers allocated by decoders and not yet released.
    #[must_use]
    pub fn outstanding_buffers(&self) -> u64 {
        self.ledger.outstanding()
    }

    /// Stop the listener and signal every connection to shut down.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

impl Drop for GatewayTestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Builder for a harness with specific tenants, devices and limits.
pub struct TestHarnessBuilder {
    config: GatewayConfig,
    tls: Option<TlsListenerConfig>,
}

impl TestHarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            tls: None,
        }
    }

    /// Register a device credential.
    #[must_use]
    pub fn device(mut self, tenant_id: &str, device_id: &str, hub_host_name: &str, sas_token: &str) -> Self {
        let device = DeviceConfig {
            id: device_id.to_string(),
            hub_host_name: hub_host_name.to_string(),
            sas_token: sas_token.to_string(),
        };
        match self.config.devices.iter_mut().find(|group| group.tenant_id == tenant_id) {
            Some(group) => group.devices.push(device),
            None => self.config.devices.push(TenantDevicesConfig {
                tenant_id: tenant_id.to_string(),
                devices: vec![device],
            }),
        }
        self
    }

    /// Map a certificate subject to a tenant.
    #[must_use]
    pub fn tenant(mut self, subject: &str, tenant_id: &str, format: TenantFormat, layout: TextLayout) -> Self {
        self.config.tenants.push(TenantConfig {
            subject: subject.to_string(),
            tenant_id: tenant_id.to_string(),
            tenant_name: None,
            format,
            layout,
        });
        self
    }

    #[must_use]
    pub fn max_pending_inbound_messages(mut self, max: usize) -> Self {
        self.config.gateway.max_pending_inbound_messages = max;
        self
    }

    #[must_use]
    pub fn max_keep_alive_timeout_secs(mut self, secs: u64) -> Self {
        self.config.gateway.max_keep_alive_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn default_keep_alive_secs(mut self, secs: u16) -> Self {
        self.config.gateway.default_keep_alive_secs = secs;
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.gateway.max_message_size = size;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.listen.max_connections = max;
        self
    }

    /// Serve TLS instead of plain TCP.
    #[must_use]
    pub fn tls(mut self, tls: TlsListenerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Start the gateway.
    pub async fn build(self) -> GatewayTestHarness {
        GatewayTestHarness::start(self.config, self.tls).await
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
