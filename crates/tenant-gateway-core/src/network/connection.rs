//! Per-connection handler.
//!
//! Drives one device connection: reads bytes, runs them through the stage
//! chain (tenancy resolver, frame decoder, device topic decoder) and feeds the
//! resulting packet pairs to the [`DeviceAdapter`]. CONNECT handshakes run as a
//! detached future polled from the same loop, so reads keep flowing into the
//! adapter's pending queue while authentication is in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::OptionFuture;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapter::{establish_session, DeviceAdapter, EstablishedSession, ReceiveOutcome};
use crate::error::{FrameError, GatewayError};
use crate::tenancy::TenancyContext;

use super::client_stream::ClientStream;
use super::context::ConnectionContext;
use super::device_topic::DeviceTopicDecoder;
use super::pipeline::Pipeline;
use super::services::GatewayServices;

const READ_BUFFER_SIZE: usize = 8 * 1024;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<EstablishedSession, GatewayError>> + Send>>;

/// Handles a single device connection.
pub struct ConnectionHandler {
    services: Arc<GatewayServices>,
    context: ConnectionContext,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    /// Create a new connection handler.
    #[must_use]
    pub fn new(
        services: Arc<GatewayServices>,
        context: ConnectionContext,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            services,
            context,
            shutdown_rx,
        }
    }

    /// Connection metadata.
    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Handle the connection until it closes.
    #[instrument(
        skip_all,
        fields(
            connection_id = %self.context.connection_id(),
            peer = %self.context.peer_address(),
            secure = self.context.is_secure()
        )
    )]
    pub async fn handle(mut self, mut stream: ClientStream) {
        let close = CancellationToken::new();
        let mut session = Session::new(Arc::clone(&self.services), self.context.clone(), close.clone());
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        debug!("device connected");
        if self.context.is_secure() {
            session.resolve_tenancy().await;
        }

        loop {
            let deadline = session.adapter.keep_alive_deadline();
            let reading = !session.adapter.is_read_throttled();

            tokio::select! {
                biased;

                () = close.cancelled() => break,

                _ = self.shutdown_rx.recv() => {
                    debug!("shutdown during connection handling");
                    session.adapter.shutdown(None).await;
                    break;
                }

                Some(outcome) = OptionFuture::from(session.pending_connect.as_mut()) => {
                    session.pending_connect = None;
                    session.adapter.complete_connect(outcome).await;
                    // Bytes left behind while reads were throttled.
                    if !buf.is_empty() {
                        session.process(&mut buf).await;
                    }
                }

                Some(()) = OptionFuture::from(deadline.map(sleep_until)) => {
                    session.adapter.check_keep_alive(Instant::now()).await;
                }

                read = stream.read_buf(&mut buf), if reading => {
                    match read {
                        Ok(0) => {
                            debug!("device disconnected");
                            session.adapter.shutdown(None).await;
                            break;
                        }
                        Ok(n) => {
                            if let Some(metrics) = &self.services.metrics {
                                metrics.record_bytes_received(n as u64);
                            }
                            session.process(&mut buf).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "read failed");
                            let err = GatewayError::from(e).in_scope("Read", self.context.connection_id());
                            session.adapter.shutdown(Some(err)).await;
                            break;
                        }
                    }
                }
            }
        }

        session.finish();
    }
}

/// Stage chain and adapter of one connection.
struct Session {
    services: Arc<GatewayServices>,
    context: ConnectionContext,
    pipeline: Pipeline,
    topics: DeviceTopicDecoder,
    adapter: DeviceAdapter,
    tenancy: Option<Arc<TenancyContext>>,
    pending_connect: Option<ConnectFuture>,
}

impl Session {
    fn new(services: Arc<GatewayServices>, context: ConnectionContext, close: CancellationToken) -> Self {
        let mut adapter = DeviceAdapter::new(
            Arc::clone(&services.settings),
            context.connection_id(),
            context.peer_address(),
            close,
        );
        if let Some(metrics) = &services.metrics {
            adapter = adapter.with_metrics(Arc::clone(metrics));
        }
        let topics = DeviceTopicDecoder::new(
            Arc::clone(&services.credentials),
            Arc::clone(&services.templates),
            services.ledger.clone(),
            services.default_keep_alive_secs,
        );

        Self {
            services,
            context,
            pipeline: Pipeline::new(),
            topics,
            adapter,
            tenancy: None,
            pending_connect: None,
        }
    }

    /// Bind the tenancy and install the frame decoder. Shuts the connection
    /// down if the stage chain is broken.
    async fn resolve_tenancy(&mut self) -> Option<Arc<TenancyContext>> {
        if let Some(tenancy) = &self.tenancy {
            return Some(Arc::clone(tenancy));
        }
        match self
            .services
            .resolver
            .resolve(self.context.peer_identity(), &mut self.pipeline)
        {
            Ok(tenancy) => {
                self.tenancy = Some(Arc::clone(&tenancy));
                Some(tenancy)
            }
            Err(e) => {
                let err = GatewayError::from(e).in_scope("ResolveTenancy", self.context.connection_id());
                self.adapter.shutdown(Some(err)).await;
                None
            }
        }
    }

    /// Decode everything buffered in `buf` and hand it to the adapter.
    async fn process(&mut self, buf: &mut BytesMut) {
        let Some(tenancy) = self.resolve_tenancy().await else {
            buf.clear();
            return;
        };

        loop {
            if self.adapter.is_closed() {
                buf.clear();
                return;
            }
            if self.adapter.is_read_throttled() {
                return;
            }

            let frame = match self.pipeline.decode(buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "dropping frame");
                    self.record_drop(&e);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "frame decode failed");
                    self.record_drop(&e);
                    let err = GatewayError::from(e).in_scope("Decode", self.context.connection_id());
                    self.adapter.shutdown(Some(err)).await;
                    buf.clear();
                    return;
                }
            };
            if let Some(metrics) = &self.services.metrics {
                metrics.record_frame_decoded();
            }

            let needs_connect = self.adapter.needs_connect() && self.pending_connect.is_none();
            let Some(pair) = self.topics.decode(frame, &tenancy, needs_connect).await else {
                continue;
            };

            if let ReceiveOutcome::BeginConnect(request) = self.adapter.receive(pair).await {
                self.pending_connect = Some(Box::pin(establish_session(
                    request,
                    Arc::clone(&self.services.identities),
                    Arc::clone(&tenancy),
                    self.context.peer_address(),
                    self.services.settings.max_keep_alive_timeout,
                    self.context.connection_id().to_string(),
                )));
            }
        }
    }

    fn record_drop(&self, err: &FrameError) {
        if let Some(metrics) = &self.services.metrics {
            let reason = match err {
                FrameError::LineTooLong(_) => "line_too_long",
                FrameError::UnknownSignature(_) => "unknown_packet_type",
                _ => "malformed",
            };
            metrics.record_frame_dropped(reason);
        }
    }

    /// A CONNECT still in flight when the loop exits is dropped unfinished.
    /// It owns no bridge until it resolves, so nothing is left to dispose and
    /// no backend client is opened for a closed connection.
    fn finish(mut self) {
        if self.pending_connect.take().is_some() {
            debug!("abandoning in-flight connect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use std::net::SocketAddr;

    use async_trait::async_trait;

    use crate::auth::{DeviceIdentity, IdentityProvider, SasTokenIdentityProvider};
    use crate::bridge::TenantRoutedBridgeFactory;
    use crate::config::{DeviceConfig, GatewayConfig, TenantDevicesConfig};
    use crate::testing::RecordingBackend;

    /// Takes its time before delegating, so a CONNECT stays in flight.
    #[derive(Debug)]
    struct SlowIdentityProvider(Duration);

    #[async_trait]
    impl IdentityProvider for SlowIdentityProvider {
        async fn authenticate(
            &self,
            device_id: &str,
            username: &str,
            password: &str,
            peer: SocketAddr,
        ) -> DeviceIdentity {
            tokio::time::sleep(self.0).await;
            SasTokenIdentityProvider
                .authenticate(device_id, username, password, peer)
                .await
        }
    }

    fn services(backend: &RecordingBackend) -> Arc<GatewayServices> {
        let mut config = GatewayConfig::default();
        config.devices.push(TenantDevicesConfig {
            tenant_id: "T1".into(),
            devices: vec![DeviceConfig {
                id: "dev42".into(),
                hub_host_name: "hub.example.net".into(),
                sas_token: "sig".into(),
            }],
        });
        let bridges = Arc::new(TenantRoutedBridgeFactory::new(Arc::new(backend.clone())));
        Arc::new(GatewayServices::with_bridges(&config, bridges).unwrap())
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn spawn_handler(
        services: Arc<GatewayServices>,
        server: TcpStream,
    ) -> (tokio::task::JoinHandle<()>, broadcast::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let context = ConnectionContext::plain(server.peer_addr().unwrap());
        let handler = ConnectionHandler::new(services, context, shutdown_rx);
        let task = tokio::spawn(handler.handle(ClientStream::plain(server)));
        (task, shutdown_tx)
    }

    #[tokio::test]
    async fn test_line_is_relayed_after_implicit_connect() {
        let backend = RecordingBackend::new();
        let (mut client, server) = connected_pair().await;
        let (_task, _shutdown) = spawn_handler(services(&backend), server);

        client
            .write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n")
            .await
            .unwrap();

        let sent = backend.wait_for_messages(1, Duration::from_secs(5)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_id, "dev42");
        assert_eq!(sent[0].address, "devices/dev42/messages/events");
        assert_eq!(&sent[0].payload[..], b"temp=21");
    }

    #[tokio::test]
    async fn test_client_close_ends_handler() {
        let backend = RecordingBackend::new();
        let (client, server) = connected_pair().await;
        let (task, _shutdown) = spawn_handler(services(&backend), server);

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_bridge() {
        let backend = RecordingBackend::new();
        let (mut client, server) = connected_pair().await;
        let (task, shutdown_tx) = spawn_handler(services(&backend), server);

        client
            .write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n")
            .await
            .unwrap();
        backend.wait_for_messages(1, Duration::from_secs(5)).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_is_disconnected() {
        let backend = RecordingBackend::new();
        let (mut client, server) = connected_pair().await;
        let (task, _shutdown) = spawn_handler(services(&backend), server);

        client
            .write_all(b"T1~2024-01-01T00:00:00Z~ghost~temp=1\n")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(backend.sent().is_empty());
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_opens_no_backend_client() {
        let backend = RecordingBackend::new();
        let services = Arc::new(
            GatewayServices::clone(&services(&backend))
                .with_identities(Arc::new(SlowIdentityProvider(Duration::from_millis(200)))),
        );
        let (mut client, server) = connected_pair().await;
        let (task, _shutdown) = spawn_handler(services, server);

        client
            .write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.connect_count(), 0);
        assert_eq!(backend.close_count(), 0);
        assert!(backend.sent().is_empty());
    }
}
