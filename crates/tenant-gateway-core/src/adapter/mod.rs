//! Device connection state machine.
//!
//! One [`DeviceAdapter`] per connection sequences authentication, relay,
//! keep-alive supervision and shutdown. All of its methods run on the
//! connection's own task, so no two of them ever interleave.
//!
//! ```text
//! NotConnected ──CONNECT──▶ ProcessingConnect ──complete──▶ Connected
//!       │                          │                           │
//!       └──────────────────────────┴────── shutdown ───────────┴──▶ +Closed
//! ```
//!
//! Data arriving while a CONNECT is in flight is queued and relayed in arrival
//! order once the CONNECT completes. The packet that arrived together with the
//! CONNECT is relayed last.

pub mod state;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::auth::{DeviceIdentity, IdentityProvider};
use crate::bridge::{MessagingBridge, EVENTS_DESTINATION};
use crate::config::GatewaySettings;
use crate::error::{ErrorCode, GatewayError};
use crate::metrics::GatewayMetrics;
use crate::packet::{ConnectPacket, DeviceDataPacket, PacketPair, PacketType};
use crate::tenancy::TenancyContext;

pub use state::{ConnectionState, StateFlags};

/// Shortest keep-alive reschedule, so a tick landing exactly on the deadline
/// does not spin.
const MIN_KEEP_ALIVE_TICK: Duration = Duration::from_millis(1);

/// Adapter settings shared by every connection.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub max_keep_alive_timeout: Option<Duration>,
    /// Prefix for the `MessageType` service property.
    pub service_property_prefix: String,
    /// Queue length at which socket reads pause during a CONNECT.
    pub max_pending_inbound_messages: usize,
}

impl AdapterSettings {
    #[must_use]
    pub fn from_config(settings: &GatewaySettings) -> Self {
        Self {
            max_keep_alive_timeout: settings.max_keep_alive_timeout(),
            service_property_prefix: settings.service_property_prefix.clone(),
            max_pending_inbound_messages: settings.max_pending_inbound_messages.max(1),
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from_config(&GatewaySettings::default())
    }
}

/// Keep-alive timeout for a declared keep-alive interval.
///
/// The timeout is one and a half times the interval. With a configured
/// maximum, a timeout strictly above it, or a zero timeout, becomes the maximum.
#[must_use]
pub fn derive_keep_alive_timeout(keep_alive_secs: u16, max: Option<Duration>) -> Duration {
    let timeout = Duration::from_millis(u64::from(keep_alive_secs) * 1500);
    match max {
        Some(max) if timeout > max || timeout.is_zero() => max,
        _ => timeout,
    }
}

/// What the caller must do after [`DeviceAdapter::receive`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    Handled,
    /// Run [`establish_session`] for this request and feed the result to
    /// [`DeviceAdapter::complete_connect`].
    BeginConnect(ConnectPacket),
}

/// Outcome of a successful CONNECT.
#[derive(Debug)]
pub struct EstablishedSession {
    pub identity: DeviceIdentity,
    pub bridge: Box<dyn MessagingBridge>,
    pub keep_alive_timeout: Duration,
}

/// Authenticate a CONNECT and open the device's bridge.
///
/// Runs detached from the adapter so the connection keeps reading (and
/// queueing) while it is in flight.
///
/// # Errors
///
/// Returns `AuthenticationFailed` when the identity provider rejects the
/// device, or the bridge factory's error.
#[instrument(skip_all, fields(connection_id = %connection_id, device_id = %request.device_id))]
pub async fn establish_session(
    request: ConnectPacket,
    identities: Arc<dyn IdentityProvider>,
    tenancy: Arc<TenancyContext>,
    peer: SocketAddr,
    max_keep_alive_timeout: Option<Duration>,
    connection_id: String,
) -> Result<EstablishedSession, GatewayError> {
    let identity = identities
        .authenticate(
            request.device_id.as_str(),
            &request.username,
            &request.password,
            peer,
        )
        .await;

    if !identity.is_authenticated() {
        return Err(GatewayError::new(
            ErrorCode::AuthenticationFailed,
            format!("device '{}' failed authentication", request.device_id),
        )
        .in_scope("Connect", &connection_id));
    }

    let keep_alive_timeout =
        derive_keep_alive_timeout(request.keep_alive_secs, max_keep_alive_timeout);
    let bridge = tenancy
        .create_bridge(&identity)
        .await
        .map_err(|e| e.in_scope("Connect", &connection_id))?;

    debug!(keep_alive_ms = keep_alive_timeout.as_millis() as u64, "Device authenticated");
    Ok(EstablishedSession {
        identity,
        bridge,
        keep_alive_timeout,
    })
}

/// Per-connection protocol state machine.
#[derive(Debug)]
pub struct DeviceAdapter {
    settings: Arc<AdapterSettings>,
    connection_id: String,
    peer: SocketAddr,
    state: ConnectionState,
    last_activity: Instant,
    keep_alive_timeout: Duration,
    next_keep_alive_check: Option<Instant>,
    identity: Option<DeviceIdentity>,
    pending: VecDeque<DeviceDataPacket>,
    held_with_connect: Option<DeviceDataPacket>,
    bridge: Option<Box<dyn MessagingBridge>>,
    close: CancellationToken,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl DeviceAdapter {
    #[must_use]
    pub fn new(
        settings: Arc<AdapterSettings>,
        connection_id: impl Into<String>,
        peer: SocketAddr,
        close: CancellationToken,
    ) -> Self {
        Self {
            settings,
            connection_id: connection_id.into(),
            peer,
            state: ConnectionState::new(),
            last_activity: Instant::now(),
            keep_alive_timeout: Duration::ZERO,
            next_keep_alive_check: None,
            identity: None,
            pending: VecDeque::new(),
            held_with_connect: None,
            bridge: None,
            close,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    /// When the keep-alive supervisor next wants to run.
    #[must_use]
    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.next_keep_alive_check
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    #[must_use]
    pub fn is_read_throttled(&self) -> bool {
        self.state.is_read_throttled()
    }

    /// Whether the next inbound data should carry a CONNECT.
    #[must_use]
    pub fn needs_connect(&self) -> bool {
        !self.state.is_closed() && self.state.phase() == StateFlags::NOT_CONNECTED
    }

    /// Token cancelled when the connection shuts down.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Handle one packet pair.
    pub async fn receive(&mut self, pair: PacketPair) -> ReceiveOutcome {
        let PacketPair { connect, data } = pair;

        if self.state.is_closed() {
            debug!(connection_id = %self.connection_id, "Dropping packet on closed connection");
            if let Some(data) = data {
                data.release();
            }
            return ReceiveOutcome::Handled;
        }

        self.last_activity = Instant::now();

        if self.state.is_connected() {
            if connect.is_some() {
                trace!(connection_id = %self.connection_id, "Ignoring CONNECT on connected device");
            }
            if let Some(data) = data {
                self.relay(data).await;
            }
            return ReceiveOutcome::Handled;
        }

        if self.state.is_processing_connect() {
            if let Some(data) = data {
                self.pending.push_back(data);
                if self.pending.len() >= self.settings.max_pending_inbound_messages {
                    debug!(
                        connection_id = %self.connection_id,
                        pending = self.pending.len(),
                        "Pausing reads until CONNECT completes"
                    );
                    self.state.set_read_throttled(true);
                }
            }
            return ReceiveOutcome::Handled;
        }

        match (connect, data) {
            (Some(connect), data) => {
                self.held_with_connect = data;
                self.state.set_phase(StateFlags::PROCESSING_CONNECT);
                ReceiveOutcome::BeginConnect(connect)
            }
            (None, Some(data)) => {
                data.release();
                let err = GatewayError::new(
                    ErrorCode::ConnectExpected,
                    "device data received before CONNECT",
                )
                .in_scope("Connect", &self.connection_id);
                self.shutdown(Some(err)).await;
                ReceiveOutcome::Handled
            }
            (None, None) => ReceiveOutcome::Handled,
        }
    }

    /// Finish a CONNECT started by [`ReceiveOutcome::BeginConnect`].
    pub async fn complete_connect(&mut self, outcome: Result<EstablishedSession, GatewayError>) {
        let session = match outcome {
            Ok(session) => session,
            Err(err) => {
                self.record_connect(Some(err.code()));
                self.shutdown(Some(err)).await;
                return;
            }
        };

        if self.state.is_closed() {
            // Closed while the CONNECT was in flight.
            session.bridge.dispose(None).await;
            return;
        }

        self.record_connect(None);
        info!(
            connection_id = %self.connection_id,
            device = %session.identity,
            keep_alive_ms = session.keep_alive_timeout.as_millis() as u64,
            "Device connected"
        );

        self.identity = Some(session.identity);
        self.bridge = Some(session.bridge);
        self.keep_alive_timeout = session.keep_alive_timeout;
        self.state.set_phase(StateFlags::CONNECTED);
        self.state.set_read_throttled(false);

        if !self.keep_alive_timeout.is_zero() {
            self.check_keep_alive(Instant::now()).await;
        }

        while let Some(packet) = self.pending.pop_front() {
            self.relay(packet).await;
        }

        if let Some(packet) = self.held_with_connect.take() {
            if packet.payload.is_empty() {
                packet.release();
            } else {
                self.relay(packet).await;
            }
        }
    }

    /// Send one packet to the backend.
    async fn relay(&mut self, packet: DeviceDataPacket) {
        if self.state.is_closed() {
            packet.release();
            return;
        }

        let bound = self.identity.as_ref().map(|identity| identity.id.as_str());
        if bound.is_some_and(|id| packet.device_id.as_str() != id) {
            self.state.mark_invalid_configuration();
            let err = GatewayError::new(
                ErrorCode::UnResolvedSendingClient,
                format!(
                    "packet for device '{}' on a connection bound to '{}'",
                    packet.device_id,
                    bound.unwrap_or_default()
                ),
            )
            .in_scope("Relay", &self.connection_id);
            packet.release();
            self.shutdown(Some(err)).await;
            return;
        }

        let Some(bridge) = self.bridge.as_ref() else {
            packet.release();
            return;
        };

        let Some(client) = bridge.try_resolve_client(EVENTS_DESTINATION) else {
            packet.release();
            let err = GatewayError::new(
                ErrorCode::UnResolvedSendingClient,
                format!("no backend client for destination '{EVENTS_DESTINATION}'"),
            )
            .in_scope("Relay", &self.connection_id);
            self.shutdown(Some(err)).await;
            return;
        };

        let DeviceDataPacket {
            destination_address,
            payload,
            sequence,
            ..
        } = packet;
        let mut message = client.create_message(&destination_address, payload);
        message.set_property(
            format!("{}MessageType", self.settings.service_property_prefix),
            PacketType::D2c.as_str(),
        );

        match client.send(message).await {
            Ok(()) => {
                trace!(
                    connection_id = %self.connection_id,
                    sequence = sequence.sequence_number,
                    address = %destination_address,
                    "Relayed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_relay();
                }
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_relay_failure();
                }
                let err = GatewayError::from(e).in_scope("Relay", &self.connection_id);
                self.shutdown(Some(err)).await;
            }
        }
    }

    /// Keep-alive supervisor tick.
    ///
    /// Shuts the connection down when the device has been silent longer than
    /// the keep-alive timeout; otherwise schedules the next tick for when the
    /// timeout would expire.
    pub async fn check_keep_alive(&mut self, now: Instant) {
        if self.state.is_closed() || self.keep_alive_timeout.is_zero() {
            self.next_keep_alive_check = None;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_activity);
        if elapsed > self.keep_alive_timeout {
            self.next_keep_alive_check = None;
            let err = GatewayError::new(
                ErrorCode::KeepAliveTimedOut,
                format!(
                    "no activity for {}ms (keep-alive timeout {}ms)",
                    elapsed.as_millis(),
                    self.keep_alive_timeout.as_millis()
                ),
            )
            .in_scope("KeepAlive", &self.connection_id);
            self.shutdown(Some(err)).await;
            return;
        }

        let remaining = (self.keep_alive_timeout - elapsed).max(MIN_KEEP_ALIVE_TICK);
        self.next_keep_alive_check = Some(now + remaining);
    }

    /// Close the connection. Only the first call has any effect.
    pub async fn shutdown(&mut self, cause: Option<GatewayError>) {
        if !self.state.mark_closed() {
            return;
        }

        let cause = cause.map(|err| err.in_scope("Shutdown", &self.connection_id));
        match &cause {
            Some(err) => warn!(
                connection_id = %self.connection_id,
                peer = %self.peer,
                code = %err.code(),
                transient = err.is_transient(),
                tracking_id = %err.tracking_id(),
                operation = err.scope().operation.as_deref().unwrap_or(""),
                error = %err.message(),
                "Closing connection"
            ),
            None => info!(connection_id = %self.connection_id, peer = %self.peer, "Closing connection"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_shutdown(cause.as_ref().map(GatewayError::code));
        }

        for packet in self.pending.drain(..) {
            packet.release();
        }
        if let Some(packet) = self.held_with_connect.take() {
            packet.release();
        }
        self.next_keep_alive_check = None;

        if let Some(bridge) = self.bridge.take() {
            bridge.dispose(cause.as_ref()).await;
        }
        self.close.cancel();
    }

    fn record_connect(&self, failure: Option<ErrorCode>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_connect(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SasTokenIdentityProvider;
    use crate::bridge::{BackendClient, TenantRoutedBridgeFactory};
    use crate::packet::{BufferLedger, DeviceId};
    use crate::testing::RecordingBackend;
    use async_trait::async_trait;

    struct Fixture {
        backend: RecordingBackend,
        ledger: BufferLedger,
        tenancy: Arc<TenancyContext>,
        adapter: DeviceAdapter,
    }

    fn fixture_with(settings: AdapterSettings) -> Fixture {
        let backend = RecordingBackend::new();
        let tenancy = Arc::new(TenancyContext::delayed(
            1024,
            Arc::new(TenantRoutedBridgeFactory::new(Arc::new(backend.clone()))),
        ));
        let adapter = DeviceAdapter::new(
            Arc::new(settings),
            "conn-1",
            "127.0.0.1:40000".parse().unwrap(),
            CancellationToken::new(),
        );
        Fixture {
            backend,
            ledger: BufferLedger::new(),
            tenancy,
            adapter,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AdapterSettings::default())
    }

    fn connect(device: &str, keep_alive: u16) -> ConnectPacket {
        ConnectPacket::new(
            DeviceId::parse(device).unwrap(),
            format!("hub/{device}"),
            "sas",
            keep_alive,
        )
    }

    fn data(ledger: &BufferLedger, device: &str, payload: &'static str) -> DeviceDataPacket {
        let mut packet = DeviceDataPacket::new(
            DeviceId::parse(device).unwrap(),
            ledger.allocate(payload.as_bytes()),
        );
        packet.destination_address = format!("devices/{device}/messages/events");
        packet
    }

    async fn session(f: &Fixture, request: ConnectPacket) -> Result<EstablishedSession, GatewayError> {
        establish_session(
            request,
            Arc::new(SasTokenIdentityProvider),
            Arc::clone(&f.tenancy),
            f.adapter.peer(),
            Some(Duration::from_secs(90)),
            "conn-1".to_string(),
        )
        .await
    }

    fn payloads(backend: &RecordingBackend) -> Vec<String> {
        backend
            .sent()
            .iter()
            .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_derive_keep_alive_timeout() {
        let max = Some(Duration::from_secs(90));
        assert_eq!(derive_keep_alive_timeout(40, max), Duration::from_secs(60));
        assert_eq!(derive_keep_alive_timeout(60, max), Duration::from_secs(90));
        assert_eq!(derive_keep_alive_timeout(0, max), Duration::from_secs(90));
        assert_eq!(derive_keep_alive_timeout(120, None), Duration::from_secs(180));
        assert_eq!(derive_keep_alive_timeout(0, None), Duration::ZERO);
    }

    #[test]
    fn test_keep_alive_equal_to_max_is_not_clamped() {
        // 60s * 1.5 == 90s: not strictly above the maximum.
        let max = Some(Duration::from_secs(90));
        assert_eq!(derive_keep_alive_timeout(60, max), Duration::from_secs(90));
        let max = Some(Duration::from_millis(89_999));
        assert_eq!(derive_keep_alive_timeout(60, max), Duration::from_millis(89_999));
    }

    #[tokio::test]
    async fn test_queued_packets_relay_before_held_packet() {
        let mut f = fixture();
        let first = PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "held")));

        let request = match f.adapter.receive(first).await {
            ReceiveOutcome::BeginConnect(request) => request,
            other => panic!("expected BeginConnect, got {other:?}"),
        };
        assert!(f.adapter.state().is_processing_connect());
        assert!(!f.adapter.needs_connect());

        for payload in ["q1", "q2"] {
            let pair = PacketPair::new(None, Some(data(&f.ledger, "dev42", payload)));
            assert!(matches!(f.adapter.receive(pair).await, ReceiveOutcome::Handled));
        }
        assert_eq!(f.adapter.pending_len(), 2);
        assert!(f.backend.sent().is_empty());

        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        assert!(f.adapter.state().is_connected());
        assert_eq!(payloads(&f.backend), vec!["q1", "q2", "held"]);
        assert_eq!(f.adapter.pending_len(), 0);
        assert_eq!(f.ledger.outstanding(), 0);

        let sent = &f.backend.sent()[0];
        assert_eq!(sent.address, "devices/dev42/messages/events");
        assert_eq!(sent.properties.get("MessageType").map(String::as_str), Some("D2C"));
    }

    #[tokio::test]
    async fn test_connected_relays_immediately() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "live"))))
            .await;
        assert_eq!(payloads(&f.backend), vec!["live"]);
    }

    #[tokio::test]
    async fn test_service_property_prefix() {
        let mut f = fixture_with(AdapterSettings {
            service_property_prefix: "iothub-".into(),
            ..AdapterSettings::default()
        });
        let ReceiveOutcome::BeginConnect(request) = f
            .adapter
            .receive(PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "x"))))
            .await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        let sent = f.backend.sent();
        assert_eq!(
            sent[0].properties.get("iothub-MessageType").map(String::as_str),
            Some("D2C")
        );
    }

    #[tokio::test]
    async fn test_empty_held_packet_is_not_relayed() {
        let mut f = fixture();
        let pair = PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "")));
        let ReceiveOutcome::BeginConnect(request) = f.adapter.receive(pair).await else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        assert!(f.backend.sent().is_empty());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_shuts_down() {
        let mut f = fixture();
        let token = f.adapter.close_token();
        let request = ConnectPacket::new(DeviceId::parse("dev42").unwrap(), "hub/other", "sas", 60);
        let pair = PacketPair::new(Some(request), Some(data(&f.ledger, "dev42", "held")));
        let ReceiveOutcome::BeginConnect(request) = f.adapter.receive(pair).await else {
            panic!("expected BeginConnect");
        };
        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "q"))))
            .await;

        let outcome = session(&f, request).await;
        let err = outcome.as_ref().unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert_eq!(err.scope().operation.as_deref(), Some("Connect"));

        f.adapter.complete_connect(outcome).await;
        assert!(f.adapter.is_closed());
        assert!(token.is_cancelled());
        assert_eq!(f.ledger.outstanding(), 0);
        assert!(f.backend.sent().is_empty());
        assert_eq!(f.backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_credential_fails_authentication() {
        let f = fixture();
        let request = ConnectPacket::without_credential(DeviceId::parse("dev42").unwrap(), 120);
        let err = session(&f, request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_identity_mismatch_marks_invalid_configuration() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "intruder", "x"))))
            .await;

        let state = f.adapter.state();
        assert!(state.is_closed());
        assert!(state.has_invalid_configuration());
        assert!(f.backend.sent().is_empty());
        assert_eq!(f.backend.close_count(), 1);
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_in_queue_stops_drain() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        for (device, payload) in [("dev42", "a"), ("intruder", "b"), ("dev42", "c")] {
            f.adapter
                .receive(PacketPair::new(None, Some(data(&f.ledger, device, payload))))
                .await;
        }
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        assert_eq!(payloads(&f.backend), vec!["a"]);
        assert!(f.adapter.is_closed());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_read_throttle_during_connect() {
        let mut f = fixture_with(AdapterSettings {
            max_pending_inbound_messages: 2,
            ..AdapterSettings::default()
        });
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };

        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "1"))))
            .await;
        assert!(!f.adapter.is_read_throttled());
        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "2"))))
            .await;
        assert!(f.adapter.is_read_throttled());

        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;
        assert!(!f.adapter.is_read_throttled());
        assert_eq!(payloads(&f.backend), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_data_before_connect_is_rejected() {
        let mut f = fixture();
        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "x"))))
            .await;
        assert!(f.adapter.is_closed());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_before_connect_is_ignored() {
        let mut f = fixture();
        f.adapter.receive(PacketPair::heartbeat()).await;
        assert!(!f.adapter.is_closed());
        assert!(f.adapter.needs_connect());
    }

    #[tokio::test]
    async fn test_closed_drops_packets() {
        let mut f = fixture();
        f.adapter.shutdown(None).await;
        let outcome = f
            .adapter
            .receive(PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "x"))))
            .await;
        assert!(matches!(outcome, ReceiveOutcome::Handled));
        assert_eq!(f.adapter.pending_len(), 0);
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_no_sends_after_connected_adapter_closes() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;
        f.adapter
            .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", "before"))))
            .await;
        assert_eq!(payloads(&f.backend), vec!["before"]);

        f.adapter.shutdown(None).await;
        assert!(f.adapter.is_closed());

        for payload in ["after1", "after2"] {
            let outcome = f
                .adapter
                .receive(PacketPair::new(None, Some(data(&f.ledger, "dev42", payload))))
                .await;
            assert!(matches!(outcome, ReceiveOutcome::Handled));
        }
        let outcome = f
            .adapter
            .receive(PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "x"))))
            .await;
        assert!(matches!(outcome, ReceiveOutcome::Handled));

        assert_eq!(payloads(&f.backend), vec!["before"]);
        assert!(f.adapter.is_closed());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        f.adapter.shutdown(None).await;
        let flags = f.adapter.state().flags();
        f.adapter
            .shutdown(Some(GatewayError::new(ErrorCode::GenericTimeout, "late")))
            .await;

        assert_eq!(f.adapter.state().flags(), flags);
        assert_eq!(f.backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_during_connect_disposes_new_bridge() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 60)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.shutdown(None).await;
        f.adapter.complete_connect(outcome).await;

        assert!(!f.adapter.state().is_connected());
        assert_eq!(f.backend.connect_count(), 1);
        assert_eq!(f.backend.close_count(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_shuts_down() {
        let mut f = fixture();
        f.backend.fail_sends(true);
        let pair = PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "x")));
        let ReceiveOutcome::BeginConnect(request) = f.adapter.receive(pair).await else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;

        assert!(f.adapter.is_closed());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[derive(Debug)]
    struct EmptyBridge;

    #[async_trait]
    impl MessagingBridge for EmptyBridge {
        fn try_resolve_client(&self, _destination: &str) -> Option<Arc<dyn BackendClient>> {
            None
        }

        async fn dispose(&self, _cause: Option<&GatewayError>) {}
    }

    #[tokio::test]
    async fn test_unresolved_client_shuts_down() {
        let mut f = fixture();
        let pair = PacketPair::new(Some(connect("dev42", 60)), Some(data(&f.ledger, "dev42", "x")));
        let ReceiveOutcome::BeginConnect(_) = f.adapter.receive(pair).await else {
            panic!("expected BeginConnect");
        };
        let session = EstablishedSession {
            identity: DeviceIdentity {
                id: "dev42".into(),
                hub_host_name: "hub".into(),
                secret: None,
                authenticated: true,
            },
            bridge: Box::new(EmptyBridge),
            keep_alive_timeout: Duration::from_secs(60),
        };
        f.adapter.complete_connect(Ok(session)).await;

        assert!(f.adapter.is_closed());
        assert_eq!(f.ledger.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_reschedules_then_times_out() {
        let mut f = fixture();
        let ReceiveOutcome::BeginConnect(request) =
            f.adapter.receive(PacketPair::new(Some(connect("dev42", 40)), None)).await
        else {
            panic!("expected BeginConnect");
        };
        let outcome = session(&f, request).await;
        f.adapter.complete_connect(outcome).await;
        assert_eq!(f.adapter.keep_alive_timeout(), Duration::from_secs(60));

        let start = Instant::now();
        assert_eq!(f.adapter.keep_alive_deadline(), Some(start + Duration::from_secs(60)));

        // Activity at +30s pushes the expiry out to +90s.
        tokio::time::advance(Duration::from_secs(30)).await;
        f.adapter.receive(PacketPair::heartbeat()).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        f.adapter.check_keep_alive(Instant::now()).await;
        assert!(!f.adapter.is_closed());
        assert_eq!(
            f.adapter.keep_alive_deadline(),
            Some(start + Duration::from_secs(90))
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        f.adapter.check_keep_alive(Instant::now()).await;
        assert!(f.adapter.is_closed());
        assert_eq!(f.adapter.keep_alive_deadline(), None);
        assert_eq!(f.backend.close_count(), 1);
    }
}
