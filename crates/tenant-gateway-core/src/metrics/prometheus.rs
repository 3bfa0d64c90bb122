//! Prometheus metrics for the tenant gateway.

use prometheus::{Counter, CounterVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::error::ErrorCode;

/// Gateway metrics collection.
pub struct GatewayMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Current open device connections.
    pub active_connections: IntGauge,

    /// Device connections accepted, by listener ("plain" or "tls").
    pub connections_accepted: CounterVec,

    /// Total bytes read from devices.
    pub bytes_received: Counter,

    /// Frames produced by tenant decoders.
    pub frames_decoded: IntCounter,

    /// Frames or lines discarded, by reason.
    pub frames_dropped: CounterVec,

    /// CONNECT outcomes ("ok" or an error code).
    pub connects: CounterVec,

    /// Messages handed to the backend.
    pub messages_relayed: IntCounter,

    /// Backend sends that failed.
    pub relay_failures: IntCounter,

    /// Connections closed for missing keep-alive.
    pub keep_alive_timeouts: IntCounter,

    /// Connection shutdowns, by cause ("closed" or an error code).
    pub shutdowns: CounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections = IntGauge::new(
            "tenant_gateway_active_connections",
            "Current number of open device connections",
        )
        .expect("metric creation should succeed");

        let connections_accepted = CounterVec::new(
            Opts::new(
                "tenant_gateway_connections_accepted_total",
                "Total device connections accepted by listener",
            ),
            &["listener"],
        )
        .expect("metric creation should succeed");

        let bytes_received = Counter::new(
            "tenant_gateway_bytes_received_total",
            "Total bytes received from devices",
        )
        .expect("metric creation should succeed");

        let frames_decoded = IntCounter::new(
            "tenant_gateway_frames_decoded_total",
            "Total frames decoded by tenant decoders",
        )
        .expect("metric creation should succeed");

        let frames_dropped = CounterVec::new(
            Opts::new(
                "tenant_gateway_frames_dropped_total",
                "Total frames or lines dropped by reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let connects = CounterVec::new(
            Opts::new(
                "tenant_gateway_connects_total",
                "Total CONNECT attempts by outcome",
            ),
            &["outcome"],
        )
        .expect("metric creation should succeed");

        let messages_relayed = IntCounter::new(
            "tenant_gateway_messages_relayed_total",
            "Total device messages sent to the backend",
        )
        .expect("metric creation should succeed");

        let relay_failures = IntCounter::new(
            "tenant_gateway_relay_failures_total",
            "Total backend sends that failed",
        )
        .expect("metric creation should succeed");

        let keep_alive_timeouts = IntCounter::new(
            "tenant_gateway_keep_alive_timeouts_total",
            "Total connections closed by the keep-alive supervisor",
        )
        .expect("metric creation should succeed");

        let shutdowns = CounterVec::new(
            Opts::new(
                "tenant_gateway_shutdowns_total",
                "Total connection shutdowns by cause",
            ),
            &["cause"],
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(active_connections.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(connections_accepted.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_received.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(frames_decoded.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(frames_dropped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(connects.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_relayed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(relay_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(keep_alive_timeouts.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(shutdowns.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            active_connections,
            connections_accepted,
            bytes_received,
            frames_decoded,
            frames_dropped,
            connects,
            messages_relayed,
            relay_failures,
            keep_alive_timeouts,
            shutdowns,
        }
    }

    pub fn inc_connections(&self) {
        self.active_connections.inc();
    }

    pub fn dec_connections(&self) {
        self.active_connections.dec();
    }

    pub fn record_accept(&self, listener: &str) {
        self.connections_accepted.with_label_values(&[listener]).inc();
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.inc_by(bytes as f64);
    }

    pub fn record_frame_decoded(&self) {
        self.frames_decoded.inc();
    }

    /// Record a dropped frame or line.
    pub fn record_frame_dropped(&self, reason: &str) {
        self.frames_dropped.with_label_values(&[reason]).inc();
    }

    /// Record a CONNECT outcome; `None` means success.
    pub fn record_connect(&self, failure: Option<ErrorCode>) {
        let outcome = failure.map_or("ok", ErrorCode::as_str);
        self.connects.with_label_values(&[outcome]).inc();
    }

    pub fn record_relay(&self) {
        self.messages_relayed.inc();
    }

    pub fn record_relay_failure(&self) {
        self.relay_failures.inc();
    }

    /// Record a shutdown; `None` means a clean close.
    pub fn record_shutdown(&self, cause: Option<ErrorCode>) {
        if cause == Some(ErrorCode::KeepAliveTimedOut) {
            self.keep_alive_timeouts.inc();
        }
        let label = cause.map_or("closed", ErrorCode::as_str);
        self.shutdowns.with_label_values(&[label]).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("active_connections", &self.active_connections.get())
            .finish_non_exhaustive()
    }
}
