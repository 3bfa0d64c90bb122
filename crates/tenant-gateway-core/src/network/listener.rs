//! Listener accepting device connections.
//!
//! Accepts plain TCP or TLS connections and spawns a task for each one,
//! delegating to the connection handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::tls::TlsServerAcceptor;

use super::client_stream::ClientStream;
use super::connection::ConnectionHandler;
use super::context::ConnectionContext;
use super::services::GatewayServices;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener for one device-facing address.
pub struct GatewayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsServerAcceptor>,
    services: Arc<GatewayServices>,
    max_connections: usize,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl GatewayListener {
    /// Bind to `address`. With an acceptor, every connection is a TLS server
    /// session.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(
        address: &str,
        tls: Option<TlsServerAcceptor>,
        services: Arc<GatewayServices>,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            local_addr,
            tls,
            services,
            max_connections,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Get a shutdown handle to signal the listener and its connections to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn label(&self) -> &'static str {
        if self.tls.is_some() {
            "tls"
        } else {
            "tcp"
        }
    }

    /// Accept connections until shutdown.
    #[instrument(skip(self), fields(address = %self.local_addr, listener = self.label()))]
    pub async fn run(&self) {
        info!("gateway listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => self.accept(socket, addr),
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let active = self.active_connections.load(Ordering::Relaxed);
        if active > 0 {
            info!(active, "waiting for connections to close");
        }
    }

    fn accept(&self, socket: TcpStream, addr: SocketAddr) {
        let current = self.active_connections.load(Ordering::Relaxed);
        if current >= self.max_connections {
            warn!(
                peer = %addr,
                active = current,
                max = self.max_connections,
                "connection rejected: limit reached"
            );
            return;
        }

        self.active_connections.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.services.metrics {
            metrics.record_accept(self.label());
            metrics.inc_connections();
        }
        debug!(peer = %addr, active = current + 1, "accepted connection");

        let services = Arc::clone(&self.services);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let active_connections = Arc::clone(&self.active_connections);
        let tls = self.tls.clone();

        tokio::spawn(async move {
            if let Some((stream, context)) = open_stream(socket, addr, tls).await {
                let handler = ConnectionHandler::new(Arc::clone(&services), context, shutdown_rx);
                handler.handle(stream).await;
            }
            if let Some(metrics) = &services.metrics {
                metrics.dec_connections();
            }
            active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Finish the TLS handshake, if any, and build the connection context.
async fn open_stream(
    socket: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsServerAcceptor>,
) -> Option<(ClientStream, ConnectionContext)> {
    let Some(acceptor) = tls else {
        return Some((ClientStream::plain(socket), ConnectionContext::plain(addr)));
    };

    let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
        Ok(Ok(stream)) => ClientStream::tls(stream),
        Ok(Err(e)) => {
            debug!(peer = %addr, error = %e, "TLS handshake failed");
            return None;
        }
        Err(_) => {
            debug!(peer = %addr, "TLS handshake timed out");
            return None;
        }
    };

    let identity = match stream.peer_identity() {
        Ok(identity) => identity,
        Err(e) => {
            warn!(peer = %addr, error = %e, "unreadable client certificate");
            return None;
        }
    };
    Some((stream, ConnectionContext::new(addr, true, identity)))
}
