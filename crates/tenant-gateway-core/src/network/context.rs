//! Per-connection metadata.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::auth::PeerIdentity;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Metadata of one device connection, fixed when the connection is accepted.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection_id: String,
    peer_address: SocketAddr,
    secure: bool,
    /// Client certificate identity, TLS connections only.
    peer_identity: Option<PeerIdentity>,
}

impl ConnectionContext {
    pub fn new(peer_address: SocketAddr, secure: bool, peer_identity: Option<PeerIdentity>) -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self {
            connection_id: format!("conn-{n}"),
            peer_address,
            secure,
            peer_identity,
        }
    }

    /// Context for a plain TCP connection.
    pub fn plain(peer_address: SocketAddr) -> Self {
        Self::new(peer_address, false, None)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer_identity.as_ref()
    }
}
