//! Device authentication.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

/// Result of authenticating a device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Stable device id.
    pub id: String,
    /// Hub host the device belongs to; empty when unknown.
    pub hub_host_name: String,
    /// Shared access signature presented by the device.
    pub secret: Option<String>,
    pub authenticated: bool,
}

impl DeviceIdentity {
    /// An identity that failed authentication.
    pub fn unauthenticated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hub_host_name: String::new(),
            secret: None,
            authenticated: false,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("id", &self.id)
            .field("hub_host_name", &self.hub_host_name)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hub_host_name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}/{}", self.hub_host_name, self.id)
        }
    }
}

/// Authenticates a device from the credential carried by its CONNECT.
#[async_trait]
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    /// Authenticate a device. Never fails; rejection is reported through
    /// [`DeviceIdentity::authenticated`].
    async fn authenticate(
        &self,
        device_id: &str,
        username: &str,
        password: &str,
        peer: SocketAddr,
    ) -> DeviceIdentity;
}

/// Accepts usernames of the form `{hub_host_name}/{device_id}[/...]` whose
/// device segment matches the connecting device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SasTokenIdentityProvider;

impl SasTokenIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IdentityProvider for SasTokenIdentityProvider {
    async fn authenticate(
        &self,
        device_id: &str,
        username: &str,
        password: &str,
        peer: SocketAddr,
    ) -> DeviceIdentity {
        let Some((hub_host_name, claimed_id)) = parse_username(username) else {
            debug!(device_id = %device_id, peer = %peer, "Username is not host/deviceId");
            return DeviceIdentity::unauthenticated(device_id);
        };
        if claimed_id != device_id {
            debug!(
                device_id = %device_id,
                claimed_id = %claimed_id,
                peer = %peer,
                "Username names a different device"
            );
            return DeviceIdentity::unauthenticated(device_id);
        }

        DeviceIdentity {
            id: device_id.to_string(),
            hub_host_name: hub_host_name.to_string(),
            secret: (!password.is_empty()).then(|| password.to_string()),
            authenticated: true,
        }
    }
}

/// Split `host/deviceId[/...]` into `(host, deviceId)`.
fn parse_username(username: &str) -> Option<(&str, &str)> {
    let mut parts = username.splitn(3, '/');
    let host = parts.next().filter(|s| !s.is_empty())?;
    let device = parts.next().filter(|s| !s.is_empty())?;
    Some((host, device))
}
