//! Device credential lookup.
//!
//! Credentials are looked up by (tenant id, device id) when the device topic
//! stage synthesizes a CONNECT for a text line.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::config::TenantDevicesConfig;

/// Stored credential for one device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredential {
    pub device_id: String,
    /// `{hub_host_name}/{device_id}`.
    pub username: String,
    /// Shared access signature.
    pub password: String,
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("device_id", &self.device_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of device credentials.
#[async_trait]
pub trait DeviceCredentialProvider: Send + Sync + fmt::Debug {
    /// Get the credential for a device of a tenant.
    async fn get_credential(&self, tenant_id: &str, device_id: &str) -> Option<DeviceCredential>;
}

/// In-memory credential provider keyed by `"{tenant_id}.{device_id}"`.
#[derive(Debug, Default)]
pub struct InMemoryCredentialProvider {
    credentials: HashMap<String, DeviceCredential>,
}

impl InMemoryCredentialProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device credential.
    pub fn add_device(
        &mut self,
        tenant_id: &str,
        device_id: &str,
        hub_host_name: &str,
        sas_token: impl Into<String>,
    ) {
        self.credentials.insert(
            credential_key(tenant_id, device_id),
            DeviceCredential {
                device_id: device_id.to_string(),
                username: format!("{hub_host_name}/{device_id}"),
                password: sas_token.into(),
            },
        );
    }

    /// Build from the `devices:` configuration section.
    #[must_use]
    pub fn from_config(tenants: &[TenantDevicesConfig]) -> Self {
        let mut provider = Self::new();
        for tenant in tenants {
            for device in &tenant.devices {
                provider.add_device(
                    &tenant.tenant_id,
                    &device.id,
                    &device.hub_host_name,
                    device.sas_token(),
                );
            }
        }
        provider
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl DeviceCredentialProvider for InMemoryCredentialProvider {
    async fn get_credential(&self, tenant_id: &str, device_id: &str) -> Option<DeviceCredential> {
        self.credentials
            .get(&credential_key(tenant_id, device_id))
            .cloned()
    }
}

fn credential_key(tenant_id: &str, device_id: &str) -> String {
    format!("{tenant_id}.{device_id}")
}
