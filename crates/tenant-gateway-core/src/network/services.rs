//! Shared services handed to every connection.

use std::sync::Arc;

use crate::adapter::AdapterSettings;
use crate::auth::{DeviceCredentialProvider, IdentityProvider, InMemoryCredentialProvider, SasTokenIdentityProvider};
use crate::backend;
use crate::bridge::{AddressTemplates, BridgeFactory};
use crate::config::GatewayConfig;
use crate::error::ConfigResult;
use crate::metrics::GatewayMetrics;
use crate::packet::BufferLedger;
use crate::tenancy::{TenancyResolver, TenantTable};

/// Everything a [`ConnectionHandler`](super::ConnectionHandler) needs besides
/// its socket. Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct GatewayServices {
    pub resolver: TenancyResolver,
    pub credentials: Arc<dyn DeviceCredentialProvider>,
    pub identities: Arc<dyn IdentityProvider>,
    pub templates: Arc<AddressTemplates>,
    pub settings: Arc<AdapterSettings>,
    pub default_keep_alive_secs: u16,
    pub ledger: BufferLedger,
    pub metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayServices {
    /// Build the services for `config` backed by the pooled TCP backend.
    ///
    /// # Errors
    ///
    /// Returns an error if an address template is malformed.
    pub fn from_config(config: &GatewayConfig) -> ConfigResult<Self> {
        let bridges = Arc::new(backend::bridge_factory(&config.backend));
        Self::with_bridges(config, bridges)
    }

    /// Build the services for `config` with a caller-supplied bridge factory.
    ///
    /// # Errors
    ///
    /// Returns an error if an address template is malformed.
    pub fn with_bridges(
        config: &GatewayConfig,
        bridges: Arc<dyn BridgeFactory>,
    ) -> ConfigResult<Self> {
        let ledger = BufferLedger::new();
        let templates = AddressTemplates::parse(config.gateway.address_templates.as_slice())?;
        let resolver = TenancyResolver::new(
            Arc::new(TenantTable::from_config(&config.tenants)),
            bridges,
            config.gateway.max_message_size,
            ledger.clone(),
        );

        Ok(Self {
            resolver,
            credentials: Arc::new(InMemoryCredentialProvider::from_config(&config.devices)),
            identities: Arc::new(SasTokenIdentityProvider),
            templates: Arc::new(templates),
            settings: Arc::new(AdapterSettings::from_config(&config.gateway)),
            default_keep_alive_secs: config.gateway.default_keep_alive_secs,
            ledger,
            metrics: None,
        })
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn DeviceCredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_identities(mut self, identities: Arc<dyn IdentityProvider>) -> Self {
        self.identities = identities;
        self
    }
}
