//! Backend messaging transport.
//!
//! [`PooledClientFactory`] hands out per-device clients that share a pool of
//! upstream TCP connections.

pub mod pool;
pub mod upstream;

use std::sync::Arc;

use crate::bridge::{BackendClientFactory, TenantRoutedBridgeFactory};
use crate::config::BackendConfig;

pub use pool::{PooledClient, PooledClientFactory};
pub use upstream::UpstreamConnection;

/// Build the bridge factory for a backend configuration.
///
/// Tenants listed in `tenant_endpoints` get their own pool; everyone else
/// shares the default endpoint.
#[must_use]
pub fn bridge_factory(config: &BackendConfig) -> TenantRoutedBridgeFactory {
    let default: Arc<dyn BackendClientFactory> = Arc::new(PooledClientFactory::new(
        crate::config::expand_env_vars(&config.endpoint),
        config,
    ));
    config
        .tenant_endpoints
        .keys()
        .fold(TenantRoutedBridgeFactory::new(default), |factory, tenant_id| {
            let pool = PooledClientFactory::new(config.endpoint_for(tenant_id), config);
            factory.with_tenant(tenant_id.clone(), Arc::new(pool))
        })
}
