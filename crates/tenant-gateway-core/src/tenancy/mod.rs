//! Tenant resolution.
//!
//! A connection's tenant comes from one of two places:
//!
//! - the TLS client certificate subject, looked up in the [`TenantTable`]
//! - the first text line received, for connections without a known subject
//!
//! The [`TenancyResolver`] runs once per connection and installs the
//! tenant's frame decoder into the connection's stage chain.

pub mod context;
pub mod resolver;

pub use context::{TenancyContext, TenantInfo, TrustInfo};
pub use resolver::{TenancyResolver, TenantProfile, TenantTable};
