//! Device and peer authentication.
//!
//! - [`PeerIdentity`]: subject and thumbprint of a TLS client certificate,
//!   used to pick the tenant
//! - [`DeviceCredentialProvider`]: credential lookup by tenant and device id
//! - [`IdentityProvider`]: authenticates a device from its CONNECT credential
//!
//! Device credentials are configured per tenant:
//!
//! ```yaml
//! devices:
//!   - tenant_id: "T1"
//!     devices:
//!       - id: "dev42"
//!         hub_host_name: "hub.example.net"
//!         sas_token: "${DEV42_SAS_TOKEN}"
//! ```

pub mod credentials;
pub mod identity;
pub mod peer;

pub use credentials::{DeviceCredential, DeviceCredentialProvider, InMemoryCredentialProvider};
pub use identity::{DeviceIdentity, IdentityProvider, SasTokenIdentityProvider};
pub use peer::PeerIdentity;
