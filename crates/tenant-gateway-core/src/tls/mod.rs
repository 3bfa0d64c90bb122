//! TLS support for the secure device listener.
//!
//! The gateway terminates TLS from devices. When a device presents a client
//! certificate, its subject selects the tenant (see [`crate::tenancy`]).
//!
//! ```rust,ignore
//! use tenant_gateway_core::tls::TlsServerAcceptor;
//! use tenant_gateway_core::config::TlsListenerConfig;
//!
//! let acceptor = TlsServerAcceptor::new(&config.listen.tls.unwrap())?;
//! let tls_stream = acceptor.accept(tcp_stream).await?;
//! ```

pub mod server;

pub use server::TlsServerAcceptor;
