//! Tenant Gateway Core Library
//!
//! Core of a multi-tenant TCP/TLS gateway for field devices. Each accepted
//! connection is bound to a tenant (from its client certificate, or from the
//! first line it sends), decoded with that tenant's wire format, authenticated
//! per device and relayed to a pooled backend.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error codes and domain-specific error types
//! - [`packet`] - Canonical packet model and payload buffers
//! - [`codec`] - Length-framed binary and delimiter-framed text decoders
//! - [`tenancy`] - Tenant resolution and per-connection tenancy context
//! - [`auth`] - Device credentials, identities and certificate identity
//! - [`adapter`] - Per-connection state machine, keep-alive and relay
//! - [`bridge`] - Messaging bridge and backend client interfaces
//! - [`backend`] - Pooled TCP backend client
//! - [`network`] - Listener, stage chain and connection handler
//! - [`metrics`] - Prometheus metrics collection
//! - [`tls`] - TLS termination for the secure listener
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenant_gateway_core::config::GatewayConfig;
//! use tenant_gateway_core::network::{GatewayListener, GatewayServices};
//!
//! let config = GatewayConfig::from_file("config.yaml")?;
//! let services = Arc::new(GatewayServices::from_config(&config)?);
//! let listener = GatewayListener::bind(&config.listen.address, None, services, 1000).await?;
//! listener.run().await;
//! ```

#![forbid(unsafe_code)]

pub mod adapter;
pub mod auth;
pub mod backend;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod packet;
pub mod tenancy;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use adapter::{DeviceAdapter, StateFlags};
pub use config::GatewayConfig;
pub use error::{ConfigError, ErrorCode, GatewayError, Result, TlsError};
pub use network::{GatewayListener, GatewayServices};
pub use tls::TlsServerAcceptor;
