//! Test utilities for the gateway.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`RecordingBackend`] - An in-memory backend recording relayed messages
//! - [`GatewayTestHarness`] - A running gateway wired to a recording backend
//! - [`TestHarnessBuilder`] - Builder for custom tenants, devices and limits
//! - [`fixtures`] - Self-signed certificate material
//!
//! # Example
//!
//! ```rust,ignore
//! use tenant_gateway_core::testing::GatewayTestHarness;
//!
//! #[tokio::test]
//! async fn test_line_is_relayed() {
//!     let harness = GatewayTestHarness::new().await;
//!     let mut device = harness.connect().await.unwrap();
//!     device.write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n").await.unwrap();
//!
//!     let sent = harness.backend.wait_for_messages(1, Duration::from_secs(5)).await;
//!     assert_eq!(sent[0].address, "devices/dev42/messages/events");
//! }
//! ```

pub mod backend;
pub mod fixtures;
pub mod harness;

pub use backend::{RecordingBackend, SentMessage};
pub use harness::{GatewayTestHarness, TestHarnessBuilder};
