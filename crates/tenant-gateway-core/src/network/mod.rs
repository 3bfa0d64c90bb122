//! Network layer of the gateway.
//!
//! This module provides:
//! - Listener accepting plain TCP and TLS device connections
//! - The per-connection stage chain (tenancy resolver, frame decoder,
//!   device topic decoder, device adapter)
//! - Connection handler driving the chain for one socket

pub mod client_stream;
pub mod connection;
pub mod context;
pub mod device_topic;
pub mod listener;
pub mod pipeline;
pub mod services;

pub use client_stream::ClientStream;
pub use connection::ConnectionHandler;
pub use context::ConnectionContext;
pub use device_topic::DeviceTopicDecoder;
pub use listener::GatewayListener;
pub use pipeline::{Pipeline, Stage};
pub use services::GatewayServices;
