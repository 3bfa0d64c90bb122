//! Recording backend for tests.
//!
//! Implements [`BackendClientFactory`] and records every message sent through
//! the clients it creates. Connects and sends can be made to fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::DeviceIdentity;
use crate::bridge::{BackendClient, BackendClientFactory, BackendMessage};
use crate::error::BackendError;

/// A message captured by the [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub device_id: String,
    pub address: String,
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Recorder {
    sent: Mutex<Vec<SentMessage>>,
    fail_connects: AtomicBool,
    fail_sends: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory backend. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    recorder: Arc<Recorder>,
}

impl RecordingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail with a transient connection error.
    pub fn fail_connects(&self, fail: bool) {
        self.recorder.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.recorder.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Messages sent so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.recorder
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clients created so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.recorder.connects.load(Ordering::SeqCst)
    }

    /// Clients closed so far.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.recorder.closes.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were sent, or `timeout` passes.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<SentMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` clients were closed, or `timeout` passes.
    pub async fn wait_for_closes(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let closes = self.close_count();
            if closes >= count || tokio::time::Instant::now() >= deadline {
                return closes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl BackendClientFactory for RecordingBackend {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn BackendClient>, BackendError> {
        if self.recorder.fail_connects.load(Ordering::SeqCst) {
            return Err(BackendError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "recording backend refuses connects",
            )));
        }
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingClient {
            device_id: identity.id.clone(),
            recorder: Arc::clone(&self.recorder),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct RecordingClient {
    device_id: String,
    recorder: Arc<Recorder>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendClient for RecordingClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send(&self, message: BackendMessage) -> Result<(), BackendError> {
        let BackendMessage {
            address,
            payload,
            properties,
        } = message;

        if self.closed.load(Ordering::SeqCst) {
            payload.release();
            return Err(BackendError::Closed {
                device_id: self.device_id.clone(),
            });
        }
        if self.recorder.fail_sends.load(Ordering::SeqCst) {
            payload.release();
            return Err(BackendError::Rejected("recording backend rejects sends".into()));
        }

        let record = SentMessage {
            device_id: self.device_id.clone(),
            address,
            payload: payload.bytes().clone(),
            properties,
        };
        payload.release();
        self.recorder
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
