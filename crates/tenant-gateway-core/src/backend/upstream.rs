//! Single shared upstream connection.
//!
//! Writes newline-delimited frames over TCP. The stream is (re)established
//! lazily: on first use, after a write failure, or after sitting idle longer
//! than the configured idle timeout.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};

use crate::error::BackendError;

struct UpstreamState {
    stream: Option<TcpStream>,
    last_used: Instant,
}

/// One pooled connection to the backend endpoint.
pub struct UpstreamConnection {
    endpoint: String,
    slot: usize,
    state: Mutex<UpstreamState>,
    connect_timeout: Duration,
    send_timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamConnection {
    #[must_use]
    pub fn new(
        endpoint: String,
        slot: usize,
        connect_timeout: Duration,
        send_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            slot,
            state: Mutex::new(UpstreamState {
                stream: None,
                last_used: Instant::now(),
            }),
            connect_timeout,
            send_timeout,
            idle_timeout,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.stream.is_some()
    }

    /// Make sure a live stream exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ConnectTimeout`] or [`BackendError::Connection`]
    /// when the endpoint cannot be reached.
    pub async fn ensure_connected(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await
    }

    /// Write one frame, reconnecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the connect or the write fails or times
    /// out. The stream is dropped on failure so the next send reconnects.
    #[instrument(skip(self, frame), fields(slot = self.slot, endpoint = %self.endpoint, len = frame.len()))]
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        let Some(stream) = state.stream.as_mut() else {
            return Err(BackendError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "upstream stream missing after connect",
            )));
        };

        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match timeout(self.send_timeout, write).await {
            Ok(Ok(())) => {
                state.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Upstream write failed, dropping connection");
                state.stream = None;
                Err(BackendError::Connection(e))
            }
            Err(_) => {
                warn!("Upstream write timed out, dropping connection");
                state.stream = None;
                Err(BackendError::SendTimeout {
                    timeout_ms: duration_ms(self.send_timeout),
                })
            }
        }
    }

    /// Drop the stream.
    pub async fn disconnect(&self) {
        if let Some(mut stream) = self.state.lock().await.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn refresh(&self, state: &mut UpstreamState) -> Result<(), BackendError> {
        if state.stream.is_some() && state.last_used.elapsed() > self.idle_timeout {
            debug!(slot = self.slot, "Upstream connection idle, reconnecting");
            state.stream = None;
        }
        if state.stream.is_none() {
            state.stream = Some(self.connect().await?);
            state.last_used = Instant::now();
        }
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream, BackendError> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.endpoint)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                debug!(slot = self.slot, endpoint = %self.endpoint, "Upstream connection established");
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to connect upstream");
                Err(BackendError::Connection(e))
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, "Upstream connect timed out");
                Err(BackendError::ConnectTimeout {
                    endpoint: self.endpoint.clone(),
                    timeout_ms: duration_ms(self.connect_timeout),
                })
            }
        }
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("endpoint", &self.endpoint)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
