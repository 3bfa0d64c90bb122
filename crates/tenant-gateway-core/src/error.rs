//! Domain error types for the tenant gateway.
//!
//! Uses `thiserror` for the per-concern error enums. Failures that end a device
//! connection are carried as [`GatewayError`], which holds the numeric error
//! code, transient flag, tracking id and scope tags that get logged on shutdown.

use std::fmt;

use rand::Rng;
use thiserror::Error;

/// Gateway error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ChannelClosed,
    GenericTimeout,
    InvalidOperation,
    NotSupported,
    KeepAliveTimedOut,
    ConnectionTimedOut,
    ConnectExpected,
    UnResolvedSendingClient,
    UnknownPacketType,
    ClientClosedRequest,
    AuthenticationFailed,
}

impl ErrorCode {
    /// Numeric code reported alongside the error.
    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::ChannelClosed => 400_001,
            Self::GenericTimeout => 400_002,
            Self::InvalidOperation => 400_003,
            Self::NotSupported => 400_004,
            Self::KeepAliveTimedOut => 400_005,
            Self::ConnectionTimedOut => 400_006,
            Self::ConnectExpected => 400_007,
            Self::UnResolvedSendingClient => 400_008,
            Self::UnknownPacketType => 400_012,
            Self::ClientClosedRequest => 400_499,
            Self::AuthenticationFailed => 401_000,
        }
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelClosed => "ChannelClosed",
            Self::GenericTimeout => "GenericTimeout",
            Self::InvalidOperation => "InvalidOperation",
            Self::NotSupported => "NotSupported",
            Self::KeepAliveTimedOut => "KeepAliveTimedOut",
            Self::ConnectionTimedOut => "ConnectionTimedOut",
            Self::ConnectExpected => "ConnectExpected",
            Self::UnResolvedSendingClient => "UnResolvedSendingClient",
            Self::UnknownPacketType => "UnknownPacketType",
            Self::ClientClosedRequest => "ClientClosedRequest",
            Self::AuthenticationFailed => "AuthenticationFailed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.value())
    }
}

/// Phase and connection that produced a [`GatewayError`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorScope {
    /// Operation in flight, e.g. "Connect" or "Relay".
    pub operation: Option<String>,
    /// Connection id.
    pub connection: Option<String>,
}

/// Connection-terminating failure.
#[derive(Error, Debug)]
#[error("{message} [{code}, tracking id {tracking_id}]")]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
    transient: bool,
    tracking_id: String,
    scope: ErrorScope,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    /// Create a non-transient error with a fresh tracking id.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transient: false,
            tracking_id: new_tracking_id(),
            scope: ErrorScope::default(),
            source: None,
        }
    }

    /// Mark the error as retryable by the peer.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Replace the generated tracking id.
    #[must_use]
    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = tracking_id.into();
        self
    }

    /// Attach the operation and connection scope tags.
    ///
    /// Tags already present are kept so the innermost scope wins.
    #[must_use]
    pub fn in_scope(mut self, operation: &str, connection: &str) -> Self {
        self.scope
            .operation
            .get_or_insert_with(|| operation.to_string());
        self.scope
            .connection
            .get_or_insert_with(|| connection.to_string());
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    #[must_use]
    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    #[must_use]
    pub fn scope(&self) -> &ErrorScope {
        &self.scope
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::new(ErrorCode::ChannelClosed, err.to_string())
            .transient()
            .with_source(err)
    }
}

fn new_tracking_id() -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("{id:016x}")
}

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Two tenant entries claim the same certificate subject.
    #[error("duplicate tenant subject: {0}")]
    DuplicateTenantSubject(String),

    /// A tenant entry is missing a required field.
    #[error("tenant '{tenant}': {message}")]
    InvalidTenant { tenant: String, message: String },

    /// An address template is malformed.
    #[error("invalid address template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    /// A numeric setting is out of range.
    #[error("{field} must be {expected}, got {actual}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        actual: u64,
    },
}

/// Framing failures raised by the frame decoders.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Socket read failure surfaced through the decoder.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Remaining length needs a fifth continuation byte.
    #[error("remaining length exceeds 4 bytes in length")]
    LengthTooLarge,

    /// Declared frame is larger than the configured maximum.
    #[error("message is too big: {size} bytes exceeds maximum {max}")]
    MessageTooBig { size: usize, max: usize },

    /// Signature byte does not name a known packet type.
    #[error("first packet byte value of {0:#04x} is invalid")]
    UnknownSignature(u8),

    /// Packet body could not be parsed.
    #[error("malformed {packet} packet: {message}")]
    Malformed {
        packet: &'static str,
        message: String,
    },

    /// Packet body did not consume the declared remaining length.
    #[error("declared remaining length leaves {0} unread bytes")]
    TrailingBytes(usize),

    /// Text line longer than the configured maximum; the line is skipped.
    #[error("line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),
}

impl FrameError {
    /// Whether the connection must be torn down.
    ///
    /// Binary framing errors are fatal. An over-long text line only loses that line.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::LineTooLong(_))
    }
}

impl From<FrameError> for GatewayError {
    fn from(err: FrameError) -> Self {
        let code = match &err {
            FrameError::Io(_) => ErrorCode::ChannelClosed,
            FrameError::UnknownSignature(_) => ErrorCode::UnknownPacketType,
            _ => ErrorCode::InvalidOperation,
        };
        GatewayError::new(code, err.to_string()).with_source(err)
    }
}

/// Packet construction failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Device ids must be non-empty.
    #[error("device id must not be empty")]
    EmptyDeviceId,
}

/// Backend client failures.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Upstream connection failure.
    #[error("backend connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Upstream did not accept the connection in time.
    #[error("backend connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    /// Send did not complete in time.
    #[error("backend send timed out after {timeout_ms}ms")]
    SendTimeout { timeout_ms: u64 },

    /// Client was already closed.
    #[error("backend client for '{device_id}' is closed")]
    Closed { device_id: String },

    /// Envelope could not be serialized.
    #[error("failed to encode backend message: {0}")]
    Encode(#[from] serde_json::Error),

    /// Test or mock backend rejection.
    #[error("backend rejected message: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Connection-level failures are worth retrying; the rest are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectTimeout { .. } | Self::SendTimeout { .. }
        )
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        let code = match &err {
            BackendError::ConnectTimeout { .. } => ErrorCode::ConnectionTimedOut,
            BackendError::SendTimeout { .. } => ErrorCode::GenericTimeout,
            BackendError::Closed { .. } => ErrorCode::ChannelClosed,
            _ => ErrorCode::InvalidOperation,
        };
        let gateway = GatewayError::new(code, err.to_string());
        let gateway = if err.is_transient() {
            gateway.transient()
        } else {
            gateway
        };
        gateway.with_source(err)
    }
}

/// Per-connection stage chain errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The anchor stage for an insertion does not exist.
    #[error("pipeline stage '{0}' not found")]
    StageNotFound(String),

    /// A stage with this name is already installed.
    #[error("pipeline stage '{0}' already installed")]
    DuplicateStage(String),

    /// A decoder is installed but no tenancy is associated with the connection.
    #[error("tenant decoder installed without a tenancy context")]
    MissingTenancy,
}

impl From<PipelineError> for GatewayError {
    fn from(err: PipelineError) -> Self {
        GatewayError::new(ErrorCode::InvalidOperation, err.to_string()).with_source(err)
    }
}

/// Errors related to TLS configuration and connections.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load certificate file.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Failed to load private key file.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// PEM file contained no certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// PEM file contained no private key.
    #[error("no private key found in '{0}'")]
    NoPrivateKeys(String),

    /// Invalid TLS configuration.
    #[error("invalid TLS configuration: {0}")]
    Config(String),

    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Peer certificate could not be parsed.
    #[error("invalid peer certificate: {0}")]
    PeerCertificate(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
