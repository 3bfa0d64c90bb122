//! Configuration types for the tenant gateway.
//!
//! Configuration is loaded from YAML files and validated before use.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bridge::AddressTemplates;
use crate::codec::{FrameFormat, TextLayout};
use crate::error::{ConfigError, ConfigResult};

/// Largest frame the binary length field can describe, plus its header.
const MAX_ENCODABLE_MESSAGE_SIZE: usize = 1 + 4 + 268_435_455;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Device-facing listeners.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-connection protocol settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Upstream messaging backend.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Known tenants keyed by client certificate subject.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,

    /// Device credentials grouped by tenant.
    #[serde(default)]
    pub devices: Vec<TenantDevicesConfig>,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device-facing listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Plain TCP address, e.g. "0.0.0.0:11000".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Maximum number of concurrent device connections per listener.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Optional TLS listener.
    #[serde(default)]
    pub tls: Option<TlsListenerConfig>,
}

/// TLS listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsListenerConfig {
    /// TLS address, e.g. "0.0.0.0:11001".
    #[serde(default = "default_secure_listen_address")]
    pub address: String,

    /// Server certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Server private key (PEM).
    pub key_path: PathBuf,

    /// CA used to verify device certificates (PEM).
    ///
    /// When set without `require_client_cert`, device certificates are
    /// verified if presented.
    pub ca_cert_path: Option<PathBuf>,

    /// Reject devices that do not present a certificate.
    #[serde(default)]
    pub require_client_cert: bool,
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    /// Upper bound on the derived keep-alive timeout, in seconds.
    #[serde(default)]
    pub max_keep_alive_timeout_secs: Option<u64>,

    /// Keep-alive declared for CONNECTs synthesized from credentials.
    #[serde(default = "default_keep_alive_secs")]
    pub default_keep_alive_secs: u16,

    /// Prefix for service properties stamped on backend messages.
    #[serde(default)]
    pub service_property_prefix: String,

    /// Largest inbound frame or line, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Pending queue length at which socket reads pause during CONNECT.
    #[serde(default = "default_max_pending_inbound_messages")]
    pub max_pending_inbound_messages: usize,

    /// Outbound address templates, tried in order.
    ///
    /// Variables: `{deviceId}`, `{tenantId}`.
    #[serde(default = "default_address_templates")]
    pub address_templates: Vec<String>,
}

impl GatewaySettings {
    #[must_use]
    pub fn max_keep_alive_timeout(&self) -> Option<Duration> {
        self.max_keep_alive_timeout_secs.map(Duration::from_secs)
    }
}

/// Upstream messaging backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Default upstream endpoint ("host:port").
    #[serde(default = "default_backend_endpoint")]
    pub endpoint: String,

    /// Endpoint overrides keyed by tenant id.
    #[serde(default)]
    pub tenant_endpoints: HashMap<String, String>,

    /// Upstream connections shared by all devices of one endpoint.
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,

    /// Pooled connections idle longer than this are re-established.
    #[serde(default = "default_connection_idle_timeout_secs")]
    pub connection_idle_timeout_secs: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Send timeout in milliseconds.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl BackendConfig {
    /// Endpoint for a tenant, with environment variables expanded.
    #[must_use]
    pub fn endpoint_for(&self, tenant_id: &str) -> String {
        let raw = self.tenant_endpoints.get(tenant_id).unwrap_or(&self.endpoint);
        expand_env_vars(raw)
    }
}

/// Wire format of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantFormat {
    Binary,
    #[default]
    Delimited,
}

/// A tenant identified by its device certificate subject.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantConfig {
    /// Certificate subject, matched exactly.
    pub subject: String,

    /// Tenant id used for credential lookup and backend routing.
    pub tenant_id: String,

    /// Display name; defaults to the tenant id.
    #[serde(default)]
    pub tenant_name: Option<String>,

    #[serde(default)]
    pub format: TenantFormat,

    /// Line layout for delimited tenants.
    #[serde(default)]
    pub layout: TextLayout,
}

impl TenantConfig {
    #[must_use]
    pub fn tenant_name(&self) -> &str {
        self.tenant_name.as_deref().unwrap_or(&self.tenant_id)
    }

    #[must_use]
    pub fn frame_format(&self) -> FrameFormat {
        match self.format {
            TenantFormat::Binary => FrameFormat::Binary,
            TenantFormat::Delimited => FrameFormat::Delimited(self.layout),
        }
    }
}

/// Devices belonging to one tenant.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantDevicesConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// A registered device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,

    /// Backend hub host the device authenticates against.
    pub hub_host_name: String,

    /// Shared access signature.
    /// Supports environment variable expansion: "${DEVICE_SAS}"
    pub sas_token: String,
}

impl DeviceConfig {
    /// Get the SAS token with environment variables expanded.
    #[must_use]
    pub fn sas_token(&self) -> String {
        expand_env_vars(&self.sas_token)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
pub fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:11000".to_string()
}

fn default_secure_listen_address() -> String {
    "0.0.0.0:11001".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_keep_alive_secs() -> u16 {
    120
}

fn default_max_message_size() -> usize {
    256 * 1024
}

fn default_max_pending_inbound_messages() -> usize {
    16
}

fn default_address_templates() -> Vec<String> {
    vec!["devices/{deviceId}/messages/events".to_string()]
}

fn default_backend_endpoint() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_connection_pool_size() -> usize {
    400
}

fn default_connection_idle_timeout_secs() -> u64 {
    210
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_connections: default_max_connections(),
            tls: None,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_keep_alive_timeout_secs: None,
            default_keep_alive_secs: default_keep_alive_secs(),
            service_property_prefix: String::new(),
            max_message_size: default_max_message_size(),
            max_pending_inbound_messages: default_max_pending_inbound_messages(),
            address_templates: default_address_templates(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_backend_endpoint(),
            tenant_endpoints: HashMap::new(),
            connection_pool_size: default_connection_pool_size(),
            connection_idle_timeout_secs: default_connection_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            gateway: GatewaySettings::default(),
            backend: BackendConfig::default(),
            tenants: Vec::new(),
            devices: Vec::new(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Configuration loading and validation

impl GatewayConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_address(&self.listen.address)?;
        if let Some(tls) = &self.listen.tls {
            validate_address(&tls.address)?;
        }
        validate_address(&self.backend.endpoint)?;

        if self.gateway.max_message_size < 2
            || self.gateway.max_message_size > MAX_ENCODABLE_MESSAGE_SIZE
        {
            return Err(ConfigError::OutOfRange {
                field: "gateway.max_message_size",
                expected: "between 2 and 268435460",
                actual: self.gateway.max_message_size as u64,
            });
        }

        if self.gateway.max_pending_inbound_messages == 0 {
            return Err(ConfigError::OutOfRange {
                field: "gateway.max_pending_inbound_messages",
                expected: "at least 1",
                actual: 0,
            });
        }

        if self.backend.connection_pool_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "backend.connection_pool_size",
                expected: "at least 1",
                actual: 0,
            });
        }

        AddressTemplates::parse(self.gateway.address_templates.as_slice())?;

        let mut subjects = HashSet::new();
        for tenant in &self.tenants {
            if tenant.tenant_id.trim().is_empty() {
                return Err(ConfigError::InvalidTenant {
                    tenant: tenant.subject.clone(),
                    message: "tenant_id must not be empty".to_string(),
                });
            }
            if !subjects.insert(tenant.subject.as_str()) {
                return Err(ConfigError::DuplicateTenantSubject(tenant.subject.clone()));
            }
        }

        for group in &self.devices {
            for device in &group.devices {
                if device.id.trim().is_empty() {
                    return Err(ConfigError::InvalidTenant {
                        tenant: group.tenant_id.clone(),
                        message: "device id must not be empty".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn validate_address(addr: &str) -> ConfigResult<()> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 || parts[1].is_empty() || parts[0].parse::<u16>().is_err() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    Ok(())
}
