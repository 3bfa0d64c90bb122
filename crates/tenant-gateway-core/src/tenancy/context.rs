//! Resolved tenancy of one connection.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::auth::DeviceIdentity;
use crate::bridge::{BridgeFactory, MessagingBridge};
use crate::codec::{FrameDecoder, FrameFormat, TextLayout};
use crate::error::GatewayError;
use crate::packet::{BufferLedger, DeviceDataPacket, SequenceInfo};

/// Evidence the tenant was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustInfo {
    /// Nothing known yet.
    None,
    /// TLS client certificate.
    Certificate { subject: String, thumbprint: String },
    /// Tenant token carried in the device payload.
    PayloadToken(String),
}

/// Tenant id, name and trust evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantInfo {
    pub tenant_id: String,
    pub tenant_name: String,
    pub trust: TrustInfo,
}

impl TenantInfo {
    fn from_payload(token: &str) -> Self {
        Self {
            tenant_id: token.to_string(),
            tenant_name: token.to_string(),
            trust: TrustInfo::PayloadToken(token.to_string()),
        }
    }
}

enum TenantSlot {
    Fixed(TenantInfo),
    /// Filled from the first decoded line, then frozen.
    Delayed(OnceLock<TenantInfo>),
}

/// The tenancy bound to a connection.
///
/// Created at most once per connection. A delayed context learns its tenant
/// from the first line that decodes and never changes afterwards.
pub struct TenancyContext {
    tenant: TenantSlot,
    format: FrameFormat,
    max_message_size: usize,
    bridges: Arc<dyn BridgeFactory>,
}

impl TenancyContext {
    /// Tenancy fixed at resolution time.
    #[must_use]
    pub fn fixed(
        tenant: TenantInfo,
        format: FrameFormat,
        max_message_size: usize,
        bridges: Arc<dyn BridgeFactory>,
    ) -> Self {
        Self {
            tenant: TenantSlot::Fixed(tenant),
            format,
            max_message_size,
            bridges,
        }
    }

    /// Self-identifying text tenancy, back-filled from content.
    #[must_use]
    pub fn delayed(max_message_size: usize, bridges: Arc<dyn BridgeFactory>) -> Self {
        Self {
            tenant: TenantSlot::Delayed(OnceLock::new()),
            format: FrameFormat::Delimited(TextLayout::SelfIdentifying),
            max_message_size,
            bridges,
        }
    }

    fn info(&self) -> Option<&TenantInfo> {
        match &self.tenant {
            TenantSlot::Fixed(info) => Some(info),
            TenantSlot::Delayed(cell) => cell.get(),
        }
    }

    /// Tenant id; empty while a delayed tenant is still unknown.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        self.info().map_or("", |info| info.tenant_id.as_str())
    }

    #[must_use]
    pub fn tenant_name(&self) -> &str {
        self.info().map_or("", |info| info.tenant_name.as_str())
    }

    #[must_use]
    pub fn trust_info(&self) -> &TrustInfo {
        self.info().map_or(&TrustInfo::None, |info| &info.trust)
    }

    #[must_use]
    pub fn is_delayed(&self) -> bool {
        matches!(self.tenant, TenantSlot::Delayed(_))
    }

    #[must_use]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Fresh frame decoder for this tenant's wire format.
    #[must_use]
    pub fn frame_decoder(&self, ledger: BufferLedger) -> FrameDecoder {
        self.format.decoder(ledger, self.max_message_size)
    }

    /// Decode one text line into a device data packet.
    ///
    /// Returns `None` when the line is dropped. The first line that decodes
    /// fills a delayed tenant.
    pub fn decode_line(&self, line: &[u8], ledger: &BufferLedger) -> Option<DeviceDataPacket> {
        let FrameFormat::Delimited(layout) = self.format else {
            warn!("Text line received by a binary tenant");
            return None;
        };

        let decoded = match layout.decode(line, self.tenant_name()) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, len = line.len(), "Dropping undecodable line");
                return None;
            }
        };

        if let (TenantSlot::Delayed(cell), Some(token)) = (&self.tenant, &decoded.tenant_token) {
            let info = cell.get_or_init(|| TenantInfo::from_payload(token));
            if info.tenant_id != *token {
                warn!(
                    tenant_id = %info.tenant_id,
                    line_tenant = %token,
                    "Line names a different tenant; keeping the first"
                );
            }
        }

        let mut packet =
            DeviceDataPacket::new(decoded.device_id, ledger.allocate(decoded.payload.into_bytes()));
        packet.sequence = SequenceInfo {
            sequence_number: 0,
            timestamp: Some(decoded.timestamp),
        };
        Some(packet)
    }

    /// Create the messaging bridge for an authenticated device of this tenant.
    ///
    /// # Errors
    ///
    /// Propagates the bridge factory's error.
    pub async fn create_bridge(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn MessagingBridge>, GatewayError> {
        self.bridges.create_bridge(self.tenant_id(), identity).await
    }
}

impl fmt::Debug for TenancyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenancyContext")
            .field("tenant_id", &self.tenant_id())
            .field("delayed", &self.is_delayed())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
