//! Positional field layouts for `~`-separated device lines.
//!
//! | layout            | tenant | timestamp | device | payload from |
//! |-------------------|--------|-----------|--------|--------------|
//! | `self_identifying`| 0      | 1         | 2      | 3            |
//! | `showcase`        | -      | 0         | 1      | 2            |
//!
//! Empty tokens are dropped before positions are assigned. Tokens from the
//! payload position onwards are rejoined with `~`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PacketError;
use crate::packet::DeviceId;

/// Field separator for text lines.
pub const FIELD_SEPARATOR: char = '~';

/// Minimum number of non-empty tokens in a valid line.
const MIN_TOKENS: usize = 3;

/// Text layout selected per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextLayout {
    /// Lines carry their own tenant id in the first field.
    #[default]
    SelfIdentifying,
    /// Tenant fixed by the certificate; payload wrapped in a JSON envelope.
    Showcase,
}

/// Fields extracted from one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    /// Tenant token, for layouts that carry one.
    pub tenant_token: Option<String>,
    pub timestamp: String,
    pub device_id: DeviceId,
    pub payload: String,
}

/// Reasons a single line is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("line is not valid UTF-8")]
    NotUtf8,

    #[error("expected at least 3 fields, found {0}")]
    TooFewTokens(usize),

    #[error("invalid device id: {0}")]
    DeviceId(#[from] PacketError),

    #[error("failed to build payload envelope: {0}")]
    Envelope(String),
}

struct Positions {
    tenant: Option<usize>,
    timestamp: usize,
    device: usize,
    payload: usize,
}

impl TextLayout {
    fn positions(self) -> Positions {
        match self {
            Self::SelfIdentifying => Positions {
                tenant: Some(0),
                timestamp: 1,
                device: 2,
                payload: 3,
            },
            Self::Showcase => Positions {
                tenant: None,
                timestamp: 0,
                device: 1,
                payload: 2,
            },
        }
    }

    /// Decode one line. `tenant_name` is embedded by layouts that wrap the payload.
    ///
    /// # Errors
    ///
    /// Returns a [`LayoutError`] when the line cannot produce a packet.
    pub fn decode(self, line: &[u8], tenant_name: &str) -> Result<DecodedLine, LayoutError> {
        let text = std::str::from_utf8(line).map_err(|_| LayoutError::NotUtf8)?;
        let tokens: Vec<&str> = text
            .split(FIELD_SEPARATOR)
            .filter(|token| !token.is_empty())
            .collect();

        if tokens.len() < MIN_TOKENS {
            return Err(LayoutError::TooFewTokens(tokens.len()));
        }

        let positions = self.positions();
        let device_id = DeviceId::parse(tokens[positions.device])?;
        let timestamp = tokens[positions.timestamp].to_string();
        let data = tokens
            .get(positions.payload..)
            .map(|rest| rest.join("~"))
            .unwrap_or_default();

        let payload = match self {
            Self::SelfIdentifying => data,
            Self::Showcase => serde_json::to_string(&serde_json::json!({
                "ts": timestamp,
                "tenantId": tenant_name,
                "deviceId": device_id.as_str(),
                "data": data,
            }))
            .map_err(|e| LayoutError::Envelope(e.to_string()))?,
        };

        Ok(DecodedLine {
            tenant_token: positions.tenant.map(|index| tokens[index].to_string()),
            timestamp,
            device_id,
            payload,
        })
    }
}
