//! Canonical packet model.
//!
//! Both frame decoders produce these types. The binary decoder builds them
//! directly from wire packets; the text layouts produce [`DeviceDataPacket`]s,
//! and the device topic stage pairs them with a synthesized [`ConnectPacket`].

pub mod buffer;

use std::fmt;

use crate::error::PacketError;

pub use buffer::{BufferLedger, PayloadBuffer};

/// Wire packet types. The signature byte carries the type in its high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Register = 1,
    DpsRegister = 2,
    Connect = 3,
    D2c = 4,
    C2d = 5,
    HeartBeat = 6,
    DeviceTwinUpdate = 7,
    FileUpload = 8,
    Disconnect = 9,
}

impl PacketType {
    /// Signature byte for this type (low nibble zero).
    #[must_use]
    pub fn signature(self) -> u8 {
        (self as u8) << 4
    }

    /// Strictly match a signature byte; a non-zero low nibble never matches.
    #[must_use]
    pub fn from_signature(signature: u8) -> Option<Self> {
        if signature & 0x0F != 0 {
            return None;
        }
        match signature >> 4 {
            1 => Some(Self::Register),
            2 => Some(Self::DpsRegister),
            3 => Some(Self::Connect),
            4 => Some(Self::D2c),
            5 => Some(Self::C2d),
            6 => Some(Self::HeartBeat),
            7 => Some(Self::DeviceTwinUpdate),
            8 => Some(Self::FileUpload),
            9 => Some(Self::Disconnect),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::DpsRegister => "DPS_REGISTER",
            Self::Connect => "CONNECT",
            Self::D2c => "D2C",
            Self::C2d => "C2D",
            Self::HeartBeat => "HEART_BEAT",
            Self::DeviceTwinUpdate => "DEVICE_TWIN_UPDATE",
            Self::FileUpload => "FILE_UPLOAD",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-empty device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate a device id. Surrounding whitespace is trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::EmptyDeviceId`] for blank input.
    pub fn parse(raw: &str) -> Result<Self, PacketError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PacketError::EmptyDeviceId);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for DeviceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DeviceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// CONNECT request, either read from the wire or synthesized from a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub device_id: DeviceId,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        username: impl Into<String>,
        password: impl Into<String>,
        keep_alive_secs: u16,
    ) -> Self {
        Self {
            device_id,
            username: username.into(),
            password: password.into(),
            keep_alive_secs,
        }
    }

    /// CONNECT carrying no credential; the identity provider decides the outcome.
    #[must_use]
    pub fn without_credential(device_id: DeviceId, keep_alive_secs: u16) -> Self {
        Self::new(device_id, "", "", keep_alive_secs)
    }

    #[must_use]
    pub fn has_credential(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Arrival order and device timestamp of a data packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    /// Per-connection arrival counter, starting at 1.
    pub sequence_number: u64,
    /// Device-reported timestamp token, when the format carries one.
    pub timestamp: Option<String>,
}

/// Device-to-cloud telemetry.
#[derive(Debug)]
pub struct DeviceDataPacket {
    pub device_id: DeviceId,
    pub destination_address: String,
    pub payload: PayloadBuffer,
    pub sequence: SequenceInfo,
}

impl DeviceDataPacket {
    #[must_use]
    pub fn new(device_id: DeviceId, payload: PayloadBuffer) -> Self {
        Self {
            device_id,
            destination_address: String::new(),
            payload,
            sequence: SequenceInfo::default(),
        }
    }

    /// Release the payload and drop the packet.
    pub fn release(self) {
        self.payload.release();
    }
}

/// A decoded packet.
#[derive(Debug)]
pub enum Packet {
    Connect(ConnectPacket),
    DeviceData(DeviceDataPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::DeviceData(_) => PacketType::D2c,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Connect(packet) => &packet.device_id,
            Self::DeviceData(packet) => &packet.device_id,
        }
    }
}

/// The unit handed to the connection state machine.
///
/// Either half may be absent: a bare CONNECT from the binary format, data
/// after the device is connected, or neither for a heartbeat.
#[derive(Debug, Default)]
pub struct PacketPair {
    pub connect: Option<ConnectPacket>,
    pub data: Option<DeviceDataPacket>,
}

impl PacketPair {
    #[must_use]
    pub fn new(connect: Option<ConnectPacket>, data: Option<DeviceDataPacket>) -> Self {
        Self { connect, data }
    }

    /// Activity-only event.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connect.is_none() && self.data.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_signature_round_trip() {
        for ty in [
            PacketType::Register,
            PacketType::DpsRegister,
            PacketType::Connect,
            PacketType::D2c,
            PacketType::C2d,
            PacketType::HeartBeat,
            PacketType::DeviceTwinUpdate,
            PacketType::FileUpload,
            PacketType::Disconnect,
        ] {
            assert_eq!(PacketType::from_signature(ty.signature()), Some(ty));
        }
        assert_eq!(PacketType::Connect.signature(), 0x30);
        assert_eq!(PacketType::D2c.signature(), 0x40);
    }

    #[test]
    fn test_signature_low_nibble_rejected() {
        assert_eq!(PacketType::from_signature(0x31), None);
        assert_eq!(PacketType::from_signature(0x00), None);
        assert_eq!(PacketType::from_signature(0xA0), None);
    }

    #[test]
    fn test_packet_type_display() {
        assert_eq!(PacketType::D2c.to_string(), "D2C");
        assert_eq!(PacketType::HeartBeat.to_string(), "HEART_BEAT");
    }

    #[test]
    fn test_device_id_rejects_blank() {
        assert_eq!(DeviceId::parse(""), Err(PacketError::EmptyDeviceId));
        assert_eq!(DeviceId::parse("  "), Err(PacketError::EmptyDeviceId));
        assert_eq!(DeviceId::parse(" dev42 ").unwrap().as_str(), "dev42");
    }

    #[test]
    fn test_connect_without_credential() {
        let connect = ConnectPacket::without_credential(DeviceId::parse("dev").unwrap(), 120);
        assert!(!connect.has_credential());
        assert_eq!(connect.keep_alive_secs, 120);
    }

    #[test]
    fn test_device_data_release() {
        let ledger = BufferLedger::new();
        let packet = DeviceDataPacket::new(
            DeviceId::parse("dev").unwrap(),
            ledger.allocate(Bytes::from_static(b"x")),
        );
        assert_eq!(Packet::DeviceData(packet).packet_type(), PacketType::D2c);
        assert_eq!(ledger.outstanding(), 0);
    }
}
