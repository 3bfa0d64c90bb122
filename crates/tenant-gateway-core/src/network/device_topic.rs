//! Device topic stage: frames in, `{Connect, DeviceData}` pairs out.
//!
//! Binds the outbound address of every data packet and, while the adapter
//! still needs a CONNECT, synthesizes one from the stored device credential.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::auth::DeviceCredentialProvider;
use crate::bridge::AddressTemplates;
use crate::codec::Frame;
use crate::packet::{BufferLedger, ConnectPacket, DeviceDataPacket, DeviceId, Packet, PacketPair};
use crate::tenancy::TenancyContext;

/// Per-connection device topic decoder.
#[derive(Debug)]
pub struct DeviceTopicDecoder {
    credentials: Arc<dyn DeviceCredentialProvider>,
    templates: Arc<AddressTemplates>,
    ledger: BufferLedger,
    default_keep_alive_secs: u16,
    next_sequence: u64,
}

impl DeviceTopicDecoder {
    #[must_use]
    pub fn new(
        credentials: Arc<dyn DeviceCredentialProvider>,
        templates: Arc<AddressTemplates>,
        ledger: BufferLedger,
        default_keep_alive_secs: u16,
    ) -> Self {
        Self {
            credentials,
            templates,
            ledger,
            default_keep_alive_secs,
            next_sequence: 1,
        }
    }

    /// Turn one frame into a packet pair.
    ///
    /// `needs_connect` is false once the adapter has started a CONNECT, in
    /// which case no credential lookup happens. Returns `None` for frames that
    /// produce nothing.
    pub async fn decode(
        &mut self,
        frame: Frame,
        tenancy: &TenancyContext,
        needs_connect: bool,
    ) -> Option<PacketPair> {
        match frame {
            Frame::Line(line) => {
                let packet = tenancy.decode_line(&line, &self.ledger)?;
                Some(self.with_connect(packet, tenancy, needs_connect).await)
            }
            Frame::Packet(Packet::Connect(connect)) => Some(PacketPair::new(Some(connect), None)),
            Frame::Packet(Packet::DeviceData(packet)) => {
                Some(self.with_connect(packet, tenancy, needs_connect).await)
            }
            Frame::Heartbeat => Some(PacketPair::heartbeat()),
            Frame::Skipped(packet_type) => {
                trace!(packet_type = %packet_type, "Ignoring packet");
                None
            }
        }
    }

    async fn with_connect(
        &mut self,
        mut packet: DeviceDataPacket,
        tenancy: &TenancyContext,
        needs_connect: bool,
    ) -> PacketPair {
        if packet.destination_address.is_empty() {
            packet.destination_address = self.bind_address(&packet.device_id, tenancy);
        }
        packet.sequence.sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let connect = if needs_connect {
            Some(self.synthesize_connect(&packet.device_id, tenancy).await)
        } else {
            None
        };
        PacketPair::new(connect, Some(packet))
    }

    fn bind_address(&self, device_id: &DeviceId, tenancy: &TenancyContext) -> String {
        self.templates.resolve(&[
            ("deviceId", device_id.as_str()),
            ("tenantId", tenancy.tenant_id()),
        ])
    }

    async fn synthesize_connect(
        &self,
        device_id: &DeviceId,
        tenancy: &TenancyContext,
    ) -> ConnectPacket {
        match self
            .credentials
            .get_credential(tenancy.tenant_id(), device_id.as_str())
            .await
        {
            Some(credential) => ConnectPacket::new(
                device_id.clone(),
                credential.username,
                credential.password,
                self.default_keep_alive_secs,
            ),
            None => {
                debug!(
                    tenant_id = %tenancy.tenant_id(),
                    device_id = %device_id,
                    "No stored credential, connecting with an empty one"
                );
                ConnectPacket::without_credential(device_id.clone(), self.default_keep_alive_secs)
            }
        }
    }
}
