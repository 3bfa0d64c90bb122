//! Tenant-specific frame decoders.
//!
//! A connection uses exactly one [`FrameDecoder`], chosen when its tenancy is
//! resolved:
//!
//! - [`BinaryPacketCodec`] for length-framed binary packets
//! - [`LineFrameDecoder`] for `~`-separated text lines, decoded by a [`TextLayout`]

pub mod binary;
pub mod delimited;
pub mod layout;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FrameError;
use crate::packet::{BufferLedger, Packet, PacketType};

pub use binary::{BinaryPacketCodec, DEFAULT_MAX_MESSAGE_SIZE};
pub use delimited::LineFrameDecoder;
pub use layout::{DecodedLine, LayoutError, TextLayout, FIELD_SEPARATOR};

/// One unit produced by a frame decoder.
#[derive(Debug)]
pub enum Frame {
    /// A decoded binary packet.
    Packet(Packet),
    /// Liveness-only binary packet.
    Heartbeat,
    /// A recognised binary packet type the gateway does not handle.
    Skipped(PacketType),
    /// One text line, delimiter stripped.
    Line(Bytes),
}

/// Wire format a tenant speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Binary,
    Delimited(TextLayout),
}

impl FrameFormat {
    /// Build a fresh decoder for one connection.
    #[must_use]
    pub fn decoder(self, ledger: BufferLedger, max_message_size: usize) -> FrameDecoder {
        match self {
            Self::Binary => FrameDecoder::Binary(BinaryPacketCodec::with_max_message_size(
                ledger,
                max_message_size,
            )),
            Self::Delimited(_) => {
                FrameDecoder::Delimited(LineFrameDecoder::with_max_length(max_message_size))
            }
        }
    }
}

/// The decoder installed in a connection's stage chain.
#[derive(Debug)]
pub enum FrameDecoder {
    Binary(BinaryPacketCodec),
    Delimited(LineFrameDecoder),
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            Self::Binary(codec) => codec.decode(src),
            Self::Delimited(decoder) => Ok(decoder.decode(src)?.map(Frame::Line)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selects_decoder() {
        let ledger = BufferLedger::new();
        assert!(matches!(
            FrameFormat::Binary.decoder(ledger.clone(), 1024),
            FrameDecoder::Binary(_)
        ));
        assert!(matches!(
            FrameFormat::Delimited(TextLayout::Showcase).decoder(ledger, 1024),
            FrameDecoder::Delimited(_)
        ));
    }

    #[test]
    fn test_delimited_yields_lines() {
        let mut decoder =
            FrameFormat::Delimited(TextLayout::SelfIdentifying).decoder(BufferLedger::new(), 1024);
        let mut buf = BytesMut::from("T1~ts~dev~x\n");
        match decoder.decode(&mut buf).unwrap() {
            Some(Frame::Line(line)) => assert_eq!(line.as_ref(), b"T1~ts~dev~x"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
