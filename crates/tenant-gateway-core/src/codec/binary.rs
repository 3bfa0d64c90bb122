//! Length-framed binary packet codec.
//!
//! Frame layout:
//! - 1 byte: signature (packet type in the high nibble, low nibble zero)
//! - 1-4 bytes: remaining length, 7 bits per byte, high bit set on all but the last
//! - N bytes: packet body
//!
//! Bodies use big-endian `u16` length-prefixed UTF-8 strings:
//! - CONNECT: device id, username, password, then a `u16` keep-alive in seconds
//! - D2C: device id, then the raw payload up to the end of the frame
//!
//! Other known packet types are recognised and skipped. Decoding never consumes
//! bytes from the source buffer until a whole frame is available, so a frame
//! split across reads decodes identically to one delivered in a single chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::FrameError;
use crate::packet::{BufferLedger, ConnectPacket, DeviceDataPacket, DeviceId, Packet, PacketType};

use super::Frame;

/// Default maximum frame size (256 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum number of bytes in the remaining-length field.
const MAX_LENGTH_FIELD_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Ready,
    Failed,
}

/// Codec for the binary device protocol.
///
/// After the first framing error the codec enters a failed state and discards
/// everything it is given; it never tries to resynchronise.
#[derive(Debug, Clone)]
pub struct BinaryPacketCodec {
    max_message_size: usize,
    state: DecoderState,
    ledger: BufferLedger,
}

impl BinaryPacketCodec {
    /// Create a codec with the default maximum message size.
    #[must_use]
    pub fn new(ledger: BufferLedger) -> Self {
        Self::with_max_message_size(ledger, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a codec with a custom maximum message size.
    #[must_use]
    pub fn with_max_message_size(ledger: BufferLedger, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: DecoderState::Ready,
            ledger,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == DecoderState::Failed
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let signature = src[0];
        let Some((remaining, length_bytes)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        let frame_size = 1 + length_bytes + remaining;
        if frame_size > self.max_message_size {
            return Err(FrameError::MessageTooBig {
                size: frame_size,
                max: self.max_message_size,
            });
        }

        if src.len() < frame_size {
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        let packet_type =
            PacketType::from_signature(signature).ok_or(FrameError::UnknownSignature(signature))?;

        src.advance(1 + length_bytes);
        let body = src.split_to(remaining).freeze();

        self.build_frame(packet_type, body).map(Some)
    }

    fn build_frame(&self, packet_type: PacketType, mut body: Bytes) -> Result<Frame, FrameError> {
        match packet_type {
            PacketType::Connect => {
                let device_id = read_device_id(&mut body, "CONNECT")?;
                let username = read_string(&mut body, "CONNECT")?;
                let password = read_string(&mut body, "CONNECT")?;
                if body.remaining() < 2 {
                    return Err(FrameError::Malformed {
                        packet: "CONNECT",
                        message: "missing keep-alive".to_string(),
                    });
                }
                let keep_alive_secs = body.get_u16();
                if body.has_remaining() {
                    return Err(FrameError::TrailingBytes(body.remaining()));
                }
                Ok(Frame::Packet(Packet::Connect(ConnectPacket::new(
                    device_id,
                    username,
                    password,
                    keep_alive_secs,
                ))))
            }
            PacketType::D2c => {
                let device_id = read_device_id(&mut body, "D2C")?;
                let payload = self.ledger.allocate(body);
                Ok(Frame::Packet(Packet::DeviceData(DeviceDataPacket::new(
                    device_id, payload,
                ))))
            }
            PacketType::HeartBeat => Ok(Frame::Heartbeat),
            other => {
                debug!(packet_type = %other, len = body.len(), "skipping unsupported packet");
                Ok(Frame::Skipped(other))
            }
        }
    }
}

impl Decoder for BinaryPacketCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.state == DecoderState::Failed {
            src.clear();
            return Ok(None);
        }

        match self.decode_frame(src) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.state = DecoderState::Failed;
                src.clear();
                Err(err)
            }
        }
    }
}

impl Encoder<&Packet> for BinaryPacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match item {
            Packet::Connect(connect) => {
                put_string(&mut body, connect.device_id.as_str())?;
                put_string(&mut body, &connect.username)?;
                put_string(&mut body, &connect.password)?;
                body.put_u16(connect.keep_alive_secs);
            }
            Packet::DeviceData(data) => {
                put_string(&mut body, data.device_id.as_str())?;
                body.extend_from_slice(data.payload.bytes());
            }
        }

        let length_field = encode_remaining_length(body.len())?;
        let frame_size = 1 + length_field.len() + body.len();
        if frame_size > self.max_message_size {
            return Err(FrameError::MessageTooBig {
                size: frame_size,
                max: self.max_message_size,
            });
        }

        dst.reserve(frame_size);
        dst.put_u8(item.packet_type().signature());
        dst.extend_from_slice(&length_field);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Decode the remaining-length field.
///
/// Returns the value and the number of bytes it occupied, or `None` when more
/// input is needed.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, byte) in buf.iter().take(MAX_LENGTH_FIELD_BYTES).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= MAX_LENGTH_FIELD_BYTES {
        Err(FrameError::LengthTooLarge)
    } else {
        Ok(None)
    }
}

fn encode_remaining_length(mut value: usize) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(MAX_LENGTH_FIELD_BYTES);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
        if out.len() == MAX_LENGTH_FIELD_BYTES {
            return Err(FrameError::LengthTooLarge);
        }
    }
    Ok(out)
}

fn read_string(body: &mut Bytes, packet: &'static str) -> Result<String, FrameError> {
    if body.remaining() < 2 {
        return Err(FrameError::Malformed {
            packet,
            message: "truncated string length".to_string(),
        });
    }
    let len = usize::from(body.get_u16());
    if body.remaining() < len {
        return Err(FrameError::Malformed {
            packet,
            message: format!("string of {len} bytes overruns body"),
        });
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| FrameError::Malformed {
        packet,
        message: e.to_string(),
    })
}

fn read_device_id(body: &mut Bytes, packet: &'static str) -> Result<DeviceId, FrameError> {
    let raw = read_string(body, packet)?;
    DeviceId::parse(&raw).map_err(|e| FrameError::Malformed {
        packet,
        message: e.to_string(),
    })
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<(), FrameError> {
    let len = u16::try_from(value.len()).map_err(|_| FrameError::Malformed {
        packet: "string",
        message: format!("{} bytes exceeds u16 length prefix", value.len()),
    })?;
    dst.put_u16(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_frame(device: &str, keep_alive: u16) -> BytesMut {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let packet = Packet::Connect(ConnectPacket::new(
            DeviceId::parse(device).unwrap(),
            format!("hub.example.net/{device}"),
            "SharedAccessSignature sr=x",
            keep_alive,
        ));
        let mut buf = BytesMut::new();
        codec.encode(&packet, &mut buf).unwrap();
        buf
    }

    fn d2c_frame(device: &str, payload: &[u8]) -> BytesMut {
        let ledger = BufferLedger::new();
        let mut codec = BinaryPacketCodec::new(ledger.clone());
        let packet = Packet::DeviceData(DeviceDataPacket::new(
            DeviceId::parse(device).unwrap(),
            ledger.allocate(Bytes::copy_from_slice(payload)),
        ));
        let mut buf = BytesMut::new();
        codec.encode(&packet, &mut buf).unwrap();
        buf
    }

    fn expect_connect(frame: Frame) -> ConnectPacket {
        match frame {
            Frame::Packet(Packet::Connect(connect)) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    fn expect_data(frame: Frame) -> DeviceDataPacket {
        match frame {
            Frame::Packet(Packet::DeviceData(data)) => data,
            other => panic!("expected D2C, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_connect() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = connect_frame("dev42", 60);

        let connect = expect_connect(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(connect.device_id, "dev42");
        assert_eq!(connect.username, "hub.example.net/dev42");
        assert_eq!(connect.keep_alive_secs, 60);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_d2c_payload() {
        let ledger = BufferLedger::new();
        let mut codec = BinaryPacketCodec::new(ledger.clone());
        let mut buf = d2c_frame("dev42", b"temp=21");

        let data = expect_data(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(data.device_id, "dev42");
        assert_eq!(data.payload.bytes().as_ref(), b"temp=21");
        assert_eq!(ledger.outstanding(), 1);
        data.release();
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_decode_needs_two_bytes() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::from(&[0x40u8][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_decode_incomplete_length_field() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::from(&[0x40u8, 0x80, 0x80][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0x40, 0x80, 0x80]);
    }

    #[test]
    fn test_decode_incomplete_body_keeps_bytes() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let full = d2c_frame("dev42", b"temp=21");
        let mut buf = BytesMut::from(&full[..full.len() - 3]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &full[..full.len() - 3]);

        buf.extend_from_slice(&full[full.len() - 3..]);
        let data = expect_data(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(data.payload.bytes().as_ref(), b"temp=21");
    }

    #[test]
    fn test_fifth_length_byte_rejected() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::from(&[0x40u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::LengthTooLarge));
        assert!(codec.is_failed());
    }

    #[test]
    fn test_max_message_size_boundary() {
        // 1 signature + 2 length bytes + 197 body = 200
        let payload = vec![b'x'; 197 - 2 - 3];
        let exact = d2c_frame("dev", &payload);
        assert_eq!(exact.len(), 200);

        let mut codec = BinaryPacketCodec::with_max_message_size(BufferLedger::new(), 200);
        let mut buf = exact.clone();
        assert!(codec.decode(&mut buf).unwrap().is_some());

        let payload = vec![b'x'; 198 - 2 - 3];
        let over = d2c_frame("dev", &payload);
        assert_eq!(over.len(), 201);

        let mut codec = BinaryPacketCodec::with_max_message_size(BufferLedger::new(), 200);
        let mut buf = over;
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooBig { size: 201, max: 200 }));
    }

    #[test]
    fn test_unknown_signature_is_fatal() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::from(&[0xA0u8, 0x01, 0x00][..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnknownSignature(0xA0)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_failed_state_discards_input() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::from(&[0x31u8, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = connect_frame("dev42", 60);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connect_trailing_bytes_rejected() {
        let mut frame = connect_frame("dev", 30);
        // bump the remaining length by one and append a stray byte
        frame[1] += 1;
        frame.put_u8(0);

        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let err = codec.decode(&mut frame).unwrap_err();
        assert!(matches!(err, FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_heartbeat_and_skipped_types() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::HeartBeat.signature());
        buf.put_u8(0);
        buf.put_u8(PacketType::Register.signature());
        buf.put_u8(2);
        buf.put_u16(7);

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Heartbeat)));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Skipped(PacketType::Register))
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = BinaryPacketCodec::new(BufferLedger::new());
        let mut buf = connect_frame("dev42", 60);
        buf.extend_from_slice(&d2c_frame("dev42", b"a"));
        buf.extend_from_slice(&d2c_frame("dev42", b"b"));

        expect_connect(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(expect_data(codec.decode(&mut buf).unwrap().unwrap()).payload.bytes().as_ref(), b"a");
        assert_eq!(expect_data(codec.decode(&mut buf).unwrap().unwrap()).payload.bytes().as_ref(), b"b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_remaining_length_encoding() {
        assert_eq!(encode_remaining_length(0).unwrap(), vec![0x00]);
        assert_eq!(encode_remaining_length(127).unwrap(), vec![0x7F]);
        assert_eq!(encode_remaining_length(128).unwrap(), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(268_435_455).unwrap(), vec![0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(encode_remaining_length(268_435_456).is_err());
        assert_eq!(decode_remaining_length(&[0x80, 0x01]).unwrap(), Some((128, 2)));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A frame split at arbitrary points decodes to the same packet as the whole frame.
        #[test]
        fn prop_split_delivery_matches_whole(
            payload in proptest::collection::vec(any::<u8>(), 0..600),
            cuts in proptest::collection::vec(any::<usize>(), 1..6),
        ) {
            let ledger = BufferLedger::new();
            let mut encoder = BinaryPacketCodec::new(ledger.clone());
            let packet = Packet::DeviceData(DeviceDataPacket::new(
                DeviceId::parse("dev42").unwrap(),
                ledger.allocate(Bytes::from(payload.clone())),
            ));
            let mut wire = BytesMut::new();
            encoder.encode(&packet, &mut wire).unwrap();
            let wire = wire.freeze();

            let mut points: Vec<usize> = cuts.iter().map(|c| c % (wire.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut codec = BinaryPacketCodec::new(ledger.clone());
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(wire.len())) {
                buf.extend_from_slice(&wire[start..point]);
                start = point;
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame);
                }
            }

            prop_assert_eq!(decoded.len(), 1);
            prop_assert!(buf.is_empty());
            match decoded.pop() {
                Some(Frame::Packet(Packet::DeviceData(data))) => {
                    prop_assert_eq!(data.device_id.as_str(), "dev42");
                    prop_assert_eq!(data.payload.bytes().as_ref(), &payload[..]);
                }
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }
    }
}
