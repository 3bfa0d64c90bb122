//! Line framing for the text tenant formats.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};

use crate::error::FrameError;

use super::binary::DEFAULT_MAX_MESSAGE_SIZE;

/// Splits the inbound stream on `\n`, stripping the delimiter and any `\r`.
///
/// An over-long line yields [`FrameError::LineTooLong`] once; the codec then
/// skips the rest of that line and carries on with the next one.
#[derive(Debug, Clone)]
pub struct LineFrameDecoder {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl LineFrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_MESSAGE_SIZE)
    }

    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
        }
    }
}

impl Default for LineFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFrameDecoder {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(Some(mut line)) => {
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(line))
            }
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                Err(FrameError::LineTooLong(self.max_length))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(FrameError::Io(e)),
        }
    }
}
