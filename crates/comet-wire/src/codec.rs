// Incremental frame reassembly over an append-only read buffer.
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{DEFAULT_MAX_FRAME_BYTES, Frame, FrameError, LENGTH_PREFIX_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingLength,
    AwaitingPayload(usize),
}

/// Streaming decoder for length-prefixed payloads.
///
/// Bytes are appended to a caller-owned buffer as they arrive; each call to
/// [`FrameDecoder::decode`] consumes at most one complete frame and leaves any
/// partial frame in place for the next read.
///
/// ```
/// use bytes::BytesMut;
/// use comet_wire::FrameDecoder;
///
/// let mut decoder = FrameDecoder::default();
/// let mut buf = BytesMut::from(&b"\x00\x00\x00\x02hi\x00\x00"[..]);
/// assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some(&b"hi"[..]));
/// assert_eq!(decoder.decode(&mut buf).unwrap(), None);
/// assert_eq!(buf.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            state: DecodeState::AwaitingLength,
            max_frame_bytes,
        }
    }

    /// True when no partial frame header has been consumed.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingLength
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::AwaitingLength => {
                    if buf.len() < LENGTH_PREFIX_LEN {
                        buf.reserve(LENGTH_PREFIX_LEN - buf.len());
                        return Ok(None);
                    }
                    let length = buf.get_u32() as usize;
                    // Refuse before reserving space for the payload.
                    if length > self.max_frame_bytes {
                        return Err(FrameError::TooLarge {
                            length,
                            max: self.max_frame_bytes,
                        });
                    }
                    self.state = DecodeState::AwaitingPayload(length);
                }
                DecodeState::AwaitingPayload(length) => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some(buf.split_to(length).freeze()));
                }
            }
        }
    }
}

/// `tokio_util` codec pairing [`FrameDecoder`] with the length-prefix encoder.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame_bytes),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        self.decoder.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decoder.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // A clean close never leaves a dangling partial frame.
            None if src.is_empty() && self.decoder.is_idle() => Ok(None),
            None => Err(FrameError::Incomplete),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        Frame::new(payload)?.encode_into(dst);
        Ok(())
    }
}
