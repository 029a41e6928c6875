// Wire format for the VOEvent transport: a 4-byte big-endian length followed
// by exactly that many bytes of XML payload.
use bytes::{BufMut, Bytes, BytesMut};

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, FrameDecoder};
pub use message::{Message, ParseError, Role, TransportMessage, VOEVENT_ROLES};

pub type Result<T> = std::result::Result<T, FrameError>;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default cap on a single payload; anything larger is refused before allocation.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame too large: {length} bytes (cap {max})")]
    TooLarge { length: usize, max: usize },
    #[error("payload does not fit a u32 length prefix: {0} bytes")]
    LengthOverflow(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("transport io error")]
    Io(#[from] std::io::Error),
}

/// A single length-prefixed payload, as written by [`FrameCodec`].
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use comet_wire::Frame;
///
/// let frame = Frame::new(Bytes::from_static(b"<x/>")).expect("frame");
/// let mut buf = BytesMut::new();
/// frame.encode_into(&mut buf);
/// assert_eq!(&buf[..4], &[0, 0, 0, 4]);
/// assert_eq!(buf.len(), frame.encoded_len());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if u32::try_from(payload.len()).is_err() {
            return Err(FrameError::LengthOverflow(payload.len()));
        }
        Ok(Self { payload })
    }

    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }
}
