//! Length-prefixed framing.
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 length, BE | payload (length bytes)    |
//! +----------------+---------------------------+
//! ```
//!
//! The reader rejects `length == 0` and `length > MAX_MESSAGE_SIZE` before
//! allocating anything for the payload. A short read at any point is a
//! closed connection, never a partial delivery.

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Largest payload accepted from a peer (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

/// Encode `payload` as a single contiguous frame.
///
/// The only limit on the sending side is what the 4-byte header can
/// describe.
pub fn encode(payload: &[u8]) -> io::Result<Bytes> {
    let length = frame_len(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(length);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

fn frame_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {len} bytes does not fit a frame header"),
        )
    })
}

/// Write one frame to `writer` with a single `write_all`.
pub fn write_frame<W: Write>(mut writer: W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode(payload)?)?;
    writer.flush()
}

/// Read exactly one frame from `reader`.
pub fn read_frame<R: Read>(mut reader: R) -> Result<Message, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    read_full(&mut reader, &mut header)?;

    let length = u32::from_be_bytes(header);
    if length == 0 {
        return Err(FrameError::ZeroLength);
    }
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = BytesMut::zeroed(length as usize);
    read_full(&mut reader, &mut payload)?;

    Ok(Message {
        payload: payload.freeze(),
    })
}

/// Loop until `buf` is filled. EOF before that is `FrameError::Closed`.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::Closed),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
