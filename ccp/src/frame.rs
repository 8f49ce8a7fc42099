//! Length-prefixed frame codec: a 3-byte big-endian length followed by that
//! many bytes of payload.
//!
//! Reads distinguish a clean close at a frame boundary (nothing read yet for
//! this frame) from a short read mid-frame: the former is the peer hanging
//! up normally, the latter is always a transport error, never silently
//! truncated.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::error::CcpError;

/// Number of bytes in the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 3;

/// Largest payload a 3-byte big-endian length prefix can express.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Prepends the 3-byte length prefix to `payload`.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, CcpError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CcpError::FrameTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    let len_bytes = (payload.len() as u32).to_be_bytes();
    buf.extend_from_slice(&len_bytes[1..]);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads exactly one frame. `Ok(None)` means the peer closed the connection
/// cleanly before sending any bytes of a new frame; anything else that
/// prevents a full frame from arriving is reported as
/// [`CcpError::Transport`].
pub fn read_frame(mut stream: &TcpStream) -> Result<Option<Vec<u8>>, CcpError> {
    let mut length_buf = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0usize;
    while filled < LENGTH_PREFIX_LEN {
        match stream.read(&mut length_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CcpError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid length-prefix",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CcpError::Transport(e)),
        }
    }

    let length = u32::from_be_bytes([0, length_buf[0], length_buf[1], length_buf[2]]) as usize;
    let mut payload = vec![0u8; length];
    let mut filled = 0usize;
    while filled < length {
        match stream.read(&mut payload[filled..]) {
            Ok(0) => {
                return Err(CcpError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid payload",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CcpError::Transport(e)),
        }
    }
    Ok(Some(payload))
}

/// Writes exactly one frame. A zero-byte short write on a still-open socket
/// surfaces as [`io::ErrorKind::WriteZero`] from `write_all`, which is
/// reported as [`CcpError::Transport`] like any other write failure.
pub fn write_frame(mut stream: &TcpStream, payload: &[u8]) -> Result<(), CcpError> {
    let buf = encode(payload)?;
    stream.write_all(&buf).map_err(CcpError::Transport)
}
