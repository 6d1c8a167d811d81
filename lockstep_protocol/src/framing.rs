// Length-delimited framing of protocol messages.
//
// Wire format: a 4-byte big-endian length prefix followed by the
// JSON-serialized message. `encode_frame` / `write_frame` / `read_frame` do
// the JSON step as well, so callers deal in `ClientMessage` /
// `ServerMessage` values directly; `read_raw_frame` exists for callers that
// want the undecoded payload.
//
// `MAX_FRAME_SIZE` (16 MB) bounds allocation from a hostile or corrupt length
// prefix. Session snapshots for joining peers are the largest frames.
//
// Everything reports `io::Error`: JSON failures are folded into
// `InvalidData` so a reader loop has a single error path for "this peer is
// broken".

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Serialize `msg` and prepend the length prefix.
pub fn encode_frame<M: Serialize>(msg: &M) -> io::Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg).map_err(io::Error::from)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                    payload.len()
                ),
            )
        })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one framed message and flush.
pub fn write_frame<W: Write, M: Serialize>(writer: &mut W, msg: &M) -> io::Result<()> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one frame's payload without decoding it.
///
/// A stream that closes before or inside a frame yields `UnexpectedEof`; an
/// oversized length prefix yields `InvalidData`.
pub fn read_raw_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Read and decode one framed message.
pub fn read_frame<R: Read, M: DeserializeOwned>(reader: &mut R) -> io::Result<M> {
    let payload = read_raw_frame(reader)?;
    serde_json::from_slice(&payload).map_err(io::Error::from)
}
