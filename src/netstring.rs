//! Netstring framing for worker sockets
//!
//! Each frame is `<decimal length>":"<payload>","`. The zero-length frame
//! (`0:,`) is the end-of-stream sentinel in both directions; the codec
//! carries it through as an empty payload and leaves interpretation to the
//! caller.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WorkerError;

/// Upper bound on a single frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest length prefix the decoder will accumulate before giving up.
const MAX_LENGTH_DIGITS: usize = 10;

/// Codec for netstring frames over a worker socket.
#[derive(Debug, Default)]
pub struct NetstringCodec;

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = WorkerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WorkerError> {
        let colon = match src.iter().position(|&b| b == b':') {
            Some(pos) => pos,
            None => {
                if src.len() > MAX_LENGTH_DIGITS {
                    return Err(WorkerError::Protocol(
                        "netstring length prefix too long".to_string(),
                    ));
                }
                return Ok(None);
            }
        };

        let prefix = &src[..colon];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(WorkerError::Protocol(
                "invalid netstring length prefix".to_string(),
            ));
        }
        let len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WorkerError::Protocol("invalid netstring length prefix".to_string()))?;
        if len > MAX_FRAME_SIZE {
            return Err(WorkerError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_SIZE
            )));
        }

        // length prefix + ':' + payload + ','
        let total = colon + 1 + len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        if src[colon + 1 + len] != b',' {
            return Err(WorkerError::Protocol(
                "netstring frame missing trailing comma".to_string(),
            ));
        }

        src.advance(colon + 1);
        let payload = src.split_to(len).freeze();
        src.advance(1);
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = WorkerError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WorkerError> {
        let header = format!("{}:", item.len());
        dst.reserve(header.len() + item.len() + 1);
        dst.put_slice(header.as_bytes());
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}
