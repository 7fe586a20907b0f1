//! `$$`-delimited JSON framing for the TCP command channel.
//!
//! Frame format: `<json envelope>$$`
//!
//! The decoder also accepts a buffer that already holds one complete JSON value
//! without the trailing delimiter (Pi relays send ARRIVED that way). Frames that
//! are not MAVC envelopes are skipped; they never terminate the stream.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{CodecError, Message};

pub const STREAM_DELIMITER: &[u8] = b"$$";

/// Upper bound on buffered bytes without a complete frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct MavcCodec;

impl MavcCodec {
    pub fn new() -> Self {
        Self
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(STREAM_DELIMITER.len()).position(|w| w == STREAM_DELIMITER)
}

/// Where to resume after an unparsable prefix: the next `[` or the byte after
/// the next delimiter, whichever comes first.
fn resync_point(buf: &[u8]) -> Option<usize> {
    let next_open = buf.iter().skip(1).position(|b| *b == b'[').map(|p| p + 1);
    let after_delim = find_delimiter(buf).map(|p| p + STREAM_DELIMITER.len());
    match (next_open, after_delim) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Drop whitespace and stray delimiter bytes between frames.
fn skip_separators(src: &mut BytesMut) {
    let n = src
        .iter()
        .take_while(|b| b.is_ascii_whitespace() || **b == b'$')
        .count();
    src.advance(n);
}

impl Decoder for MavcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            skip_separators(src);
            if src.is_empty() {
                return Ok(None);
            }

            let (next, used) = {
                let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();
                let next = stream.next();
                (next, stream.byte_offset())
            };
            match next {
                Some(Ok(value)) => {
                    src.advance(used);
                    skip_separators(src);
                    match serde_json::from_value::<Message>(value) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(e) => {
                            debug!("MAVC: skipping non-envelope frame: {e}");
                            continue;
                        }
                    }
                }
                Some(Err(e)) if e.is_eof() => {
                    if src.len() > MAX_FRAME_SIZE {
                        debug!("MAVC: discarding {} buffered bytes without a frame", src.len());
                        src.clear();
                    }
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!("MAVC: skipping malformed frame: {e}");
                    match resync_point(&src[..]) {
                        Some(pos) => src.advance(pos),
                        None => src.clear(),
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                if !src.is_empty() {
                    debug!("MAVC: {} trailing bytes at end of stream", src.len());
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for MavcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = item.to_bytes()?;
        dst.reserve(bytes.len() + STREAM_DELIMITER.len());
        dst.put_slice(&bytes);
        dst.put_slice(STREAM_DELIMITER);
        Ok(())
    }
}
