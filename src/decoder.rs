//! Byte chunks to line fragments.
//!
//! The response body is read through `StreamReader` and framed by [`FragmentCodec`],
//! so a fragment is always one whole line no matter how the chunks were cut.
//! Objects that still span several lines are joined by
//! [`crate::classifier::FragmentMerger`].

use crate::constants::{KEEP_ALIVE_SENTINEL, MAX_PENDING_BYTES};
use crate::types::{CitelineError, ObservedError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Newline framing that drops blank lines and `{}` keep-alives.
#[derive(Debug, Clone)]
pub struct FragmentCodec {
    max_length: usize,
    /// Where the newline search resumes in the buffer.
    next_index: usize,
}

impl Default for FragmentCodec {
    fn default() -> Self {
        Self::new_with_max_length(MAX_PENDING_BYTES)
    }
}

impl FragmentCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

/// Lines are decoded lossily; an invalid byte only replaces itself.
fn to_fragment(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == KEEP_ALIVE_SENTINEL {
        return None;
    }
    Some(text.to_string())
}

impl Decoder for FragmentCodec {
    type Item = String;
    type Error = ObservedError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, ObservedError> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if let Some(fragment) = to_fragment(&line[..end]) {
                        return Ok(Some(fragment));
                    }
                }
                None if buf.len() > self.max_length => {
                    tracing::error!(
                        "[☁️  -> ⚙️ ] Stream line exceeds {} bytes",
                        self.max_length
                    );
                    buf.clear();
                    self.next_index = 0;
                    return Err(CitelineError::MalformedStream(format!(
                        "line exceeds {} bytes",
                        self.max_length
                    ))
                    .into());
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, ObservedError> {
        if let Some(fragment) = self.decode(buf)? {
            return Ok(Some(fragment));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        // unterminated last line
        let rest = buf.split_to(buf.len());
        Ok(to_fragment(&rest))
    }
}

/// Lazily turns a byte stream (e.g. `reqwest::Response::bytes_stream`) into fragments.
/// A transport error is reported as `Io` and ends the sequence.
pub fn decode_fragments<S, E>(chunks: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let reader = StreamReader::new(chunks.map(|r| r.map_err(std::io::Error::other)));
    FramedRead::new(reader, FragmentCodec::new())
}
