use crate::constants::DATA_FIELD;
use crate::transport::ByteStream;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

#[derive(Error, Debug)]
pub enum FrameDecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Max line length exceeded ({0} bytes)")]
    MaxLineLengthExceeded(usize),
}

impl From<FrameDecodeError> for crate::types::CiteflowError {
    fn from(e: FrameDecodeError) -> Self {
        match e {
            FrameDecodeError::Io(io) => Self::Io(io),
            other => Self::Decode(other.to_string()),
        }
    }
}

/// Splits an arbitrarily chunked event stream into `data: ` payloads.
///
/// Bytes are buffered until a `\n` arrives, so a read may end anywhere: inside
/// the prefix, inside the JSON, or in the middle of a multi-byte character.
/// Lines without the prefix (keep-alive comments, blank separators, `event:`)
/// are dropped.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_length: usize,
    // Where the next newline search resumes, so partial lines are scanned once.
    next_index: usize,
}

pub type FrameLines = FramedRead<StreamReader<ByteStream, Bytes>, FrameDecoder>;

impl FrameDecoder {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    /// Pull-based line stream over a transport body.
    pub fn framed(body: ByteStream, max_length: usize) -> FrameLines {
        FramedRead::new(StreamReader::new(body), Self::new(max_length))
    }
}

fn extract_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let field = line.strip_prefix(DATA_FIELD.as_bytes())?;
    let payload = field.strip_prefix(b" ").unwrap_or(field);
    if payload.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(payload).into_owned())
}

impl Decoder for FrameDecoder {
    type Item = String;
    type Error = FrameDecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameDecodeError> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let newline_index = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(newline_index + 1);
                    if let Some(payload) = extract_payload(&line[..line.len() - 1]) {
                        return Ok(Some(payload));
                    }
                }
                None if buf.len() > self.max_length => {
                    return Err(FrameDecodeError::MaxLineLengthExceeded(self.max_length));
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameDecodeError> {
        if let Some(payload) = self.decode(buf)? {
            return Ok(Some(payload));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Trailing line without a newline: kept only if it is a well-formed data line.
        self.next_index = 0;
        let rest = buf.split();
        let payload = extract_payload(&rest);
        if payload.is_none() {
            tracing::debug!("[DECODE] Dropping {} trailing bytes at EOF", rest.len());
        }
        Ok(payload)
    }
}
