//! Newline framing for child process output.
//!
//! The OS hands us stdout in arbitrary chunks, so records may be split
//! anywhere. `LineFramer` keeps the unterminated tail between calls and
//! yields only complete lines. `\n` and `\r\n` are both terminators.
//! Whitespace-only lines are dropped. An unterminated tail at end of stream
//! is discarded, never emitted.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::RawRecord;

/// One instance may serve both `feed` and `Decoder`; each keeps its own
/// scan position, so interleaving them never skips a terminator.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Buffer used by `feed`; `Decoder` callers bring their own.
    pending: BytesMut,
    /// Bytes of `pending` already scanned for a newline.
    feed_index: usize,
    /// Bytes of the decoder's buffer already scanned for a newline.
    decode_index: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawRecord> {
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(record) = Self::next_record(&mut self.pending, &mut self.feed_index) {
            records.push(record);
        }
        records
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_record(buf: &mut BytesMut, scanned: &mut usize) -> Option<RawRecord> {
        loop {
            let start = (*scanned).min(buf.len());
            let Some(offset) = buf[start..].iter().position(|b| *b == b'\n') else {
                *scanned = buf.len();
                return None;
            };

            let newline = start + offset;
            *scanned = 0;

            let mut line = buf.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(RawRecord::new(line.freeze()));
        }
    }
}

impl Decoder for LineFramer {
    type Item = RawRecord;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Self::next_record(src, &mut self.decode_index))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = Self::next_record(buf, &mut self.decode_index) {
            return Ok(Some(record));
        }
        if !buf.is_empty() {
            tracing::debug!(
                bytes = buf.len(),
                "Discarding unterminated output at end of stream"
            );
            buf.clear();
        }
        self.decode_index = 0;
        Ok(None)
    }
}

impl Encoder<RawRecord> for LineFramer {
    type Error = io::Error;

    fn encode(&mut self, item: RawRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
