//! Newline framing for worker output.
//!
//! Pipe reads do not respect record boundaries, so each stream keeps the
//! trailing partial record until the next chunk completes it. A record that
//! grows past the length limit is dropped whole and reported once.

use bytes::{Buf, BytesMut};

/// Longest record a worker may write before it is discarded.
pub const MAX_RECORD_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("record exceeded {limit} bytes and was discarded")]
pub struct RecordTooLarge {
    pub limit: usize,
}

#[derive(Debug)]
pub struct LineFramer {
    residual: BytesMut,
    /// Prefix of `residual` already known to hold no newline.
    scanned: usize,
    max_len: usize,
    /// Dropping the rest of an oversized record up to its newline.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_len(MAX_RECORD_LEN)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            residual: BytesMut::new(),
            scanned: 0,
            max_len,
            discarding: false,
        }
    }

    /// Append a raw chunk and return every record it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, RecordTooLarge>> {
        self.residual.extend_from_slice(chunk);

        let mut records = Vec::new();
        loop {
            let Some(offset) = self.residual[self.scanned..].iter().position(|b| *b == b'\n')
            else {
                if !self.discarding && self.residual.len() > self.max_len {
                    records.push(Err(self.too_large()));
                    self.discarding = true;
                }
                if self.discarding {
                    self.residual.clear();
                }
                self.scanned = self.residual.len();
                return records;
            };

            let line = self.residual.split_to(self.scanned + offset);
            self.residual.advance(1);
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_len {
                records.push(Err(self.too_large()));
            } else if let Some(record) = decode(&line) {
                records.push(Ok(record));
            }
        }
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.residual.len()
    }

    /// Take whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.residual.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode(&rest)
    }

    fn too_large(&self) -> RecordTooLarge {
        RecordTooLarge {
            limit: self.max_len,
        }
    }
}

fn decode(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(String::from_utf8_lossy(line).into_owned())
}
