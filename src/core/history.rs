//! Bounded replay buffer of normalized output.
//!
//! Keeps the most recent chunks of the normalized stream so late-joining
//! subscribers can be brought up to date. Truncated from the head once the
//! byte budget is exceeded.

use crate::core::filter::NormalizedChunk;
use std::collections::VecDeque;

/// Target byte budget per session.
pub const DEFAULT_CAPACITY_BYTES: usize = 256 * 1024;

/// Append-only ring of normalized chunks. Callers serialize access (the
/// session lock); `snapshot` is therefore atomic with respect to `append`.
pub struct HistoryBuffer {
    chunks: VecDeque<NormalizedChunk>,
    bytes: usize,
    capacity: usize,
    last_seq: Option<u64>,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
            last_seq: None,
        }
    }

    pub fn append(&mut self, chunk: NormalizedChunk) {
        self.bytes += chunk.data.len();
        self.last_seq = Some(chunk.seq);
        self.chunks.push_back(chunk);
        while self.bytes > self.capacity && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.data.len();
            }
        }
    }

    /// Current contents as one contiguous block, plus the sequence number of
    /// the last chunk it covers. A subscriber that receives this snapshot
    /// must then be fed every chunk with `seq > last_seq`.
    pub fn snapshot(&self) -> (String, Option<u64>) {
        let mut text = String::with_capacity(self.bytes);
        for chunk in &self.chunks {
            text.push_str(&chunk.data);
        }
        (text, self.last_seq)
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u64, data: &str) -> NormalizedChunk {
        NormalizedChunk {
            seq,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_snapshot_concatenates_in_order() {
        let mut h = HistoryBuffer::new();
        h.append(chunk(0, "[u@h ~]$ "));
        h.append(chunk(1, "ls\r\n"));
        h.append(chunk(2, "a b\r\n"));
        let (text, last) = h.snapshot();
        assert_eq!(text, "[u@h ~]$ ls\r\na b\r\n");
        assert_eq!(last, Some(2));
    }

    #[test]
    fn test_truncates_from_head() {
        let mut h = HistoryBuffer::with_capacity(10);
        h.append(chunk(0, "aaaaa"));
        h.append(chunk(1, "bbbbb"));
        h.append(chunk(2, "ccccc"));
        let (text, last) = h.snapshot();
        assert_eq!(text, "bbbbbccccc");
        assert_eq!(last, Some(2));
        assert!(h.len_bytes() <= 10);
    }

    #[test]
    fn test_oversized_single_chunk_is_kept() {
        // A chunk larger than the whole budget must still be replayable.
        let mut h = HistoryBuffer::with_capacity(4);
        h.append(chunk(0, "oversized"));
        let (text, last) = h.snapshot();
        assert_eq!(text, "oversized");
        assert_eq!(last, Some(0));
    }

    #[test]
    fn test_empty_snapshot() {
        let h = HistoryBuffer::new();
        let (text, last) = h.snapshot();
        assert!(text.is_empty());
        assert_eq!(last, None);
    }
}
