//! FIFO of commands submitted through the browser channel.
//!
//! The gating policy reads this buffer: while it is non-empty, programmatic
//! `exec` calls fail and receive its drained contents for reconciliation.

use crate::core::command::{BrowserCommandRecord, CommandResult};
use std::collections::VecDeque;

/// Per-session record of browser-submitted commands. Callers serialize
/// access (the session lock).
pub struct BrowserCommandBuffer {
    records: VecDeque<BrowserCommandRecord>,
}

impl BrowserCommandBuffer {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
        }
    }

    pub fn append(&mut self, record: BrowserCommandRecord) {
        self.records.push_back(record);
    }

    /// Write the result of a completed command into its record. Each record
    /// is completed at most once; a second completion for the same id is
    /// ignored.
    pub fn complete(&mut self, command_id: &str, result: CommandResult) {
        if let Some(rec) = self
            .records
            .iter_mut()
            .find(|r| r.command_id == command_id && r.result.exit_code == -1)
        {
            rec.result = result;
        }
    }

    /// Empty the buffer and return its prior contents in submission order.
    pub fn drain(&mut self) -> Vec<BrowserCommandRecord> {
        self.records.drain(..).collect()
    }

    /// Remove a record whose command never reached the shell (submission
    /// rolled back).
    pub fn remove(&mut self, command_id: &str) {
        self.records.retain(|r| r.command_id != command_id);
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for BrowserCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CommandSource;

    fn record(id: &str) -> BrowserCommandRecord {
        BrowserCommandRecord::new("pwd".into(), id.into(), CommandSource::User)
    }

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let mut buf = BrowserCommandBuffer::new();
        buf.append(record("b-1"));
        buf.append(record("b-2"));
        assert_eq!(buf.size(), 2);
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].command_id, "b-1");
        assert_eq!(drained[1].command_id, "b-2");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_complete_writes_result_once() {
        let mut buf = BrowserCommandBuffer::new();
        buf.append(record("b-1"));
        buf.complete(
            "b-1",
            CommandResult {
                stdout: "/home\n".into(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        buf.complete(
            "b-1",
            CommandResult {
                stdout: "late".into(),
                stderr: String::new(),
                exit_code: 7,
            },
        );
        let drained = buf.drain();
        assert_eq!(drained[0].result.exit_code, 0);
        assert_eq!(drained[0].result.stdout, "/home\n");
    }

    #[test]
    fn test_remove_rolls_back_a_submission() {
        let mut buf = BrowserCommandBuffer::new();
        buf.append(record("b-1"));
        buf.append(record("b-2"));
        buf.remove("b-1");
        assert_eq!(buf.size(), 1);
        assert_eq!(buf.drain()[0].command_id, "b-2");
    }

    #[test]
    fn test_complete_unknown_id_is_ignored() {
        let mut buf = BrowserCommandBuffer::new();
        buf.append(record("b-1"));
        buf.complete("nope", CommandResult::pending());
        assert_eq!(buf.size(), 1);
    }
}
