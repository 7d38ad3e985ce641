use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Who submitted a command. Threaded through requests, buffered records and
/// output messages; parsed exactly once at the channel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    User,
    Agent,
}

/// Captured result of one completed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

impl CommandResult {
    /// Placeholder for a command that has been submitted but not completed.
    pub fn pending() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
        }
    }
}

/// One command submitted through the browser channel, as reported to a
/// gated tool caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserCommandRecord {
    pub command: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    /// Submission time, epoch milliseconds.
    pub timestamp: u64,
    pub source: CommandSource,
    pub result: CommandResult,
}

impl BrowserCommandRecord {
    pub fn new(command: String, command_id: String, source: CommandSource) -> Self {
        Self {
            command,
            command_id,
            timestamp: now_ms(),
            source,
            result: CommandResult::pending(),
        }
    }
}

/// Terminal outcome of an execution request. Every request resolves with
/// exactly one of these.
#[derive(Debug)]
pub enum ExecOutcome {
    Completed(CommandResult),
    Cancelled(CommandResult),
    TransportLost,
}

/// A command accepted for execution on the session's shell.
///
/// Carries at most one response: the sink is taken when the outcome is
/// delivered and can never fire twice.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub command: String,
    pub command_id: String,
    pub source: CommandSource,
    pub sink: Option<oneshot::Sender<ExecOutcome>>,
}

impl ExecutionRequest {
    pub fn new(
        command: String,
        command_id: String,
        source: CommandSource,
    ) -> (Self, oneshot::Receiver<ExecOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                command_id,
                source,
                sink: Some(tx),
            },
            rx,
        )
    }

    /// Resolve the request. A second call is a no-op by construction.
    pub fn resolve(&mut self, outcome: ExecOutcome) {
        if let Some(sink) = self.sink.take() {
            // The receiver may have gone away (caller timed out and moved
            // on); that is not an error.
            let _ = sink.send(outcome);
        } else {
            log::warn!(
                "execution request {} resolved twice, ignoring",
                self.command_id
            );
        }
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_wire_format() {
        assert_eq!(serde_json::to_string(&CommandSource::User).unwrap(), "\"user\"");
        let parsed: CommandSource = serde_json::from_str("\"agent\"").unwrap();
        assert_eq!(parsed, CommandSource::Agent);
    }

    #[test]
    fn test_record_starts_pending() {
        let rec = BrowserCommandRecord::new("pwd".into(), "b-1".into(), CommandSource::User);
        assert_eq!(rec.result.exit_code, -1);
        assert!(rec.timestamp > 0);
    }

    #[test]
    fn test_resolve_is_exactly_once() {
        let (mut req, mut rx) = ExecutionRequest::new("ls".into(), "c-1".into(), CommandSource::Agent);
        req.resolve(ExecOutcome::Completed(CommandResult {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        }));
        // Second resolution must not panic and must not deliver.
        req.resolve(ExecOutcome::TransportLost);
        match rx.try_recv().unwrap() {
            ExecOutcome::Completed(r) => assert_eq!(r.exit_code, 0),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_command_result_serializes_exit_code_key() {
        let json = serde_json::to_string(&CommandResult::pending()).unwrap();
        assert!(json.contains("\"exitCode\":-1"));
    }
}
