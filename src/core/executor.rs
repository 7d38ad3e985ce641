//! Command Executor / Gater
//!
//! The per-session control core. Serializes command submissions (one
//! in-flight request, FIFO queue behind it), decides the cancellation
//! mechanism, and resolves every response sink exactly once. The gating
//! policy against the browser-command buffer is applied by the session
//! before a tool command reaches `submit`.

use crate::core::command::{CommandResult, CommandSource, ExecOutcome, ExecutionRequest};
use crate::core::error::SessionError;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Queued submissions behind the in-flight one. Overflow fails with `busy`.
pub const PENDING_QUEUE_CAPACITY: usize = 16;

/// Smallest timeout `exec` will honor, in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// How long a cancellation waits for the post-signal prompt before the
/// session escalates to transport-lost.
pub const CANCEL_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    Idle,
    Running,
    Cancelling,
}

/// What the session must do to start an accepted command: register the
/// wire text with the filter, then write `wire + "\n"` to the shell.
#[derive(Debug, Clone)]
pub struct StartCommand {
    pub command: String,
    pub wire: String,
    pub command_id: String,
    pub source: CommandSource,
}

/// Result of a `submit` call.
#[derive(Debug)]
pub enum Submission {
    Started(StartCommand),
    Queued,
}

/// How to interrupt the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMechanism {
    /// Native channel SIGINT (tool-channel submissions).
    Signal,
    /// Write the interrupt control byte 0x03 (browser submissions).
    ControlC,
}

#[derive(Debug)]
pub struct CancelInfo {
    pub mechanism: CancelMechanism,
    pub command_id: String,
    pub source: CommandSource,
}

/// The finished request plus, if queued work exists, the next command to
/// start.
#[derive(Debug)]
pub struct Completion {
    pub command_id: String,
    pub source: CommandSource,
    pub was_cancelled: bool,
    pub next: Option<StartCommand>,
}

struct ExecState {
    phase: ExecPhase,
    current: Option<ExecutionRequest>,
    queue: VecDeque<ExecutionRequest>,
}

/// See module docs. One per session; shared behind `Arc` by the session.
pub struct CommandExecutor {
    state: Mutex<ExecState>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExecState {
                phase: ExecPhase::Idle,
                current: None,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn phase(&self) -> ExecPhase {
        self.state.lock().unwrap().phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == ExecPhase::Idle
    }

    /// The exact line written to the shell for a command: the command plus
    /// the exit-code marker the filter elides and parses.
    pub fn wire_for(command: &str) -> String {
        format!("{}; echo \"__rc:$?\"", command)
    }

    /// Accept a request. Started immediately when idle, queued FIFO while
    /// another command is in flight, rejected with `busy` on queue overflow.
    pub fn submit(&self, request: ExecutionRequest) -> Result<Submission, SessionError> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            ExecPhase::Idle => {
                let start = StartCommand {
                    command: request.command.clone(),
                    wire: Self::wire_for(&request.command),
                    command_id: request.command_id.clone(),
                    source: request.source,
                };
                state.phase = ExecPhase::Running;
                state.current = Some(request);
                Ok(Submission::Started(start))
            }
            ExecPhase::Running | ExecPhase::Cancelling => {
                if state.queue.len() >= PENDING_QUEUE_CAPACITY {
                    debug!("pending queue full, rejecting {}", request.command_id);
                    return Err(SessionError::Busy);
                }
                state.queue.push_back(request);
                Ok(Submission::Queued)
            }
        }
    }

    /// The filter reported a completion prompt for the in-flight command.
    /// Resolves its sink (exactly once) and hands back the next queued
    /// command, if any.
    pub fn complete(&self, result: CommandResult) -> Option<Completion> {
        let mut state = self.state.lock().unwrap();
        let mut finished = match state.current.take() {
            Some(req) => req,
            None => {
                // A prompt with nothing in flight (raw-mode Enter, etc.).
                return None;
            }
        };
        let was_cancelled = state.phase == ExecPhase::Cancelling;
        if was_cancelled {
            finished.resolve(ExecOutcome::Cancelled(result.clone()));
        } else {
            finished.resolve(ExecOutcome::Completed(result.clone()));
        }

        let next = match state.queue.pop_front() {
            Some(request) => {
                let start = StartCommand {
                    command: request.command.clone(),
                    wire: Self::wire_for(&request.command),
                    command_id: request.command_id.clone(),
                    source: request.source,
                };
                state.phase = ExecPhase::Running;
                state.current = Some(request);
                Some(start)
            }
            None => {
                state.phase = ExecPhase::Idle;
                None
            }
        };

        Some(Completion {
            command_id: finished.command_id,
            source: finished.source,
            was_cancelled,
            next,
        })
    }

    /// Request cancellation of the in-flight command. Only valid while
    /// `Running`; the mechanism depends on which channel submitted it.
    pub fn cancel(&self) -> Result<CancelInfo, SessionError> {
        self.cancel_inner(None)
    }

    /// Cancel only if `command_id` is still the in-flight command. Guards a
    /// deadline that fires in the same instant its command completes and a
    /// queued successor starts.
    pub fn cancel_if_current(&self, command_id: &str) -> Result<CancelInfo, SessionError> {
        self.cancel_inner(Some(command_id))
    }

    fn cancel_inner(&self, expected_id: Option<&str>) -> Result<CancelInfo, SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.phase != ExecPhase::Running {
            return Err(SessionError::NotRunning);
        }
        let current = state
            .current
            .as_ref()
            .ok_or(SessionError::NotRunning)?;
        if let Some(expected) = expected_id {
            if current.command_id != expected {
                return Err(SessionError::NotRunning);
            }
        }
        let mechanism = match current.source {
            CommandSource::Agent => CancelMechanism::Signal,
            CommandSource::User => CancelMechanism::ControlC,
        };
        let info = CancelInfo {
            mechanism,
            command_id: current.command_id.clone(),
            source: current.source,
        };
        state.phase = ExecPhase::Cancelling;
        Ok(info)
    }

    /// Id and source of the in-flight command, if any.
    pub fn current_command(&self) -> Option<(String, CommandSource)> {
        let state = self.state.lock().unwrap();
        state
            .current
            .as_ref()
            .map(|req| (req.command_id.clone(), req.source))
    }

    /// Id of the command currently being cancelled, if any. Used by the
    /// cancel watchdog to detect a post-signal prompt that never came.
    pub fn cancelling_command(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.phase != ExecPhase::Cancelling {
            return None;
        }
        state.current.as_ref().map(|req| req.command_id.clone())
    }

    /// The transport is gone: resolve the in-flight request and everything
    /// queued behind it with `transport-lost`. Returns the affected ids.
    pub fn fail_all(&self) -> Vec<(String, CommandSource)> {
        let mut state = self.state.lock().unwrap();
        let mut failed = Vec::new();
        if let Some(mut req) = state.current.take() {
            failed.push((req.command_id.clone(), req.source));
            req.resolve(ExecOutcome::TransportLost);
        }
        while let Some(mut req) = state.queue.pop_front() {
            failed.push((req.command_id.clone(), req.source));
            req.resolve(ExecOutcome::TransportLost);
        }
        if !failed.is_empty() {
            warn!("{} request(s) resolved with transport-lost", failed.len());
        }
        state.phase = ExecPhase::Idle;
        failed
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn request(id: &str, source: CommandSource) -> (ExecutionRequest, tokio::sync::oneshot::Receiver<ExecOutcome>) {
        ExecutionRequest::new(format!("cmd-{}", id), id.to_string(), source)
    }

    fn ok_result() -> CommandResult {
        CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn test_submit_starts_when_idle() {
        let exec = CommandExecutor::new();
        let (req, _rx) = request("a", CommandSource::Agent);
        match exec.submit(req).unwrap() {
            Submission::Started(start) => {
                assert_eq!(start.command, "cmd-a");
                assert_eq!(start.wire, "cmd-a; echo \"__rc:$?\"");
            }
            Submission::Queued => panic!("should start immediately"),
        }
        assert_eq!(exec.phase(), ExecPhase::Running);
    }

    #[test]
    fn test_fifo_queue_and_busy_overflow() {
        let exec = CommandExecutor::new();
        let (first, _rx) = request("first", CommandSource::Agent);
        exec.submit(first).unwrap();
        let mut receivers = Vec::new();
        for i in 0..PENDING_QUEUE_CAPACITY {
            let (req, rx) = request(&format!("q{}", i), CommandSource::Agent);
            assert!(matches!(exec.submit(req).unwrap(), Submission::Queued));
            receivers.push(rx);
        }
        let (overflow, _rx) = request("overflow", CommandSource::Agent);
        assert!(matches!(exec.submit(overflow), Err(SessionError::Busy)));

        // Completing the first hands back the oldest queued command.
        let completion = exec.complete(ok_result()).unwrap();
        assert_eq!(completion.command_id, "first");
        assert_eq!(completion.next.as_ref().unwrap().command_id, "q0");
    }

    #[test]
    fn test_complete_resolves_sink_once() {
        let exec = CommandExecutor::new();
        let (req, mut rx) = request("a", CommandSource::Agent);
        exec.submit(req).unwrap();
        let completion = exec.complete(ok_result()).unwrap();
        assert!(!completion.was_cancelled);
        assert!(completion.next.is_none());
        assert_eq!(exec.phase(), ExecPhase::Idle);
        assert!(matches!(rx.try_recv().unwrap(), ExecOutcome::Completed(_)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn test_cancel_mechanism_follows_source() {
        let exec = CommandExecutor::new();
        let (req, _rx) = request("agent", CommandSource::Agent);
        exec.submit(req).unwrap();
        let info = exec.cancel().unwrap();
        assert_eq!(info.mechanism, CancelMechanism::Signal);
        assert_eq!(exec.phase(), ExecPhase::Cancelling);
        let _ = exec.complete(ok_result());

        let (req, _rx) = request("user", CommandSource::User);
        exec.submit(req).unwrap();
        let info = exec.cancel().unwrap();
        assert_eq!(info.mechanism, CancelMechanism::ControlC);
    }

    #[test]
    fn test_cancel_if_current_checks_id() {
        let exec = CommandExecutor::new();
        let (req, _rx) = request("a", CommandSource::Agent);
        exec.submit(req).unwrap();
        assert!(matches!(
            exec.cancel_if_current("other"),
            Err(SessionError::NotRunning)
        ));
        assert_eq!(exec.phase(), ExecPhase::Running);
        assert!(exec.cancel_if_current("a").is_ok());
    }

    #[test]
    fn test_cancel_when_idle_is_not_running() {
        let exec = CommandExecutor::new();
        assert!(matches!(exec.cancel(), Err(SessionError::NotRunning)));
    }

    #[test]
    fn test_cancel_while_cancelling_is_not_running() {
        let exec = CommandExecutor::new();
        let (req, _rx) = request("a", CommandSource::User);
        exec.submit(req).unwrap();
        exec.cancel().unwrap();
        assert!(matches!(exec.cancel(), Err(SessionError::NotRunning)));
    }

    #[test]
    fn test_cancelled_completion_outcome() {
        let exec = CommandExecutor::new();
        let (req, mut rx) = request("a", CommandSource::User);
        exec.submit(req).unwrap();
        exec.cancel().unwrap();
        let completion = exec.complete(ok_result()).unwrap();
        assert!(completion.was_cancelled);
        assert!(matches!(rx.try_recv().unwrap(), ExecOutcome::Cancelled(_)));
    }

    #[test]
    fn test_fail_all_resolves_current_and_queue() {
        let exec = CommandExecutor::new();
        let (req, mut rx1) = request("a", CommandSource::Agent);
        exec.submit(req).unwrap();
        let (req, mut rx2) = request("b", CommandSource::User);
        exec.submit(req).unwrap();

        let failed = exec.fail_all();
        assert_eq!(failed.len(), 2);
        assert!(matches!(rx1.try_recv().unwrap(), ExecOutcome::TransportLost));
        assert!(matches!(rx2.try_recv().unwrap(), ExecOutcome::TransportLost));
        assert_eq!(exec.phase(), ExecPhase::Idle);
    }

    #[test]
    fn test_prompt_without_inflight_is_ignored() {
        let exec = CommandExecutor::new();
        assert!(exec.complete(ok_result()).is_none());
    }
}
