//! Session core.
//!
//! One `Session` owns one PTY-backed SSH shell and everything multiplexed
//! on top of it: the echo/prompt filter, the replayable history, the
//! subscriber fan-out, the browser-command buffer and the command executor.
//! All raw shell bytes are consumed by a single reader task that drives the
//! filter; per-session mutable state sits behind one short-held lock.

use crate::core::broadcast::OutputBroadcaster;
use crate::core::browser_buffer::BrowserCommandBuffer;
use crate::core::command::{
    now_ms, BrowserCommandRecord, CommandResult, CommandSource, ExecOutcome, ExecutionRequest,
};
use crate::core::error::SessionError;
use crate::core::executor::{
    CancelInfo, CancelMechanism, CommandExecutor, StartCommand, Submission, CANCEL_GRACE_MS,
    MIN_TIMEOUT_MS,
};
use crate::core::filter::{EchoPromptFilter, FilterEvent};
use crate::core::history::HistoryBuffer;
use crate::ssh::config::SshConfig;
use crate::ssh::shell::{SshShellAdapter, CTRL_C};
use crate::web::protocol::ServerMessage;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

/// How long `connect` waits for the first canonical prompt.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle. Transitions are monotonic; in particular
/// `Closing` never goes back to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Snapshot of a session for `list` and the monitoring socket.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub host: String,
    pub username: String,
    pub status: SessionState,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
}

/// Signals deliverable to the foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellSignal {
    Interrupt,
}

/// Everything the session needs from the shell transport. Implemented by
/// the SSH adapter; tests drive the session with a scripted transport.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;
    async fn send_signal(&self, signal: ShellSignal) -> Result<(), SessionError>;
    async fn close(&self);
}

/// Input to the session reader task. A single FIFO: command registrations
/// are enqueued before the corresponding shell write, so the filter always
/// learns about a command before its first output byte.
#[derive(Debug)]
pub enum ReaderMsg {
    /// Register and write a command accepted by the executor.
    Register { start: StartCommand },
    /// Emit synthetic text into the normalized stream.
    Inject(String),
    /// Raw bytes read from the shell.
    Bytes(Vec<u8>),
    /// The transport is gone (EOF, close, or I/O error).
    Closed(Option<String>),
}

/// Failure modes of a tool-channel `exec`, mapped to wire errors by the
/// dispatcher.
#[derive(Debug)]
pub enum ExecError {
    /// Browser commands ran since the last exec; payload for reconciliation.
    Gated(Vec<BrowserCommandRecord>),
    /// Requested timeout below the 1 000 ms floor.
    TimeoutTooSmall(u64),
    /// Submission failed (busy queue, session closed, ...).
    Session(SessionError),
    /// An explicit cancel resolved the command.
    Cancelled(CommandResult),
    /// The deadline cancelled the command.
    TimedOut(CommandResult),
    TransportLost,
}

struct SessionInner {
    state: SessionState,
    last_activity: u64,
    history: HistoryBuffer,
    broadcaster: OutputBroadcaster,
    /// Source of the in-flight command, stamped on its output chunks.
    current_source: Option<CommandSource>,
    ready_seen: bool,
}

/// See module docs.
pub struct Session {
    name: String,
    host: String,
    username: String,
    created_at: u64,
    transport: Arc<dyn ShellTransport>,
    reader_tx: mpsc::UnboundedSender<ReaderMsg>,
    executor: CommandExecutor,
    browser: Mutex<BrowserCommandBuffer>,
    inner: Mutex<SessionInner>,
    ready: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to an SSH endpoint and bring the shell to a usable state:
    /// open the PTY shell, run the init sequence, wait for the first
    /// canonical prompt.
    pub async fn connect(name: &str, config: SshConfig) -> Result<Arc<Self>, SessionError> {
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let adapter = SshShellAdapter::connect(name, &config, reader_tx.clone()).await?;
        let adapter = Arc::new(adapter);
        let session = Self::start(
            name,
            &config.target.hostname,
            &config.target.username,
            adapter.clone(),
            reader_tx,
            reader_rx,
        );
        adapter.run_init_sequence().await?;
        session.wait_ready(READY_TIMEOUT).await?;
        Ok(session)
    }

    /// Wire up a session over an already-connected transport and spawn its
    /// reader task. The session starts in `Connecting` and becomes
    /// `Connected` when the first canonical prompt is observed.
    pub fn start(
        name: &str,
        host: &str,
        username: &str,
        transport: Arc<dyn ShellTransport>,
        reader_tx: mpsc::UnboundedSender<ReaderMsg>,
        reader_rx: mpsc::UnboundedReceiver<ReaderMsg>,
    ) -> Arc<Self> {
        let session = Arc::new(Session {
            name: name.to_string(),
            host: host.to_string(),
            username: username.to_string(),
            created_at: now_ms(),
            transport,
            reader_tx,
            executor: CommandExecutor::new(),
            browser: Mutex::new(BrowserCommandBuffer::new()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                last_activity: now_ms(),
                history: HistoryBuffer::new(),
                broadcaster: OutputBroadcaster::new(),
                current_source: None,
                ready_seen: false,
            }),
            ready: Notify::new(),
        });
        let reader = Arc::clone(&session);
        tokio::spawn(async move {
            reader.reader_loop(reader_rx).await;
        });
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().unwrap();
        SessionSummary {
            name: self.name.clone(),
            host: self.host.clone(),
            username: self.username.clone(),
            status: inner.state,
            last_activity: inner.last_activity,
        }
    }

    /// Block until the first canonical prompt has been observed.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let wait = async {
            loop {
                let notified = self.ready.notified();
                {
                    let inner = self.inner.lock().unwrap();
                    if inner.ready_seen {
                        return Ok(());
                    }
                    if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                        return Err(SessionError::Closed);
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::Internal("shell prompt not observed".to_string()))?
    }

    // ------------------------------------------------------------------
    // Command submission
    // ------------------------------------------------------------------

    /// Submit a command through the executor. Returns the receiver for its
    /// outcome; the command starts now or runs FIFO after the in-flight one.
    pub fn submit(
        &self,
        command: &str,
        command_id: &str,
        source: CommandSource,
    ) -> Result<oneshot::Receiver<ExecOutcome>, SessionError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Connected {
                return Err(SessionError::Closed);
            }
        }
        let (request, rx) =
            ExecutionRequest::new(command.to_string(), command_id.to_string(), source);
        match self.executor.submit(request)? {
            Submission::Started(start) => self.begin_command(start)?,
            Submission::Queued => {
                debug!("SSH[{}] command {} queued", self.name, command_id);
            }
        }
        self.touch();
        Ok(rx)
    }

    /// Browser-channel submission: recorded for the gating policy, then
    /// executed like any other command. Returns the (possibly generated)
    /// command id.
    pub fn submit_from_browser(
        &self,
        command: &str,
        command_id: Option<String>,
        source: CommandSource,
    ) -> Result<String, SessionError> {
        let command_id =
            command_id.unwrap_or_else(|| format!("browser-{}", Uuid::new_v4()));
        let record =
            BrowserCommandRecord::new(command.to_string(), command_id.clone(), source);
        self.browser.lock().unwrap().append(record);
        if let Err(e) = self.submit(command, &command_id, source) {
            // The command never reached the shell; take the record back out.
            self.browser.lock().unwrap().remove(&command_id);
            return Err(e);
        }
        Ok(command_id)
    }

    /// Tool-channel `exec`: gated on the browser-command buffer, bounded by
    /// an optional deadline (minimum 1 000 ms).
    pub async fn exec_from_tool(
        self: &Arc<Self>,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, ExecError> {
        if let Some(ms) = timeout_ms {
            if ms < MIN_TIMEOUT_MS {
                return Err(ExecError::TimeoutTooSmall(ms));
            }
        }
        {
            let mut browser = self.browser.lock().unwrap();
            if !browser.is_empty() {
                let drained = browser.drain();
                info!(
                    "SSH[{}] exec gated, returning {} browser command(s)",
                    self.name,
                    drained.len()
                );
                return Err(ExecError::Gated(drained));
            }
        }

        let command_id = format!("agent-{}", Uuid::new_v4());
        let mut rx = self
            .submit(command, &command_id, CommandSource::Agent)
            .map_err(ExecError::Session)?;

        let deadline = match timeout_ms {
            None => {
                return match rx.await {
                    Ok(ExecOutcome::Completed(r)) => Ok(r),
                    Ok(ExecOutcome::Cancelled(r)) => Err(ExecError::Cancelled(r)),
                    Ok(ExecOutcome::TransportLost) | Err(_) => Err(ExecError::TransportLost),
                };
            }
            Some(ms) => Duration::from_millis(ms),
        };

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(ExecOutcome::Completed(r))) => Ok(r),
            Ok(Ok(ExecOutcome::Cancelled(r))) => Err(ExecError::Cancelled(r)),
            Ok(Ok(ExecOutcome::TransportLost)) | Ok(Err(_)) => Err(ExecError::TransportLost),
            Err(_) => {
                debug!(
                    "SSH[{}] exec deadline elapsed for {}, cancelling",
                    self.name, command_id
                );
                if let Ok(info) = self.executor.cancel_if_current(&command_id) {
                    let _ = self.perform_cancel(info).await;
                }
                // Wait (bounded) for the post-signal prompt.
                match tokio::time::timeout(Duration::from_millis(CANCEL_GRACE_MS), &mut rx).await
                {
                    Ok(Ok(ExecOutcome::Completed(r))) => Ok(r),
                    Ok(Ok(ExecOutcome::Cancelled(r))) => Err(ExecError::TimedOut(r)),
                    Ok(Ok(ExecOutcome::TransportLost)) | Ok(Err(_)) => {
                        Err(ExecError::TransportLost)
                    }
                    Err(_) => {
                        warn!(
                            "SSH[{}] no prompt after cancel, escalating to transport-lost",
                            self.name
                        );
                        self.close().await;
                        Err(ExecError::TransportLost)
                    }
                }
            }
        }
    }

    /// Tool-channel `cancel`. Fails with `not-running` unless a command is
    /// currently running.
    pub async fn cancel_from_tool(self: &Arc<Self>) -> Result<(), SessionError> {
        let info = self.executor.cancel()?;
        self.perform_cancel(info).await
    }

    /// Browser `terminal_signal`: interrupt the in-flight command, or
    /// forward a bare control byte when nothing tracked is running.
    pub async fn signal_interrupt(self: &Arc<Self>) {
        match self.executor.cancel() {
            Ok(info) => {
                let _ = self.perform_cancel(info).await;
            }
            Err(_) => {
                let _ = self.transport.write(&[CTRL_C]).await;
            }
        }
    }

    async fn perform_cancel(self: &Arc<Self>, info: CancelInfo) -> Result<(), SessionError> {
        info!(
            "SSH[{}] cancelling {} via {:?}",
            self.name, info.command_id, info.mechanism
        );
        // Queue the feedback before the interrupt so `^C` precedes the
        // post-signal prompt in the stream.
        let _ = self.reader_tx.send(ReaderMsg::Inject("^C\r\n".to_string()));
        match info.mechanism {
            CancelMechanism::Signal => {
                if self.transport.send_signal(ShellSignal::Interrupt).await.is_err() {
                    self.transport.write(&[CTRL_C]).await?;
                }
            }
            CancelMechanism::ControlC => {
                self.transport.write(&[CTRL_C]).await?;
            }
        }
        self.spawn_cancel_watchdog(info.command_id);
        Ok(())
    }

    fn spawn_cancel_watchdog(self: &Arc<Self>, command_id: String) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(CANCEL_GRACE_MS)).await;
            if session.executor.cancelling_command().as_deref() == Some(command_id.as_str()) {
                warn!(
                    "SSH[{}] cancel of {} saw no prompt within {} ms, escalating",
                    session.name, command_id, CANCEL_GRACE_MS
                );
                session.close().await;
            }
        });
    }

    /// Raw keystrokes from the browser, forwarded unfiltered to stdin.
    pub async fn write_raw(&self, data: &[u8]) -> Result<(), SessionError> {
        self.touch();
        self.transport.write(data).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.touch();
        self.transport.resize(cols, rows).await
    }

    /// Number of commands sitting in the browser buffer (gating predicate).
    pub fn browser_buffer_size(&self) -> usize {
        self.browser.lock().unwrap().size()
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Attach a WebSocket subscriber: history snapshot first, then the
    /// current lock state, then live chunks strictly after the snapshot.
    pub fn attach_subscriber(&self) -> Option<(u64, mpsc::Receiver<ServerMessage>)> {
        let mut inner = self.inner.lock().unwrap();
        let (id, rx) = inner.broadcaster.attach()?;
        Self::send_state(&mut inner, &self.executor, id);
        Some((id, rx))
    }

    pub fn detach_subscriber(&self, id: u64) {
        self.inner.lock().unwrap().broadcaster.detach(id);
    }

    /// Deliver one message to one subscriber's queue.
    pub fn send_to_subscriber(&self, subscriber_id: u64, msg: ServerMessage) -> bool {
        self.inner
            .lock()
            .unwrap()
            .broadcaster
            .send_to(subscriber_id, msg)
    }

    /// Re-send the history snapshot and current lock state to one
    /// subscriber (`request_state_recovery`).
    pub fn recover_state(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        Self::send_state(&mut inner, &self.executor, subscriber_id);
    }

    /// Deliver an error to one subscriber and unlock its terminal.
    pub fn report_command_error(
        &self,
        subscriber_id: u64,
        command_id: &str,
        source: CommandSource,
        message: &str,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.broadcaster.send_to(
            subscriber_id,
            ServerMessage::CommandError {
                command_id: command_id.to_string(),
                source,
                error_message: message.to_string(),
            },
        );
        inner.broadcaster.send_to(
            subscriber_id,
            ServerMessage::TerminalLockState {
                is_locked: false,
                command_id: None,
                source: None,
            },
        );
    }

    fn send_state(inner: &mut SessionInner, executor: &CommandExecutor, id: u64) {
        let (text, last_seq) = inner.history.snapshot();
        if !text.is_empty() {
            inner.broadcaster.send_to(
                id,
                ServerMessage::TerminalOutput {
                    data: text,
                    source: None,
                    timestamp: now_ms(),
                    sequence: last_seq.unwrap_or(0),
                },
            );
        }
        let (is_locked, command_id, source) = match executor.current_command() {
            Some((cmd_id, src)) => (true, Some(cmd_id), Some(src)),
            None => (false, None, None),
        };
        inner.broadcaster.send_to(
            id,
            ServerMessage::TerminalLockState {
                is_locked,
                command_id,
                source,
            },
        );
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Close the session: stop accepting subscribers, close the transport,
    /// fail in-flight requests. Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            inner.state = SessionState::Closing;
            inner.broadcaster.close();
        }
        info!("SSH[{}] closing session", self.name);
        self.transport.close().await;
        self.executor.fail_all();
        self.ready.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Reader task
    // ------------------------------------------------------------------

    async fn reader_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ReaderMsg>) {
        debug!("SSH[{}] reader task started", self.name);
        let mut filter = EchoPromptFilter::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                ReaderMsg::Bytes(bytes) => {
                    let events = filter.feed(&bytes);
                    self.process_events(events, &mut filter).await;
                }
                ReaderMsg::Register { start } => {
                    self.start_command_on_reader(&mut filter, start).await;
                }
                ReaderMsg::Inject(text) => {
                    let events = filter.inject_text(&text);
                    self.process_events(events, &mut filter).await;
                }
                ReaderMsg::Closed(reason) => {
                    self.on_transport_lost(&mut filter, reason);
                    break;
                }
            }
        }
        debug!("SSH[{}] reader task ended", self.name);
    }

    async fn start_command_on_reader(&self, filter: &mut EchoPromptFilter, start: StartCommand) {
        let events = filter.register_command(&start.command, &start.wire, true);
        let starts = self.apply_events(events);
        let mut line = start.wire.into_bytes();
        line.push(b'\n');
        if self.transport.write(&line).await.is_err() {
            warn!("SSH[{}] failed to write command to shell", self.name);
        }
        // A forced completion during registration can release queued work.
        for next in starts {
            Box::pin(self.start_command_on_reader(filter, next)).await;
        }
    }

    async fn process_events(&self, events: Vec<FilterEvent>, filter: &mut EchoPromptFilter) {
        let starts = self.apply_events(events);
        for start in starts {
            self.start_command_on_reader(filter, start).await;
        }
    }

    /// Apply filter events to history / broadcaster / executor state.
    /// Returns follow-up commands released from the queue by completions.
    fn apply_events(&self, events: Vec<FilterEvent>) -> Vec<StartCommand> {
        let mut starts = Vec::new();
        for event in events {
            match event {
                FilterEvent::Chunk(chunk) => {
                    let mut inner = self.inner.lock().unwrap();
                    let msg = ServerMessage::TerminalOutput {
                        data: chunk.data.clone(),
                        source: inner.current_source,
                        timestamp: now_ms(),
                        sequence: chunk.seq,
                    };
                    inner.history.append(chunk);
                    inner.broadcaster.broadcast(&msg);
                }
                FilterEvent::Ready => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.ready_seen = true;
                        if inner.state == SessionState::Connecting {
                            inner.state = SessionState::Connected;
                        }
                    }
                    self.ready.notify_waiters();
                    info!("SSH[{}] shell ready", self.name);
                }
                FilterEvent::CommandComplete { exit_code, stdout } => {
                    if let Some(start) = self.finish_command(exit_code, stdout) {
                        starts.push(start);
                    }
                }
            }
        }
        starts
    }

    fn finish_command(&self, exit_code: i32, stdout: String) -> Option<StartCommand> {
        let result = CommandResult {
            stdout,
            stderr: String::new(),
            exit_code,
        };
        let completion = self.executor.complete(result.clone())?;
        debug!(
            "SSH[{}] command {} finished (exit {}, cancelled: {})",
            self.name, completion.command_id, exit_code, completion.was_cancelled
        );
        self.browser
            .lock()
            .unwrap()
            .complete(&completion.command_id, result);

        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = now_ms();
        match completion.next {
            Some(start) => {
                inner.current_source = Some(start.source);
                inner.broadcaster.broadcast(&ServerMessage::TerminalLockState {
                    is_locked: true,
                    command_id: Some(start.command_id.clone()),
                    source: Some(start.source),
                });
                Some(start)
            }
            None => {
                inner.current_source = None;
                inner.broadcaster.broadcast(&ServerMessage::TerminalReady);
                inner.broadcaster.broadcast(&ServerMessage::TerminalLockState {
                    is_locked: false,
                    command_id: None,
                    source: None,
                });
                None
            }
        }
    }

    fn on_transport_lost(&self, filter: &mut EchoPromptFilter, reason: Option<String>) {
        warn!(
            "SSH[{}] transport lost: {}",
            self.name,
            reason.as_deref().unwrap_or("unknown")
        );
        let _ = filter.abort_pending();
        self.executor.fail_all();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::Closed;
            inner.broadcaster.close();
        }
        self.ready.notify_waiters();
    }

    fn begin_command(&self, start: StartCommand) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.current_source = Some(start.source);
            inner.broadcaster.broadcast(&ServerMessage::TerminalLockState {
                is_locked: true,
                command_id: Some(start.command_id.clone()),
                source: Some(start.source),
            });
        }
        self.reader_tx
            .send(ReaderMsg::Register { start })
            .map_err(|_| SessionError::Closed)
    }

    fn touch(&self) {
        self.inner.lock().unwrap().last_activity = now_ms();
    }
}
