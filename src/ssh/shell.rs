//! SSH Shell Adapter
//!
//! Owns one PTY-backed interactive shell over SSH. A dedicated I/O task has
//! exclusive ownership of the russh channel: it serves write/resize/signal
//! commands from an mpsc queue and streams raw channel bytes into the
//! session reader. No raw byte bypasses the session's filter.

use crate::core::error::SessionError;
use crate::core::session::{ReaderMsg, ShellSignal, ShellTransport};
use crate::ssh::client::{self, SshClient};
use crate::ssh::config::SshConfig;
use crate::ssh::error::SshError;
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Pty, Sig};
use tokio::sync::mpsc;

/// Interrupt control byte written when the native signal path is not
/// honored (and for all browser-channel cancellations).
pub const CTRL_C: u8 = 0x03;

/// Delay after the init sequence before the shell is considered usable.
pub const READINESS_DELAY_MS: u64 = 200;

/// Commands served by the channel I/O task.
enum AdapterCmd {
    Write(Vec<u8>),
    Resize(u16, u16),
    Signal(ShellSignal),
    Close,
}

/// Handle to one SSH shell. Cheap to share; all I/O funnels through the
/// channel task.
pub struct SshShellAdapter {
    session_name: String,
    cmd_tx: mpsc::UnboundedSender<AdapterCmd>,
    // Keeps the SSH connection alive for the lifetime of the adapter.
    _handle: Handle<SshClient>,
}

impl SshShellAdapter {
    /// Connect, authenticate, open the PTY shell channel and spawn its I/O
    /// task. Raw bytes flow into `reader_tx` as `ReaderMsg::Bytes`; channel
    /// teardown is reported as `ReaderMsg::Closed`.
    pub async fn connect(
        session_name: &str,
        config: &SshConfig,
        reader_tx: mpsc::UnboundedSender<ReaderMsg>,
    ) -> Result<Self, SshError> {
        let mut handle = client::connect_direct(&config.target).await?;
        client::authenticate(&mut handle, &config.target).await?;

        debug!("SSH[{}] opening session channel", session_name);
        let channel = handle.channel_open_session().await?;
        debug!(
            "SSH[{}] session channel opened, id: {:?}",
            session_name,
            channel.id()
        );

        // TTY_OP_ISPEED and TTY_OP_OSPEED are needed for interactive
        // programs to configure raw mode properly.
        debug!(
            "SSH[{}] requesting PTY {}x{}",
            session_name, config.terminal.cols, config.terminal.rows
        );
        channel
            .request_pty(
                false,
                "xterm-256color",
                config.terminal.cols as u32,
                config.terminal.rows as u32,
                0,
                0,
                &[
                    (Pty::TTY_OP_ISPEED, 38400),
                    (Pty::TTY_OP_OSPEED, 38400),
                ],
            )
            .await?;

        debug!("SSH[{}] requesting shell", session_name);
        channel.request_shell(false).await?;
        info!("SSH[{}] shell started", session_name);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<AdapterCmd>();
        let name = session_name.to_string();
        tokio::spawn(async move {
            Self::channel_io_loop(channel, cmd_rx, reader_tx, name).await;
        });

        Ok(SshShellAdapter {
            session_name: session_name.to_string(),
            cmd_tx,
            _handle: handle,
        })
    }

    /// Write the prompt-stabilizing initialization sequence: disable server
    /// echo, set the canonical bracket prompt, drop PROMPT_COMMAND. Output
    /// is redirected to a null sink; whatever echo leaks is discarded by
    /// the filter until the first canonical prompt. A short readiness delay
    /// follows.
    pub async fn run_init_sequence(&self) -> Result<(), SessionError> {
        const INIT_LINES: &[&str] = &[
            "stty -echo > /dev/null 2>&1\n",
            "export PS1='[\\u@\\h \\W]$ ' PS2='' > /dev/null 2>&1\n",
            "unset PROMPT_COMMAND > /dev/null 2>&1\n",
        ];
        for line in INIT_LINES {
            self.write(line.as_bytes()).await?;
        }
        tokio::time::sleep(std::time::Duration::from_millis(READINESS_DELAY_MS)).await;
        Ok(())
    }

    /// Channel I/O loop - owns the channel exclusively
    async fn channel_io_loop(
        mut channel: Channel<Msg>,
        mut cmd_rx: mpsc::UnboundedReceiver<AdapterCmd>,
        reader_tx: mpsc::UnboundedSender<ReaderMsg>,
        session_name: String,
    ) {
        debug!("SSH[{}] channel I/O loop started", session_name);
        let mut close_reason: Option<String> = None;

        loop {
            tokio::select! {
                // Prioritize outbound commands (user input) over reads so
                // interactive programs stay responsive.
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(AdapterCmd::Write(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("SSH[{}] write error: {:?}", session_name, e);
                                close_reason = Some(format!("write error: {}", e));
                                break;
                            }
                        }
                        Some(AdapterCmd::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                warn!("SSH[{}] resize error: {:?}", session_name, e);
                            }
                        }
                        Some(AdapterCmd::Signal(ShellSignal::Interrupt)) => {
                            // Best-effort native signal; fall back to the
                            // control byte when the server ignores it.
                            if let Err(e) = channel.signal(Sig::INT).await {
                                debug!("SSH[{}] channel signal not honored ({}), writing 0x03", session_name, e);
                                if let Err(e) = channel.data(&[CTRL_C][..]).await {
                                    warn!("SSH[{}] interrupt write error: {:?}", session_name, e);
                                    close_reason = Some(format!("write error: {}", e));
                                    break;
                                }
                            }
                        }
                        Some(AdapterCmd::Close) | None => {
                            debug!("SSH[{}] close requested", session_name);
                            let _ = channel.eof().await;
                            close_reason = Some("closed by client".to_string());
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = reader_tx.send(ReaderMsg::Bytes(data.to_vec()));
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            let _ = reader_tx.send(ReaderMsg::Bytes(data.to_vec()));
                        }
                        Some(ChannelMsg::Eof) => {
                            debug!("SSH[{}] received channel EOF - connection closing", session_name);
                            close_reason = Some("channel EOF".to_string());
                            break;
                        }
                        Some(ChannelMsg::Close) => {
                            debug!("SSH[{}] received channel Close - connection terminated", session_name);
                            close_reason = Some("channel closed by server".to_string());
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            // The remote shell itself exited; EOF/Close follows.
                            debug!("SSH[{}] remote shell exited with status: {}", session_name, exit_status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            debug!("SSH[{}] remote shell killed by signal: {:?}", session_name, signal_name);
                        }
                        Some(_) => {
                            // Other channel messages (WindowAdjusted, etc.)
                        }
                        None => {
                            debug!("SSH[{}] channel wait returned None - network disconnected", session_name);
                            close_reason = Some("network disconnected".to_string());
                            break;
                        }
                    }
                }
            }
        }

        let _ = reader_tx.send(ReaderMsg::Closed(close_reason));
        debug!("SSH[{}] channel I/O loop ended", session_name);
    }
}

#[async_trait]
impl ShellTransport for SshShellAdapter {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.cmd_tx
            .send(AdapterCmd::Write(data.to_vec()))
            .map_err(|e| {
                SessionError::SshError(SshError::ChannelError(e.to_string()))
            })?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.cmd_tx
            .send(AdapterCmd::Resize(cols, rows))
            .map_err(|e| {
                SessionError::SshError(SshError::ChannelError(e.to_string()))
            })?;
        Ok(())
    }

    async fn send_signal(&self, signal: ShellSignal) -> Result<(), SessionError> {
        self.cmd_tx
            .send(AdapterCmd::Signal(signal))
            .map_err(|e| {
                SessionError::SshError(SshError::ChannelError(e.to_string()))
            })?;
        Ok(())
    }

    async fn close(&self) {
        debug!("SSH[{}] adapter close", self.session_name);
        // Dropping on a dead loop is fine; the reader already saw Closed.
        let _ = self.cmd_tx.send(AdapterCmd::Close);
    }
}
