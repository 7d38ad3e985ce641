//! WebSocket message taxonomy.
//!
//! Every message is a JSON object with a `type` discriminator. Inbound
//! messages parse into `ClientMessage` at exactly one site; anything that
//! does not parse is answered with `malformed_message_handled` and the
//! socket stays open.

use crate::core::command::CommandSource;
use crate::core::session::SessionSummary;
use serde::{Deserialize, Serialize};

/// Messages sent from the server to a WebSocket client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chunk of the normalized stream. `data` may contain CR-LF and ANSI
    /// sequences; `sequence` is the session-monotonic chunk number.
    TerminalOutput {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<CommandSource>,
        timestamp: u64,
        sequence: u64,
    },
    TerminalLockState {
        #[serde(rename = "isLocked")]
        is_locked: bool,
        #[serde(rename = "commandId", skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<CommandSource>,
    },
    /// The executor returned to idle.
    TerminalReady,
    CommandError {
        #[serde(rename = "commandId")]
        command_id: String,
        source: CommandSource,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
    /// Acknowledges that an invalid inbound message was dropped.
    MalformedMessageHandled,
    /// Monitoring socket: snapshot of all session summaries.
    SessionList { sessions: Vec<SessionSummary> },
}

/// Messages received from a WebSocket client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a complete command line through the browser channel.
    TerminalInput {
        #[serde(rename = "sessionName", default)]
        session_name: Option<String>,
        command: String,
        #[serde(rename = "commandId", default)]
        command_id: Option<String>,
        #[serde(default)]
        source: Option<CommandSource>,
    },
    /// Raw keystrokes forwarded to shell stdin.
    TerminalInputRaw { data: String },
    /// Deliver a signal to the foreground process (currently SIGINT).
    TerminalSignal {
        #[serde(rename = "sessionName", default)]
        session_name: Option<String>,
        signal: String,
    },
    TerminalResize { cols: u16, rows: u16 },
    /// Re-send the history snapshot and the current lock state.
    RequestStateRecovery {
        #[serde(rename = "sessionName", default)]
        session_name: Option<String>,
    },
}
