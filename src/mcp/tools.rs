//! Tool Dispatcher
//!
//! Maps the fixed tool vocabulary onto registry and session operations.
//! Every outcome — success or failure — is returned as a structured
//! payload with a `success` flag; nothing escapes this boundary as an
//! exception. The gating failure carries the drained browser commands.

use crate::core::error::{ErrorKind, SessionError};
use crate::core::session::ExecError;
use crate::registry::SessionRegistry;
use crate::ssh::config::{HostConfig, SshAuth, SshConfig};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// The dispatcher does not recognize this tool name; the JSON-RPC layer
/// answers with an invalid-params error.
#[derive(Debug)]
pub struct UnknownTool(pub String);

#[derive(Debug, Deserialize)]
struct ConnectArgs {
    name: String,
    host: String,
    username: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    password: Option<String>,
    #[serde(rename = "privateKey", default)]
    private_key: Option<String>,
    #[serde(rename = "keyFilePath", default)]
    key_file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecArgs {
    #[serde(rename = "sessionName")]
    session_name: String,
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    #[serde(rename = "sessionName")]
    session_name: String,
}

/// See module docs.
pub struct ToolDispatcher {
    registry: Arc<SessionRegistry>,
    /// `http://host:port` of the web surface, when it is up.
    monitoring_base: Option<String>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, monitoring_base: Option<String>) -> Self {
        Self {
            registry,
            monitoring_base,
        }
    }

    /// Execute one tool call. The returned value is always a payload with
    /// `success`; `Err` only for unrecognized tool names.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Result<Value, UnknownTool> {
        info!("tool call: {}", tool);
        let payload = match tool {
            "connect" => self.connect(args).await,
            "exec" => self.exec(args).await,
            "cancel" => self.cancel(args).await,
            "list" => self.list().await,
            "disconnect" => self.disconnect(args).await,
            "monitoring-url" => self.monitoring_url(args).await,
            other => return Err(UnknownTool(other.to_string())),
        };
        Ok(payload)
    }

    async fn connect(&self, args: Value) -> Value {
        let args: ConnectArgs = match parse_args(args) {
            Ok(args) => args,
            Err(payload) => return payload,
        };
        let auth = match (args.password, args.private_key, args.key_file_path) {
            (Some(password), None, None) => SshAuth::Password(password),
            (None, Some(data), None) => SshAuth::KeyData {
                data,
                passphrase: None,
            },
            (None, None, Some(path)) => SshAuth::KeyFile {
                path,
                passphrase: None,
            },
            (None, None, None) => {
                return error_payload(
                    ErrorKind::MissingParams,
                    "one of password, privateKey or keyFilePath is required",
                )
            }
            _ => {
                return error_payload(
                    ErrorKind::MissingParams,
                    "password, privateKey and keyFilePath are mutually exclusive",
                )
            }
        };
        let config = SshConfig::new(HostConfig {
            hostname: args.host,
            port: args.port.unwrap_or(22),
            username: args.username,
            auth,
        });
        match self.registry.create(&args.name, config).await {
            Ok(session) => json!({
                "success": true,
                "connection": session.summary(),
            }),
            Err(e) => session_error_payload(&e),
        }
    }

    async fn exec(&self, args: Value) -> Value {
        let args: ExecArgs = match parse_args(args) {
            Ok(args) => args,
            Err(payload) => return payload,
        };
        let session = match self.registry.get(&args.session_name).await {
            Ok(session) => session,
            Err(e) => return session_error_payload(&e),
        };
        match session.exec_from_tool(&args.command, args.timeout).await {
            Ok(result) => json!({ "success": true, "result": result }),
            Err(ExecError::Gated(records)) => json!({
                "success": false,
                "error": ErrorKind::BrowserCommandsExecuted.as_str(),
                "message": "User executed commands directly in browser",
                "browserCommands": records,
                "retryAllowed": true,
            }),
            Err(ExecError::TimeoutTooSmall(ms)) => error_payload(
                ErrorKind::MissingParams,
                &format!("timeout must be at least 1000 ms (got {})", ms),
            ),
            Err(ExecError::Cancelled(result)) => json!({
                "success": false,
                "error": ErrorKind::Cancelled.as_str(),
                "message": "command was cancelled",
                "result": result,
            }),
            Err(ExecError::TimedOut(result)) => json!({
                "success": false,
                "error": ErrorKind::Timeout.as_str(),
                "message": "command timed out and was interrupted",
                "result": result,
            }),
            Err(ExecError::TransportLost) => error_payload(
                ErrorKind::TransportLost,
                "the SSH transport was lost while the command ran",
            ),
            Err(ExecError::Session(e)) => session_error_payload(&e),
        }
    }

    async fn cancel(&self, args: Value) -> Value {
        let args: SessionArgs = match parse_args(args) {
            Ok(args) => args,
            Err(payload) => return payload,
        };
        let session = match self.registry.get(&args.session_name).await {
            Ok(session) => session,
            Err(e) => return session_error_payload(&e),
        };
        match session.cancel_from_tool().await {
            Ok(()) => json!({ "success": true, "cancelled": true }),
            Err(e) => session_error_payload(&e),
        }
    }

    async fn list(&self) -> Value {
        let sessions = self.registry.list().await;
        json!({ "success": true, "sessions": sessions })
    }

    async fn disconnect(&self, args: Value) -> Value {
        let args: SessionArgs = match parse_args(args) {
            Ok(args) => args,
            Err(payload) => return payload,
        };
        match self.registry.dispose(&args.session_name).await {
            Ok(()) => json!({
                "success": true,
                "message": format!("session {} disconnected", args.session_name),
            }),
            Err(e) => session_error_payload(&e),
        }
    }

    async fn monitoring_url(&self, args: Value) -> Value {
        let args: SessionArgs = match parse_args(args) {
            Ok(args) => args,
            Err(payload) => return payload,
        };
        if let Err(e) = self.registry.get(&args.session_name).await {
            return session_error_payload(&e);
        }
        match &self.monitoring_base {
            Some(base) => json!({
                "success": true,
                "monitoringUrl": format!("{}/session/{}", base, args.session_name),
            }),
            None => error_payload(
                ErrorKind::WebUnavailable,
                "the web surface is not running",
            ),
        }
    }
}

/// MCP descriptors for the fixed tool vocabulary.
pub fn tool_descriptors() -> Value {
    json!([
        {
            "name": "connect",
            "description": "Open a named SSH session with a persistent interactive shell.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Unique session name" },
                    "host": { "type": "string" },
                    "username": { "type": "string" },
                    "port": { "type": "number" },
                    "password": { "type": "string" },
                    "privateKey": { "type": "string", "description": "Private key material" },
                    "keyFilePath": { "type": "string", "description": "Path to a private key file" }
                },
                "required": ["name", "host", "username"]
            }
        },
        {
            "name": "exec",
            "description": "Run a command in the session's shell and return stdout and exit code. Fails with browser-commands-executed when a user ran commands in the browser since the last exec.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "sessionName": { "type": "string" },
                    "command": { "type": "string" },
                    "timeout": { "type": "number", "description": "Deadline in milliseconds, minimum 1000" }
                },
                "required": ["sessionName", "command"]
            }
        },
        {
            "name": "cancel",
            "description": "Interrupt the command currently running in the session.",
            "inputSchema": {
                "type": "object",
                "properties": { "sessionName": { "type": "string" } },
                "required": ["sessionName"]
            }
        },
        {
            "name": "list",
            "description": "List all sessions with their connection state.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "disconnect",
            "description": "Close a session and release its resources.",
            "inputSchema": {
                "type": "object",
                "properties": { "sessionName": { "type": "string" } },
                "required": ["sessionName"]
            }
        },
        {
            "name": "monitoring-url",
            "description": "Browser URL of the live terminal for a session.",
            "inputSchema": {
                "type": "object",
                "properties": { "sessionName": { "type": "string" } },
                "required": ["sessionName"]
            }
        }
    ])
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, Value> {
    serde_json::from_value(args)
        .map_err(|e| error_payload(ErrorKind::MissingParams, &e.to_string()))
}

fn error_payload(kind: ErrorKind, message: &str) -> Value {
    json!({
        "success": false,
        "error": kind.as_str(),
        "message": message,
    })
}

fn session_error_payload(e: &SessionError) -> Value {
    error_payload(e.kind(), &e.to_string())
}
