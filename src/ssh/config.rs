use serde::{Deserialize, Serialize};

/// SSH authentication method. Immutable once the session is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password(String),
    /// Private key material held in memory (PEM/OpenSSH encoded).
    KeyData {
        data: String,
        passphrase: Option<String>,
    },
    /// Private key loaded from a file on disk.
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
}

/// Configuration for a single SSH host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

/// Terminal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Complete SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub target: HostConfig,
    pub terminal: TerminalConfig,
}

impl SshConfig {
    pub fn new(target: HostConfig) -> Self {
        Self {
            target,
            terminal: TerminalConfig::default(),
        }
    }
}
