//! Process supervisor for the tool-channel transport.
//!
//! Embedders run the MCP server as a long-lived child process. The
//! supervisor spawns it with piped stdio, exchanges line-framed JSON with
//! its stdin/stdout, logs stderr as diagnostics, and shuts it down with
//! SIGTERM plus a bounded grace period before escalating to SIGKILL.

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Default grace period between SIGTERM and SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A supervised tool-channel child process.
pub struct ServerSupervisor {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ServerSupervisor {
    /// Spawn `program` with piped stdio. Stderr is drained in the
    /// background and logged; it carries diagnostics only.
    pub fn spawn(program: &str, args: &[&str]) -> std::io::Result<Self> {
        info!("spawning tool-channel child: {} {:?}", program, args);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[child] {}", line);
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send one line-framed JSON message to the child's stdin.
    pub async fn send(&mut self, message: &Value) -> std::io::Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// Receive the next line-framed JSON message from the child's stdout.
    /// `None` on EOF; non-JSON lines are skipped.
    pub async fn recv(&mut self) -> std::io::Result<Option<Value>> {
        while let Some(line) = self.stdout.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    warn!("skipping non-JSON line from child: {}", e);
                }
            }
        }
        Ok(None)
    }

    /// Graceful shutdown: SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn shutdown(mut self, grace: Duration) -> std::io::Result<()> {
        if let Some(pid) = self.child.id() {
            debug!("sending SIGTERM to child {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM failed: {}", e);
            }
        }
        // Closing stdin lets a well-behaved child exit on EOF as well.
        drop(self.stdin);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                info!("child exited: {:?}", status?);
                Ok(())
            }
            Err(_) => {
                warn!("child ignored SIGTERM for {:?}, killing", grace);
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_line_framed_round_trip() {
        // `cat` echoes stdin back; good enough to prove the framing.
        let mut sup = ServerSupervisor::spawn("cat", &[]).unwrap();
        sup.send(&json!({"jsonrpc":"2.0","id":1,"method":"ping"}))
            .await
            .unwrap();
        let echoed = sup.recv().await.unwrap().unwrap();
        assert_eq!(echoed["method"], "ping");
        sup.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sigterm_terminates_child() {
        let sup = ServerSupervisor::spawn("sh", &["-c", "sleep 30"]).unwrap();
        assert!(sup.pid().is_some());
        // Nothing on stdout; shutdown must not hang.
        sup.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sigkill_escalation() {
        let sup = ServerSupervisor::spawn("sh", &["-c", "trap '' TERM; sleep 30"]).unwrap();
        // The child ignores SIGTERM; the supervisor must escalate.
        sup.shutdown(Duration::from_millis(300)).await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_skips_noise_lines() {
        let mut sup = ServerSupervisor::spawn(
            "sh",
            &["-c", "echo not json; echo '{\"ok\":true}'"],
        )
        .unwrap();
        let value = sup.recv().await.unwrap().unwrap();
        assert_eq!(value["ok"], true);
        sup.shutdown(Duration::from_secs(2)).await.unwrap();
    }
}
