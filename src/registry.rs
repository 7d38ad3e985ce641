//! Session Registry
//!
//! Named collection of sessions. Names are reserved before the SSH
//! connection is attempted, so uniqueness holds under concurrent `connect`
//! calls; a failed connection rolls the reservation back.

use crate::core::error::SessionError;
use crate::core::session::{Session, SessionSummary};
use crate::ssh::config::SshConfig;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    /// Names currently connecting; counts as taken.
    reserved: HashSet<String>,
}

/// Process-wide session map. The lock is held only for map operations,
/// never across a connection attempt.
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                sessions: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }

    /// Create a session under `name`. Fails with `exists` if the name is
    /// taken (or being connected) by anyone else.
    pub async fn create(
        &self,
        name: &str,
        config: SshConfig,
    ) -> Result<Arc<Session>, SessionError> {
        {
            let mut state = self.state.write().await;
            if state.sessions.contains_key(name) || !state.reserved.insert(name.to_string()) {
                return Err(SessionError::Exists(name.to_string()));
            }
        }

        let result = Session::connect(name, config).await;

        let mut state = self.state.write().await;
        state.reserved.remove(name);
        match result {
            Ok(session) => {
                info!("session {} registered", name);
                state.sessions.insert(name.to_string(), Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                warn!("session {} failed to connect: {}", name, e);
                Err(e)
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Session>, SessionError> {
        let state = self.state.read().await;
        state
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let state = self.state.read().await;
        state.sessions.values().map(|s| s.summary()).collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        let state = self.state.read().await;
        state.sessions.contains_key(name)
    }

    /// Transition the named session to closing and drop it from the map.
    pub async fn dispose(&self, name: &str) -> Result<(), SessionError> {
        let session = {
            let mut state = self.state.write().await;
            state
                .sessions
                .remove(name)
                .ok_or_else(|| SessionError::NotFound(name.to_string()))?
        };
        session.close().await;
        info!("session {} disposed", name);
        Ok(())
    }

    /// Close every session (process shutdown).
    pub async fn dispose_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.write().await;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        let state = self.state.read().await;
        state.sessions.len()
    }

    /// Register an externally constructed session (tests drive this with a
    /// scripted transport).
    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, session: Arc<Session>) {
        let mut state = self.state.write().await;
        state.sessions.insert(session.name().to_string(), session);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::now_ms;
    use crate::core::session::{ReaderMsg, SessionState, ShellSignal, ShellTransport};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullShell;

    #[async_trait]
    impl ShellTransport for NullShell {
        async fn write(&self, _data: &[u8]) -> Result<(), SessionError> {
            Ok(())
        }
        async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
            Ok(())
        }
        async fn send_signal(&self, _signal: ShellSignal) -> Result<(), SessionError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn test_session(name: &str) -> Arc<Session> {
        let (tx, rx) = mpsc::unbounded_channel::<ReaderMsg>();
        Session::start(name, "web01", "alice", Arc::new(NullShell), tx, rx)
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let registry = SessionRegistry::new();
        registry.insert_for_test(test_session("s1")).await;
        registry.insert_for_test(test_session("s2")).await;

        assert!(registry.get("s1").await.is_ok());
        assert!(matches!(
            registry.get("missing").await,
            Err(SessionError::NotFound(_))
        ));

        let summaries = registry.list().await;
        assert_eq!(summaries.len(), 2);
        let s1 = summaries.iter().find(|s| s.name == "s1").unwrap();
        assert_eq!(s1.username, "alice");
        assert_eq!(s1.status, SessionState::Connecting);
        assert!(s1.last_activity <= now_ms());
    }

    #[tokio::test]
    async fn test_dispose_removes_and_closes() {
        let registry = SessionRegistry::new();
        let session = test_session("s1");
        registry.insert_for_test(Arc::clone(&session)).await;

        registry.dispose("s1").await.unwrap();
        assert!(matches!(
            registry.dispose("s1").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            session.state(),
            SessionState::Closing | SessionState::Closed
        ));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_is_exists() {
        let registry = SessionRegistry::new();
        registry.insert_for_test(test_session("s1")).await;

        let config = SshConfig::new(crate::ssh::config::HostConfig {
            hostname: "127.0.0.1".to_string(),
            port: 1,
            username: "nobody".to_string(),
            auth: crate::ssh::config::SshAuth::Password("x".to_string()),
        });
        match registry.create("s1", config).await {
            Err(SessionError::Exists(name)) => assert_eq!(name, "s1"),
            other => panic!("expected exists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_connect_releases_name() {
        let registry = SessionRegistry::new();
        // Nothing listens on port 1; the connect fails fast and the name
        // must become available again.
        let config = SshConfig::new(crate::ssh::config::HostConfig {
            hostname: "127.0.0.1".to_string(),
            port: 1,
            username: "nobody".to_string(),
            auth: crate::ssh::config::SshAuth::Password("x".to_string()),
        });
        assert!(registry.create("s1", config).await.is_err());
        assert!(!registry.contains("s1").await);
        registry.insert_for_test(test_session("s1")).await;
        assert!(registry.contains("s1").await);
    }
}
