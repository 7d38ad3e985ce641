//! Single-port HTTP and WebSocket surface.
//!
//! Serves the embedded terminal pages, upgrades per-session subscriber
//! sockets and the monitoring socket, and maintains the port file other
//! processes use to find this server.

pub mod protocol;
pub mod socket;

use crate::registry::SessionRegistry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{any, get};
use axum::Router;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the file the bound port is written to, in the working directory.
pub const PORT_FILE_NAME: &str = ".ssh-mcp-server.port";

const TERMINAL_PAGE: &str = include_str!("terminal.html");

/// Shared state for the axum handlers.
pub struct WebState {
    pub registry: Arc<SessionRegistry>,
}

/// Routes for the single-port surface.
pub fn app(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/session/{name}", get(session_page))
        .route("/ws/monitoring", any(socket::monitoring_ws))
        .route("/ws/session/{name}", any(socket::session_ws))
        .with_state(state)
}

async fn index_page() -> Html<&'static str> {
    Html(TERMINAL_PAGE)
}

async fn session_page(
    Path(name): Path<String>,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    if state.registry.contains(&name).await {
        Html(TERMINAL_PAGE).into_response()
    } else {
        (StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

/// A running HTTP listener plus its port file.
pub struct WebServer {
    addr: SocketAddr,
    port_file: PathBuf,
    handle: tokio::task::JoinHandle<()>,
}

impl WebServer {
    /// Bind `bind_addr` (e.g. `127.0.0.1:0`), write the port file into
    /// `port_file_dir`, and serve in the background.
    pub async fn start(
        registry: Arc<SessionRegistry>,
        bind_addr: &str,
        port_file_dir: &std::path::Path,
    ) -> std::io::Result<WebServer> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;

        let port_file = port_file_dir.join(PORT_FILE_NAME);
        std::fs::write(&port_file, addr.port().to_string())?;
        info!("web surface on http://{} (port file {:?})", addr, port_file);

        let state = Arc::new(WebState { registry });
        let router = app(state);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("web server exited: {}", e);
            }
        });

        Ok(WebServer {
            addr,
            port_file,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host usable in URLs handed to clients.
    fn url_host(&self) -> String {
        let ip = self.addr.ip();
        if ip.is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            ip.to_string()
        }
    }

    /// `http://host:port` for URLs handed to clients.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.url_host(), self.addr.port())
    }

    /// Browser URL for one session, re-using this server's port.
    pub fn monitoring_url(&self, session_name: &str) -> String {
        format!("{}/session/{}", self.base_url(), session_name)
    }

    /// Stop serving and remove the port file.
    pub fn shutdown(&self) {
        self.handle.abort();
        self.remove_port_file();
    }

    /// Remove the port file; called on every exit path.
    pub fn remove_port_file(&self) {
        if self.port_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.port_file) {
                warn!("failed to remove port file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let server = WebServer::start(registry, "127.0.0.1:0", dir.path())
            .await
            .unwrap();

        let port_file = dir.path().join(PORT_FILE_NAME);
        let written = std::fs::read_to_string(&port_file).unwrap();
        assert_eq!(written, server.addr().port().to_string());

        server.shutdown();
        assert!(!port_file.exists());
    }

    #[tokio::test]
    async fn test_monitoring_url_shape() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let server = WebServer::start(registry, "127.0.0.1:0", dir.path())
            .await
            .unwrap();
        let url = server.monitoring_url("s1");
        assert_eq!(
            url,
            format!("http://127.0.0.1:{}/session/s1", server.addr().port())
        );
        server.shutdown();
    }
}
