use log::{info, warn};
use ssh_mcp_server::mcp;
use ssh_mcp_server::mcp::tools::ToolDispatcher;
use ssh_mcp_server::registry::SessionRegistry;
use ssh_mcp_server::web::WebServer;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // stdout carries the JSON-RPC channel; all logging goes to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let registry = Arc::new(SessionRegistry::new());

    // Single-port HTTP/WebSocket surface. The bound port lands in the port
    // file next to the working directory; tool calls keep working without
    // it, `monitoring-url` reports web-unavailable.
    let bind_addr =
        std::env::var("SSH_MCP_WEB_BIND").unwrap_or_else(|_| "127.0.0.1:0".to_string());
    let port_file_dir = std::env::current_dir()?;
    let web = match WebServer::start(Arc::clone(&registry), &bind_addr, &port_file_dir).await {
        Ok(web) => Some(web),
        Err(e) => {
            warn!("web surface unavailable: {}", e);
            None
        }
    };

    let monitoring_base = web.as_ref().map(|w| w.base_url());
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::clone(&registry), monitoring_base));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = mcp::serve_stdio(dispatcher) => {
            match result {
                Ok(()) => info!("stdio channel reached EOF, shutting down"),
                Err(e) => warn!("stdio channel failed: {}", e),
            }
        }
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    }

    // Shutdown order: stop the web surface (and drop the port file), then
    // close every session.
    if let Some(web) = &web {
        web.shutdown();
    }
    registry.dispose_all().await;
    info!("shutdown complete");
    Ok(())
}
