use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::ProxyConfig;
use crate::http::connection::Connection;
use crate::proxy::Relay;

/// Binds the configured address and serves until the task is dropped.
pub async fn run(cfg: Arc<ProxyConfig>) -> anyhow::Result<()> {
    let relay = Arc::new(Relay::from_config(Arc::clone(&cfg))?);

    let listener = TcpListener::bind(cfg.listen_addr()).await?;
    info!(
        addr = %cfg.listen_addr(),
        upstream = %cfg.upstream_base_url,
        tunnel = %format!("{}:{}", cfg.tunnel.host, cfg.tunnel.port),
        prefix = %cfg.path_prefix,
        "Listening"
    );

    serve(listener, relay).await
}

/// Accepts connections on an already bound listener, one task each.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        tracing::debug!("Accepted connection from {}", peer);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "could not disable Nagle");
        }

        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, relay);
            if let Err(e) = conn.run().await {
                tracing::warn!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
