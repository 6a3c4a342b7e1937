use std::sync::Arc;

use tracing::Level;
use tunnel_relay::config::ProxyConfig;
use tunnel_relay::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ProxyConfig::load();
    let debug = cfg.as_ref().map(|c| c.debug).unwrap_or(false);

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .init();

    let cfg = match cfg {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    tokio::select! {
        res = server::listener::run(cfg) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
