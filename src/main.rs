mod auth;
mod buffer_pool;
mod config;
mod http;
mod pump;
mod session;
mod socks;
mod tunnel;

use crate::config::{Cli, ProxyConfig};
use crate::session::SessionTracker;
use crate::socks::SocksConnector;
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("htsp=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(args).await?);

    info!("HTTP proxy listening on http://{}", config.listen_addr);
    info!(
        "SOCKS5 upstream: {} ({:?} handshake)",
        config.socks_addr, config.handshake
    );
    if config.basic_token.is_some() {
        info!("Inbound proxy authentication enforced");
    }

    let connector = Arc::new(SocksConnector::new(
        config.socks_addr,
        config.socks_credential.clone(),
        config.handshake,
    ));

    let listener = bind_listener(config.listen_addr, config.backlog)?;
    let tracker = SessionTracker::new();

    // Graceful shutdown signal handling
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::task::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    // Main server loop
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let connector = connector.clone();
                    let basic_token = config.basic_token.clone();
                    let cancel = shutdown.child_token();
                    let permit = tracker.begin();
                    tokio::task::spawn(async move {
                        let _permit = permit;
                        debug!(%peer_addr, "accepted");
                        session::run(stream, connector, basic_token, cancel).await;
                    });
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                }
            }
        }
    }

    // Give in-flight sessions a chance to finish before the process exits
    let active = tracker.active();
    if active > 0 {
        info!("Waiting for {} sessions to close...", active);
        match tracker.drain(Duration::from_secs(30)).await {
            0 => info!("All sessions closed gracefully"),
            remaining => warn!("Forced shutdown with {} sessions still active", remaining),
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}
