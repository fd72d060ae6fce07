//! The accept loop: binds `config.listen_addr` and spawns one
//! [`engine::run`] task per accepted connection, mirroring the
//! teacher's `Client::listen` connection-accept loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::engine;
use crate::metrics::MetricsSink;
use crate::net_filter::NetFilter;

/// Runs the accept loop until the listener fails. Never returns `Ok`
/// under normal operation.
pub async fn run(
    config: Arc<ProxyConfig>,
    net_filter: Arc<dyn NetFilter>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening for client connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept connection");
                continue;
            }
        };

        let conn_id = Uuid::new_v4();
        info!(%conn_id, %peer, "accepted connection");

        let config = config.clone();
        let net_filter = net_filter.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            engine::run(conn_id, stream, config, net_filter, metrics).await;
        });
    }
}
