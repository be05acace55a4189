//! musterd — muster fleet broker daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::net::TcpListener;

use muster_broker::{Broker, MemPeerStore, Notifier, Phase, PeerStatus, PhaseListener};
use muster_core::config::BrokerConfig;
use muster_core::wire::{paths, RpcResponse};
use muster_session::Router;

/// Phase listener that turns lifecycle events into log lines. Embedders
/// with audit or alerting hooks subscribe their own listeners next to it.
struct LogListener;

impl PhaseListener for LogListener {
    fn on_phase(&self, id: u64, phase: Phase) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match phase {
                Phase::Created => tracing::info!(id, "peer record created"),
                Phase::Repeated => tracing::warn!(id, "repeated login refused"),
                Phase::Connected => tracing::info!(id, "peer connected"),
                Phase::Disconnected { duration } => {
                    tracing::info!(id, ?duration, "peer disconnected")
                }
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BrokerConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BrokerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BrokerConfig::default()
    });
    if config.shared_secret.is_empty() {
        tracing::warn!("shared_secret is empty — every correctly framed join will decrypt");
    }

    let default_status = if config.auto_activate {
        PeerStatus::Active
    } else {
        PeerStatus::Inactive
    };
    let store = Arc::new(MemPeerStore::new(default_status));

    let mut notifier = Notifier::new();
    notifier.subscribe(Arc::new(LogListener));

    let mut router = Router::new();
    router
        .register(paths::HEARTBEAT, |_req| async {
            RpcResponse::ok(serde_json::json!({}))
        })
        .context("register heartbeat handler")?;

    let broker = Arc::new(Broker::new(&config, store, notifier, Arc::new(router)));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "musterd listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                socket.set_nodelay(true).ok();
                let broker = broker.clone();
                tokio::spawn(async move {
                    broker.admit(socket, peer).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
