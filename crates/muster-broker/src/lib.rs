//! muster-broker — the broker side of the fleet relay.
//!
//! Agents dial in, pass the join handshake, and stay connected on one
//! multiplexed session each. The broker addresses them by durable numeric
//! identifier and dispatches calls over the live sessions; everything a
//! caller needs hangs off [`Broker`].

pub mod dispatch;
pub mod join;
pub mod limiter;
pub mod phase;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use muster_core::config::BrokerConfig;
use muster_session::Router;

pub use dispatch::{Dispatcher, TaskResult};
pub use join::Acceptor;
pub use phase::{Notifier, NoopListener, Phase, PhaseListener};
pub use registry::{Conn, Registry};
pub use store::{MemPeerStore, PeerRecord, PeerStatus, PeerStore};

/// Everything one broker instance owns: the acceptor admitting new peers,
/// the registry of live connections, and the dispatcher over them.
pub struct Broker {
    acceptor: Arc<Acceptor>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
}

impl Broker {
    pub fn new(
        config: &BrokerConfig,
        store: Arc<dyn PeerStore>,
        notifier: Notifier,
        router: Arc<Router>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.registry_shards));
        let pool = Arc::new(pool::WorkerPool::new(
            config.dispatch.workers,
            config.dispatch.queue,
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            pool,
            Duration::from_secs(config.dispatch.timeout_secs),
        );
        let acceptor = Arc::new(Acceptor::new(
            config,
            store,
            registry.clone(),
            notifier,
            router,
        ));
        Self {
            acceptor,
            registry,
            dispatcher,
        }
    }

    /// Run one inbound connection to completion. Spawn this per accepted
    /// socket.
    pub async fn admit<T>(&self, transport: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.acceptor.admit(transport, peer).await;
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Server-initiated close of `id`'s session. Removal and the
    /// `Disconnected` notification flow through the normal serve-exit
    /// path. Returns false when the peer was not online.
    pub async fn knockout(&self, id: u64) -> bool {
        match self.registry.get(id) {
            Some(conn) => {
                tracing::info!(id, "knocking out peer");
                conn.session.close().await;
                true
            }
            None => false,
        }
    }
}
