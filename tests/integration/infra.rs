//! Shared fixtures: an in-process broker on a loopback listener and agents
//! that dial it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use muster_agent::{AgentSession, DialError, Dialer};
use muster_broker::{Broker, MemPeerStore, Notifier, Phase, PeerStatus, PhaseListener};
use muster_core::config::{AgentConfig, BrokerConfig, EndpointConfig};
use muster_core::wire::{paths, RpcResponse};
use muster_session::Router;

pub const SECRET: &str = "integration-fleet-secret";
/// Routable address agents assert; the dial itself is loopback.
pub const ADVERTISE: &str = "10.20.0.7";

pub struct Recorder(pub mpsc::UnboundedSender<(u64, Phase)>);

impl PhaseListener for Recorder {
    fn on_phase(&self, id: u64, phase: Phase) -> BoxFuture<'static, ()> {
        let tx = self.0.clone();
        Box::pin(async move {
            let _ = tx.send((id, phase));
        })
    }
}

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub store: Arc<MemPeerStore>,
    pub addr: SocketAddr,
    pub phases: mpsc::UnboundedReceiver<(u64, Phase)>,
}

/// Boot a broker with `config` (shared secret is forced to the fixture
/// value) and start accepting on an ephemeral loopback port.
pub async fn start_broker(mut config: BrokerConfig) -> TestBroker {
    config.shared_secret = SECRET.into();

    let default_status = if config.auto_activate {
        PeerStatus::Active
    } else {
        PeerStatus::Inactive
    };
    let store = Arc::new(MemPeerStore::new(default_status));

    let (tx, phases) = mpsc::unbounded_channel();
    let mut notifier = Notifier::new();
    notifier.subscribe(Arc::new(Recorder(tx)));

    let mut router = Router::new();
    router
        .register(paths::HEARTBEAT, |_req| async {
            RpcResponse::ok(serde_json::json!({}))
        })
        .unwrap();

    let broker = Arc::new(Broker::new(
        &config,
        store.clone(),
        notifier,
        Arc::new(router),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                let broker = broker.clone();
                tokio::spawn(async move { broker.admit(socket, peer).await });
            }
        });
    }

    TestBroker {
        broker,
        store,
        addr,
        phases,
    }
}

pub fn agent_config(broker: SocketAddr, hardware_id: &str) -> AgentConfig {
    AgentConfig {
        endpoints: vec![EndpointConfig {
            addr: broker.to_string(),
            tls: false,
            server_name: None,
        }],
        shared_secret: SECRET.into(),
        hardware_id: hardware_id.into(),
        advertise_addr: Some(ADVERTISE.parse().unwrap()),
        ..Default::default()
    }
}

/// Router agents serve in these tests: echoes task-status pulls, and
/// sleeps forever on `/slow` to exercise dispatch deadlines.
pub fn agent_router() -> Arc<Router> {
    let mut router = Router::new();
    router
        .register(paths::TASK_STATUS_PULL, |req| async move {
            RpcResponse::ok(req.body)
        })
        .unwrap();
    router
        .register("/slow", |_req| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            RpcResponse::ok(serde_json::Value::Null)
        })
        .unwrap();
    Arc::new(router)
}

/// Join one agent and start serving the broker's calls in the background.
/// Returns the live session handle.
pub async fn join_agent(
    broker: SocketAddr,
    hardware_id: &str,
) -> Result<Arc<AgentSession>, DialError> {
    let mut dialer = Dialer::new(agent_config(broker, hardware_id), agent_router());
    let session = Arc::new(dialer.connect_once().await?);
    {
        let session = session.clone();
        let router = agent_router();
        tokio::spawn(async move { session.serve(router).await });
    }
    Ok(session)
}

/// Poll until `id` shows up in the broker registry.
pub async fn wait_online(broker: &Broker, id: u64) {
    for _ in 0..100u32 {
        if broker.registry().get(id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("peer {id} never came online");
}

/// Drain phase events until one matches `pred`, failing after `limit`.
pub async fn wait_for_phase<F>(
    phases: &mut mpsc::UnboundedReceiver<(u64, Phase)>,
    limit: Duration,
    mut pred: F,
) -> (u64, Phase)
where
    F: FnMut(u64, &Phase) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let event = tokio::time::timeout_at(deadline, phases.recv())
            .await
            .expect("phase event deadline expired")
            .expect("phase channel closed");
        if pred(event.0, &event.1) {
            return event;
        }
    }
}
