//! Join handshake acceptor — admits one transport into the fleet.
//!
//! Admission runs in a fixed order so every rejection happens as early and
//! as cheaply as possible: rate limiter, bounded request read, envelope
//! decryption, identity sanity, durable record lookup, activation status,
//! online-conflict check. Only then is a credential issued, the reply
//! written, and the raw transport promoted to a multiplexed session that
//! lives until the peer disconnects or goes silent.
//!
//! A rejected handshake answers with a problem payload and drops the
//! connection; it never tears down an existing live session for the same
//! identifier.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;

use muster_core::config::BrokerConfig;
use muster_core::sealed;
use muster_core::wire::{status, Problem, JOIN_PATH, MAX_IDENTITY_PAYLOAD};
use muster_core::{Credential, Identity, JoinError};
use muster_session::frame;
use muster_session::join_wire::{self, JoinWireError};
use muster_session::rpc;
use muster_session::{MuxConfig, MuxSession, Router};

use crate::limiter::HandshakeLimiter;
use crate::phase::{Notifier, Phase};
use crate::registry::{Conn, Registry};
use crate::store::{PeerStatus, PeerStore};

pub struct Acceptor {
    envelope_key: [u8; 32],
    issue_session_secret: bool,
    handshake_timeout: Duration,
    read_timeout_multiplier: u32,
    default_heartbeat_secs: u64,
    limiter: HandshakeLimiter,
    store: Arc<dyn PeerStore>,
    registry: Arc<Registry>,
    notifier: Notifier,
    router: Arc<Router>,
}

impl Acceptor {
    pub fn new(
        config: &BrokerConfig,
        store: Arc<dyn PeerStore>,
        registry: Arc<Registry>,
        notifier: Notifier,
        router: Arc<Router>,
    ) -> Self {
        Self {
            envelope_key: sealed::derive_key(&config.shared_secret),
            issue_session_secret: config.issue_session_secret,
            handshake_timeout: Duration::from_secs(config.handshake.timeout_secs),
            read_timeout_multiplier: config.handshake.read_timeout_multiplier,
            default_heartbeat_secs: config.handshake.default_heartbeat_secs,
            limiter: HandshakeLimiter::new(config.handshake.rate_per_sec, config.handshake.burst),
            store,
            registry,
            notifier,
            router,
        }
    }

    /// Run one connection from raw transport to session teardown. Returns
    /// when the peer is gone; intended to be spawned per accepted socket.
    pub async fn admit<T>(&self, transport: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Shed reconnect storms before reading a single byte.
        if !self.limiter.allow() {
            let mut transport = transport;
            reject(&mut transport, &JoinError::RateLimited, peer).await;
            return;
        }

        let mut io = BufReader::new(transport);

        let negotiated = match timeout(self.handshake_timeout, self.negotiate(&mut io)).await {
            Err(_) => {
                tracing::debug!(%peer, "handshake deadline expired");
                return;
            }
            Ok(Err(err)) => {
                tracing::debug!(%peer, error = %err, status = err.status(), "handshake rejected");
                reject(&mut io, &err, peer).await;
                return;
            }
            Ok(Ok(accepted)) => accepted,
        };

        self.run_session(io, negotiated, peer).await;
    }

    /// Everything between the request head and the 202 reply, under the
    /// handshake deadline.
    async fn negotiate<T>(
        &self,
        io: &mut BufReader<T>,
    ) -> Result<(Identity, Credential), JoinError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let body = join_wire::read_join_request(io, MAX_IDENTITY_PAYLOAD)
            .await
            .map_err(wire_error)?;

        let identity: Identity = sealed::open(&self.envelope_key, &body)
            .map_err(|e| JoinError::Malformed(e.to_string()))?;
        identity
            .validate()
            .map_err(|e| JoinError::Malformed(e.to_string()))?;

        let (record, created) = self.store.lookup_or_create(&identity);
        if created {
            tracing::info!(id = record.id, key = %record.key, "peer record created");
            self.notifier.notify(record.id, Phase::Created);
        }

        match record.status {
            PeerStatus::Removed => return Err(JoinError::Forbidden),
            PeerStatus::Inactive => return Err(JoinError::NotActive),
            PeerStatus::Active => {}
        }

        if self.registry.get(record.id).is_some() {
            return Err(JoinError::AlreadyOnline);
        }

        let credential = Credential::issue(record.id, self.issue_session_secret);
        let reply = sealed::seal(&self.envelope_key, &credential)
            .map_err(|e| JoinError::Internal(e.to_string()))?;
        join_wire::write_join_response(io, status::ACCEPTED, &reply)
            .await
            .map_err(wire_error)?;

        Ok((identity, credential))
    }

    /// Promote the transport to a multiplexed session, register it, serve
    /// it until it dies, then clean up.
    async fn run_session<T>(
        &self,
        io: BufReader<T>,
        (identity, credential): (Identity, Credential),
        peer: SocketAddr,
    ) where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = credential.id;

        let heartbeat = match identity.heartbeat_secs {
            0 => self.default_heartbeat_secs,
            declared => declared,
        };
        let read_timeout =
            Duration::from_secs(heartbeat.saturating_mul(self.read_timeout_multiplier as u64));
        let obfuscation_key = credential
            .session_secret
            .as_deref()
            .map(frame::obfuscation_key);

        let session = Arc::new(MuxSession::new(
            io,
            MuxConfig {
                initiator: false,
                read_timeout: Some(read_timeout),
                obfuscation_key,
                ..Default::default()
            },
        ));

        let conn = Arc::new(Conn {
            id,
            identity,
            credential,
            session: session.clone(),
            connected_at: Instant::now(),
        });

        // A handshake that raced past the online check loses here; the
        // established connection stays untouched.
        if !self.registry.insert_if_absent(conn.clone()) {
            tracing::info!(id, %peer, "lost insert race to a live connection");
            self.notifier.notify(id, Phase::Repeated);
            session.close().await;
            return;
        }

        tracing::info!(id, %peer, "peer online");
        self.notifier.notify(id, Phase::Connected);

        rpc::serve(&session, self.router.clone()).await;

        self.registry.remove(id);
        let duration = conn.connected_at.elapsed();
        tracing::info!(id, %peer, ?duration, "peer offline");
        self.notifier.notify(id, Phase::Disconnected { duration });
    }
}

fn wire_error(e: JoinWireError) -> JoinError {
    match e {
        JoinWireError::Io(e) => JoinError::Io(e),
        other => JoinError::Malformed(other.to_string()),
    }
}

/// Best-effort rejection reply. The connection is gone afterwards either
/// way, so write failures are only logged.
async fn reject<W: AsyncWrite + Unpin>(w: &mut W, err: &JoinError, peer: SocketAddr) {
    let problem = Problem::new(
        err.status(),
        if err.retryable() {
            "retryable"
        } else {
            "permanent"
        },
        err.to_string(),
        JOIN_PATH.to_string(),
    );
    let body = serde_json::to_vec(&problem).unwrap_or_default();
    if let Err(e) = join_wire::write_join_response(w, err.status(), &body).await {
        tracing::debug!(%peer, error = %e, "rejection reply failed");
    }
}
