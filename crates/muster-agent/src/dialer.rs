//! Broker dialer — the agent side of the join handshake and the reconnect
//! loop around it.
//!
//! Endpoints are tried round-robin. A rejected handshake is classified
//! fatal or retryable from its status: removed/not-active peers stop
//! dialing entirely (an operator has to intervene), everything else backs
//! off on the outage-based schedule and tries again.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use muster_core::config::{AgentConfig, EndpointConfig};
use muster_core::sealed;
use muster_core::wire::{paths, status, RpcRequest, RpcResponse};
use muster_core::{Credential, Identity};
use muster_session::join_wire::{self, JoinWireError};
use muster_session::{frame, rpc, MuxConfig, MuxSession, Router};

use crate::backoff::backoff_for;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("broker refused permanently with status {0}")]
    Forbidden(u16),
    #[error("broker refused with status {0}")]
    Rejected(u16),
    #[error("invalid server name {0:?}")]
    BadServerName(String),
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error(transparent)]
    Wire(#[from] JoinWireError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    /// Fatal errors stop the reconnect loop; retrying cannot help until an
    /// operator or a config change intervenes.
    pub fn fatal(&self) -> bool {
        matches!(
            self,
            DialError::NoEndpoints | DialError::Forbidden(_) | DialError::BadServerName(_)
        )
    }
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}
type BoxedTransport = Box<dyn Transport>;

/// A joined session: the issued credential plus the live multiplexed
/// session underneath it.
pub struct AgentSession {
    credential: Credential,
    session: Arc<MuxSession>,
    heartbeat: Duration,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.credential.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// One outbound exchange on a fresh logical stream.
    pub async fn call(&self, path: &str, body: serde_json::Value) -> Result<RpcResponse, rpc::RpcError> {
        let mut stream = self.session.open_stream().await?;
        rpc::send_request(
            &stream,
            &RpcRequest {
                path: path.to_string(),
                body,
            },
        )
        .await?;
        rpc::recv_response(&mut stream).await
    }

    /// Serve the broker's inbound calls and keep heartbeats flowing until
    /// the session dies.
    pub async fn serve(self: &Arc<Self>, router: Arc<Router>) {
        let heartbeats = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.heartbeat);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if this.is_closed() {
                        return;
                    }
                    if let Err(e) = this.call(paths::HEARTBEAT, serde_json::json!({})).await {
                        tracing::debug!(error = %e, "heartbeat failed");
                        return;
                    }
                }
            })
        };

        rpc::serve(&self.session, router).await;
        heartbeats.abort();
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

pub struct Dialer {
    config: AgentConfig,
    router: Arc<Router>,
    envelope_key: [u8; 32],
    next_endpoint: usize,
}

impl Dialer {
    pub fn new(config: AgentConfig, router: Arc<Router>) -> Self {
        let envelope_key = sealed::derive_key(&config.shared_secret);
        Self {
            config,
            router,
            envelope_key,
            next_endpoint: 0,
        }
    }

    /// Dial, join, serve, reconnect — forever, or until a fatal rejection.
    pub async fn run(mut self) -> Result<(), DialError> {
        let mut outage_started: Option<Instant> = None;

        loop {
            match self.connect_once().await {
                Ok(session) => {
                    outage_started = None;
                    let session = Arc::new(session);
                    tracing::info!(id = session.credential().id, "joined fleet");
                    session.serve(self.router.clone()).await;
                    tracing::warn!(id = session.credential().id, "session ended, reconnecting");
                }
                Err(e) if e.fatal() => {
                    tracing::error!(error = %e, "giving up");
                    return Err(e);
                }
                Err(e) => {
                    let started = *outage_started.get_or_insert_with(Instant::now);
                    let delay = backoff_for(started.elapsed());
                    tracing::warn!(error = %e, ?delay, "dial failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One complete attempt against the next endpoint in rotation.
    pub async fn connect_once(&mut self) -> Result<AgentSession, DialError> {
        if self.config.endpoints.is_empty() {
            return Err(DialError::NoEndpoints);
        }
        let endpoint = self.config.endpoints[self.next_endpoint % self.config.endpoints.len()].clone();
        self.next_endpoint = self.next_endpoint.wrapping_add(1);

        let dial_timeout = Duration::from_secs(self.config.dial_timeout_secs);
        let tcp = timeout(dial_timeout, TcpStream::connect(&endpoint.addr))
            .await
            .map_err(|_| DialError::DialTimeout(dial_timeout))??;
        tcp.set_nodelay(true)?;
        let local_addr = tcp.local_addr()?.ip();

        // The whole exchange is bounded, not just the TCP connect: a
        // broker that accepts the socket and goes silent must not wedge
        // the reconnect loop.
        timeout(dial_timeout, async {
            let transport = self.maybe_tls(tcp, &endpoint).await?;
            self.handshake(transport, local_addr).await
        })
        .await
        .map_err(|_| DialError::DialTimeout(dial_timeout))?
    }

    async fn maybe_tls(
        &self,
        tcp: TcpStream,
        endpoint: &EndpointConfig,
    ) -> Result<BoxedTransport, DialError> {
        if !endpoint.tls {
            return Ok(Box::new(tcp));
        }

        let name = endpoint
            .server_name
            .clone()
            .unwrap_or_else(|| host_part(&endpoint.addr).to_string());
        let server_name = rustls::pki_types::ServerName::try_from(name.clone())
            .map_err(|_| DialError::BadServerName(name))?;

        let tls = tls_connector().connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    }

    /// The join exchange, then promotion to a multiplexed session.
    async fn handshake(
        &self,
        transport: BoxedTransport,
        local_addr: IpAddr,
    ) -> Result<AgentSession, DialError> {
        let identity = self.identity(local_addr);
        let sealed_identity = sealed::seal(&self.envelope_key, &identity)
            .map_err(|e| DialError::Malformed(e.to_string()))?;

        let mut io = BufReader::new(transport);
        join_wire::write_join_request(&mut io, &sealed_identity).await?;
        let (code, body) = join_wire::read_join_response(&mut io).await?;

        match code {
            status::ACCEPTED => {}
            status::FORBIDDEN | status::NOT_ACTIVE => return Err(DialError::Forbidden(code)),
            other => return Err(DialError::Rejected(other)),
        }

        let credential: Credential = sealed::open(&self.envelope_key, &body)
            .map_err(|e| DialError::Malformed(e.to_string()))?;
        let obfuscation_key = credential
            .session_secret
            .as_deref()
            .map(frame::obfuscation_key);

        // The broker reaps silent sessions from its side; this side only
        // ever waits on the broker, so no read timeout here.
        let session = Arc::new(MuxSession::new(
            io,
            MuxConfig {
                initiator: true,
                obfuscation_key,
                ..Default::default()
            },
        ));

        Ok(AgentSession {
            credential,
            session,
            heartbeat: Duration::from_secs(self.config.heartbeat_secs.max(1)),
        })
    }

    fn identity(&self, local_addr: IpAddr) -> Identity {
        let asserted_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Identity {
            addr: self.config.advertise_addr.unwrap_or(local_addr),
            hardware_id: self.config.hardware_id.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: self.config.version.clone(),
            heartbeat_secs: self.config.heartbeat_secs,
            asserted_at,
        }
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn host_part(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_part_strips_port() {
        assert_eq!(host_part("broker.example.com:59100"), "broker.example.com");
        assert_eq!(host_part("broker.example.com"), "broker.example.com");
    }

    #[test]
    fn fatal_classification() {
        assert!(DialError::NoEndpoints.fatal());
        assert!(DialError::Forbidden(status::FORBIDDEN).fatal());
        assert!(DialError::Forbidden(status::NOT_ACTIVE).fatal());
        assert!(!DialError::Rejected(status::ALREADY_ONLINE).fatal());
        assert!(!DialError::Rejected(status::RATE_LIMITED).fatal());
        assert!(!DialError::DialTimeout(Duration::from_secs(5)).fatal());
    }

    #[tokio::test]
    async fn silent_broker_is_bounded_by_the_dial_timeout() {
        // Accepts the socket, then never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = AgentConfig {
            endpoints: vec![EndpointConfig {
                addr: addr.to_string(),
                tls: false,
                server_name: None,
            }],
            dial_timeout_secs: 1,
            ..Default::default()
        };
        let mut dialer = Dialer::new(config, Arc::new(Router::new()));

        let started = std::time::Instant::now();
        let err = dialer.connect_once().await.unwrap_err();
        assert!(matches!(err, DialError::DialTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn empty_endpoint_list_is_fatal() {
        let mut dialer = Dialer::new(AgentConfig::default(), Arc::new(Router::new()));
        assert!(matches!(
            dialer.connect_once().await,
            Err(DialError::NoEndpoints)
        ));
    }
}
