//! Stream-multiplexing session.
//!
//! Wraps one established byte-stream connection into many independent
//! logical streams. Either side can originate a stream at any time; frames
//! from all streams interleave on the wire. A session close terminates
//! every logical stream.
//!
//! Internally a session is two pump tasks: the read pump parses inbound
//! frames and routes them to per-stream channels, the write pump serializes
//! outbound frames. All public methods take `&self` — handles are shared
//! freely behind an `Arc`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use muster_core::wire::{
    KIND_CLOSE, KIND_DATA, KIND_GOAWAY, KIND_OPEN, KIND_PING, MAX_FRAME_PAYLOAD,
};

use crate::frame::{self, Frame};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("session closed")]
    SessionClosed,
    #[error("message of {0} bytes exceeds frame payload limit")]
    MessageTooLarge(usize),
}

/// Session knobs. The defaults suit the broker side; the agent flips
/// `initiator`.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Whether this side opened the underlying connection. Initiator-opened
    /// logical streams use odd ids, acceptor-opened even ids.
    pub initiator: bool,
    /// Kill the session when no frame arrives for this long. Derived from
    /// the peer's declared heartbeat interval (typically 3×) so a silent
    /// peer is reaped rather than held forever. None = wait forever.
    pub read_timeout: Option<Duration>,
    /// Protocol-level ping interval. None disables pings — the right choice
    /// when application-level heartbeats already flow.
    pub keepalive: Option<Duration>,
    /// Obfuscate data-frame payloads with this key when present.
    pub obfuscation_key: Option<[u8; 32]>,
    /// Largest payload one frame may carry.
    pub max_frame_payload: u32,
    /// Inbound streams queued before `accept` picks them up.
    pub accept_backlog: usize,
    /// Messages buffered per logical stream.
    pub stream_window: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initiator: false,
            read_timeout: None,
            keepalive: None,
            obfuscation_key: None,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            accept_backlog: 32,
            stream_window: 64,
        }
    }
}

type StreamMap = Arc<DashMap<u32, mpsc::Sender<Bytes>>>;

/// One multiplexed session over an established transport.
pub struct MuxSession {
    out_tx: mpsc::Sender<Frame>,
    streams: StreamMap,
    accept_rx: Mutex<mpsc::Receiver<LogicalStream>>,
    next_id: AtomicU32,
    shutdown: Arc<watch::Sender<bool>>,
    max_frame_payload: u32,
    stream_window: usize,
}

impl MuxSession {
    /// Take ownership of `transport` and start the session pumps.
    pub fn new<T>(transport: T, cfg: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::channel::<Frame>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<LogicalStream>(cfg.accept_backlog);
        let streams: StreamMap = Arc::new(DashMap::new());
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        let first_id = if cfg.initiator { 1 } else { 2 };

        tokio::spawn(read_pump(
            reader,
            cfg.clone(),
            streams.clone(),
            accept_tx,
            out_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(write_pump(
            writer,
            out_rx,
            cfg.obfuscation_key,
            cfg.keepalive,
            shutdown.clone(),
        ));

        Self {
            out_tx,
            streams,
            accept_rx: Mutex::new(accept_rx),
            next_id: AtomicU32::new(first_id),
            shutdown,
            max_frame_payload: cfg.max_frame_payload,
            stream_window: cfg.stream_window,
        }
    }

    /// Open a new logical stream to the remote side.
    pub async fn open_stream(&self) -> Result<LogicalStream, MuxError> {
        if *self.shutdown.borrow() {
            return Err(MuxError::SessionClosed);
        }
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.stream_window);
        self.streams.insert(id, tx);

        if self.out_tx.send(Frame::open(id)).await.is_err() {
            self.streams.remove(&id);
            return Err(MuxError::SessionClosed);
        }

        Ok(LogicalStream {
            id,
            rx,
            out: self.out_tx.clone(),
            streams: self.streams.clone(),
            max_frame_payload: self.max_frame_payload,
            closed: false,
        })
    }

    /// Wait for the next logical stream opened by the remote side.
    /// Returns None once the session is down.
    pub async fn accept(&self) -> Option<LogicalStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Tear the session down: best-effort GoAway to the peer, then stop
    /// both pumps. All logical streams end.
    pub async fn close(&self) {
        let _ = self.out_tx.try_send(Frame::goaway());
        // send_replace, not send: the pumps subscribe only once their
        // tasks run, and a plain send with no receiver drops the value.
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// One independent bidirectional message stream on a session.
///
/// Message-oriented: each `write_msg` becomes exactly one data frame and
/// arrives as exactly one `read_msg` on the other side.
#[derive(Debug)]
pub struct LogicalStream {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    out: mpsc::Sender<Frame>,
    streams: StreamMap,
    max_frame_payload: u32,
    closed: bool,
}

impl LogicalStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send one message. Fails once the session is down or the message
    /// exceeds the frame payload limit.
    pub async fn write_msg(&self, msg: &[u8]) -> Result<(), MuxError> {
        if msg.len() > self.max_frame_payload as usize {
            return Err(MuxError::MessageTooLarge(msg.len()));
        }
        self.out
            .send(Frame::data(self.id, BytesMut::from(msg)))
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Receive the next message. None once the remote closed the stream or
    /// the session died.
    pub async fn read_msg(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Close this stream only; the session stays up.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.streams.remove(&self.id);
        let _ = self.out.send(Frame::close(self.id)).await;
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        if !self.closed {
            self.streams.remove(&self.id);
            let _ = self.out.try_send(Frame::close(self.id));
        }
    }
}

// ── Pumps ─────────────────────────────────────────────────────────────────────

async fn read_pump<R: AsyncRead + Unpin>(
    mut reader: R,
    cfg: MuxConfig,
    streams: StreamMap,
    accept_tx: mpsc::Sender<LogicalStream>,
    out_tx: mpsc::Sender<Frame>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut seq: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = next_frame(&mut reader, cfg.max_frame_payload, cfg.read_timeout) => {
                match res {
                    Ok(frame) => frame,
                    Err(PumpEnd::Timeout) => {
                        tracing::debug!("session read timed out, reaping");
                        break;
                    }
                    Err(PumpEnd::Io(e)) => {
                        tracing::debug!(error = %e, "session read ended");
                        break;
                    }
                }
            }
        };

        match frame.kind {
            KIND_OPEN => {
                let id = frame.stream_id;
                let (tx, rx) = mpsc::channel(cfg.stream_window);
                streams.insert(id, tx);
                let stream = LogicalStream {
                    id,
                    rx,
                    out: out_tx.clone(),
                    streams: streams.clone(),
                    max_frame_payload: cfg.max_frame_payload,
                    closed: false,
                };
                // Backlog full means nobody is accepting; refuse the stream
                // rather than stalling every other stream on the session.
                match accept_tx.try_send(stream) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(mut refused)) => {
                        tracing::debug!(stream = id, "accept backlog full, refusing stream");
                        refused.close().await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            KIND_DATA => {
                let mut frame = frame;
                if let Some(key) = &cfg.obfuscation_key {
                    frame::keystream_xor(key, frame.stream_id, seq, &mut frame.payload);
                }
                seq += 1;
                let target = streams.get(&frame.stream_id).map(|e| e.value().clone());
                if let Some(tx) = target {
                    if tx.send(frame.payload.freeze()).await.is_err() {
                        streams.remove(&frame.stream_id);
                    }
                } else {
                    tracing::trace!(stream = frame.stream_id, "data for unknown stream, dropping");
                }
            }
            KIND_CLOSE => {
                streams.remove(&frame.stream_id);
            }
            KIND_PING => {}
            KIND_GOAWAY => {
                tracing::debug!("remote goaway");
                break;
            }
            other => {
                tracing::debug!(kind = other, "unknown frame kind, killing session");
                break;
            }
        }
    }

    streams.clear();
    shutdown.send_replace(true);
}

enum PumpEnd {
    Timeout,
    Io(std::io::Error),
}

async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u32,
    read_timeout: Option<Duration>,
) -> Result<Frame, PumpEnd> {
    match read_timeout {
        Some(limit) => match timeout(limit, frame::read_frame(reader, max_payload)).await {
            Ok(res) => res.map_err(PumpEnd::Io),
            Err(_) => Err(PumpEnd::Timeout),
        },
        None => frame::read_frame(reader, max_payload)
            .await
            .map_err(PumpEnd::Io),
    }
}

async fn write_pump<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Frame>,
    key: Option<[u8; 32]>,
    keepalive: Option<Duration>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    use tokio::io::AsyncWriteExt;

    let mut shutdown_rx = shutdown.subscribe();
    let mut tick = keepalive.map(tokio::time::interval);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            // Drain pending frames (the GoAway of a deliberate close among
            // them) before honoring shutdown.
            biased;

            maybe = out_rx.recv() => {
                let Some(mut frame) = maybe else { break };
                if frame.kind == KIND_DATA {
                    if let Some(key) = &key {
                        frame::keystream_xor(key, frame.stream_id, seq, &mut frame.payload);
                    }
                    seq += 1;
                }
                if let Err(e) = frame::write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "session write failed");
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
            _ = keepalive_tick(&mut tick) => {
                if frame::write_frame(&mut writer, &Frame::ping()).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    shutdown.send_replace(true);
}

async fn keepalive_tick(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
