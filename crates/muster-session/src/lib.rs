//! muster-session — the stream-multiplexing session, the RPC codec carried
//! on its logical streams, and the HTTP-shaped join framing.
//!
//! Everything here is transport-agnostic: sessions wrap any
//! `AsyncRead + AsyncWrite` byte stream, so tests run over in-memory
//! duplex pipes and production runs over TCP or TLS.

pub mod frame;
pub mod join_wire;
pub mod mux;
pub mod rpc;

pub use mux::{LogicalStream, MuxConfig, MuxError, MuxSession};
pub use rpc::{serve, Router};
