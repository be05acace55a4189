//! muster integration test harness.
//!
//! Every test runs a real broker on a loopback TCP listener and real
//! agents dialing it — the full join handshake, session promotion, and
//! dispatch path, in one process. Agents assert a routable address via
//! `advertise_addr` because the identity check refuses loopback claims.
//!
//!   cargo test --test integration

mod infra;

mod dispatch;
mod handshake;
mod lifecycle;
