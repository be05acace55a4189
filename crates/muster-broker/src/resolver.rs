//! Synthetic addressing — resolve a peer identifier to a logical stream.
//!
//! Callers address an agent as if it were a normal network host whose
//! hostname is the stringified identifier. Resolution happens entirely
//! locally: the "dial" is a registry lookup plus opening one logical
//! stream on the peer's live session. Nothing resembling DNS ever runs.

use std::sync::Arc;

use muster_core::DispatchError;
use muster_session::LogicalStream;

use crate::registry::Registry;

#[derive(Clone)]
pub struct Resolver {
    registry: Arc<Registry>,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Open a fresh logical stream to `id`, or fail immediately with
    /// `Offline` when the peer has no live connection.
    pub async fn dial(&self, id: u64) -> Result<LogicalStream, DispatchError> {
        let conn = self.registry.get(id).ok_or(DispatchError::Offline(id))?;
        conn.session
            .open_stream()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }

    /// Resolve a synthetic host string (the stringified identifier) as it
    /// appears in a request URL's host component.
    pub fn resolve_host(host: &str) -> Result<u64, DispatchError> {
        host.parse::<u64>()
            .map_err(|_| DispatchError::Transport(format!("invalid peer host {host:?}")))
    }
}
