//! Dispatch layer — oneway, unicast, multicast, broadcast.
//!
//! Every call becomes one task on the bounded worker pool and carries its
//! own deadline; no dispatch path waits unboundedly. Results come back on
//! one-shot futures (unicast/oneway) or an unordered completion channel
//! (multicast/broadcast). The layer never retries — retry policy belongs
//! to the calling collaborator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use muster_core::wire::{RpcRequest, RpcResponse};
use muster_core::DispatchError;
use muster_session::rpc;

use crate::pool::WorkerPool;
use crate::registry::Registry;
use crate::resolver::Resolver;

/// Per-peer outcome of a multicast/broadcast.
#[derive(Debug)]
pub struct TaskResult {
    pub id: u64,
    pub outcome: Result<RpcResponse, DispatchError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    resolver: Resolver,
    registry: Arc<Registry>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, pool: Arc<WorkerPool>, timeout: Duration) -> Self {
        Self {
            pool,
            resolver: Resolver::new(registry.clone()),
            registry,
            timeout,
        }
    }

    /// Best-effort single request; the response body is discarded.
    pub async fn oneway(&self, id: u64, path: &str, body: Value) -> Result<(), DispatchError> {
        self.unicast(id, path, body).await.map(|_| ())
    }

    /// Request/response to one peer. Blocks the caller on a single-slot
    /// future until the pooled worker completes or the deadline passes.
    pub async fn unicast(
        &self,
        id: u64,
        path: &str,
        body: Value,
    ) -> Result<RpcResponse, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let resolver = self.resolver.clone();
        let path = path.to_string();
        let deadline = self.timeout;

        self.pool
            .submit(async move {
                let outcome = call_peer(&resolver, id, &path, body, deadline).await;
                let _ = tx.send(outcome);
            })
            .await
            .map_err(|_| DispatchError::Overloaded)?;

        rx.await.map_err(|_| DispatchError::Canceled)?
    }

    /// Fan one request out to `ids`, one pooled task each. Outcomes arrive
    /// unordered; the channel closes once every id has reported.
    pub async fn multicast(
        &self,
        ids: Vec<u64>,
        path: &str,
        body: Value,
    ) -> mpsc::Receiver<TaskResult> {
        let (tx, rx) = mpsc::channel(ids.len().max(1));

        for id in ids {
            let task_tx = tx.clone();
            let resolver = self.resolver.clone();
            let path = path.to_string();
            let body = body.clone();
            let deadline = self.timeout;

            let submitted = self
                .pool
                .submit(async move {
                    let outcome = call_peer(&resolver, id, &path, body, deadline).await;
                    let _ = task_tx.send(TaskResult { id, outcome }).await;
                })
                .await;

            if let Err(e) = submitted {
                tracing::warn!(id, error = %e, "multicast submission refused");
                // Channel capacity covers every id, so this cannot block.
                let _ = tx
                    .send(TaskResult {
                        id,
                        outcome: Err(DispatchError::Overloaded),
                    })
                    .await;
            }
        }

        rx
    }

    /// Multicast over a live snapshot of the registry.
    pub async fn broadcast(&self, path: &str, body: Value) -> mpsc::Receiver<TaskResult> {
        let ids = self.registry.snapshot_ids();
        self.multicast(ids, path, body).await
    }
}

/// One complete outbound exchange: resolve, open a logical stream, send
/// the request, await the response — all under one deadline. An offline
/// peer short-circuits before any wait. On deadline expiry the logical
/// stream is simply abandoned (dropping it closes it).
async fn call_peer(
    resolver: &Resolver,
    id: u64,
    path: &str,
    body: Value,
    deadline: Duration,
) -> Result<RpcResponse, DispatchError> {
    let mut stream = resolver.dial(id).await?;
    let request = RpcRequest {
        path: path.to_string(),
        body,
    };

    let exchange = async {
        rpc::send_request(&stream, &request)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        rpc::recv_response(&mut stream)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    };

    let response = tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| DispatchError::Timeout(deadline))??;

    if response.is_success() {
        Ok(response)
    } else {
        Err(DispatchError::Remote {
            status: response.status,
            detail: response.body.to_string(),
        })
    }
}
