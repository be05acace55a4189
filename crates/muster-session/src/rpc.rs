//! Request/response semantics over logical streams.
//!
//! One logical stream carries exactly one exchange: the caller writes a
//! JSON `RpcRequest` message, the serving side answers with one JSON
//! `RpcResponse`. Handlers are registered in an explicit path table —
//! duplicate registration is rejected up front.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use muster_core::wire::{status, RpcRequest, RpcResponse};

use crate::mux::{LogicalStream, MuxError, MuxSession};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("stream closed before a message arrived")]
    Closed,
    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

pub async fn send_request(stream: &LogicalStream, req: &RpcRequest) -> Result<(), RpcError> {
    let bytes = serde_json::to_vec(req)?;
    stream.write_msg(&bytes).await?;
    Ok(())
}

pub async fn recv_request(stream: &mut LogicalStream) -> Result<RpcRequest, RpcError> {
    let msg = stream.read_msg().await.ok_or(RpcError::Closed)?;
    Ok(serde_json::from_slice(&msg)?)
}

pub async fn send_response(stream: &LogicalStream, resp: &RpcResponse) -> Result<(), RpcError> {
    let bytes = serde_json::to_vec(resp)?;
    stream.write_msg(&bytes).await?;
    Ok(())
}

pub async fn recv_response(stream: &mut LogicalStream) -> Result<RpcResponse, RpcError> {
    let msg = stream.read_msg().await.ok_or(RpcError::Closed)?;
    Ok(serde_json::from_slice(&msg)?)
}

// ── Router ────────────────────────────────────────────────────────────────────

type HandlerFn = Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, RpcResponse> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("handler already registered for {0}")]
    Duplicate(String),
}

/// Explicit path → handler table.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, HandlerFn>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `path`. Registering the same path twice is a
    /// wiring bug and fails here, not at dispatch time.
    pub fn register<F, Fut>(&mut self, path: &str, handler: F) -> Result<(), RouterError>
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = RpcResponse> + Send + 'static,
    {
        if self.routes.contains_key(path) {
            return Err(RouterError::Duplicate(path.to_string()));
        }
        self.routes
            .insert(path.to_string(), Arc::new(move |req| handler(req).boxed()));
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<HandlerFn> {
        self.routes.get(path).cloned()
    }
}

/// Serve inbound logical streams on `session` until it dies. Each stream
/// is handled on its own task; a handler panic terminates only that
/// exchange.
pub async fn serve(session: &MuxSession, router: Arc<Router>) {
    while let Some(mut stream) = session.accept().await {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(&mut stream, &router).await {
                tracing::debug!(stream = stream.id(), error = %e, "exchange failed");
            }
            stream.close().await;
        });
    }
}

async fn handle_stream(stream: &mut LogicalStream, router: &Router) -> Result<(), RpcError> {
    let req = recv_request(stream).await?;

    let resp = match router.lookup(&req.path) {
        None => RpcResponse::error(status::NOT_FOUND, "no handler for path"),
        Some(handler) => {
            let path = req.path.clone();
            match std::panic::AssertUnwindSafe(handler(req))
                .catch_unwind()
                .await
            {
                Ok(resp) => resp,
                Err(_) => {
                    tracing::warn!(path, "handler panicked");
                    RpcResponse::error(status::INTERNAL, "handler panicked")
                }
            }
        }
    };

    send_response(stream, &resp).await
}
