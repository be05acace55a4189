//! Lifecycle phase notifications.
//!
//! Four callback points fire around a connection's lifecycle. Every
//! callback runs on its own task — the handshake and serving paths never
//! wait on downstream effects (audit writes, alerting), however slow.
//! Ordering across peers is not guaranteed.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

#[derive(Debug, Clone)]
pub enum Phase {
    /// A durable record was created for a previously unknown peer.
    Created,
    /// A handshake lost the insert race against an existing live
    /// connection for the same identifier.
    Repeated,
    /// The peer went online.
    Connected,
    /// The peer went offline, with how long it was connected.
    Disconnected { duration: Duration },
}

pub trait PhaseListener: Send + Sync + 'static {
    fn on_phase(&self, id: u64, phase: Phase) -> BoxFuture<'static, ()>;
}

/// Listener that ignores every event. Useful as an explicit default.
pub struct NoopListener;

impl PhaseListener for NoopListener {
    fn on_phase(&self, _id: u64, _phase: Phase) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Fans phase events out to subscribed listeners, fire-and-forget.
#[derive(Default, Clone)]
pub struct Notifier {
    listeners: Vec<Arc<dyn PhaseListener>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    /// Deliver `phase` to every listener asynchronously. Never blocks the
    /// caller.
    pub fn notify(&self, id: u64, phase: Phase) {
        for listener in &self.listeners {
            let listener = listener.clone();
            let phase = phase.clone();
            tokio::spawn(async move {
                listener.on_phase(id, phase).await;
            });
        }
    }
}
