//! Injected page/window lifecycle events.
//!
//! The editing surface owns a [`LifecycleSource`] and emits events into it;
//! autosave and presence each hold their own subscription.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The document gained focus.
    Focus,
    /// The document lost focus. Autosave flushes, presence goes away.
    Blur,
    /// The process is going away. Presence is cleaned up via beacon.
    Unload,
}

/// Fan-out source of [`LifecycleEvent`]s. Clones share one channel.
#[derive(Debug, Clone)]
pub struct LifecycleSource {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    /// Deliver `event` to every subscriber. Returns how many received it.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        log::debug!("Lifecycle event: {event:?}");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

/// Receive from a broadcast receiver that may already be gone. A `None`
/// receiver never resolves, so its `select!` branch goes quiet.
pub(crate) async fn recv_or_pending<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, broadcast::error::RecvError> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
