//! Downstream publish contract
//!
//! A [`ViewSink`] receives the incremental events of one publication. Calls
//! for one publication are never concurrent and arrive in emission order, so a
//! mirror that applies them in order always holds a consistent view.

use super::types::{OutputId, ViewEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub trait ViewSink: Send + Sync {
    fn added(&self, view: &str, id: OutputId, row: Value);

    fn changed(&self, view: &str, id: OutputId, row: Value);

    fn removed(&self, view: &str, id: OutputId);

    /// First full reconciliation finished
    fn ready(&self, view: &str);

    /// Recompute or rebuild failed; the last published state stays in place
    fn failed(&self, view: &str, error: &str) {
        log::error!("❌ View '{}' failed: {}", view, error);
    }
}

/// Sink forwarding every call as a [`ViewEvent`] over an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ViewEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ViewEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: ViewEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("View event receiver dropped");
        }
    }
}

impl ViewSink for ChannelSink {
    fn added(&self, view: &str, id: OutputId, row: Value) {
        self.send(ViewEvent::Added {
            view: view.to_string(),
            id,
            row,
        });
    }

    fn changed(&self, view: &str, id: OutputId, row: Value) {
        self.send(ViewEvent::Changed {
            view: view.to_string(),
            id,
            row,
        });
    }

    fn removed(&self, view: &str, id: OutputId) {
        self.send(ViewEvent::Removed {
            view: view.to_string(),
            id,
        });
    }

    fn ready(&self, view: &str) {
        self.send(ViewEvent::Ready {
            view: view.to_string(),
        });
    }

    fn failed(&self, view: &str, error: &str) {
        log::error!("❌ View '{}' failed: {}", view, error);
        self.send(ViewEvent::Failed {
            view: view.to_string(),
            error: error.to_string(),
        });
    }
}
