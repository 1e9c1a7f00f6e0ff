// Event Forwarder
// Relays agent and thread events to the presentation boundary, unchanged and in order

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::models::events::ForwardedEvent;

/// Destination for forwarded events
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ForwardedEvent) -> Result<(), String>;
}

impl EventSink for mpsc::UnboundedSender<ForwardedEvent> {
    fn deliver(&self, event: ForwardedEvent) -> Result<(), String> {
        self.send(event)
            .map_err(|_| "event receiver dropped".to_string())
    }
}

#[derive(Clone)]
pub struct EventForwarder {
    sink: Arc<dyn EventSink>,
}

impl EventForwarder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Forwarder backed by an in-process queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ForwardedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(tx)), rx)
    }

    /// Deliver one event. Failures are logged, never raised to the producer.
    pub fn forward(&self, event: impl Into<ForwardedEvent>) {
        if let Err(e) = self.sink.deliver(event.into()) {
            log::warn!("[EventForwarder] Dropped event: {}", e);
        }
    }
}
