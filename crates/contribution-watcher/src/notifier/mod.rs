//! Notifier fan-out
//!
//! Confirmation events and processed blocks are pushed to every registered
//! sink, in registration order. A sink that fails is logged and skipped; the
//! remaining sinks still receive the event.

pub mod webhook;
pub mod websocket;

use tracing::{debug, error};
use watcher_common::{BlockSummary, ConfirmationEvent, Result};

pub use webhook::{WebhookNotifier, WebhookWorker};
pub use websocket::{WebSocketHub, WsMessage};

/// Contract shared by all sinks
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, event: &ConfirmationEvent) -> Result<()>;

    fn on_new_block(&self, _block: &BlockSummary) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) {}
}

/// The sinks this service ships with
pub enum Sink {
    WebSocket(WebSocketHub),
    Webhook(WebhookNotifier),
}

impl Notifier for Sink {
    fn name(&self) -> &'static str {
        match self {
            Sink::WebSocket(hub) => hub.name(),
            Sink::Webhook(webhook) => webhook.name(),
        }
    }

    fn send(&self, event: &ConfirmationEvent) -> Result<()> {
        match self {
            Sink::WebSocket(hub) => hub.send(event),
            Sink::Webhook(webhook) => webhook.send(event),
        }
    }

    fn on_new_block(&self, block: &BlockSummary) -> Result<()> {
        match self {
            Sink::WebSocket(hub) => hub.on_new_block(block),
            Sink::Webhook(webhook) => webhook.on_new_block(block),
        }
    }

    fn destroy(&self) {
        match self {
            Sink::WebSocket(hub) => hub.destroy(),
            Sink::Webhook(webhook) => webhook.destroy(),
        }
    }
}

/// Sinks registered at startup
#[derive(Default)]
pub struct NotifierSet {
    sinks: Vec<Sink>,
}

impl NotifierSet {
    pub fn new(sinks: Vec<Sink>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// The websocket hub, when one is registered
    pub fn websocket(&self) -> Option<&WebSocketHub> {
        self.sinks.iter().find_map(|sink| match sink {
            Sink::WebSocket(hub) => Some(hub),
            _ => None,
        })
    }

    /// Deliver `event` to every sink. Returns how many accepted it.
    pub fn dispatch(&self, event: &ConfirmationEvent) -> usize {
        debug!(
            "Dispatching confirmation for contribution {} (tx {})",
            event.contribution_id, event.txid
        );

        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.send(event) {
                Ok(()) => delivered += 1,
                Err(e) => error!(
                    "Notifier {} failed for contribution {}: {}",
                    sink.name(),
                    event.contribution_id,
                    e
                ),
            }
        }
        delivered
    }

    pub fn new_block(&self, block: &BlockSummary) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_new_block(block) {
                error!(
                    "Notifier {} failed for block {}: {}",
                    sink.name(),
                    block.height,
                    e
                );
            }
        }
    }

    pub fn destroy(&self) {
        for sink in &self.sinks {
            sink.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use watcher_common::ContributionId;

    fn event() -> ConfirmationEvent {
        ConfirmationEvent::transparent("tmTo", 10, "tx1", ContributionId::new(1).unwrap())
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        // A webhook whose worker is gone rejects every event
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let broken = WebhookNotifier::from_sender(tx);

        let hub = WebSocketHub::new(16);
        let mut listener = hub.subscribe();

        let set = NotifierSet::new(vec![Sink::Webhook(broken), Sink::WebSocket(hub)]);
        assert_eq!(set.dispatch(&event()), 1);

        match listener.recv().await.unwrap() {
            WsMessage::Confirmation(received) => assert_eq!(received, event()),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_sink() {
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let set = NotifierSet::new(vec![
            Sink::Webhook(WebhookNotifier::from_sender(first_tx)),
            Sink::Webhook(WebhookNotifier::from_sender(second_tx)),
        ]);

        assert_eq!(set.dispatch(&event()), 2);
        assert_eq!(first_rx.recv().await.unwrap(), event());
        assert_eq!(second_rx.recv().await.unwrap(), event());
    }

    #[test]
    fn test_empty_set() {
        let set = NotifierSet::default();
        assert!(set.is_empty());
        assert_eq!(set.dispatch(&event()), 0);
        assert!(set.websocket().is_none());
    }
}
