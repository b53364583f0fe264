//! Webhook sink
//!
//! Confirmations are queued to a background worker which POSTs each one to
//! `{backend}/contribution/{id}/confirm` with the API secret as a bearer token.
//! A failed POST is logged and dropped.

use tokio::sync::mpsc;
use tracing::{info, warn};
use watcher_common::{ConfirmationEvent, ContributionId, Error, Result};

use super::Notifier;

pub struct WebhookNotifier {
    queue: mpsc::UnboundedSender<ConfirmationEvent>,
}

impl WebhookNotifier {
    /// Create the sink and the worker that performs the deliveries
    pub fn new(backend_url: &str, api_secret: &str) -> (Self, WebhookWorker) {
        let (queue, pending) = mpsc::unbounded_channel();
        let worker = WebhookWorker {
            pending,
            http_client: reqwest::Client::new(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_secret: api_secret.to_string(),
        };
        (Self { queue }, worker)
    }

    /// Sink feeding an existing queue
    pub fn from_sender(queue: mpsc::UnboundedSender<ConfirmationEvent>) -> Self {
        Self { queue }
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, event: &ConfirmationEvent) -> Result<()> {
        self.queue.send(event.clone()).map_err(|_| Error::Delivery {
            sink: "webhook",
            reason: "delivery worker has stopped".to_string(),
        })
    }
}

/// Drains the queue in order, one POST at a time
pub struct WebhookWorker {
    pending: mpsc::UnboundedReceiver<ConfirmationEvent>,
    http_client: reqwest::Client,
    backend_url: String,
    api_secret: String,
}

impl WebhookWorker {
    pub async fn run(mut self) {
        info!("Webhook worker started, delivering to {}", self.backend_url);

        while let Some(event) = self.pending.recv().await {
            self.deliver(&event).await;
        }

        info!("Webhook worker stopped");
    }

    pub fn confirm_url(&self, id: ContributionId) -> String {
        format!("{}/contribution/{}/confirm", self.backend_url, id)
    }

    async fn deliver(&self, event: &ConfirmationEvent) -> bool {
        let url = self.confirm_url(event.contribution_id);

        match self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_secret)
            .json(event)
            .send()
            .await
        {
            Ok(response) => {
                if response.status().is_success() {
                    info!(
                        "Webhook confirmed contribution {} (tx {})",
                        event.contribution_id, event.txid
                    );
                    true
                } else {
                    warn!(
                        "Webhook returned error status {} for contribution {}",
                        response.status(),
                        event.contribution_id
                    );
                    false
                }
            }
            Err(e) => {
                warn!(
                    "Failed to send webhook for contribution {}: {}",
                    event.contribution_id, e
                );
                false
            }
        }
    }
}
