//! The watcher service
//!
//! Owns every long-lived piece of state: the address book, the notifier set,
//! the credential check and the scanner handle. HTTP handlers and `main` only
//! talk to [`Watcher`].

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};
use watcher_common::memo::{encode_memo, make_memo};
use watcher_common::{ContributionId, Error, Result};

use crate::address::{AddressAssigner, AddressStrategy, TransparentDeriver};
use crate::auth::CredentialCheck;
use crate::bootstrap::{BootstrapRequest, BootstrapResponse, StartHeightResolver};
use crate::checkpoint::Checkpoint;
use crate::config::{AddressStrategyKind, Config};
use crate::ledger::{with_timeout, DisclosureReceipt, LedgerClient};
use crate::notifier::{NotifierSet, Sink, WebSocketHub, WebhookNotifier, WebhookWorker};
use crate::reconciler::{check_receipt, DisclosureReconciler};
use crate::scanner::{BlockScanner, ScannerConfig};
use crate::state::{StateStore, WatchedAddress};

const WEBSOCKET_CHANNEL_CAPACITY: usize = 256;

/// Build the sinks selected by configuration, in registration order.
/// The webhook worker, if any, must be spawned by the caller.
pub fn build_notifiers(config: &Config) -> (NotifierSet, Option<WebhookWorker>) {
    let mut sinks = Vec::new();
    let mut worker = None;

    if config.enable_websocket {
        sinks.push(Sink::WebSocket(WebSocketHub::new(WEBSOCKET_CHANNEL_CAPACITY)));
    }

    if let (Some(backend_url), Some(secret)) = (&config.backend_url, &config.api_secret) {
        let (webhook, webhook_worker) = WebhookNotifier::new(backend_url, secret);
        sinks.push(Sink::Webhook(webhook));
        worker = Some(webhook_worker);
    }

    (NotifierSet::new(sinks), worker)
}

pub struct Watcher {
    config: Config,
    ledger: Arc<dyn LedgerClient>,
    store: StateStore,
    assigner: AddressAssigner,
    notifier: Arc<NotifierSet>,
    credential: CredentialCheck,
    checkpoint: Option<Checkpoint>,
    /// Cursor of the running scanner; `None` until bootstrap starts it
    scanner: Mutex<Option<watch::Receiver<u64>>>,
    /// Serializes bootstraps so the scanner starts once
    starting: Mutex<()>,
    fatal: mpsc::UnboundedSender<Error>,
    shutdown: watch::Sender<bool>,
}

impl Watcher {
    /// Returns the service and the channel on which it reports fatal errors
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerClient>,
        notifier: NotifierSet,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Error>)> {
        let credential = CredentialCheck::from_hash_hex(&config.api_secret_hash)?;
        let store = StateStore::new();

        let strategy = match config.address_strategy {
            AddressStrategyKind::Derive => {
                let xpub = config.extended_public_key.as_deref().ok_or_else(|| {
                    Error::Derivation("no extended public key configured".to_string())
                })?;
                AddressStrategy::Derive(TransparentDeriver::new(xpub, config.network)?)
            }
            AddressStrategyKind::Custodial => AddressStrategy::Custodial(Arc::clone(&ledger)),
        };
        let assigner =
            AddressAssigner::new(strategy, config.shielded_address.clone(), store.clone());

        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let watcher = Self {
            config,
            ledger,
            store,
            assigner,
            notifier: Arc::new(notifier),
            credential,
            checkpoint,
            scanner: Mutex::new(None),
            starting: Mutex::new(()),
            fatal,
            shutdown,
        };
        Ok((watcher, fatal_rx))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn credential(&self) -> &CredentialCheck {
        &self.credential
    }

    pub fn notifier(&self) -> &NotifierSet {
        &self.notifier
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Next height the scanner will process, once it runs
    pub async fn scanner_height(&self) -> Option<u64> {
        self.scanner.lock().await.as_ref().map(|rx| *rx.borrow())
    }

    pub async fn tip(&self) -> Result<u64> {
        with_timeout(
            "getblockcount",
            self.config.rpc_timeout(),
            self.ledger.block_count(),
        )
        .await
    }

    pub async fn assign(&self, id: ContributionId) -> Result<WatchedAddress> {
        self.assigner.assign(id).await
    }

    /// Hex memo a contributor attaches to a shielded payment
    pub fn memo_for(&self, id: ContributionId) -> String {
        encode_memo(&make_memo(id, &self.config.service_name))
    }

    pub async fn validate_address(&self, address: &str) -> Result<bool> {
        with_timeout(
            "validateaddress",
            self.config.rpc_timeout(),
            self.ledger.validate_address(address),
        )
        .await
    }

    /// Validate a shielded-payment disclosure and queue it for confirmation
    pub async fn submit_disclosure(
        &self,
        id: ContributionId,
        disclosure: &str,
    ) -> Result<DisclosureReceipt> {
        let shielded = self.assigner.shielded_address().ok_or_else(|| {
            Error::InvalidInput("shielded payments are not enabled".to_string())
        })?;

        let disclosure = disclosure.trim();
        if disclosure.is_empty() || hex::decode(disclosure).is_err() {
            return Err(Error::InvalidInput("disclosure must be hex".to_string()));
        }

        let receipt = with_timeout(
            "z_validatepaymentdisclosure",
            self.config.rpc_timeout(),
            self.ledger.validate_disclosure(disclosure),
        )
        .await?;

        check_receipt(Some(shielded), id, &receipt).map_err(|reason| {
            warn!("Rejected disclosure for contribution {}: {}", id, reason);
            Error::InvalidInput(reason)
        })?;

        self.store.put_disclosure(id, disclosure.to_string()).await;
        info!(
            "Accepted disclosure for contribution {} (tx {})",
            id, receipt.txid
        );
        Ok(receipt)
    }

    /// Seed the address book and start the scanner if it is not running.
    /// A running scanner keeps its cursor.
    pub async fn bootstrap(&self, request: &BootstrapRequest) -> Result<BootstrapResponse> {
        let ids = request.contribution_ids()?;

        // Ledger calls below run without the cursor lock so health stays live
        let _starting = self.starting.lock().await;

        let current_height = self.tip().await?;

        for id in &ids {
            self.assigner.assign(*id).await?;
        }
        info!("Bootstrap seeded {} contribution(s)", ids.len());

        if let Some(start_height) = self.scanner_height().await {
            info!("Scanner already running at height {}", start_height);
            return Ok(BootstrapResponse {
                start_height,
                current_height,
            });
        }

        let resolver = StartHeightResolver {
            ledger: self.ledger.as_ref(),
            rpc_timeout: self.config.rpc_timeout(),
            fallback_start_height: self.config.fallback_start_height,
            checkpoint: self.checkpoint.as_ref(),
        };
        let (start_height, source) = resolver.resolve(request, current_height).await?;
        info!(
            "Resuming scan at height {} ({:?}), tip is {}",
            start_height, source, current_height
        );

        let progress = self.start_scanner(start_height);
        *self.scanner.lock().await = Some(progress);

        Ok(BootstrapResponse {
            start_height,
            current_height,
        })
    }

    fn start_scanner(&self, start_height: u64) -> watch::Receiver<u64> {
        let reconciler = DisclosureReconciler::new(
            Arc::clone(&self.ledger),
            self.store.clone(),
            Arc::clone(&self.notifier),
            self.config.shielded_address.clone(),
            self.config.min_confirmations,
            self.config.rpc_timeout(),
        );

        let scanner = BlockScanner::new(
            Arc::clone(&self.ledger),
            self.store.clone(),
            Arc::clone(&self.notifier),
            reconciler,
            self.checkpoint.clone(),
            ScannerConfig {
                min_confirmations: self.config.min_confirmations,
                retry_delay: self.config.scan_retry_delay(),
                max_failures: self.config.max_fetch_failures,
                rpc_timeout: self.config.rpc_timeout(),
            },
            start_height,
        );
        let progress = scanner.progress();

        let shutdown = self.shutdown.subscribe();
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = scanner.run(shutdown).await {
                error!("Block scanner halted: {}", e);
                let _ = fatal.send(e);
            }
        });

        progress
    }

    /// Resolves once shutdown has been requested
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }

    /// Stop scheduling scanner ticks and close every sink
    pub fn shutdown(&self) {
        info!("Shutting down watcher");
        self.shutdown.send_replace(true);
        self.notifier.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_secret;
    use crate::mock_node::MockNode;
    use std::time::Duration;

    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const SHIELDED: &str = "ztestsapling1sharedaddressforeverycontribution";

    fn watcher(node: &MockNode) -> Watcher {
        let mut config = Config::for_mock(hash_secret("secret"), XPUB);
        config.shielded_address = Some(SHIELDED.to_string());
        let (notifier, _) = build_notifiers(&config);
        let (watcher, _fatal) =
            Watcher::new(config, Arc::new(node.clone()), notifier, None).unwrap();
        watcher
    }

    #[test]
    fn test_build_notifiers() {
        let mut config = Config::for_mock(hash_secret("secret"), XPUB);
        let (set, worker) = build_notifiers(&config);
        assert_eq!(set.len(), 1);
        assert!(worker.is_none());

        config.enable_websocket = false;
        config.backend_url = Some("http://backend".to_string());
        config.api_secret = Some("secret".to_string());
        let (set, worker) = build_notifiers(&config);
        assert_eq!(set.len(), 1);
        assert!(set.websocket().is_none());
        assert!(worker.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_never_moves_running_cursor() {
        let node = MockNode::new(500);
        let watcher = watcher(&node);

        let first = watcher
            .bootstrap(&BootstrapRequest::default())
            .await
            .unwrap();
        assert_eq!(first.start_height, 500);

        node.mine_empty(3).await;
        let mut request = BootstrapRequest::default();
        request.pending_contributions.push(crate::bootstrap::PendingContribution {
            id: 8,
            last_tx_id: None,
        });
        let second = watcher.bootstrap(&request).await.unwrap();

        assert_eq!(second.start_height, 500);
        assert_eq!(second.current_height, 503);
        assert!(watcher
            .store()
            .addresses_by_contribution(ContributionId::new(8).unwrap())
            .await
            .is_some());
        watcher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_bootstrap_does_not_block_health() {
        let node = MockNode::new(500);
        let watcher = Arc::new(watcher(&node));
        node.stall_next_lookups(1).await;

        let request = BootstrapRequest {
            latest_tx_id: Some("slowtx".to_string()),
            ..BootstrapRequest::default()
        };
        let pending = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.bootstrap(&request).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let height = tokio::time::timeout(Duration::from_secs(1), watcher.scanner_height()).await;
        assert_eq!(height, Ok(None));

        pending.abort();
    }

    #[tokio::test]
    async fn test_disclosure_rejections() {
        let node = MockNode::new(1);
        let watcher = watcher(&node);
        let id = ContributionId::new(3).unwrap();

        assert!(matches!(
            watcher.submit_disclosure(id, "not hex").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            watcher.submit_disclosure(id, "abcd").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(watcher.store().all_disclosures().await.is_empty());
    }

    #[tokio::test]
    async fn test_disclosure_disabled_without_shielded_address() {
        let node = MockNode::new(1);
        let config = Config::for_mock(hash_secret("secret"), XPUB);
        let (watcher, _fatal) =
            Watcher::new(config, Arc::new(node), NotifierSet::default(), None).unwrap();

        assert!(matches!(
            watcher
                .submit_disclosure(ContributionId::new(1).unwrap(), "abcd")
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_memo_for() {
        let node = MockNode::new(1);
        let watcher = watcher(&node);
        assert_eq!(
            watcher.memo_for(ContributionId::new(12).unwrap()),
            hex::encode("Contribution 12 on Grant.io")
        );
    }
}
