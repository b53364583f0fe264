//! Block scanner
//!
//! Walks the chain one block at a time, staying `min_confirmations` behind
//! the tip. Each output paying a watched transparent address becomes a
//! confirmation event. A block is retried until it is fetched; too many
//! consecutive failures halt the scanner, which the service treats as fatal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use watcher_common::{ConfirmationEvent, Error, Result};

use crate::checkpoint::Checkpoint;
use crate::ledger::{with_timeout, Block, LedgerClient};
use crate::notifier::NotifierSet;
use crate::reconciler::DisclosureReconciler;
use crate::state::StateStore;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub min_confirmations: u64,
    pub retry_delay: Duration,
    pub max_failures: u32,
    pub rpc_timeout: Duration,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// `height` is not yet `min_confirmations` deep below `tip`
    Waiting { height: u64, tip: u64 },
    /// `height` was scanned and `events` confirmations dispatched
    Processed { height: u64, events: usize },
    /// The node could not be read; `height` will be retried
    Failed { height: u64, failures: u32 },
}

pub struct BlockScanner {
    ledger: Arc<dyn LedgerClient>,
    store: StateStore,
    notifier: Arc<NotifierSet>,
    reconciler: DisclosureReconciler,
    checkpoint: Option<Checkpoint>,
    config: ScannerConfig,
    /// Next height to process
    cursor: u64,
    failures: u32,
    progress: watch::Sender<u64>,
}

impl BlockScanner {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: StateStore,
        notifier: Arc<NotifierSet>,
        reconciler: DisclosureReconciler,
        checkpoint: Option<Checkpoint>,
        config: ScannerConfig,
        start_height: u64,
    ) -> Self {
        let (progress, _) = watch::channel(start_height);

        Self {
            ledger,
            store,
            notifier,
            reconciler,
            checkpoint,
            config,
            cursor: start_height,
            failures: 0,
            progress,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Follows the cursor as blocks are processed
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// Scan until shutdown is signalled. Returns an error only when the
    /// failure cap is reached.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Block scanner starting at height {} ({} confirmations required)",
            self.cursor, self.config.min_confirmations
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await? {
                TickOutcome::Processed { .. } => continue,
                TickOutcome::Waiting { .. } | TickOutcome::Failed { .. } => {}
            }

            tokio::select! {
                _ = sleep(self.config.retry_delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Block scanner stopped at height {}", self.cursor);
        Ok(())
    }

    /// Advance by at most one block
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let height = self.cursor;

        let tip = match with_timeout(
            "getblockcount",
            self.config.rpc_timeout,
            self.ledger.block_count(),
        )
        .await
        {
            Ok(tip) => tip,
            Err(e) => return self.record_failure(height, e),
        };

        if height + self.config.min_confirmations > tip {
            debug!(
                "Waiting for confirmations: next block {}, tip {}",
                height, tip
            );
            return Ok(TickOutcome::Waiting { height, tip });
        }

        let block = match with_timeout(
            "getblock",
            self.config.rpc_timeout,
            self.ledger.block(height),
        )
        .await
        {
            Ok(block) => block,
            Err(e) => return self.record_failure(height, e),
        };

        if self.failures > 0 {
            info!(
                "Fetched block {} after {} failed attempt(s)",
                height, self.failures
            );
        }
        self.failures = 0;

        let events = self.process_block(&block).await;
        self.reconciler.reconcile(height).await;

        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.record_height(height).await {
                warn!("Failed to checkpoint height {}: {:#}", height, e);
            }
        }

        self.cursor = height + 1;
        self.progress.send_replace(self.cursor);

        Ok(TickOutcome::Processed { height, events })
    }

    async fn process_block(&self, block: &Block) -> usize {
        let mut events = Vec::new();

        for tx in &block.transactions {
            for output in &tx.vout {
                let matches = self
                    .store
                    .match_addresses(output.addresses().iter().map(String::as_str))
                    .await;

                for (address, contribution_id) in matches {
                    events.push(ConfirmationEvent::transparent(
                        address,
                        output.amount(),
                        tx.txid.clone(),
                        contribution_id,
                    ));
                }
            }
        }

        if events.is_empty() {
            debug!("Block {}: no watched outputs", block.height);
        } else {
            info!(
                "Block {}: {} confirmed contribution payment(s)",
                block.height,
                events.len()
            );
        }

        for event in &events {
            self.notifier.dispatch(event);
        }
        self.notifier.new_block(&block.summary());

        events.len()
    }

    fn record_failure(&mut self, height: u64, cause: Error) -> Result<TickOutcome> {
        self.failures += 1;

        if self.failures >= self.config.max_failures {
            error!(
                "Giving up on block {} after {} consecutive failures: {}",
                height, self.failures, cause
            );
            return Err(Error::ScannerHalted {
                height,
                failures: self.failures,
                reason: cause.to_string(),
            });
        }

        warn!(
            "Failed to read block {} (attempt {}/{}): {}",
            height, self.failures, self.config.max_failures, cause
        );
        Ok(TickOutcome::Failed {
            height,
            failures: self.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_node::MockNode;
    use crate::notifier::{Sink, WebhookNotifier};
    use crate::state::WatchedAddress;
    use tokio::sync::mpsc;
    use watcher_common::ContributionId;

    const WATCHED: &str = "tmWatchedAddressForContributionSeven";

    fn config() -> ScannerConfig {
        ScannerConfig {
            min_confirmations: 6,
            retry_delay: Duration::from_secs(5),
            max_failures: 5,
            rpc_timeout: Duration::from_secs(30),
        }
    }

    async fn setup(
        node: &MockNode,
        start_height: u64,
    ) -> (BlockScanner, mpsc::UnboundedReceiver<ConfirmationEvent>) {
        let store = StateStore::new();
        store
            .put_address(WatchedAddress {
                contribution_id: ContributionId::new(7).unwrap(),
                transparent_address: WATCHED.to_string(),
                shared_shielded_address: None,
            })
            .await;

        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(NotifierSet::new(vec![Sink::Webhook(
            WebhookNotifier::from_sender(tx),
        )]));
        let ledger: Arc<dyn LedgerClient> = Arc::new(node.clone());
        let reconciler = DisclosureReconciler::new(
            Arc::clone(&ledger),
            store.clone(),
            Arc::clone(&notifier),
            None,
            6,
            Duration::from_secs(30),
        );

        let scanner = BlockScanner::new(
            ledger,
            store,
            notifier,
            reconciler,
            None,
            config(),
            start_height,
        );
        (scanner, rx)
    }

    async fn drain(scanner: &mut BlockScanner) {
        while let TickOutcome::Processed { .. } = scanner.tick().await.unwrap() {}
    }

    #[tokio::test]
    async fn test_payment_confirmed_once_at_depth() {
        let node = MockNode::new(100);
        let (pay_height, txid) = node.pay(WATCHED, 1_500_000).await;
        let (mut scanner, mut rx) = setup(&node, 100).await;

        node.mine_empty(5).await;
        drain(&mut scanner).await;
        assert_eq!(scanner.cursor(), pay_height);
        assert!(rx.try_recv().is_err());

        node.advance_chain().await;
        drain(&mut scanner).await;
        assert_eq!(scanner.cursor(), pay_height + 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.contribution_id, ContributionId::new(7).unwrap());
        assert_eq!(event.amount, 1_500_000);
        assert_eq!(event.txid, txid);
        assert_eq!(event.to, WATCHED);
        assert!(event.memo.is_empty());

        node.mine_empty(20).await;
        drain(&mut scanner).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_waiting_does_not_count_as_failure() {
        let node = MockNode::new(100);
        let (mut scanner, _rx) = setup(&node, 100).await;

        for _ in 0..10 {
            assert_eq!(
                scanner.tick().await.unwrap(),
                TickOutcome::Waiting {
                    height: 100,
                    tip: 100
                }
            );
        }
        assert_eq!(scanner.failures, 0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_are_fatal() {
        let node = MockNode::new(100);
        node.mine_empty(10).await;
        node.fail_next_fetches(5).await;
        let (mut scanner, _rx) = setup(&node, 100).await;

        for attempt in 1..5 {
            assert_eq!(
                scanner.tick().await.unwrap(),
                TickOutcome::Failed {
                    height: 100,
                    failures: attempt
                }
            );
        }

        let halted = scanner.tick().await;
        assert!(matches!(
            halted,
            Err(Error::ScannerHalted {
                height: 100,
                failures: 5,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let node = MockNode::new(100);
        node.mine_empty(10).await;
        node.fail_next_fetches(4).await;
        let (mut scanner, _rx) = setup(&node, 100).await;

        for _ in 0..4 {
            assert!(matches!(
                scanner.tick().await.unwrap(),
                TickOutcome::Failed { height: 100, .. }
            ));
        }

        assert_eq!(
            scanner.tick().await.unwrap(),
            TickOutcome::Processed {
                height: 100,
                events: 0
            }
        );
        assert_eq!(scanner.failures, 0);

        node.fail_next_fetches(4).await;
        for _ in 0..4 {
            assert!(matches!(
                scanner.tick().await.unwrap(),
                TickOutcome::Failed { height: 101, .. }
            ));
        }
        assert!(matches!(
            scanner.tick().await.unwrap(),
            TickOutcome::Processed { height: 101, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_fetch_times_out() {
        let node = MockNode::new(100);
        node.mine_empty(10).await;
        node.stall_next_fetches(1).await;
        let (mut scanner, _rx) = setup(&node, 100).await;

        assert_eq!(
            scanner.tick().await.unwrap(),
            TickOutcome::Failed {
                height: 100,
                failures: 1
            }
        );
        assert!(matches!(
            scanner.tick().await.unwrap(),
            TickOutcome::Processed { height: 100, .. }
        ));
    }

    #[tokio::test]
    async fn test_heights_are_never_skipped() {
        let node = MockNode::new(100);
        node.mine_empty(20).await;
        let (mut scanner, _rx) = setup(&node, 100).await;
        let progress = scanner.progress();

        let mut seen = Vec::new();
        while let TickOutcome::Processed { height, .. } = scanner.tick().await.unwrap() {
            seen.push(height);
        }

        assert_eq!(seen, (100..=114).collect::<Vec<_>>());
        assert_eq!(*progress.borrow(), 115);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let node = MockNode::new(100);
        let (scanner, _rx) = setup(&node, 100).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(scanner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown_tx.send_replace(true);

        assert!(handle.await.unwrap().is_ok());
    }
}
