//! Shielded-payment disclosure reconciliation
//!
//! Runs after every processed block. Each pending disclosure is re-validated
//! by the node; once its transaction sits `min_confirmations` below the
//! scanned height it is confirmed and removed.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use watcher_common::memo::contribution_id_from_memo;
use watcher_common::{ConfirmationEvent, ContributionId};

use crate::ledger::{with_timeout, DisclosureReceipt, LedgerClient};
use crate::notifier::NotifierSet;
use crate::state::{PendingDisclosure, StateStore};

pub struct DisclosureReconciler {
    ledger: Arc<dyn LedgerClient>,
    store: StateStore,
    notifier: Arc<NotifierSet>,
    shielded_address: Option<String>,
    min_confirmations: u64,
    rpc_timeout: Duration,
}

impl DisclosureReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: StateStore,
        notifier: Arc<NotifierSet>,
        shielded_address: Option<String>,
        min_confirmations: u64,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            notifier,
            shielded_address,
            min_confirmations,
            rpc_timeout,
        }
    }

    pub fn check_receipt(
        &self,
        id: ContributionId,
        receipt: &DisclosureReceipt,
    ) -> std::result::Result<(), String> {
        check_receipt(self.shielded_address.as_deref(), id, receipt)
    }

    /// Confirm every disclosure that is deep enough below `scanned_height`.
    /// Returns the number confirmed.
    pub async fn reconcile(&self, scanned_height: u64) -> usize {
        let pending = self.store.all_disclosures().await;
        if pending.is_empty() {
            return 0;
        }

        debug!(
            "Reconciling {} pending disclosure(s) at height {}",
            pending.len(),
            scanned_height
        );

        let mut confirmed = 0;
        for entry in pending {
            if self.reconcile_one(&entry, scanned_height).await {
                confirmed += 1;
            }
        }
        confirmed
    }

    async fn reconcile_one(&self, entry: &PendingDisclosure, scanned_height: u64) -> bool {
        let id = entry.contribution_id;

        let receipt = match with_timeout(
            "z_validatepaymentdisclosure",
            self.rpc_timeout,
            self.ledger.validate_disclosure(&entry.disclosure),
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Could not validate disclosure for contribution {}: {}", id, e);
                return false;
            }
        };

        if let Err(reason) = self.check_receipt(id, &receipt) {
            warn!("Dropping disclosure for contribution {}: {}", id, reason);
            self.drop_if_unchanged(entry).await;
            return false;
        }

        let tx_height = match with_timeout(
            "getrawtransaction",
            self.rpc_timeout,
            self.ledger.transaction_height(&receipt.txid),
        )
        .await
        {
            Ok(Some(height)) => height,
            Ok(None) => {
                debug!("Disclosed tx {} is not mined yet", receipt.txid);
                return false;
            }
            Err(e) => {
                warn!("Could not locate disclosed tx {}: {}", receipt.txid, e);
                return false;
            }
        };

        if tx_height + self.min_confirmations > scanned_height {
            debug!(
                "Disclosed tx {} at {} is not deep enough at {}",
                receipt.txid, tx_height, scanned_height
            );
            return false;
        }

        let event = ConfirmationEvent {
            to: receipt.payment_address.clone(),
            amount: receipt.value_zat,
            txid: receipt.txid.clone(),
            memo: receipt.memo.clone(),
            contribution_id: id,
        };

        // Removal and dispatch happen under the store lock
        let taken = self
            .store
            .take_disclosure(entry, || {
                self.notifier.dispatch(&event);
            })
            .await;

        if taken {
            info!(
                "Confirmed shielded contribution {} (tx {}, {} zatoshis)",
                id, event.txid, event.amount
            );
        }
        taken
    }

    async fn drop_if_unchanged(&self, entry: &PendingDisclosure) {
        self.store.take_disclosure(entry, || {}).await;
    }
}

/// Reject receipts that cannot belong to `id`
pub fn check_receipt(
    shielded_address: Option<&str>,
    id: ContributionId,
    receipt: &DisclosureReceipt,
) -> std::result::Result<(), String> {
    if !receipt.valid {
        return Err("node reports the disclosure as invalid".to_string());
    }

    match shielded_address {
        Some(expected) if expected == receipt.payment_address => {}
        Some(_) => {
            return Err(format!(
                "pays {} instead of the shared shielded address",
                receipt.payment_address
            ))
        }
        None => return Err("shielded payments are disabled".to_string()),
    }

    match contribution_id_from_memo(&receipt.memo) {
        Some(named) if named == id => Ok(()),
        Some(named) => Err(format!("memo names contribution {}", named)),
        None => Err("memo does not name a contribution".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_node::MockNode;
    use crate::notifier::{Sink, WebhookNotifier};
    use tokio::sync::mpsc;
    use watcher_common::memo::{encode_memo, make_memo};

    const SHIELDED: &str = "ztestsapling1sharedaddressforeverycontribution";

    fn id(raw: i64) -> ContributionId {
        ContributionId::new(raw).unwrap()
    }

    fn receipt(txid: &str, to: &str, contribution: i64) -> DisclosureReceipt {
        DisclosureReceipt {
            txid: txid.to_string(),
            valid: true,
            payment_address: to.to_string(),
            memo: encode_memo(&make_memo(id(contribution), "Grant.io")),
            value_zat: 250_000,
            message: None,
        }
    }

    fn setup(
        node: &MockNode,
    ) -> (
        DisclosureReconciler,
        StateStore,
        mpsc::UnboundedReceiver<ConfirmationEvent>,
    ) {
        let store = StateStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(NotifierSet::new(vec![Sink::Webhook(
            WebhookNotifier::from_sender(tx),
        )]));
        let reconciler = DisclosureReconciler::new(
            Arc::new(node.clone()),
            store.clone(),
            notifier,
            Some(SHIELDED.to_string()),
            6,
            Duration::from_secs(5),
        );
        (reconciler, store, rx)
    }

    #[tokio::test]
    async fn test_confirms_at_depth() {
        let node = MockNode::new(100);
        let (reconciler, store, mut rx) = setup(&node);

        let height = node
            .mine_disclosed_payment("blob", receipt("shieldedtx", SHIELDED, 4))
            .await;
        store.put_disclosure(id(4), "blob".to_string()).await;

        assert_eq!(reconciler.reconcile(height + 5).await, 0);
        assert_eq!(store.all_disclosures().await.len(), 1);

        assert_eq!(reconciler.reconcile(height + 6).await, 1);
        assert!(store.all_disclosures().await.is_empty());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.contribution_id, id(4));
        assert_eq!(event.amount, 250_000);
        assert_eq!(event.txid, "shieldedtx");
        assert_eq!(event.to, SHIELDED);

        // Removed exactly once
        assert_eq!(reconciler.reconcile(height + 7).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_address_is_dropped() {
        let node = MockNode::new(100);
        let (reconciler, store, mut rx) = setup(&node);

        let height = node
            .mine_disclosed_payment("blob", receipt("tx", "ztestsapling1someoneelse", 4))
            .await;
        store.put_disclosure(id(4), "blob".to_string()).await;

        assert_eq!(reconciler.reconcile(height + 10).await, 0);
        assert!(store.all_disclosures().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_disclosure_is_dropped() {
        let node = MockNode::new(100);
        let (reconciler, store, mut rx) = setup(&node);

        store.put_disclosure(id(2), "unknown".to_string()).await;

        assert_eq!(reconciler.reconcile(200).await, 0);
        assert!(store.all_disclosures().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmined_stays_pending() {
        let node = MockNode::new(100);
        let (reconciler, store, _rx) = setup(&node);

        node.register_disclosure("blob", receipt("mempooltx", SHIELDED, 3))
            .await;
        store.put_disclosure(id(3), "blob".to_string()).await;

        assert_eq!(reconciler.reconcile(500).await, 0);
        assert_eq!(store.all_disclosures().await.len(), 1);
    }

    #[test]
    fn test_check_receipt_memo() {
        let node = MockNode::new(1);
        let (reconciler, _, _) = setup(&node);

        assert!(reconciler
            .check_receipt(id(4), &receipt("tx", SHIELDED, 4))
            .is_ok());
        assert!(reconciler
            .check_receipt(id(5), &receipt("tx", SHIELDED, 4))
            .is_err());

        let mut blank = receipt("tx", SHIELDED, 4);
        blank.memo = String::new();
        assert!(reconciler.check_receipt(id(4), &blank).is_err());
    }
}
