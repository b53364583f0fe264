//! Bootstrap handshake
//!
//! After a restart the backend re-sends every contribution still awaiting
//! payment, plus the last transaction it saw confirmed. The watcher seeds its
//! address book from the list and picks the height the scanner resumes from.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use watcher_common::{ContributionId, Error, Result};

use crate::checkpoint::Checkpoint;
use crate::ledger::{with_timeout, LedgerClient};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingContribution {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tx_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    #[serde(default)]
    pub pending_contributions: Vec<PendingContribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_tx_id: Option<String>,
}

impl BootstrapRequest {
    /// Validate every id before anything is assigned
    pub fn contribution_ids(&self) -> Result<Vec<ContributionId>> {
        self.pending_contributions
            .iter()
            .map(|entry| ContributionId::new(entry.id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    pub start_height: u64,
    pub current_height: u64,
}

/// Where a start height came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    LatestTx,
    ContributionTx,
    Fallback,
    Checkpoint,
    Tip,
}

/// Inputs for choosing where scanning resumes
pub struct StartHeightResolver<'a> {
    pub ledger: &'a dyn LedgerClient,
    pub rpc_timeout: Duration,
    pub fallback_start_height: Option<u64>,
    pub checkpoint: Option<&'a Checkpoint>,
}

impl StartHeightResolver<'_> {
    /// First available of: the block holding `latestTxId`, the lowest block
    /// holding any entry's `lastTxId`, the configured fallback, the
    /// checkpoint plus one, the current tip.
    ///
    /// Resuming at a transaction's own block rescans it, so its outputs may
    /// be delivered again.
    pub async fn resolve(
        &self,
        request: &BootstrapRequest,
        tip: u64,
    ) -> Result<(u64, StartSource)> {
        if let Some(txid) = request.latest_tx_id.as_deref() {
            if let Some(height) = self.tx_height(txid).await? {
                return Ok((height, StartSource::LatestTx));
            }
        }

        let mut lowest: Option<u64> = None;
        for txid in request
            .pending_contributions
            .iter()
            .filter_map(|entry| entry.last_tx_id.as_deref())
        {
            if let Some(height) = self.tx_height(txid).await? {
                lowest = Some(lowest.map_or(height, |l| l.min(height)));
            }
        }
        if let Some(height) = lowest {
            return Ok((height, StartSource::ContributionTx));
        }

        if let Some(height) = self.fallback_start_height {
            return Ok((height.min(tip), StartSource::Fallback));
        }

        if let Some(checkpoint) = self.checkpoint {
            match checkpoint.last_processed_height().await {
                Ok(Some(height)) => return Ok((height + 1, StartSource::Checkpoint)),
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable checkpoint: {:#}", e),
            }
        }

        Ok((tip, StartSource::Tip))
    }

    async fn tx_height(&self, txid: &str) -> Result<Option<u64>> {
        match with_timeout(
            "getrawtransaction",
            self.rpc_timeout,
            self.ledger.transaction_height(txid),
        )
        .await
        {
            Ok(Some(height)) => Ok(Some(height)),
            Ok(None) => {
                info!("Transaction {} is not mined, not resuming from it", txid);
                Ok(None)
            }
            // The node does not know the transaction
            Err(Error::RpcFailure { message, .. }) => {
                warn!("Cannot locate transaction {}: {}", txid, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
