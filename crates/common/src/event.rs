use serde::{Deserialize, Serialize};

use crate::ContributionId;

/// A payment that reached confirmation depth.
///
/// Built either from a transparent output paying a watched address, or from a
/// validated shielded-payment disclosure. Never stored; handed straight to the
/// notifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationEvent {
    /// Receiving address
    pub to: String,

    /// Amount in zatoshis
    pub amount: u64,

    /// Transaction id
    pub txid: String,

    /// Hex memo; empty for transparent outputs
    pub memo: String,

    pub contribution_id: ContributionId,
}

impl ConfirmationEvent {
    pub fn transparent(
        to: impl Into<String>,
        amount: u64,
        txid: impl Into<String>,
        contribution_id: ContributionId,
    ) -> Self {
        Self {
            to: to.into(),
            amount,
            txid: txid.into(),
            memo: String::new(),
            contribution_id,
        }
    }
}

/// Minimal description of a processed block, pushed to streaming clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub tx_count: usize,
}
