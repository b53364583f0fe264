//! In-memory state store
//!
//! Holds the watched addresses and the pending shielded-payment disclosures.
//! Nothing here survives a restart; the backend re-seeds it through bootstrap.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use watcher_common::ContributionId;

/// Receiving addresses for one contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedAddress {
    pub contribution_id: ContributionId,
    pub transparent_address: String,
    /// Same for every contribution; payments are told apart by memo
    pub shared_shielded_address: Option<String>,
}

/// A disclosure waiting for its transaction to reach confirmation depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDisclosure {
    pub contribution_id: ContributionId,
    pub disclosure: String,
}

#[derive(Default)]
struct Inner {
    addresses: HashMap<ContributionId, WatchedAddress>,
    by_transparent: HashMap<String, ContributionId>,
    disclosures: HashMap<ContributionId, String>,
}

/// Shared handle to the store. Every access goes through one mutex.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a watched address. The first record for a contribution wins and
    /// is returned on every later call.
    pub async fn put_address(&self, address: WatchedAddress) -> WatchedAddress {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.addresses.get(&address.contribution_id) {
            return existing.clone();
        }

        debug!(
            "Watching {} for contribution {}",
            address.transparent_address, address.contribution_id
        );
        inner
            .by_transparent
            .insert(address.transparent_address.clone(), address.contribution_id);
        inner
            .addresses
            .insert(address.contribution_id, address.clone());
        address
    }

    pub async fn addresses_by_contribution(&self, id: ContributionId) -> Option<WatchedAddress> {
        self.inner.lock().await.addresses.get(&id).cloned()
    }

    /// Resolve many addresses under a single lock
    pub async fn match_addresses<'a, I>(&self, addresses: I) -> Vec<(&'a str, ContributionId)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let inner = self.inner.lock().await;
        addresses
            .into_iter()
            .filter_map(|a| inner.by_transparent.get(a).map(|id| (a, *id)))
            .collect()
    }

    pub async fn watched_count(&self) -> usize {
        self.inner.lock().await.addresses.len()
    }

    /// Store a disclosure, replacing any pending one for the same contribution
    pub async fn put_disclosure(&self, id: ContributionId, disclosure: String) {
        let mut inner = self.inner.lock().await;
        if inner.disclosures.insert(id, disclosure).is_some() {
            debug!("Replaced pending disclosure for contribution {}", id);
        }
    }

    pub async fn all_disclosures(&self) -> Vec<PendingDisclosure> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<PendingDisclosure> = inner
            .disclosures
            .iter()
            .map(|(id, disclosure)| PendingDisclosure {
                contribution_id: *id,
                disclosure: disclosure.clone(),
            })
            .collect();
        pending.sort_by_key(|p| p.contribution_id);
        pending
    }

    pub async fn remove_disclosure(&self, id: ContributionId) -> Option<String> {
        self.inner.lock().await.disclosures.remove(&id)
    }

    /// Remove `pending` if it is still the stored disclosure for its
    /// contribution and run `on_removed` before the lock is released.
    ///
    /// Returns false when the entry was already removed or overwritten, in
    /// which case `on_removed` does not run.
    pub async fn take_disclosure<F>(&self, pending: &PendingDisclosure, on_removed: F) -> bool
    where
        F: FnOnce(),
    {
        let mut inner = self.inner.lock().await;
        match inner.disclosures.get(&pending.contribution_id) {
            Some(current) if *current == pending.disclosure => {
                inner.disclosures.remove(&pending.contribution_id);
                on_removed();
                true
            }
            _ => false,
        }
    }
}
