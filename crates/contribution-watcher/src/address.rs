//! Address assignment
//!
//! Gives every contribution its own transparent receiving address, paired with
//! the single shared shielded address. Addresses come from one of two
//! strategies, chosen at startup:
//!
//! - **derive**: walk a published BIP32 extended public key along `0/<id>` and
//!   encode the child key as a P2PKH address
//! - **custodial**: ask the node wallet for an address labeled with the
//!   contribution, creating one only when none exists

use bip32::{ChildNumber, XPub};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use watcher_common::{ContributionId, Error, Result};
use zcash_address::{ToAddress, ZcashAddress};
use zcash_protocol::consensus::NetworkType;

use crate::ledger::LedgerClient;
use crate::state::{StateStore, WatchedAddress};

/// Non-hardened chain the contribution index hangs off
const EXTERNAL_CHAIN: u32 = 0;

/// Derives transparent addresses from an extended public key
#[derive(Clone)]
pub struct TransparentDeriver {
    chain: XPub,
    network: NetworkType,
}

impl TransparentDeriver {
    pub fn new(extended_public_key: &str, network: NetworkType) -> Result<Self> {
        let account = XPub::from_str(extended_public_key.trim())
            .map_err(|e| Error::Derivation(format!("invalid extended public key: {}", e)))?;
        let chain = account
            .derive_child(child_number(EXTERNAL_CHAIN)?)
            .map_err(|e| Error::Derivation(e.to_string()))?;

        Ok(Self { chain, network })
    }

    /// Address for child `index`. Indexes outside `0..2^31` are rejected.
    pub fn derive(&self, index: i64) -> Result<String> {
        let id = ContributionId::new(index)?;
        let child = self
            .chain
            .derive_child(child_number(id.get())?)
            .map_err(|e| Error::Derivation(e.to_string()))?;

        let pub_key_hash = hash160(&child.to_bytes());
        Ok(ZcashAddress::from_transparent_p2pkh(self.network, pub_key_hash).encode())
    }
}

fn child_number(index: u32) -> Result<ChildNumber> {
    ChildNumber::new(index, false).map_err(|e| Error::Derivation(e.to_string()))
}

/// RIPEMD-160 of SHA-256, as used for P2PKH key hashes
fn hash160(bytes: &[u8]) -> [u8; 20] {
    let sha_hash = Sha256::digest(bytes);
    let ripe_hash = Ripemd160::digest(sha_hash);
    let mut payload = [0u8; 20];
    payload.copy_from_slice(&ripe_hash[..]);
    payload
}

/// Wallet label for a contribution's custodial address
pub fn custodial_label(id: ContributionId) -> String {
    format!("contribution-{}", id)
}

pub enum AddressStrategy {
    Derive(TransparentDeriver),
    Custodial(Arc<dyn LedgerClient>),
}

pub struct AddressAssigner {
    strategy: AddressStrategy,
    shielded_address: Option<String>,
    store: StateStore,
    /// Serializes custodial allocation so one id never gets two wallet addresses
    allocation: Mutex<()>,
}

impl AddressAssigner {
    pub fn new(strategy: AddressStrategy, shielded_address: Option<String>, store: StateStore) -> Self {
        Self {
            strategy,
            shielded_address,
            store,
            allocation: Mutex::new(()),
        }
    }

    pub fn shielded_address(&self) -> Option<&str> {
        self.shielded_address.as_deref()
    }

    /// Addresses for `id`, creating and recording them the first time
    pub async fn assign(&self, id: ContributionId) -> Result<WatchedAddress> {
        if let Some(existing) = self.store.addresses_by_contribution(id).await {
            return Ok(existing);
        }

        let transparent_address = match &self.strategy {
            AddressStrategy::Derive(deriver) => deriver.derive(id.get() as i64)?,
            AddressStrategy::Custodial(wallet) => {
                let _guard = self.allocation.lock().await;
                if let Some(existing) = self.store.addresses_by_contribution(id).await {
                    return Ok(existing);
                }
                self.allocate(wallet.as_ref(), id).await?
            }
        };

        let watched = self
            .store
            .put_address(WatchedAddress {
                contribution_id: id,
                transparent_address,
                shared_shielded_address: self.shielded_address.clone(),
            })
            .await;
        Ok(watched)
    }

    async fn allocate(&self, wallet: &dyn LedgerClient, id: ContributionId) -> Result<String> {
        let label = custodial_label(id);
        let existing = wallet
            .addresses_by_label(&label)
            .await
            .map_err(|e| Error::Custodial(format!("lookup of {} failed: {}", label, e)))?;

        if let Some(first) = existing.first() {
            if existing.len() > 1 {
                warn!(
                    "Wallet holds {} addresses labeled {}, using {}",
                    existing.len(),
                    label,
                    first
                );
            }
            return Ok(first.clone());
        }

        let address = wallet
            .new_address(&label)
            .await
            .map_err(|e| Error::Custodial(format!("allocation for {} failed: {}", label, e)))?;
        info!("Allocated custodial address {} for contribution {}", address, id);
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_node::MockNode;

    /// BIP32 test vector 1, master public key
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn id(raw: i64) -> ContributionId {
        ContributionId::new(raw).unwrap()
    }

    #[test]
    fn test_derive_is_deterministic() {
        let deriver = TransparentDeriver::new(XPUB, NetworkType::Main).unwrap();
        let first = deriver.derive(7).unwrap();

        assert_eq!(first, deriver.derive(7).unwrap());
        assert_eq!(
            first,
            TransparentDeriver::new(XPUB, NetworkType::Main)
                .unwrap()
                .derive(7)
                .unwrap()
        );
        assert_ne!(first, deriver.derive(8).unwrap());
        assert!(first.starts_with("t1"));
    }

    #[test]
    fn test_derive_network_prefix() {
        let deriver = TransparentDeriver::new(XPUB, NetworkType::Test).unwrap();
        assert!(deriver.derive(0).unwrap().starts_with("tm"));
    }

    #[test]
    fn test_derive_range() {
        let deriver = TransparentDeriver::new(XPUB, NetworkType::Test).unwrap();

        assert!(deriver.derive((1 << 31) - 1).is_ok());
        assert!(matches!(
            deriver.derive(1 << 31),
            Err(Error::InvalidContributionId(_))
        ));
        assert!(matches!(
            deriver.derive(-1),
            Err(Error::InvalidContributionId(-1))
        ));
    }

    #[test]
    fn test_rejects_bad_xpub() {
        assert!(TransparentDeriver::new("xpub-not-really", NetworkType::Test).is_err());
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let store = StateStore::new();
        let assigner = AddressAssigner::new(
            AddressStrategy::Derive(TransparentDeriver::new(XPUB, NetworkType::Test).unwrap()),
            Some("ztestsaplingShared".to_string()),
            store.clone(),
        );

        let first = assigner.assign(id(5)).await.unwrap();
        let second = assigner.assign(id(5)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.shared_shielded_address.as_deref(), Some("ztestsaplingShared"));
        assert_eq!(
            store
                .match_addresses([first.transparent_address.as_str()])
                .await,
            vec![(first.transparent_address.as_str(), id(5))]
        );
    }

    #[tokio::test]
    async fn test_custodial_reuses_labeled_address() {
        let node = MockNode::new(1);
        let preexisting = node.new_address(&custodial_label(id(9))).await.unwrap();

        let assigner = AddressAssigner::new(
            AddressStrategy::Custodial(Arc::new(node.clone())),
            None,
            StateStore::new(),
        );

        let watched = assigner.assign(id(9)).await.unwrap();
        assert_eq!(watched.transparent_address, preexisting);
        assert_eq!(
            node.addresses_by_label(&custodial_label(id(9))).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_custodial_allocates_once() {
        let node = MockNode::new(1);
        let assigner = Arc::new(AddressAssigner::new(
            AddressStrategy::Custodial(Arc::new(node.clone())),
            None,
            StateStore::new(),
        ));

        let (a, b) = tokio::join!(assigner.assign(id(11)), assigner.assign(id(11)));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(
            node.addresses_by_label(&custodial_label(id(11))).await.unwrap().len(),
            1
        );
    }
}
