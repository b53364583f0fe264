//! Mock Zcash node for development and testing
//!
//! Simulates a full node without requiring an actual blockchain connection.
//! Blocks are kept in memory; payments, disclosures and fetch failures can be
//! injected to drive the scanner through specific scenarios.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use watcher_common::{Error, Result};

use crate::ledger::{
    Block, ChainInfo, DisclosureReceipt, LedgerClient, ScriptPubKey, Transaction, TxOut,
};

#[derive(Default)]
struct MockChain {
    /// Height of `blocks[0]`
    base_height: u64,
    blocks: Vec<Block>,
    disclosures: HashMap<String, DisclosureReceipt>,
    labels: HashMap<String, Vec<String>>,
    next_label_address: u32,
    failing_fetches: u32,
    stalled_fetches: u32,
    stalled_lookups: u32,
    next_tx: u64,
}

impl MockChain {
    fn tip(&self) -> u64 {
        self.base_height + self.blocks.len() as u64 - 1
    }

    fn push_block(&mut self, transactions: Vec<Transaction>) -> u64 {
        let height = self.base_height + self.blocks.len() as u64;
        self.blocks.push(Block {
            height,
            hash: format!("{:064x}", height),
            time: 1_477_641_360 + height as i64 * 75, // ~75 seconds per block
            transactions,
        });
        height
    }

    fn next_txid(&mut self) -> String {
        self.next_tx += 1;
        format!("{:064x}", 0xfeed_0000_0000u64 + self.next_tx)
    }
}

/// In-memory ledger
#[derive(Clone)]
pub struct MockNode {
    chain: Arc<Mutex<MockChain>>,
}

impl MockNode {
    /// Create a chain whose genesis sits at `start_height`
    pub fn new(start_height: u64) -> Self {
        let mut chain = MockChain {
            base_height: start_height,
            ..Default::default()
        };
        chain.push_block(Vec::new());

        Self {
            chain: Arc::new(Mutex::new(chain)),
        }
    }

    /// Current tip height
    pub async fn tip(&self) -> u64 {
        self.chain.lock().await.tip()
    }

    /// Advance the blockchain by one empty block (simulates a new block being mined)
    pub async fn advance_chain(&self) -> u64 {
        let height = self.chain.lock().await.push_block(Vec::new());
        debug!("Mock node: Advanced to height {}", height);
        height
    }

    pub async fn mine_empty(&self, count: u64) -> u64 {
        let mut chain = self.chain.lock().await;
        for _ in 0..count {
            chain.push_block(Vec::new());
        }
        chain.tip()
    }

    /// Mine a block holding one transaction that pays `amount` zatoshis to `address`.
    /// Returns `(height, txid)`.
    pub async fn pay(&self, address: &str, amount: u64) -> (u64, String) {
        let mut chain = self.chain.lock().await;
        let txid = chain.next_txid();
        let tx = Transaction {
            txid: txid.clone(),
            vout: vec![TxOut {
                value: amount as f64 / 100_000_000.0,
                value_zat: Some(amount),
                n: 0,
                script_pub_key: ScriptPubKey {
                    addresses: vec![address.to_string()],
                },
            }],
        };
        let height = chain.push_block(vec![tx]);
        (height, txid)
    }

    /// Mine a shielded transaction and register the disclosure blob proving it.
    /// Returns the mined height.
    pub async fn mine_disclosed_payment(&self, blob: &str, receipt: DisclosureReceipt) -> u64 {
        let mut chain = self.chain.lock().await;
        let tx = Transaction {
            txid: receipt.txid.clone(),
            vout: Vec::new(),
        };
        let height = chain.push_block(vec![tx]);
        chain.disclosures.insert(blob.to_string(), receipt);
        height
    }

    /// Register a disclosure whose transaction is not mined yet
    pub async fn register_disclosure(&self, blob: &str, receipt: DisclosureReceipt) {
        self.chain
            .lock()
            .await
            .disclosures
            .insert(blob.to_string(), receipt);
    }

    /// Make the next `count` block fetches fail
    pub async fn fail_next_fetches(&self, count: u32) {
        self.chain.lock().await.failing_fetches = count;
    }

    /// Make the next `count` block fetches hang
    pub async fn stall_next_fetches(&self, count: u32) {
        self.chain.lock().await.stalled_fetches = count;
    }

    /// Make the next `count` transaction height lookups hang
    pub async fn stall_next_lookups(&self, count: u32) {
        self.chain.lock().await.stalled_lookups = count;
    }
}

#[async_trait]
impl LedgerClient for MockNode {
    async fn chain_info(&self) -> Result<ChainInfo> {
        let chain = self.chain.lock().await;
        Ok(ChainInfo {
            chain: "regtest".to_string(),
            blocks: chain.tip(),
            best_block_hash: format!("{:064x}", chain.tip()),
        })
    }

    async fn block_count(&self) -> Result<u64> {
        let height = self.chain.lock().await.tip();
        debug!("Mock node: block_count() -> {}", height);
        Ok(height)
    }

    async fn block(&self, height: u64) -> Result<Block> {
        let stall = {
            let mut chain = self.chain.lock().await;
            if chain.failing_fetches > 0 {
                chain.failing_fetches -= 1;
                return Err(Error::Rpc(format!("getblock: injected failure at {}", height)));
            }
            if chain.stalled_fetches > 0 {
                chain.stalled_fetches -= 1;
                true
            } else {
                false
            }
        };

        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let chain = self.chain.lock().await;
        height
            .checked_sub(chain.base_height)
            .and_then(|offset| chain.blocks.get(offset as usize))
            .cloned()
            .ok_or_else(|| Error::RpcFailure {
                method: "getblock".to_string(),
                code: -8,
                message: "Block height out of range".to_string(),
            })
    }

    async fn balance(&self, address: &str) -> Result<u64> {
        let chain = self.chain.lock().await;
        Ok(chain
            .blocks
            .iter()
            .flat_map(|block| &block.transactions)
            .flat_map(|tx| &tx.vout)
            .filter(|out| out.addresses().iter().any(|a| a == address))
            .map(TxOut::amount)
            .sum())
    }

    async fn validate_disclosure(&self, disclosure: &str) -> Result<DisclosureReceipt> {
        let chain = self.chain.lock().await;
        Ok(chain
            .disclosures
            .get(disclosure)
            .cloned()
            .unwrap_or_else(|| DisclosureReceipt {
                txid: String::new(),
                valid: false,
                payment_address: String::new(),
                memo: String::new(),
                value_zat: 0,
                message: None,
            }))
    }

    async fn transaction_height(&self, txid: &str) -> Result<Option<u64>> {
        let stall = {
            let mut chain = self.chain.lock().await;
            let stall = chain.stalled_lookups > 0;
            chain.stalled_lookups = chain.stalled_lookups.saturating_sub(1);
            stall
        };

        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let chain = self.chain.lock().await;
        Ok(chain
            .blocks
            .iter()
            .find(|block| block.transactions.iter().any(|tx| tx.txid == txid))
            .map(|block| block.height))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        Ok((address.starts_with("tm") || address.starts_with("zt")) && address.len() >= 26)
    }

    async fn addresses_by_label(&self, label: &str) -> Result<Vec<String>> {
        let chain = self.chain.lock().await;
        Ok(chain.labels.get(label).cloned().unwrap_or_default())
    }

    async fn new_address(&self, label: &str) -> Result<String> {
        let mut chain = self.chain.lock().await;
        chain.next_label_address += 1;
        let address = format!("tmMockWallet{:022}", chain.next_label_address);
        chain
            .labels
            .entry(label.to_string())
            .or_default()
            .push(address.clone());
        Ok(address)
    }
}
