//! Zcash full-node client
//!
//! JSON-RPC façade over zcashd. Everything the watcher needs from the chain
//! goes through the [`LedgerClient`] trait so the scanner can run against the
//! mock node in tests.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use watcher_common::{BlockSummary, Error, Result};

/// zcashd error code for an unknown wallet label
const RPC_WALLET_INVALID_LABEL_NAME: i64 = -11;

const ZATOSHIS_PER_ZEC: f64 = 100_000_000.0;

/// Subset of `getblockchaininfo`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    /// "main", "test" or "regtest"
    pub chain: String,

    pub blocks: u64,

    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
}

/// Block as returned by `getblock <height> 2`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "tx", default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            height: self.height,
            hash: self.hash.clone(),
            tx_count: self.transactions.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub vout: Vec<TxOut>,
}

/// Transparent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOut {
    #[serde(default)]
    pub value: f64,
    #[serde(rename = "valueZat", default)]
    pub value_zat: Option<u64>,
    #[serde(default)]
    pub n: u32,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

impl TxOut {
    /// Output value in zatoshis
    pub fn amount(&self) -> u64 {
        self.value_zat
            .unwrap_or_else(|| (self.value * ZATOSHIS_PER_ZEC).round() as u64)
    }

    pub fn addresses(&self) -> &[String] {
        &self.script_pub_key.addresses
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Result of `z_validatepaymentdisclosure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosureReceipt {
    pub txid: String,
    pub valid: bool,
    #[serde(default)]
    pub payment_address: String,
    /// Hex memo, zero padded to the field width
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub value_zat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything the watcher asks of the full node
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo>;

    /// Height of the chain tip
    async fn block_count(&self) -> Result<u64>;

    /// Full block with transaction detail
    async fn block(&self, height: u64) -> Result<Block>;

    /// Confirmed balance of an address, in zatoshis
    async fn balance(&self, address: &str) -> Result<u64>;

    async fn validate_disclosure(&self, disclosure: &str) -> Result<DisclosureReceipt>;

    /// Height of the block containing `txid`, or `None` while unmined
    async fn transaction_height(&self, txid: &str) -> Result<Option<u64>>;

    async fn validate_address(&self, address: &str) -> Result<bool>;

    /// Wallet addresses carrying `label`
    async fn addresses_by_label(&self, label: &str) -> Result<Vec<String>>;

    /// Allocate a new labeled wallet address
    async fn new_address(&self, label: &str) -> Result<String>;
}

/// Bound a ledger call; elapsed time becomes [`Error::Timeout`]
pub async fn with_timeout<T, F>(method: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            method: method.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawTransactionInfo {
    #[serde(default)]
    height: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AddressValidation {
    #[serde(rename = "isvalid")]
    is_valid: bool,
}

/// JSON-RPC client for zcashd
pub struct RpcLedger {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Rpc(format!("Failed to build HTTP client: {}", e)))?;

        info!("Using Zcash node RPC at {}", url);

        Ok(Self {
            client,
            url,
            user,
            password,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        with_timeout(method, self.timeout, self.call_inner(method, params)).await
    }

    async fn call_inner<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("{}: {}", method, e)))?;
        let status = response.status();

        // zcashd reports RPC errors with a non-2xx status and a JSON body
        let envelope: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("{}: HTTP {} with unreadable body: {}", method, status, e)))?;

        if let Some(err) = envelope.error {
            return Err(Error::RpcFailure {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        debug!("RPC {} -> HTTP {}", method, status);

        envelope
            .result
            .ok_or_else(|| Error::Rpc(format!("{}: response carried no result", method)))
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn chain_info(&self) -> Result<ChainInfo> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block(&self, height: u64) -> Result<Block> {
        // Heights are passed as strings; zcashd treats a bare number as a hash
        self.call("getblock", json!([height.to_string(), 2])).await
    }

    async fn balance(&self, address: &str) -> Result<u64> {
        let zec: f64 = self.call("z_getbalance", json!([address])).await?;
        Ok((zec * ZATOSHIS_PER_ZEC).round() as u64)
    }

    async fn validate_disclosure(&self, disclosure: &str) -> Result<DisclosureReceipt> {
        self.call("z_validatepaymentdisclosure", json!([disclosure]))
            .await
    }

    async fn transaction_height(&self, txid: &str) -> Result<Option<u64>> {
        let info: RawTransactionInfo = self.call("getrawtransaction", json!([txid, 1])).await?;
        // Mempool transactions report -1 or omit the field
        Ok(info.height.filter(|h| *h >= 0).map(|h| h as u64))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let method = if address.starts_with('t') {
            "validateaddress"
        } else {
            "z_validateaddress"
        };
        let validation: AddressValidation = self.call(method, json!([address])).await?;
        Ok(validation.is_valid)
    }

    async fn addresses_by_label(&self, label: &str) -> Result<Vec<String>> {
        match self
            .call::<HashMap<String, Value>>("getaddressesbylabel", json!([label]))
            .await
        {
            Ok(addresses) => {
                let mut addresses: Vec<String> = addresses.into_keys().collect();
                addresses.sort();
                Ok(addresses)
            }
            Err(Error::RpcFailure { code, .. }) if code == RPC_WALLET_INVALID_LABEL_NAME => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn new_address(&self, label: &str) -> Result<String> {
        self.call("getnewaddress", json!([label])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_parsing() {
        let raw = json!({
            "hash": "00ab",
            "height": 120,
            "time": 1_600_000_000,
            "tx": [{
                "txid": "t1",
                "vout": [
                    {
                        "value": 0.5,
                        "valueZat": 50_000_000u64,
                        "n": 0,
                        "scriptPubKey": { "addresses": ["tmAAA"] }
                    },
                    {
                        "value": 0.25,
                        "n": 1,
                        "scriptPubKey": { "type": "nulldata" }
                    }
                ]
            }]
        });

        let block: Block = serde_json::from_value(raw).unwrap();
        assert_eq!(block.height, 120);
        assert_eq!(block.transactions.len(), 1);

        let outputs = &block.transactions[0].vout;
        assert_eq!(outputs[0].amount(), 50_000_000);
        assert_eq!(outputs[0].addresses(), ["tmAAA".to_string()]);
        assert_eq!(outputs[1].amount(), 25_000_000);
        assert!(outputs[1].addresses().is_empty());

        let summary = block.summary();
        assert_eq!(summary.height, 120);
        assert_eq!(summary.tx_count, 1);
    }

    #[test]
    fn test_disclosure_receipt_parsing() {
        let raw = json!({
            "txid": "abcd",
            "jsIndex": 0,
            "outputIndex": 1,
            "version": 1,
            "onetimePrivKey": "00",
            "message": "thanks",
            "joinSplitPubKey": "00",
            "signatureVerified": true,
            "paymentAddress": "zcShared",
            "memo": "f600",
            "value": 1.5,
            "valueZat": 150_000_000u64,
            "commitmentMatch": true,
            "valid": true
        });

        let receipt: DisclosureReceipt = serde_json::from_value(raw).unwrap();
        assert!(receipt.valid);
        assert_eq!(receipt.payment_address, "zcShared");
        assert_eq!(receipt.value_zat, 150_000_000);
        assert_eq!(receipt.message.as_deref(), Some("thanks"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: Result<()> = with_timeout("getblock", Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { secs: 3, .. })));
    }

    #[tokio::test]
    #[ignore] // Requires a running zcashd
    async fn test_connect_to_node() {
        let ledger = RpcLedger::new(
            "http://127.0.0.1:18232",
            Some("user".to_string()),
            Some("pass".to_string()),
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(ledger.chain_info().await.is_ok());
    }
}
