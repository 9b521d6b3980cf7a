//! Upstream node access over JSON-RPC.
//!
//! One fetcher owns one HTTP client against one endpoint. `fetch_block`
//! resolves every transaction's receipt concurrently and fails as a whole if
//! any single resolution fails; a transient failure also schedules failover
//! on the node manager. Head subscription is tail polling: each newly
//! observed height is fetched and pushed down the channel in chain order,
//! and the channel closes when the subscription task exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::node_manager::NodeManager;
use crate::types::{BlockFact, TransactionFact};

/// How often the head poller asks for the latest block number.
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Attempts for a real-time block whose receipts are not all available yet.
const INCONSISTENT_FETCH_ATTEMPTS: u32 = 5;
/// Back-off between those attempts.
const INCONSISTENT_FETCH_BACKOFF: Duration = Duration::from_secs(120);

/// Cheap follow-up data for one transaction, served to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionExtras {
    pub data: String,
    pub gas: u64,
    pub gas_price: BigUint,
}

/// Everything the indexer needs from an upstream node.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn latest_block(&self) -> Result<BigUint, AppError>;
    async fn fetch_block(&self, block_number: &BigUint) -> Result<BlockFact, AppError>;
    /// Start pushing freshly mined blocks into `sender`. The task owns the
    /// sender: the channel closes when it stops. One fetcher holds at most
    /// one active subscription.
    fn subscribe_new_heads(self: Arc<Self>, sender: mpsc::Sender<BlockFact>) -> JoinHandle<()>;
    /// Stop the subscription task, if any.
    fn close(&self);
    async fn transaction_extras(&self, tx_hash: &str) -> Result<TransactionExtras, AppError>;
}

/// Builds a fetcher against one endpoint; the indexer creates a fresh one
/// per worker and per failover cycle.
pub type FetcherFactory = Arc<dyn Fn(String) -> Arc<dyn Fetch> + Send + Sync>;

pub struct ChainFetcher {
    client: reqwest::Client,
    endpoint: String,
    node_manager: Arc<NodeManager>,
    subscription_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl ChainFetcher {
    pub fn new(endpoint: String, node_manager: Arc<NodeManager>) -> Self {
        ChainFetcher {
            client: reqwest::Client::new(),
            endpoint,
            node_manager,
            subscription_stop: Mutex::new(None),
        }
    }

    /// The standard factory over [`ChainFetcher`].
    pub fn factory(node_manager: Arc<NodeManager>) -> FetcherFactory {
        Arc::new(move |endpoint| {
            Arc::new(ChainFetcher::new(endpoint, node_manager.clone())) as Arc<dyn Fetch>
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("{method} request failed: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("{method} returned bad json: {e}")))?;
        if let Some(error) = body.get("error") {
            if !error.is_null() {
                return Err(AppError::Upstream(format!("{method} error: {error}")));
            }
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| AppError::Upstream(format!("{method} returned no result")))
    }

    /// Fetch a real-time block, retrying while the node's receipts lag
    /// behind its headers. After the final attempt the block is abandoned
    /// and the error is fatal for the current cycle.
    async fn fetch_block_with_retry(
        &self,
        block_number: &BigUint,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<BlockFact, AppError> {
        let mut attempt = 1;
        loop {
            match self.fetch_block(block_number).await {
                Err(AppError::Inconsistent(reason)) if attempt < INCONSISTENT_FETCH_ATTEMPTS => {
                    tracing::warn!(
                        block = %block_number,
                        attempt,
                        reason = %reason,
                        "block not fully available yet, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = stop.changed() => {
                            return Err(AppError::Upstream("subscription stopped".to_string()))
                        }
                        _ = tokio::time::sleep(INCONSISTENT_FETCH_BACKOFF) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Fetch for ChainFetcher {
    async fn latest_block(&self) -> Result<BigUint, AppError> {
        match self.rpc_call("eth_blockNumber", json!([])).await {
            Ok(result) => hex_quantity(&result, "blockNumber"),
            Err(e) => {
                self.node_manager.request_switch();
                Err(e)
            }
        }
    }

    async fn fetch_block(&self, block_number: &BigUint) -> Result<BlockFact, AppError> {
        let number_hex = format!("0x{:x}", block_number);
        let block = match self
            .rpc_call("eth_getBlockByNumber", json!([number_hex, true]))
            .await
        {
            Ok(result) if !result.is_null() => result,
            Ok(_) => {
                return Err(AppError::Upstream(format!("block {block_number} not found")))
            }
            Err(e) => {
                self.node_manager.request_switch();
                return Err(e);
            }
        };

        let tx_hashes: Vec<String> = block
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| tx.get("hash").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // one receipt lookup per transaction, all in flight at once
        let receipt_calls = tx_hashes
            .iter()
            .map(|hash| self.rpc_call("eth_getTransactionReceipt", json!([hash])));
        let receipts = match futures::future::try_join_all(receipt_calls).await {
            Ok(receipts) => receipts,
            Err(e) => {
                self.node_manager.request_switch();
                return Err(e);
            }
        };

        block_fact_from_parts(&block, &receipts)
    }

    fn subscribe_new_heads(self: Arc<Self>, sender: mpsc::Sender<BlockFact>) -> JoinHandle<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self
            .subscription_stop
            .lock()
            .expect("fetcher poisoned") = Some(stop_tx);

        tokio::spawn(async move {
            let mut last_seen: Option<BigUint> = None;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(HEAD_POLL_INTERVAL) => {}
                }
                let head = match self.latest_block().await {
                    Ok(head) => head,
                    Err(e) => {
                        tracing::warn!(error = %e, "head poll failed, ending subscription");
                        return;
                    }
                };
                let mut next = match &last_seen {
                    None => head.clone(),
                    Some(seen) if *seen < head => seen + 1u32,
                    Some(_) => continue,
                };
                while next <= head {
                    match self.fetch_block_with_retry(&next, &mut stop_rx).await {
                        Ok(fact) => {
                            if sender.send(fact).await.is_err() {
                                return;
                            }
                        }
                        Err(AppError::Inconsistent(reason)) => {
                            tracing::error!(block = %next, reason = %reason, "abandoning block");
                            self.node_manager.request_switch();
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(block = %next, error = %e, "real-time fetch failed");
                            return;
                        }
                    }
                    next += 1u32;
                }
                last_seen = Some(head);
            }
        })
    }

    fn close(&self) {
        if let Some(stop) = self
            .subscription_stop
            .lock()
            .expect("fetcher poisoned")
            .take()
        {
            let _ = stop.send(true);
        }
    }

    async fn transaction_extras(&self, tx_hash: &str) -> Result<TransactionExtras, AppError> {
        let result = self
            .rpc_call("eth_getTransactionByHash", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Err(AppError::NotFound(format!("transaction {tx_hash}")));
        }
        Ok(TransactionExtras {
            data: string_field(&result, "input")?,
            gas: hex_u64(&result, "gas")?,
            gas_price: hex_quantity(
                result
                    .get("gasPrice")
                    .unwrap_or(&Value::String("0x0".to_string())),
                "gasPrice",
            )?,
        })
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, AppError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Upstream(format!("missing field {field}")))
}

fn hex_quantity(value: &Value, what: &str) -> Result<BigUint, AppError> {
    let s = value
        .as_str()
        .ok_or_else(|| AppError::Upstream(format!("{what} is not a string")))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| AppError::Upstream(format!("{what} is not hex: {s}")))
}

fn hex_u64(value: &Value, field: &str) -> Result<u64, AppError> {
    let s = string_field(value, field)?;
    let digits = s.strip_prefix("0x").unwrap_or(&s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| AppError::Upstream(format!("{field} is not hex: {s}")))
}

/// Assemble a [`BlockFact`] from a full block body and its receipts, in
/// transaction position order. A missing receipt makes the whole block
/// inconsistent. A successful contract creation yields a second, synthetic
/// fact indexing the created address.
pub fn block_fact_from_parts(block: &Value, receipts: &[Value]) -> Result<BlockFact, AppError> {
    let block_number = hex_quantity(
        block
            .get("number")
            .unwrap_or(&Value::Null),
        "block number",
    )?;
    let block_time = hex_u64(block, "timestamp")?;

    let empty = Vec::new();
    let transactions = block
        .get("transactions")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    if transactions.len() != receipts.len() {
        return Err(AppError::Inconsistent(format!(
            "block {block_number} has {} transactions but {} receipts",
            transactions.len(),
            receipts.len()
        )));
    }

    let mut facts = Vec::with_capacity(transactions.len());
    for (tx, receipt) in transactions.iter().zip(receipts) {
        let hash = string_field(tx, "hash")?.to_lowercase();
        if receipt.is_null() {
            return Err(AppError::Inconsistent(format!(
                "transaction {hash} in block {block_number} has no receipt"
            )));
        }
        let from = string_field(tx, "from")?.to_lowercase();
        let to = tx
            .get("to")
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        let value = BigInt::from(hex_quantity(
            tx.get("value").unwrap_or(&Value::Null),
            "value",
        )?);
        let status = receipt.get("status").and_then(Value::as_str) == Some("0x1");

        let is_creation = to.is_empty() && value.is_zero();
        facts.push(TransactionFact {
            from,
            to,
            tx_hash: hash.clone(),
            value: value.clone(),
            status,
        });
        if is_creation && status {
            if let Some(contract) = receipt.get("contractAddress").and_then(Value::as_str) {
                facts.push(TransactionFact {
                    from: String::new(),
                    to: contract.to_lowercase(),
                    tx_hash: hash,
                    value: BigInt::from(0),
                    status: true,
                });
            }
        }
    }

    Ok(BlockFact {
        block_number,
        block_time,
        transactions: facts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(hash: &str, from: &str, to: Option<&str>, value: &str) -> Value {
        json!({
            "hash": hash,
            "from": from,
            "to": to,
            "value": value,
        })
    }

    fn receipt(status: &str) -> Value {
        json!({ "status": status })
    }

    const HASH_1: &str = "0xc4690121c0a6cc6c0cb933b9551ae9926302a12a105ad8f24e50f8dadb4a6ece";
    const ADDR_A: &str = "0x2cb1569dbc9c9c64ac7c682acdf6515275277bd6";
    const ADDR_B: &str = "0xafbfefa496ae205cf4e002dee11517e6d6da3ef6";
    const ADDR_C: &str = "0x3ebe227e9fd42bb97b9a950e4a731d8975263812";

    fn block(transactions: Vec<Value>) -> Value {
        json!({
            "number": "0x7e2",
            "timestamp": "0x5c330a80",
            "transactions": transactions,
        })
    }

    #[test]
    fn plain_transfer_becomes_one_fact() {
        let block = block(vec![tx(HASH_1, ADDR_A, Some(ADDR_B), "0x6f")]);
        let fact = block_fact_from_parts(&block, &[receipt("0x1")]).unwrap();
        assert_eq!(fact.block_number, BigUint::from(2018u32));
        assert_eq!(fact.block_time, 1546848896);
        assert_eq!(fact.transactions.len(), 1);
        let t = &fact.transactions[0];
        assert_eq!(t.from, ADDR_A);
        assert_eq!(t.to, ADDR_B);
        assert_eq!(t.value, BigInt::from(111));
        assert!(t.status);
    }

    #[test]
    fn checksummed_addresses_are_lowercased() {
        let block = block(vec![tx(
            HASH_1,
            "0x2CB1569DBc9c9c64ac7c682acdf6515275277bd6",
            Some(ADDR_B),
            "0x1",
        )]);
        let fact = block_fact_from_parts(&block, &[receipt("0x1")]).unwrap();
        assert_eq!(fact.transactions[0].from, ADDR_A);
    }

    #[test]
    fn successful_creation_emits_synthetic_fact() {
        let creation = tx(HASH_1, ADDR_A, None, "0x0");
        let mut created_receipt = receipt("0x1");
        created_receipt["contractAddress"] = json!(ADDR_C);
        let fact = block_fact_from_parts(&block(vec![creation]), &[created_receipt]).unwrap();
        assert_eq!(fact.transactions.len(), 2);
        assert_eq!(fact.transactions[0].from, ADDR_A);
        assert_eq!(fact.transactions[0].to, "");
        assert_eq!(fact.transactions[1].from, "");
        assert_eq!(fact.transactions[1].to, ADDR_C);
        assert!(fact.transactions[1].status);
        assert_eq!(fact.transactions[1].tx_hash, HASH_1);
    }

    #[test]
    fn failed_creation_emits_no_synthetic_fact() {
        let creation = tx(HASH_1, ADDR_A, None, "0x0");
        let mut created_receipt = receipt("0x0");
        created_receipt["contractAddress"] = json!(ADDR_C);
        let fact = block_fact_from_parts(&block(vec![creation]), &[created_receipt]).unwrap();
        assert_eq!(fact.transactions.len(), 1);
        assert!(!fact.transactions[0].status);
    }

    #[test]
    fn failed_transfer_keeps_its_fact_with_status_false() {
        let block = block(vec![tx(HASH_1, ADDR_A, Some(ADDR_B), "0x5")]);
        let fact = block_fact_from_parts(&block, &[receipt("0x0")]).unwrap();
        assert_eq!(fact.transactions.len(), 1);
        assert!(!fact.transactions[0].status);
        assert_eq!(fact.transactions[0].value, BigInt::from(5));
    }

    #[test]
    fn missing_receipt_is_inconsistent() {
        let block = block(vec![tx(HASH_1, ADDR_A, Some(ADDR_B), "0x5")]);
        let err = block_fact_from_parts(&block, &[Value::Null]).unwrap_err();
        assert!(matches!(err, AppError::Inconsistent(_)));
        let err = block_fact_from_parts(&block, &[]).unwrap_err();
        assert!(matches!(err, AppError::Inconsistent(_)));
    }

    #[test]
    fn transaction_order_is_preserved() {
        let block = block(vec![
            tx(HASH_1, ADDR_A, Some(ADDR_B), "0x6f"),
            tx(
                "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
                ADDR_C,
                Some(ADDR_B),
                "0xde",
            ),
        ]);
        let fact =
            block_fact_from_parts(&block, &[receipt("0x1"), receipt("0x1")]).unwrap();
        assert_eq!(fact.transactions[0].tx_hash, HASH_1);
        assert_eq!(fact.transactions[1].value, BigInt::from(222));
    }

    #[test]
    fn hex_quantity_parses_quantities() {
        assert_eq!(
            hex_quantity(&json!("0x7e2"), "n").unwrap(),
            BigUint::from(2018u32)
        );
        assert!(hex_quantity(&json!("zz"), "n").is_err());
        assert!(hex_quantity(&Value::Null, "n").is_err());
    }
}
