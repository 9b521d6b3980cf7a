//! JSON response shapes for the HTTP layer.

use serde::Serialize;

use crate::dao::SCAN_CAP;
use crate::fetcher::TransactionExtras;
use crate::types::{AddressIndex, BatchStatus, BlockIndex};

/// A scan total: an exact number, or `"+100000"` once the scan cap was hit.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Total {
    Exact(usize),
    Capped(String),
}

impl Total {
    pub fn new(total: usize) -> Self {
        if total >= SCAN_CAP {
            Total::Capped(format!("+{SCAN_CAP}"))
        } else {
            Total::Exact(total)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiTransaction {
    pub address: String,
    pub sequence: u8,
    pub tx_hash: String,
    /// Signed decimal string; negative on the sender side.
    pub value: String,
    pub time: u64,
    #[serde(rename = "coupleAddress")]
    pub couple_address: String,
    pub status: bool,
}

impl From<AddressIndex> for ApiTransaction {
    fn from(index: AddressIndex) -> Self {
        ApiTransaction {
            address: index.address,
            sequence: index.sequence,
            tx_hash: index.tx_hash,
            value: index.value.to_string(),
            time: index.time,
            couple_address: index.couple_address,
            status: index.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionsByAccount {
    #[serde(rename = "numFound")]
    pub num_found: Total,
    pub start: usize,
    pub data: Vec<ApiTransaction>,
}

#[derive(Debug, Serialize)]
pub struct ApiBlock {
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    pub time: u64,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    pub addresses: Vec<ApiAddressSequence>,
}

#[derive(Debug, Serialize)]
pub struct ApiAddressSequence {
    pub address: String,
    pub sequence: u8,
}

impl From<BlockIndex> for ApiBlock {
    fn from(block: BlockIndex) -> Self {
        ApiBlock {
            block_number: block.block_number,
            time: block.time,
            created_at: block.created_at,
            addresses: block
                .addresses
                .into_iter()
                .map(|a| ApiAddressSequence {
                    address: a.address,
                    sequence: a.sequence,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Blocks {
    #[serde(rename = "numFound")]
    pub num_found: Total,
    pub start: usize,
    pub data: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
pub struct ApiBatchStatus {
    pub from: String,
    pub to: String,
    pub step: u8,
    pub current: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
}

impl From<BatchStatus> for ApiBatchStatus {
    fn from(batch: BatchStatus) -> Self {
        ApiBatchStatus {
            from: batch.from.to_string(),
            to: batch.to.to_string(),
            step: batch.step,
            current: batch
                .current
                .map(|c| c.to_string())
                .unwrap_or_default(),
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiTransactionExtras {
    pub data: String,
    pub gas: u64,
    #[serde(rename = "gasPrice")]
    pub gas_price: String,
}

impl From<TransactionExtras> for ApiTransactionExtras {
    fn from(extras: TransactionExtras) -> Self {
        ApiTransactionExtras {
            data: extras.data,
            gas: extras.gas,
            gas_price: extras.gas_price.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct Processed {
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    pub transactions: usize,
}
