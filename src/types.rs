//! Domain types produced by the fetcher and persisted by the repositories.

use std::fmt;

use num_bigint::{BigInt, BigUint};

/// Transactions without a sender or receiver side are indexed against this
/// address so every stored record carries a 20-byte counterparty.
pub const ADDRESS_ZERO: &str = "0x0000000000000000000000000000000000000000";

/// One value transfer as reported by the upstream node.
///
/// An empty `from` marks a synthetic contract-creation fact; an empty `to`
/// marks the creation transaction itself. At least one side is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionFact {
    pub from: String,
    pub to: String,
    pub tx_hash: String,
    pub value: BigInt,
    /// Receipt status, true = success.
    pub status: bool,
}

/// A fully resolved block: header fields plus its transactions in upstream
/// order.
#[derive(Debug, Clone, Default)]
pub struct BlockFact {
    pub block_number: BigUint,
    /// Block header time, unix seconds.
    pub block_time: u64,
    pub transactions: Vec<TransactionFact>,
}

/// An address paired with its highest sequence inside one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSequence {
    pub address: String,
    pub sequence: u8,
}

/// One persisted touch of an address. `value` is negative on the sender
/// side, positive on the receiver side; on disk only the magnitude is kept
/// and the sign is re-established by the write policy.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressIndex {
    pub address: String,
    pub sequence: u8,
    pub tx_hash: String,
    pub value: BigInt,
    /// Block time, unix seconds.
    pub time: u64,
    pub couple_address: String,
    pub status: bool,
}

/// One persisted real-time block: which addresses it touched and how often,
/// plus when we saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockIndex {
    /// Decimal block number without padding.
    pub block_number: String,
    pub addresses: Vec<AddressSequence>,
    /// Block header time, unix seconds.
    pub time: u64,
    /// Wall clock at write, unix seconds.
    pub created_at: u64,
}

/// Progress record of one back-fill worker. Identity is `(from, to, step,
/// created_at)`; progress is `(current, updated_at)`.
///
/// A batch visits `from, from+step, from+2*step, ...` up to and including
/// `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatus {
    pub from: BigUint,
    pub to: BigUint,
    pub step: u8,
    /// Identity timestamp, unix seconds.
    pub created_at: u64,
    /// Last visited block number, none before the first stride.
    pub current: Option<BigUint>,
    pub updated_at: u64,
}

impl BatchStatus {
    /// A batch is done once the next stride would overshoot `to`.
    pub fn is_done(&self) -> bool {
        match &self.current {
            None => false,
            Some(current) => current + self.step > self.to,
        }
    }

    /// Advance to the next block number of this batch: seeds `current` with
    /// `from` on the first call, then strides by `step`.
    pub fn next(&mut self) -> BigUint {
        let next = match self.current.take() {
            None => self.from.clone(),
            Some(current) => current + self.step,
        };
        self.current = Some(next.clone());
        next
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from {}, to {}, step {}, current {:?}, created at {}",
            self.from, self.to, self.step, self.current, self.created_at
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(from: u32, to: u32, step: u8) -> BatchStatus {
        BatchStatus {
            from: BigUint::from(from),
            to: BigUint::from(to),
            step,
            created_at: 1546848896,
            current: None,
            updated_at: 0,
        }
    }

    #[test]
    fn fresh_batch_is_not_done() {
        assert!(!batch(0, 10, 3).is_done());
    }

    #[test]
    fn next_seeds_from_then_strides() {
        let mut b = batch(2, 10, 3);
        assert_eq!(b.next(), BigUint::from(2u32));
        assert_eq!(b.next(), BigUint::from(5u32));
        assert_eq!(b.next(), BigUint::from(8u32));
    }

    #[test]
    fn done_once_next_stride_overshoots() {
        let mut b = batch(0, 4, 2);
        // visits 0, 2, 4 then stops
        let mut visited = Vec::new();
        while !b.is_done() {
            visited.push(b.next());
        }
        let expected: Vec<BigUint> =
            [0u32, 2, 4].iter().map(|n| BigUint::from(*n)).collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn final_stride_landing_on_to_still_runs() {
        let mut b = batch(1, 1, 1);
        assert!(!b.is_done());
        assert_eq!(b.next(), BigUint::from(1u32));
        assert!(b.is_done());
    }
}
