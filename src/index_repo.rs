//! Repository over the address and block databases.

use std::sync::Arc;

use crate::dao::{prefix_upper_bound, KeyValue, KeyValueDao};
use crate::error::AppError;
use crate::marshal;
use crate::types::{AddressIndex, AddressSequence, BlockIndex};

/// Read/write operations over the address and block indexes. The indexer
/// owns the writes; the HTTP layer shares the reads.
pub trait IndexRepo: Send + Sync {
    /// Persist one block's worth of address records.
    ///
    /// Real-time writes (`is_batch == false`) first check the block database
    /// for an earlier version of the same block number and, if present,
    /// erase that version's address records before writing the new ones and
    /// the new block index (reorg handling). Back-fill writes never touch
    /// the block database.
    fn store(
        &self,
        address_indexes: &[AddressIndex],
        block_index: &BlockIndex,
        is_batch: bool,
    ) -> Result<(), AppError>;

    /// Paged transaction lookup for one address, optionally bounded by
    /// inclusive unix-second times. Unbounded queries return newest first;
    /// bounded queries return ascending. The total is capped at
    /// [`crate::dao::SCAN_CAP`].
    fn get_transactions_by_address(
        &self,
        address: &str,
        rows: usize,
        start: usize,
        from_time: Option<u64>,
        to_time: Option<u64>,
    ) -> Result<(usize, Vec<AddressIndex>), AppError>;

    /// Count-only variant of [`Self::get_transactions_by_address`].
    fn get_total_transactions(
        &self,
        address: &str,
        from_time: Option<u64>,
        to_time: Option<u64>,
    ) -> Result<usize, AppError>;

    /// Point lookup when `block_number` is non-empty, otherwise the latest
    /// `rows` blocks, newest first.
    fn get_blocks(
        &self,
        block_number: &str,
        rows: usize,
        start: usize,
    ) -> Result<(usize, Vec<BlockIndex>), AppError>;

    fn get_last_block(&self) -> Result<BlockIndex, AppError>;
    fn get_first_block(&self) -> Result<BlockIndex, AppError>;

    /// Delete block records created before `until_time`; returns how many
    /// were removed.
    fn delete_old_blocks(&self, until_time: u64) -> Result<usize, AppError>;
}

pub struct KvIndexRepo {
    address_dao: Arc<dyn KeyValueDao>,
    block_dao: Arc<dyn KeyValueDao>,
}

impl KvIndexRepo {
    pub fn new(address_dao: Arc<dyn KeyValueDao>, block_dao: Arc<dyn KeyValueDao>) -> Self {
        KvIndexRepo {
            address_dao,
            block_dao,
        }
    }

    fn save_address_indexes(&self, address_indexes: &[AddressIndex]) -> Result<(), AppError> {
        let mut records = Vec::with_capacity(address_indexes.len());
        for index in address_indexes {
            records.push(KeyValue::new(
                marshal::marshal_address_key(index)?,
                marshal::marshal_address_value(index)?,
            ));
        }
        self.address_dao.batch_put(records)
    }

    fn save_block_index(&self, block_index: &BlockIndex) -> Result<(), AppError> {
        self.block_dao.put(KeyValue::new(
            marshal::marshal_block_key(&block_index.block_number),
            marshal::marshal_block_value(block_index)?,
        ))
    }

    /// Erase every address record the replaced block version wrote. The
    /// erasure is keyed by the old block's own time as recorded in its block
    /// index; the sequences there are the per-address maxima, and the stored
    /// sequences form the contiguous range `1..=max`.
    fn handle_reorg(
        &self,
        old_block_time: u64,
        reorg_addresses: &[AddressSequence],
    ) -> Result<(), AppError> {
        let mut keys = Vec::new();
        for address_seq in reorg_addresses {
            for sequence in 1..=address_seq.sequence {
                keys.push(marshal::marshal_address_key_parts(
                    &address_seq.address,
                    old_block_time,
                    sequence,
                )?);
            }
        }
        self.address_dao.batch_delete(&keys)
    }

    fn key_value_to_address_index(&self, kv: &KeyValue) -> Result<AddressIndex, AppError> {
        let mut index = marshal::unmarshal_address_value(&kv.value)?;
        let (address, time, sequence) = marshal::unmarshal_address_key(&kv.key)?;
        index.address = address;
        index.time = time;
        index.sequence = sequence;
        Ok(index)
    }

    fn key_value_to_block_index(&self, kv: &KeyValue) -> Result<BlockIndex, AppError> {
        let mut block_index = marshal::unmarshal_block_value(&kv.value)?;
        block_index.block_number = marshal::unmarshal_block_key(&kv.key)?;
        Ok(block_index)
    }

    /// Resolve the scan for an address query: ascending range when either
    /// time bound is set, descending prefix scan otherwise.
    fn scan_address(
        &self,
        address: &str,
        rows: usize,
        start: usize,
        from_time: Option<u64>,
        to_time: Option<u64>,
    ) -> Result<(usize, Vec<KeyValue>), AppError> {
        let prefix = marshal::marshal_address_key_prefix(address)?;
        if from_time.is_none() && to_time.is_none() {
            return Ok(self.address_dao.find_by_prefix(&prefix, false, rows, start));
        }
        let lo = match from_time {
            Some(t) => marshal::marshal_address_key_prefix_time(address, t)?,
            None => prefix.clone(),
        };
        // +1s makes the upper bound inclusive
        let hi = match to_time {
            Some(t) => marshal::marshal_address_key_prefix_time(address, t + 1)?,
            None => prefix_upper_bound(&prefix).unwrap_or_else(|| {
                let mut bound = prefix.clone();
                bound.extend_from_slice(&[0xff; 6]);
                bound
            }),
        };
        Ok(self.address_dao.find_by_range(&lo, &hi, true, rows, start))
    }
}

impl IndexRepo for KvIndexRepo {
    fn store(
        &self,
        address_indexes: &[AddressIndex],
        block_index: &BlockIndex,
        is_batch: bool,
    ) -> Result<(), AppError> {
        if !is_batch {
            let key = marshal::marshal_block_key(&block_index.block_number);
            if let Some(old_block) = self.block_dao.find_by_key(&key)? {
                let old_index = marshal::unmarshal_block_value(&old_block.value)?;
                if !old_index.addresses.is_empty() {
                    // Reorg: the delete below and the rewrite are not atomic
                    // across the two databases; until the new block index
                    // lands the old one points at erased address entries.
                    self.handle_reorg(old_index.time, &old_index.addresses)?;
                }
            }
        }
        self.save_address_indexes(address_indexes)?;
        if !is_batch {
            self.save_block_index(block_index)?;
        }
        Ok(())
    }

    fn get_transactions_by_address(
        &self,
        address: &str,
        rows: usize,
        start: usize,
        from_time: Option<u64>,
        to_time: Option<u64>,
    ) -> Result<(usize, Vec<AddressIndex>), AppError> {
        let (total, key_values) = self.scan_address(address, rows, start, from_time, to_time)?;
        let mut indexes = Vec::with_capacity(key_values.len());
        for kv in &key_values {
            indexes.push(self.key_value_to_address_index(kv)?);
        }
        Ok((total, indexes))
    }

    fn get_total_transactions(
        &self,
        address: &str,
        from_time: Option<u64>,
        to_time: Option<u64>,
    ) -> Result<usize, AppError> {
        let (total, _) = self.scan_address(address, 0, 0, from_time, to_time)?;
        Ok(total)
    }

    fn get_blocks(
        &self,
        block_number: &str,
        rows: usize,
        start: usize,
    ) -> Result<(usize, Vec<BlockIndex>), AppError> {
        if !block_number.is_empty() {
            if block_number.bytes().any(|b| !b.is_ascii_digit()) {
                return Err(AppError::InvalidInput(format!(
                    "bad block number {block_number}"
                )));
            }
            let key = marshal::marshal_block_key(block_number);
            return match self.block_dao.find_by_key(&key)? {
                Some(kv) => Ok((1, vec![self.key_value_to_block_index(&kv)?])),
                None => Ok((0, Vec::new())),
            };
        }
        let (total, key_values) = self.block_dao.find_by_prefix(&[], false, rows, start);
        let mut blocks = Vec::with_capacity(key_values.len());
        for kv in &key_values {
            blocks.push(self.key_value_to_block_index(kv)?);
        }
        Ok((total, blocks))
    }

    fn get_last_block(&self) -> Result<BlockIndex, AppError> {
        let last = self.block_dao.last_n(1);
        match last.first() {
            Some(kv) => self.key_value_to_block_index(kv),
            None => Err(AppError::NotFound("no last block".to_string())),
        }
    }

    fn get_first_block(&self) -> Result<BlockIndex, AppError> {
        let first = self.block_dao.first_n(1);
        match first.first() {
            Some(kv) => self.key_value_to_block_index(kv),
            None => Err(AppError::NotFound("no first block".to_string())),
        }
    }

    fn delete_old_blocks(&self, until_time: u64) -> Result<usize, AppError> {
        let to_delete = self.block_dao.first_while(&|kv| {
            match marshal::unmarshal_block_value(&kv.value) {
                Ok(block_index) => block_index.created_at < until_time,
                Err(_) => false,
            }
        });
        let keys: Vec<Vec<u8>> = to_delete.into_iter().map(|kv| kv.key).collect();
        self.block_dao.batch_delete(&keys)?;
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::memory::MemoryDao;
    use num_bigint::BigInt;

    const FROM_1: &str = "0x2cb1569dbc9c9c64ac7c682acdf6515275277bd6";
    const TO_1: &str = "0xafbfefa496ae205cf4e002dee11517e6d6da3ef6";
    const FROM_2: &str = "0x3ebe227e9fd42bb97b9a950e4a731d8975263812";
    const ADDR_H: &str = "0x55a2b1c6e0b8b8805bd56ec171ad8a8fbdea3a44";
    const TX_1: &str = "0xc4690121c0a6cc6c0cb933b9551ae9926302a12a105ad8f24e50f8dadb4a6ece";
    const TX_2: &str = "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347";
    const TX_3: &str = "0x9bdbd233827534e48cc23801d145c64c4f4bab6b2c4c74a54673633e4c6c1591";
    const BLOCK_TIME: u64 = 1546848896;

    fn index(
        address: &str,
        sequence: u8,
        tx_hash: &str,
        value: i64,
        couple: &str,
    ) -> AddressIndex {
        AddressIndex {
            address: address.to_string(),
            sequence,
            tx_hash: tx_hash.to_string(),
            value: BigInt::from(value),
            time: BLOCK_TIME,
            couple_address: couple.to_string(),
            status: true,
        }
    }

    fn two_party_block() -> (Vec<AddressIndex>, BlockIndex) {
        let indexes = vec![
            index(FROM_1, 1, TX_1, -111, TO_1),
            index(TO_1, 1, TX_1, 111, FROM_1),
            index(FROM_2, 1, TX_2, -222, TO_1),
            index(TO_1, 2, TX_2, 222, FROM_2),
        ];
        let block_index = BlockIndex {
            block_number: "2018".to_string(),
            addresses: vec![
                AddressSequence { address: TO_1.to_string(), sequence: 2 },
                AddressSequence { address: FROM_1.to_string(), sequence: 1 },
                AddressSequence { address: FROM_2.to_string(), sequence: 1 },
            ],
            time: BLOCK_TIME,
            created_at: BLOCK_TIME,
        };
        (indexes, block_index)
    }

    fn repo_with_block() -> KvIndexRepo {
        let repo = KvIndexRepo::new(Arc::new(MemoryDao::new()), Arc::new(MemoryDao::new()));
        let (indexes, block_index) = two_party_block();
        repo.store(&indexes, &block_index, false).unwrap();
        repo
    }

    #[test]
    fn transfer_is_visible_from_both_sides() {
        let repo = repo_with_block();

        let (total, records) = repo
            .get_transactions_by_address(FROM_1, 10, 0, None, None)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].value, BigInt::from(-111));
        assert_eq!(records[0].couple_address, TO_1);

        let (total, records) = repo
            .get_transactions_by_address(TO_1, 10, 0, None, None)
            .unwrap();
        assert_eq!(total, 2);
        // newest first: the second touch comes back first
        assert_eq!(records[0].sequence, 2);
        assert_eq!(records[0].couple_address, FROM_2);
        assert_eq!(records[1].sequence, 1);
        assert_eq!(records[1].couple_address, FROM_1);
        assert_eq!(records[0].value, BigInt::from(222));
    }

    #[test]
    fn bad_address_is_invalid_input() {
        let repo = repo_with_block();
        let err = repo
            .get_transactions_by_address("wrong address", 10, 0, None, None)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn time_bounds_are_inclusive_and_ascending() {
        let repo = repo_with_block();
        let (total, records) = repo
            .get_transactions_by_address(
                TO_1,
                10,
                0,
                Some(BLOCK_TIME),
                Some(BLOCK_TIME),
            )
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].sequence, 2);
    }

    #[test]
    fn range_outside_block_time_is_empty() {
        let repo = repo_with_block();
        let (total, records) = repo
            .get_transactions_by_address(
                TO_1,
                10,
                0,
                Some(BLOCK_TIME + 1),
                Some(BLOCK_TIME + 100),
            )
            .unwrap();
        assert_eq!(total, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn half_open_bounds_default_to_prefix_edges() {
        let repo = repo_with_block();
        let (total, _) = repo
            .get_transactions_by_address(TO_1, 10, 0, Some(BLOCK_TIME - 100), None)
            .unwrap();
        assert_eq!(total, 2);
        let (total, _) = repo
            .get_transactions_by_address(TO_1, 10, 0, None, Some(BLOCK_TIME))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn paging_concatenation_matches_full_scan() {
        let repo = repo_with_block();
        let (_, all) = repo
            .get_transactions_by_address(TO_1, usize::MAX, 0, None, None)
            .unwrap();
        let mut paged = Vec::new();
        let mut start = 0;
        loop {
            let (_, page) = repo
                .get_transactions_by_address(TO_1, 1, start, None, None)
                .unwrap();
            if page.is_empty() {
                break;
            }
            paged.extend(page);
            start += 1;
        }
        assert_eq!(paged, all);
    }

    #[test]
    fn get_total_matches_page_total() {
        let repo = repo_with_block();
        assert_eq!(repo.get_total_transactions(TO_1, None, None).unwrap(), 2);
        assert_eq!(
            repo.get_total_transactions(TO_1, Some(BLOCK_TIME + 1), None)
                .unwrap(),
            0
        );
    }

    #[test]
    fn reorg_erases_replaced_addresses() {
        let repo = repo_with_block();

        // same block number arrives again carrying only FROM_1 -> ADDR_H
        let new_indexes = vec![
            index(FROM_1, 1, TX_3, -7, ADDR_H),
            index(ADDR_H, 1, TX_3, 7, FROM_1),
        ];
        let new_block = BlockIndex {
            block_number: "2018".to_string(),
            addresses: vec![
                AddressSequence { address: FROM_1.to_string(), sequence: 1 },
                AddressSequence { address: ADDR_H.to_string(), sequence: 1 },
            ],
            time: BLOCK_TIME,
            created_at: BLOCK_TIME + 15,
        };
        repo.store(&new_indexes, &new_block, false).unwrap();

        let (total, _) = repo
            .get_transactions_by_address(TO_1, 10, 0, None, None)
            .unwrap();
        assert_eq!(total, 0);
        let (total, records) = repo
            .get_transactions_by_address(FROM_1, 10, 0, None, None)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].couple_address, ADDR_H);
        assert_eq!(records[0].tx_hash, TX_3);
    }

    #[test]
    fn batch_store_skips_reorg_and_block_db() {
        let repo = KvIndexRepo::new(Arc::new(MemoryDao::new()), Arc::new(MemoryDao::new()));
        let (indexes, block_index) = two_party_block();
        repo.store(&indexes, &block_index, true).unwrap();
        assert!(repo.get_last_block().unwrap_err().is_not_found());

        // a second batch write of the same block must not erase anything
        repo.store(&indexes, &block_index, true).unwrap();
        let (total, _) = repo
            .get_transactions_by_address(TO_1, 10, 0, None, None)
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn get_blocks_point_lookup_and_latest() {
        let repo = repo_with_block();
        let (total, blocks) = repo.get_blocks("2018", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(blocks[0].block_number, "2018");

        let (total, blocks) = repo.get_blocks("", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(blocks[0].block_number, "2018");

        let (total, blocks) = repo.get_blocks("2019", 10, 0).unwrap();
        assert_eq!(total, 0);
        assert!(blocks.is_empty());
    }

    #[test]
    fn first_and_last_block_on_empty_db() {
        let repo = KvIndexRepo::new(Arc::new(MemoryDao::new()), Arc::new(MemoryDao::new()));
        assert!(repo.get_last_block().unwrap_err().is_not_found());
        assert!(repo.get_first_block().unwrap_err().is_not_found());
    }

    #[test]
    fn delete_old_blocks_by_created_at() {
        let repo = repo_with_block();
        let old_block = BlockIndex {
            block_number: "2017".to_string(),
            addresses: Vec::new(),
            time: BLOCK_TIME - 18_000,
            created_at: BLOCK_TIME - 18_000,
        };
        repo.save_block_index(&old_block).unwrap();
        assert_eq!(repo.get_first_block().unwrap().block_number, "2017");

        let deleted = repo.delete_old_blocks(BLOCK_TIME).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.get_first_block().unwrap().block_number, "2018");
    }
}
