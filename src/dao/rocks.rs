//! RocksDB-backed DAO.
//!
//! Each of the three databases (address, block, batch) is its own RocksDB
//! directory opened once at process start and shared by every worker;
//! RocksDB provides the internal concurrency.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use super::{paginate, prefix_upper_bound, KeyValue, KeyValueDao};
use crate::error::AppError;

pub struct RocksDao {
    db: Arc<DB>,
}

impl RocksDao {
    pub fn new(db: Arc<DB>) -> Self {
        RocksDao { db }
    }

    /// Open (creating if missing) a single-column-family database at `path`.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)
            .map_err(|e| AppError::Storage(format!("cannot open {}: {e}", path.display())))?;
        Ok(RocksDao { db: Arc::new(db) })
    }

    /// Flush memtables to disk; used on shutdown.
    pub fn flush(&self) -> Result<(), AppError> {
        self.db.flush()?;
        Ok(())
    }

    fn iterate(
        &self,
        mode: IteratorMode,
    ) -> impl Iterator<Item = KeyValue> + '_ {
        self.db.iterator(mode).map_while(|item| match item {
            Ok((key, value)) => Some(KeyValue::new(key.into_vec(), value.into_vec())),
            Err(e) => {
                tracing::error!(error = %e, "rocksdb iterator error, truncating scan");
                None
            }
        })
    }

    fn scan(
        &self,
        lo: &[u8],
        hi: Option<&[u8]>,
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        if asc {
            let hi = hi.map(|h| h.to_vec());
            let records = self
                .iterate(IteratorMode::From(lo, Direction::Forward))
                .take_while(move |kv| match &hi {
                    Some(hi) => kv.key.as_slice() < hi.as_slice(),
                    None => true,
                });
            paginate(records, rows, start)
        } else {
            // Position on the last key <= hi; the bound itself is exclusive
            // so an exact hit gets skipped.
            let mode = match hi {
                Some(hi) => IteratorMode::From(hi, Direction::Reverse),
                None => IteratorMode::End,
            };
            let hi = hi.map(|h| h.to_vec());
            let lo = lo.to_vec();
            let records = self
                .iterate(mode)
                .skip_while(move |kv| match &hi {
                    Some(hi) => kv.key.as_slice() >= hi.as_slice(),
                    None => false,
                })
                .take_while(move |kv| kv.key.as_slice() >= lo.as_slice());
            paginate(records, rows, start)
        }
    }
}

impl KeyValueDao for RocksDao {
    fn put(&self, record: KeyValue) -> Result<(), AppError> {
        self.db.put(record.key, record.value)?;
        Ok(())
    }

    fn batch_put(&self, records: Vec<KeyValue>) -> Result<(), AppError> {
        let mut batch = WriteBatch::default();
        for record in records {
            batch.put(record.key, record.value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), AppError> {
        self.db.delete(key)?;
        Ok(())
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> Result<(), AppError> {
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn find_by_key(&self, key: &[u8]) -> Result<Option<KeyValue>, AppError> {
        let value = self.db.get(key)?;
        Ok(value.map(|v| KeyValue::new(key.to_vec(), v)))
    }

    fn find_by_prefix(
        &self,
        prefix: &[u8],
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        let hi = prefix_upper_bound(prefix);
        self.scan(prefix, hi.as_deref(), asc, rows, start)
    }

    fn find_by_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        self.scan(lo, Some(hi), asc, rows, start)
    }

    fn first_n(&self, n: usize) -> Vec<KeyValue> {
        self.iterate(IteratorMode::Start).take(n).collect()
    }

    fn last_n(&self, n: usize) -> Vec<KeyValue> {
        self.iterate(IteratorMode::End).take(n).collect()
    }

    fn first_while(&self, pred: &dyn Fn(&KeyValue) -> bool) -> Vec<KeyValue> {
        self.iterate(IteratorMode::Start)
            .take_while(|kv| pred(kv))
            .collect()
    }

    fn all(&self) -> Vec<KeyValue> {
        self.iterate(IteratorMode::Start).collect()
    }
}
