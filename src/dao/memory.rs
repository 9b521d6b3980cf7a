//! BTreeMap-backed DAO used by unit and integration tests.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{paginate, prefix_upper_bound, KeyValue, KeyValueDao};
use crate::error::AppError;

#[derive(Default)]
pub struct MemoryDao {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_range(
        &self,
        lo: &[u8],
        hi: Option<&[u8]>,
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        let map = self.map.read().expect("memory dao poisoned");
        let upper = match hi {
            Some(hi) => Bound::Excluded(hi.to_vec()),
            None => Bound::Unbounded,
        };
        let range = map.range((Bound::Included(lo.to_vec()), upper));
        let to_kv = |(k, v): (&Vec<u8>, &Vec<u8>)| KeyValue::new(k.clone(), v.clone());
        if asc {
            paginate(range.map(to_kv), rows, start)
        } else {
            paginate(range.rev().map(to_kv), rows, start)
        }
    }
}

impl KeyValueDao for MemoryDao {
    fn put(&self, record: KeyValue) -> Result<(), AppError> {
        self.map
            .write()
            .expect("memory dao poisoned")
            .insert(record.key, record.value);
        Ok(())
    }

    fn batch_put(&self, records: Vec<KeyValue>) -> Result<(), AppError> {
        let mut map = self.map.write().expect("memory dao poisoned");
        for record in records {
            map.insert(record.key, record.value);
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), AppError> {
        self.map.write().expect("memory dao poisoned").remove(key);
        Ok(())
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> Result<(), AppError> {
        let mut map = self.map.write().expect("memory dao poisoned");
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn find_by_key(&self, key: &[u8]) -> Result<Option<KeyValue>, AppError> {
        let map = self.map.read().expect("memory dao poisoned");
        Ok(map
            .get(key)
            .map(|value| KeyValue::new(key.to_vec(), value.clone())))
    }

    fn find_by_prefix(
        &self,
        prefix: &[u8],
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        let hi = prefix_upper_bound(prefix);
        self.collect_range(prefix, hi.as_deref(), asc, rows, start)
    }

    fn find_by_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        asc: bool,
        rows: usize,
        start: usize,
    ) -> (usize, Vec<KeyValue>) {
        self.collect_range(lo, Some(hi), asc, rows, start)
    }

    fn first_n(&self, n: usize) -> Vec<KeyValue> {
        let map = self.map.read().expect("memory dao poisoned");
        map.iter()
            .take(n)
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }

    fn last_n(&self, n: usize) -> Vec<KeyValue> {
        let map = self.map.read().expect("memory dao poisoned");
        map.iter()
            .rev()
            .take(n)
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }

    fn first_while(&self, pred: &dyn Fn(&KeyValue) -> bool) -> Vec<KeyValue> {
        let map = self.map.read().expect("memory dao poisoned");
        let mut result = Vec::new();
        for (k, v) in map.iter() {
            let kv = KeyValue::new(k.clone(), v.clone());
            if !pred(&kv) {
                break;
            }
            result.push(kv);
        }
        result
    }

    fn all(&self) -> Vec<KeyValue> {
        let map = self.map.read().expect("memory dao poisoned");
        map.iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }
}
