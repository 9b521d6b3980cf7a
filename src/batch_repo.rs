//! Repository over the batch database.

use std::sync::Arc;

use num_bigint::BigUint;

use crate::dao::{KeyValue, KeyValueDao};
use crate::error::AppError;
use crate::marshal;
use crate::types::BatchStatus;

pub trait BatchRepo: Send + Sync {
    /// Decode every stored batch.
    fn get_all(&self) -> Result<Vec<BatchStatus>, AppError>;
    /// Idempotent put keyed by batch identity; rejects a batch whose
    /// identity is incomplete.
    fn update(&self, batch: &BatchStatus) -> Result<(), AppError>;
    /// Find the first batch whose `from` equals `from_block`, delete it and
    /// rewrite it with `new_to`, keeping the other identity fields. Used to
    /// raise a surviving batch's ceiling to the current chain head.
    fn replace(&self, from_block: &BigUint, new_to: &BigUint) -> Result<(), AppError>;
}

pub struct KvBatchRepo {
    batch_dao: Arc<dyn KeyValueDao>,
}

impl KvBatchRepo {
    pub fn new(batch_dao: Arc<dyn KeyValueDao>) -> Self {
        KvBatchRepo { batch_dao }
    }

    fn key_value_to_batch(&self, kv: &KeyValue) -> Result<BatchStatus, AppError> {
        let mut batch = marshal::unmarshal_batch_key(&kv.key)?;
        let (updated_at, current) = marshal::unmarshal_batch_value(&kv.value)?;
        batch.updated_at = updated_at;
        batch.current = Some(current);
        Ok(batch)
    }
}

impl BatchRepo for KvBatchRepo {
    fn get_all(&self) -> Result<Vec<BatchStatus>, AppError> {
        let mut batches = Vec::new();
        for kv in self.batch_dao.all() {
            batches.push(self.key_value_to_batch(&kv)?);
        }
        Ok(batches)
    }

    fn update(&self, batch: &BatchStatus) -> Result<(), AppError> {
        if batch.step == 0 || batch.created_at == 0 {
            return Err(AppError::InvalidInput(format!("batch is not valid: {batch}")));
        }
        let key = marshal::marshal_batch_key(&batch.from, &batch.to, batch.step, batch.created_at);
        let current = batch.current.clone().unwrap_or_default();
        let value = marshal::marshal_batch_value(batch.updated_at, &current);
        self.batch_dao.put(KeyValue::new(key, value))
    }

    fn replace(&self, from_block: &BigUint, new_to: &BigUint) -> Result<(), AppError> {
        let prefix = marshal::marshal_batch_key_from(from_block);
        let (_, key_values) = self.batch_dao.find_by_prefix(&prefix, true, 1, 0);
        let Some(kv) = key_values.first() else {
            return Ok(());
        };
        let mut batch = self.key_value_to_batch(kv)?;
        self.batch_dao.delete(&kv.key)?;
        batch.to = new_to.clone();
        self.update(&batch)
    }
}
