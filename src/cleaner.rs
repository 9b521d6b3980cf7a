//! Block-index TTL loop.
//!
//! The block database only exists as the reorg journal for real-time
//! blocks, so it is bounded: on every tick, blocks created more than the
//! TTL before the newest one are deleted. The address database is never
//! touched; per-address history is kept forever.

use std::sync::Arc;
use std::time::Duration;

use crate::index_repo::IndexRepo;

pub struct Cleaner {
    index_repo: Arc<dyn IndexRepo>,
    clean_interval: Duration,
    block_ttl: Duration,
}

impl Cleaner {
    pub fn new(index_repo: Arc<dyn IndexRepo>, clean_interval: Duration, block_ttl: Duration) -> Self {
        Cleaner {
            index_repo,
            clean_interval,
            block_ttl,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.clean_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            tracing::info!("cleaning block db");
            self.sweep();
        }
    }

    fn sweep(&self) {
        let last_block = match self.index_repo.get_last_block() {
            Ok(last_block) => last_block,
            Err(e) => {
                tracing::error!(error = %e, "cleaner cannot read last block");
                return;
            }
        };
        let horizon = last_block
            .created_at
            .saturating_sub(self.block_ttl.as_secs());
        match self.index_repo.delete_old_blocks(horizon) {
            Ok(total) => tracing::info!(total, until = horizon, "deleted old blocks"),
            Err(e) => tracing::error!(error = %e, "deleting old blocks failed"),
        }
    }
}
