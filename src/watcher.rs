//! Node liveness watcher.
//!
//! Once armed, checks on every tick how stale the newest stored block is.
//! Two delays matter: how long since any block arrived (receipt delay) and
//! how old the last block already was when it arrived (pipeline delay).
//! Crossing the out-of-sync threshold on either stops the loop and requests
//! an endpoint switch; the indexer re-arms the watcher on its next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::index_repo::IndexRepo;
use crate::node_manager::NodeManager;
use crate::timeutil::now_secs;
use crate::types::BlockIndex;

pub struct NodeStatusWatcher {
    index_repo: Arc<dyn IndexRepo>,
    node_manager: Arc<NodeManager>,
    interval: Duration,
    oos_threshold: Duration,
    is_watching: AtomicBool,
}

impl NodeStatusWatcher {
    pub fn new(
        index_repo: Arc<dyn IndexRepo>,
        node_manager: Arc<NodeManager>,
        interval: Duration,
        oos_threshold: Duration,
    ) -> Self {
        NodeStatusWatcher {
            index_repo,
            node_manager,
            interval,
            oos_threshold,
            is_watching: AtomicBool::new(false),
        }
    }

    /// Run the periodic check until an out-of-sync condition fires. Calling
    /// this while a loop is already running is a no-op.
    pub async fn watch(&self) {
        if self.is_watching.swap(true, Ordering::SeqCst) {
            tracing::info!("watcher already running");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            tracing::info!("checking upstream node status");
            if self.check_once() {
                self.is_watching.store(false, Ordering::SeqCst);
                self.node_manager.request_switch();
                return;
            }
        }
    }

    fn check_once(&self) -> bool {
        match self.index_repo.get_last_block() {
            Ok(last_block) => {
                is_out_of_sync(&last_block, now_secs(), self.oos_threshold)
            }
            Err(e) => {
                tracing::error!(error = %e, "watcher cannot read last block");
                false
            }
        }
    }
}

/// Out-of-sync test over the newest stored block.
pub fn is_out_of_sync(last_block: &BlockIndex, now: u64, threshold: Duration) -> bool {
    let receipt_delay = now.saturating_sub(last_block.created_at);
    let pipeline_delay = last_block.created_at.saturating_sub(last_block.time);
    if receipt_delay > threshold.as_secs() || pipeline_delay > threshold.as_secs() {
        tracing::info!(
            receipt_delay,
            pipeline_delay,
            threshold = threshold.as_secs(),
            "upstream node is out of sync"
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(time: u64, created_at: u64) -> BlockIndex {
        BlockIndex {
            block_number: "2018".to_string(),
            addresses: Vec::new(),
            time,
            created_at,
        }
    }

    const THRESHOLD: Duration = Duration::from_secs(600);

    #[test]
    fn fresh_block_is_in_sync() {
        let now = 1546848896;
        assert!(!is_out_of_sync(&block(now - 10, now - 5), now, THRESHOLD));
    }

    #[test]
    fn stale_receipt_triggers_switch() {
        let now = 1546848896;
        // nothing received for 11 minutes
        assert!(is_out_of_sync(&block(now - 700, now - 700), now, THRESHOLD));
    }

    #[test]
    fn lagging_pipeline_triggers_switch() {
        let now = 1546848896;
        // the last block was already 11 minutes old when it arrived
        assert!(is_out_of_sync(&block(now - 701, now - 1), now, THRESHOLD));
    }

    #[test]
    fn delay_exactly_at_threshold_is_tolerated() {
        let now = 1546848896;
        assert!(!is_out_of_sync(&block(now - 600, now - 600), now, THRESHOLD));
    }
}
