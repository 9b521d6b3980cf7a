//! Process-wide configuration and the context threaded through
//! constructors.
//!
//! Everything is populated once at startup from CLI flags and read-only
//! afterwards; there is no ambient global state.

use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::node_manager::NodeManager;

pub const DEFAULT_CLEAN_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_BLOCK_TTL_HOURS: u64 = 4;
pub const DEFAULT_WATCHER_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_OOS_THRESHOLD_SECONDS: u64 = 600;
pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_NUM_BATCH: u8 = 8;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Upstream node endpoints, tried in order on failover.
    pub endpoints: Vec<String>,
    /// Database path prefix; the three stores live at
    /// `<prefix>_address`, `<prefix>_block` and `<prefix>_batch`.
    pub db_path: String,
    pub clean_interval: Duration,
    pub block_ttl: Duration,
    pub watcher_interval: Duration,
    pub oos_threshold: Duration,
    pub http_port: u16,
    /// Initial back-fill batch count, 1..=127.
    pub num_batch: u8,
}

/// The explicit singleton bundle built in `main` and handed to every
/// component.
pub struct Context {
    pub config: AppConfig,
    pub node_manager: Arc<NodeManager>,
}

impl Context {
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        if config.num_batch == 0 || config.num_batch > 127 {
            return Err(AppError::InvalidInput(format!(
                "batch count must be within 1..=127, got {}",
                config.num_batch
            )));
        }
        if config.db_path.is_empty() {
            return Err(AppError::InvalidInput("empty db path".to_string()));
        }
        let node_manager = Arc::new(NodeManager::new());
        node_manager.set_endpoints(config.endpoints.clone())?;
        Ok(Context {
            config,
            node_manager,
        })
    }
}
