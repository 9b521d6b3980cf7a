use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use accindex::api::{self, ApiContext};
use accindex::batch_repo::KvBatchRepo;
use accindex::cleaner::Cleaner;
use accindex::config::{
    AppConfig, Context, DEFAULT_BLOCK_TTL_HOURS, DEFAULT_CLEAN_INTERVAL_MINUTES,
    DEFAULT_HTTP_PORT, DEFAULT_NUM_BATCH, DEFAULT_OOS_THRESHOLD_SECONDS,
    DEFAULT_WATCHER_INTERVAL_MINUTES,
};
use accindex::dao::rocks::RocksDao;
use accindex::error::AppError;
use accindex::fetcher::ChainFetcher;
use accindex::index_repo::KvIndexRepo;
use accindex::indexer::Indexer;
use accindex::telemetry;
use accindex::watcher::NodeStatusWatcher;

/// Account-transaction indexer for an Ethereum-compatible chain.
#[derive(Parser, Debug)]
#[command(name = "accindex", version)]
struct Args {
    /// Comma-separated list of upstream node endpoints
    #[arg(long)]
    ipc: String,

    /// Database path prefix; three stores are opened as
    /// <prefix>_address, <prefix>_block and <prefix>_batch
    #[arg(long)]
    db: String,

    /// Block db clean interval, in minutes
    #[arg(long, default_value_t = DEFAULT_CLEAN_INTERVAL_MINUTES)]
    clean_interval: u64,

    /// Block db record TTL, in hours
    #[arg(long, default_value_t = DEFAULT_BLOCK_TTL_HOURS)]
    block_ttl: u64,

    /// Node status watcher interval, in minutes
    #[arg(long, default_value_t = DEFAULT_WATCHER_INTERVAL_MINUTES)]
    watcher_interval: u64,

    /// Out-of-sync threshold, in seconds
    #[arg(long, default_value_t = DEFAULT_OOS_THRESHOLD_SECONDS)]
    oos_threshold: u64,

    /// HTTP port
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
    port: u16,

    /// Number of initial back-fill batches (1..=127)
    #[arg(long, default_value_t = DEFAULT_NUM_BATCH)]
    num_batch: u8,
}

#[tokio::main]
async fn main() {
    telemetry::init_tracing();
    if let Err(e) = run(Args::parse()).await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let endpoints = args
        .ipc
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let config = AppConfig {
        endpoints,
        db_path: args.db.clone(),
        clean_interval: Duration::from_secs(args.clean_interval * 60),
        block_ttl: Duration::from_secs(args.block_ttl * 3600),
        watcher_interval: Duration::from_secs(args.watcher_interval * 60),
        oos_threshold: Duration::from_secs(args.oos_threshold),
        http_port: args.port,
        num_batch: args.num_batch,
    };
    let ctx = Context::new(config)?;

    let address_dao = Arc::new(RocksDao::open(Path::new(&format!("{}_address", args.db)))?);
    let block_dao = Arc::new(RocksDao::open(Path::new(&format!("{}_block", args.db)))?);
    let batch_dao = Arc::new(RocksDao::open(Path::new(&format!("{}_batch", args.db)))?);

    let index_repo = Arc::new(KvIndexRepo::new(address_dao.clone(), block_dao.clone()));
    let batch_repo = Arc::new(KvBatchRepo::new(batch_dao.clone()));
    let fetcher_factory = ChainFetcher::factory(ctx.node_manager.clone());

    // HTTP service
    let api_ctx = ApiContext {
        index_repo: index_repo.clone(),
        batch_repo: batch_repo.clone(),
        node_manager: ctx.node_manager.clone(),
        fetcher_factory: fetcher_factory.clone(),
    };
    let http_port = ctx.config.http_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_ctx, http_port).await {
            tracing::error!(error = %e, "http server failed");
            std::process::exit(1);
        }
    });

    // maintenance loops
    let cleaner = Cleaner::new(
        index_repo.clone(),
        ctx.config.clean_interval,
        ctx.config.block_ttl,
    );
    tokio::spawn(async move { cleaner.run().await });

    // indexing pipeline
    let watcher = Arc::new(NodeStatusWatcher::new(
        index_repo.clone(),
        ctx.node_manager.clone(),
        ctx.config.watcher_interval,
        ctx.config.oos_threshold,
    ));
    let indexer = Arc::new(Indexer::new(
        index_repo,
        batch_repo,
        ctx.node_manager.clone(),
        fetcher_factory,
        watcher,
        ctx.config.num_batch,
    ));
    tokio::spawn(indexer.run());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::Storage(format!("cannot listen for interrupt: {e}")))?;
    tracing::info!("interrupt received, flushing databases");
    for dao in [&address_dao, &block_dao, &batch_dao] {
        if let Err(e) = dao.flush() {
            tracing::error!(error = %e, "flush failed");
        }
    }
    std::process::exit(1);
}
