//! HTTP service over the read side of the repositories.
//!
//! Public API: account transaction lookup and transaction extras. Admin
//! API: batch status, block queries, and re-indexing a single block.

pub mod types;

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use num_bigint::BigUint;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::batch_repo::BatchRepo;
use crate::error::AppError;
use crate::fetcher::FetcherFactory;
use crate::index_repo::IndexRepo;
use crate::indexer::to_index_data;
use crate::node_manager::NodeManager;
use crate::timeutil::parse_time_str;
use self::types::{
    ApiBatchStatus, ApiBlock, ApiError, ApiTransaction, ApiTransactionExtras, Blocks,
    Processed, Total, TransactionsByAccount,
};

const DEFAULT_ROWS: usize = 10;

#[derive(Clone)]
pub struct ApiContext {
    pub index_repo: Arc<dyn IndexRepo>,
    pub batch_repo: Arc<dyn BatchRepo>,
    pub node_manager: Arc<NodeManager>,
    pub fetcher_factory: FetcherFactory,
}

#[derive(Debug, Deserialize)]
pub struct PagingParams {
    rows: Option<usize>,
    start: Option<usize>,
    #[serde(rename = "fromTime")]
    from_time: Option<String>,
    #[serde(rename = "toTime")]
    to_time: Option<String>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn error_response(e: AppError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Upstream(_) | AppError::Inconsistent(_) => StatusCode::BAD_GATEWAY,
        AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError { error: e.to_string() }))
}

fn parse_optional_time(value: &Option<String>) -> Result<Option<u64>, AppError> {
    match value {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse_time_str(s).map(Some),
    }
}

/// GET /api/account/{address}?rows&start&fromTime&toTime
async fn get_transactions_by_account(
    Path(address): Path<String>,
    Query(params): Query<PagingParams>,
    Extension(ctx): Extension<ApiContext>,
) -> ApiResult<TransactionsByAccount> {
    let rows = params.rows.unwrap_or(DEFAULT_ROWS);
    let start = params.start.unwrap_or(0);
    let from_time = parse_optional_time(&params.from_time).map_err(error_response)?;
    let to_time = parse_optional_time(&params.to_time).map_err(error_response)?;

    let (total, indexes) = ctx
        .index_repo
        .get_transactions_by_address(&address, rows, start, from_time, to_time)
        .map_err(error_response)?;
    Ok(Json(TransactionsByAccount {
        num_found: Total::new(total),
        start,
        data: indexes.into_iter().map(ApiTransaction::from).collect(),
    }))
}

/// GET /api/transaction/{tx_hash}
async fn get_transaction_extras(
    Path(tx_hash): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> ApiResult<ApiTransactionExtras> {
    let fetcher = (ctx.fetcher_factory)(ctx.node_manager.current());
    let extras = fetcher
        .transaction_extras(&tx_hash)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiTransactionExtras::from(extras)))
}

/// GET /admin/batch/status
async fn get_batch_status(
    Extension(ctx): Extension<ApiContext>,
) -> ApiResult<Vec<ApiBatchStatus>> {
    let batches = ctx.batch_repo.get_all().map_err(error_response)?;
    Ok(Json(batches.into_iter().map(ApiBatchStatus::from).collect()))
}

/// GET /admin/block and /admin/block/{block_number}
async fn get_blocks(
    block_number: Option<Path<String>>,
    Query(params): Query<PagingParams>,
    Extension(ctx): Extension<ApiContext>,
) -> ApiResult<Blocks> {
    let rows = params.rows.unwrap_or(DEFAULT_ROWS);
    let start = params.start.unwrap_or(0);
    let block_number = block_number.map(|Path(n)| n).unwrap_or_default();
    let (total, blocks) = ctx
        .index_repo
        .get_blocks(&block_number, rows, start)
        .map_err(error_response)?;
    Ok(Json(Blocks {
        num_found: Total::new(total),
        start,
        data: blocks.into_iter().map(ApiBlock::from).collect(),
    }))
}

/// POST /admin/block/{block_number}: unconditional re-fetch and store of a
/// single block, written the batch way.
async fn fetch_and_process(
    Path(block_number): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> ApiResult<Processed> {
    let number = block_number.parse::<BigUint>().map_err(|_| {
        error_response(AppError::InvalidInput(format!(
            "bad block number {block_number}"
        )))
    })?;
    let fetcher = (ctx.fetcher_factory)(ctx.node_manager.current());
    let fact = fetcher.fetch_block(&number).await.map_err(error_response)?;
    let (address_indexes, block_index) = to_index_data(&fact);
    ctx.index_repo
        .store(&address_indexes, &block_index, true)
        .map_err(error_response)?;
    Ok(Json(Processed {
        block_number,
        transactions: fact.transactions.len(),
    }))
}

pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/account/{address}", get(get_transactions_by_account))
        .route("/api/transaction/{tx_hash}", get(get_transaction_extras))
        .route("/admin/batch/status", get(get_batch_status))
        .route("/admin/block", get(get_blocks))
        .route("/admin/block/{block_number}", get(get_blocks))
        .route("/admin/block/{block_number}", post(fetch_and_process))
        .layer(cors)
        .layer(Extension(ctx))
}

/// Bind and serve until the process exits.
pub async fn serve(ctx: ApiContext, port: u16) -> Result<(), AppError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::InvalidInput(format!("cannot bind {addr}: {e}")))?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(ctx))
        .await
        .map_err(|e| AppError::Storage(format!("http server failed: {e}")))
}
