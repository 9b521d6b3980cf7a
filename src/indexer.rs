//! Orchestrates the indexing pipeline: one real-time worker fed by a head
//! subscription plus N back-fill workers tiling the historical range, all
//! writing through the repositories.
//!
//! Lifecycle per instance: Idle -> Running -> Quiescing -> Idle. A node
//! switch closes the stop channel, waits out the quiesce interval so
//! in-flight work against the old endpoint drains, then rebuilds the
//! fetchers and workers against the new endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use tokio::sync::{mpsc, watch};

use crate::batch_repo::BatchRepo;
use crate::error::AppError;
use crate::fetcher::{Fetch, FetcherFactory};
use crate::index_repo::IndexRepo;
use crate::node_manager::{NodeManager, NodeSubscriber};
use crate::timeutil::now_secs;
use crate::types::{AddressIndex, AddressSequence, BatchStatus, BlockFact, BlockIndex, ADDRESS_ZERO};
use crate::watcher::NodeStatusWatcher;

/// How long a restart waits for workers on the old endpoint to drain.
const QUIESCE_INTERVAL: Duration = Duration::from_secs(30);
/// Batch workers poll the stop channel once per this many blocks.
const STOP_POLL_ITERATIONS: u32 = 10;
/// Capacity of the real-time block channel.
const REALTIME_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Idle,
    Running,
    Quiescing,
}

pub struct Indexer {
    index_repo: Arc<dyn IndexRepo>,
    batch_repo: Arc<dyn BatchRepo>,
    node_manager: Arc<NodeManager>,
    fetcher_factory: FetcherFactory,
    watcher: Arc<NodeStatusWatcher>,
    num_batch: u8,
    state: Mutex<IndexerState>,
    subscribed: AtomicBool,
    realtime_fetcher: Mutex<Option<Arc<dyn Fetch>>>,
}

/// Forwards switch notifications into the orchestration loop without
/// holding the indexer alive from inside the node manager.
struct SwitchSignal {
    sender: mpsc::UnboundedSender<String>,
}

impl NodeSubscriber for SwitchSignal {
    fn on_switch(&self, new_endpoint: &str) {
        let _ = self.sender.send(new_endpoint.to_string());
    }

    fn name(&self) -> &str {
        "indexer"
    }
}

impl Indexer {
    pub fn new(
        index_repo: Arc<dyn IndexRepo>,
        batch_repo: Arc<dyn BatchRepo>,
        node_manager: Arc<NodeManager>,
        fetcher_factory: FetcherFactory,
        watcher: Arc<NodeStatusWatcher>,
        num_batch: u8,
    ) -> Self {
        Indexer {
            index_repo,
            batch_repo,
            node_manager,
            fetcher_factory,
            watcher,
            num_batch,
            state: Mutex::new(IndexerState::Idle),
            subscribed: AtomicBool::new(false),
            realtime_fetcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock().expect("indexer poisoned")
    }

    fn set_state(&self, state: IndexerState) {
        *self.state.lock().expect("indexer poisoned") = state;
    }

    /// Entry point: runs until the process exits, restarting the worker set
    /// after every endpoint switch.
    pub async fn run(self: Arc<Self>) {
        let (switch_tx, mut switch_rx) = mpsc::unbounded_channel();
        let subscriber: Arc<dyn NodeSubscriber> = Arc::new(SwitchSignal { sender: switch_tx });
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            self.node_manager.subscribe(&subscriber);
        }

        let mut stop_tx = self.start_cycle().await;
        while let Some(endpoint) = switch_rx.recv().await {
            tracing::info!(endpoint = %endpoint, "endpoint switched, quiescing workers");
            self.set_state(IndexerState::Quiescing);
            let _ = stop_tx.send(true);
            if let Some(fetcher) = self
                .realtime_fetcher
                .lock()
                .expect("indexer poisoned")
                .take()
            {
                fetcher.close();
            }
            tokio::time::sleep(QUIESCE_INTERVAL).await;
            self.set_state(IndexerState::Idle);
            // drain switches that queued up while quiescing
            while switch_rx.try_recv().is_ok() {}
            stop_tx = self.start_cycle().await;
        }
    }

    /// Build fetchers and launch the worker set against the current
    /// endpoint. Returns the stop channel for this cycle.
    async fn start_cycle(self: &Arc<Self>) -> watch::Sender<bool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.set_state(IndexerState::Running);
        self.node_manager.enable_switch();

        let endpoint = self.node_manager.current();
        let fetcher = (self.fetcher_factory)(endpoint.clone());
        let latest = match fetcher.latest_block().await {
            Ok(latest) => latest,
            Err(e) => {
                // the fetcher already scheduled failover; stay idle until
                // the switch notification restarts us
                tracing::warn!(endpoint = %endpoint, error = %e, "cannot reach upstream node");
                self.set_state(IndexerState::Idle);
                return stop_tx;
            }
        };
        tracing::info!(endpoint = %endpoint, latest = %latest, "starting indexing cycle");

        // back-fill workers
        let batches = self.batch_plan(&latest);
        let mut batch_handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let worker_fetcher = (self.fetcher_factory)(endpoint.clone());
            batch_handles.push(tokio::spawn(batch_worker(
                self.index_repo.clone(),
                self.batch_repo.clone(),
                worker_fetcher,
                batch,
                stop_rx.clone(),
            )));
        }

        // real-time worker
        let (block_tx, block_rx) = mpsc::channel(REALTIME_CHANNEL_SIZE);
        fetcher.clone().subscribe_new_heads(block_tx);
        *self
            .realtime_fetcher
            .lock()
            .expect("indexer poisoned") = Some(fetcher);
        tokio::spawn(realtime_worker(self.index_repo.clone(), block_rx));

        // the watcher arms once the whole back-fill is done
        let watcher = self.watcher.clone();
        tokio::spawn(async move {
            for handle in batch_handles {
                let _ = handle.await;
            }
            tracing::info!("back-fill finished, arming node status watcher");
            watcher.watch().await;
        });

        stop_tx
    }

    /// Work out which batches this cycle runs.
    fn batch_plan(&self, latest: &BigUint) -> Vec<BatchStatus> {
        let stored = match self.batch_repo.get_all() {
            Ok(stored) => stored,
            Err(e) => panic!("cannot load batch statuses: {e}"),
        };
        if stored.is_empty() {
            return initial_batches(self.num_batch, &BigUint::zero(), latest);
        }

        let mut batches: Vec<BatchStatus> =
            stored.into_iter().filter(|b| !b.is_done()).collect();

        // tie the surviving plan to the real-time tail
        let Ok(last_block) = self.index_repo.get_last_block() else {
            return batches;
        };
        let Ok(tail) = last_block.block_number.parse::<BigUint>() else {
            return batches;
        };
        let mut found = false;
        for batch in &mut batches {
            if batch.from == tail {
                found = true;
                if let Err(e) = self.batch_repo.replace(&batch.from, latest) {
                    tracing::warn!(error = %e, "cannot raise batch ceiling");
                }
                batch.to = latest.clone();
            }
        }
        if !found {
            let created_at = now_secs();
            batches.push(BatchStatus {
                from: tail,
                to: latest.clone(),
                step: 1,
                created_at,
                current: None,
                updated_at: created_at,
            });
        }
        batches
    }
}

/// The initial plan: `n` batches tiling `[genesis, latest]` with stride `n`,
/// batch `i` starting at `genesis + i`.
pub fn initial_batches(n: u8, genesis: &BigUint, latest: &BigUint) -> Vec<BatchStatus> {
    let created_at = now_secs();
    (0..n)
        .map(|i| BatchStatus {
            from: genesis + i,
            to: latest.clone(),
            step: n,
            created_at,
            current: None,
            updated_at: created_at,
        })
        .collect()
}

async fn batch_worker(
    index_repo: Arc<dyn IndexRepo>,
    batch_repo: Arc<dyn BatchRepo>,
    fetcher: Arc<dyn Fetch>,
    mut batch: BatchStatus,
    stop_rx: watch::Receiver<bool>,
) {
    tracing::info!(batch = %batch, "batch worker starting");
    let mut iterations = 0u32;
    while !batch.is_done() {
        let block_number = batch.next();
        let fact = match fetcher.fetch_block(&block_number).await {
            Ok(fact) => fact,
            Err(e) => {
                tracing::warn!(block = %block_number, error = %e, "batch fetch failed, stopping worker");
                break;
            }
        };
        store_or_die(&index_repo, &fact, true);
        batch.updated_at = now_secs();
        if let Err(e) = batch_repo.update(&batch) {
            tracing::warn!(error = %e, "cannot persist batch progress");
        }
        iterations += 1;
        if iterations % STOP_POLL_ITERATIONS == 0 && *stop_rx.borrow() {
            tracing::info!(batch = %batch, "batch worker stopping on request");
            return;
        }
    }
    tracing::info!(from = %batch.from, "batch worker finished");
}

async fn realtime_worker(index_repo: Arc<dyn IndexRepo>, mut blocks: mpsc::Receiver<BlockFact>) {
    while let Some(fact) = blocks.recv().await {
        tracing::info!(block = %fact.block_number, transactions = fact.transactions.len(), "received real-time block");
        store_or_die(&index_repo, &fact, false);
    }
    tracing::info!("real-time channel closed, worker exiting");
}

fn store_or_die(index_repo: &Arc<dyn IndexRepo>, fact: &BlockFact, is_batch: bool) {
    let (address_indexes, block_index) = to_index_data(fact);
    if let Err(e) = index_repo.store(&address_indexes, &block_index, is_batch) {
        if let AppError::InvalidInput(reason) = &e {
            // an upstream block carrying unparsable addresses is data we
            // cannot index, not a storage bug
            tracing::error!(block = %fact.block_number, reason = %reason, "skipping unindexable block");
            return;
        }
        panic!(
            "storage failure while indexing block {}: {e}",
            fact.block_number
        );
    }
}

/// Turn one block into its address records and block index.
///
/// Walks transactions in upstream order keeping one sequence counter per
/// address; the sender side is written with the negated value, the receiver
/// side with the positive value, and an originally-empty side is rewritten
/// to the zero address in the counterparty field. The source fact is never
/// mutated; the negated value is a copy.
pub fn to_index_data(fact: &BlockFact) -> (Vec<AddressIndex>, BlockIndex) {
    let mut records = Vec::with_capacity(2 * fact.transactions.len());
    let mut sequences: HashMap<String, u8> = HashMap::new();
    let mut touch_order: Vec<String> = Vec::new();

    fn bump(
        sequences: &mut HashMap<String, u8>,
        touch_order: &mut Vec<String>,
        address: &str,
    ) -> u8 {
        let sequence = sequences.entry(address.to_string()).or_insert_with(|| {
            touch_order.push(address.to_string());
            0
        });
        *sequence += 1;
        *sequence
    }

    for tx in &fact.transactions {
        let from_empty = tx.from.is_empty();
        let to_empty = tx.to.is_empty();
        let from = if from_empty { ADDRESS_ZERO.to_string() } else { tx.from.clone() };
        let to = if to_empty { ADDRESS_ZERO.to_string() } else { tx.to.clone() };
        let magnitude = BigInt::from(tx.value.magnitude().clone());

        if !from_empty {
            records.push(AddressIndex {
                address: from.clone(),
                sequence: bump(&mut sequences, &mut touch_order, &from),
                tx_hash: tx.tx_hash.clone(),
                value: -magnitude.clone(),
                time: fact.block_time,
                couple_address: to.clone(),
                status: tx.status,
            });
        }
        if !to_empty {
            records.push(AddressIndex {
                address: to.clone(),
                sequence: bump(&mut sequences, &mut touch_order, &to),
                tx_hash: tx.tx_hash.clone(),
                value: magnitude,
                time: fact.block_time,
                couple_address: from,
                status: tx.status,
            });
        }
    }

    let addresses = touch_order
        .into_iter()
        .map(|address| {
            let sequence = sequences[&address];
            AddressSequence { address, sequence }
        })
        .collect();

    let block_index = BlockIndex {
        block_number: fact.block_number.to_string(),
        addresses,
        time: fact.block_time,
        created_at: now_secs(),
    };
    (records, block_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_repo::KvBatchRepo;
    use crate::dao::memory::MemoryDao;
    use crate::index_repo::KvIndexRepo;
    use crate::types::TransactionFact;
    use std::collections::HashSet;

    const ADDR_A: &str = "0x2cb1569dbc9c9c64ac7c682acdf6515275277bd6";
    const ADDR_B: &str = "0xafbfefa496ae205cf4e002dee11517e6d6da3ef6";
    const ADDR_C: &str = "0x3ebe227e9fd42bb97b9a950e4a731d8975263812";
    const ADDR_E: &str = "0x55a2b1c6e0b8b8805bd56ec171ad8a8fbdea3a44";
    const TX_1: &str = "0xc4690121c0a6cc6c0cb933b9551ae9926302a12a105ad8f24e50f8dadb4a6ece";
    const TX_2: &str = "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347";
    const BLOCK_TIME: u64 = 1546848896;

    fn transfer(from: &str, to: &str, hash: &str, value: i64, status: bool) -> TransactionFact {
        TransactionFact {
            from: from.to_string(),
            to: to.to_string(),
            tx_hash: hash.to_string(),
            value: BigInt::from(value),
            status,
        }
    }

    fn block(transactions: Vec<TransactionFact>) -> BlockFact {
        BlockFact {
            block_number: BigUint::from(2018u32),
            block_time: BLOCK_TIME,
            transactions,
        }
    }

    #[test]
    fn two_party_transfer_emits_mirrored_records() {
        let fact = block(vec![
            transfer(ADDR_A, ADDR_B, TX_1, 111, true),
            transfer(ADDR_C, ADDR_B, TX_2, 222, true),
        ]);
        let (records, block_index) = to_index_data(&fact);

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].address, ADDR_A);
        assert_eq!(records[0].value, BigInt::from(-111));
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].couple_address, ADDR_B);
        assert_eq!(records[1].address, ADDR_B);
        assert_eq!(records[1].value, BigInt::from(111));
        assert_eq!(records[1].sequence, 1);
        // B touched a second time by the second transaction
        assert_eq!(records[3].address, ADDR_B);
        assert_eq!(records[3].sequence, 2);
        assert_eq!(records[3].couple_address, ADDR_C);

        assert_eq!(block_index.block_number, "2018");
        assert_eq!(block_index.time, BLOCK_TIME);
        let by_address: HashMap<_, _> = block_index
            .addresses
            .iter()
            .map(|a| (a.address.as_str(), a.sequence))
            .collect();
        assert_eq!(by_address[ADDR_A], 1);
        assert_eq!(by_address[ADDR_B], 2);
        assert_eq!(by_address[ADDR_C], 1);
    }

    #[test]
    fn paired_record_values_sum_to_zero() {
        let fact = block(vec![transfer(ADDR_A, ADDR_B, TX_1, 111, true)]);
        let (records, _) = to_index_data(&fact);
        assert_eq!(records.len(), 2);
        let sum: BigInt = records.iter().map(|r| r.value.clone()).sum();
        assert_eq!(sum, BigInt::from(0));
        // the source fact is untouched
        assert_eq!(fact.transactions[0].value, BigInt::from(111));
    }

    #[test]
    fn contract_creation_indexes_creator_and_created() {
        let fact = block(vec![
            transfer(ADDR_A, "", TX_1, 0, true),
            TransactionFact {
                from: String::new(),
                to: ADDR_E.to_string(),
                tx_hash: TX_1.to_string(),
                value: BigInt::from(0),
                status: true,
            },
        ]);
        let (records, block_index) = to_index_data(&fact);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, ADDR_A);
        assert_eq!(records[0].couple_address, ADDRESS_ZERO);
        assert_eq!(records[0].value, BigInt::from(0));
        assert_eq!(records[1].address, ADDR_E);
        assert_eq!(records[1].couple_address, ADDRESS_ZERO);
        // the zero address itself earned no record
        assert_eq!(block_index.addresses.len(), 2);
    }

    #[test]
    fn failed_transactions_are_still_indexed() {
        let fact = block(vec![transfer(ADDR_A, ADDR_B, TX_1, 5, false)]);
        let (records, _) = to_index_data(&fact);
        assert_eq!(records.len(), 2);
        assert!(!records[0].status);
        assert!(!records[1].status);
    }

    #[test]
    fn initial_batches_tile_the_whole_range() {
        let batches = initial_batches(3, &BigUint::zero(), &BigUint::from(10u32));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].from, BigUint::from(0u32));
        assert_eq!(batches[1].from, BigUint::from(1u32));
        assert_eq!(batches[2].from, BigUint::from(2u32));
        assert!(batches.iter().all(|b| b.step == 3));

        // walking every batch to completion visits each block exactly once
        let mut visited = HashSet::new();
        for mut batch in batches {
            while !batch.is_done() {
                assert!(visited.insert(batch.next()));
            }
        }
        let expected: HashSet<BigUint> = (0u32..=10).map(BigUint::from).collect();
        assert_eq!(visited, expected);
    }

    fn plan_fixture() -> (Indexer, Arc<KvBatchRepo>, Arc<KvIndexRepo>) {
        let index_repo = Arc::new(KvIndexRepo::new(
            Arc::new(MemoryDao::new()),
            Arc::new(MemoryDao::new()),
        ));
        let batch_repo = Arc::new(KvBatchRepo::new(Arc::new(MemoryDao::new())));
        let node_manager = Arc::new(NodeManager::new());
        node_manager
            .set_endpoints(vec!["http://localhost:8545".to_string()])
            .unwrap();
        let watcher = Arc::new(NodeStatusWatcher::new(
            index_repo.clone(),
            node_manager.clone(),
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));
        let factory: FetcherFactory = Arc::new(|_| unreachable!("plan tests fetch nothing"));
        let indexer = Indexer::new(
            index_repo.clone(),
            batch_repo.clone(),
            node_manager,
            factory,
            watcher,
            3,
        );
        (indexer, batch_repo, index_repo)
    }

    #[test]
    fn empty_batch_db_gets_the_initial_plan() {
        let (indexer, _, _) = plan_fixture();
        let batches = indexer.batch_plan(&BigUint::from(100u32));
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.to == BigUint::from(100u32)));
    }

    #[test]
    fn stored_plan_is_tied_to_the_realtime_tail() {
        let (indexer, batch_repo, index_repo) = plan_fixture();
        let stored = BatchStatus {
            from: BigUint::from(0u32),
            to: BigUint::from(700u32),
            step: 2,
            created_at: now_secs() - 1000,
            current: Some(BigUint::from(200u32)),
            updated_at: now_secs(),
        };
        batch_repo.update(&stored).unwrap();
        batch_repo
            .update(&BatchStatus {
                from: BigUint::from(1u32),
                current: Some(BigUint::from(231u32)),
                ..stored.clone()
            })
            .unwrap();

        // last real-time block is 800, nothing in the plan starts there
        index_repo
            .store(
                &[],
                &BlockIndex {
                    block_number: "800".to_string(),
                    addresses: Vec::new(),
                    time: now_secs(),
                    created_at: now_secs(),
                },
                false,
            )
            .unwrap();

        let batches = indexer.batch_plan(&BigUint::from(900u32));
        assert_eq!(batches.len(), 3);
        let tail_batch = &batches[2];
        assert_eq!(tail_batch.from, BigUint::from(800u32));
        assert_eq!(tail_batch.to, BigUint::from(900u32));
        assert_eq!(tail_batch.step, 1);

        // persist the tail batch part-way, then replan against a new head:
        // the stored batch is reused with a raised ceiling
        let mut tail_batch = tail_batch.clone();
        tail_batch.current = Some(BigUint::from(850u32));
        tail_batch.updated_at = now_secs();
        batch_repo.update(&tail_batch).unwrap();

        let batches = indexer.batch_plan(&BigUint::from(1000u32));
        assert_eq!(batches.len(), 3);
        let reused = batches
            .iter()
            .find(|b| b.from == BigUint::from(800u32))
            .unwrap();
        assert_eq!(reused.to, BigUint::from(1000u32));
        assert_eq!(reused.current, Some(BigUint::from(850u32)));

        // the raise is persisted too
        let stored_tail = batch_repo
            .get_all()
            .unwrap()
            .into_iter()
            .find(|b| b.from == BigUint::from(800u32))
            .unwrap();
        assert_eq!(stored_tail.to, BigUint::from(1000u32));
    }

    #[test]
    fn done_batches_are_dropped_from_the_plan() {
        let (indexer, batch_repo, _) = plan_fixture();
        batch_repo
            .update(&BatchStatus {
                from: BigUint::from(0u32),
                to: BigUint::from(10u32),
                step: 2,
                created_at: now_secs(),
                current: Some(BigUint::from(10u32)),
                updated_at: now_secs(),
            })
            .unwrap();
        let batches = indexer.batch_plan(&BigUint::from(20u32));
        assert!(batches.is_empty());
    }
}
