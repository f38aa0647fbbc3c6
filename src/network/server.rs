//! Node actor owning the chain and the mempool.
//!
//! Every mutation goes through one task: peer blocks, peer transactions and
//! local production requests arrive as commands on a channel and are handled
//! in order. Readers never wait on that task; they clone the latest
//! [`ChainSnapshot`], swapped in under a short lock after each tip change.
//!
//! Sealing runs on the blocking pool so a long proof-of-work search does not
//! stall the loop. The search is cancelled as soon as a competing block for
//! the same or a later height becomes the tip.

use crate::consensus::ConsensusError;
use crate::consensus::validator::DoubleSignEvidence;
use crate::core::block::Block;
use crate::core::blockchain::{Blockchain, Candidate, ChainError, ChainSnapshot, ChainUpdate};
use crate::core::params::ChainParams;
use crate::core::transaction::{Transaction, TransactionType, TxError};
use crate::crypto::key_pair::PrivateKey;
use crate::network::message::{Message, MessageType, Misbehavior, NodeEvent};
use crate::storage::kv::KeyValueStore;
use crate::storage::mempool::{Mempool, MempoolError};
use crate::types::address::Address;
use crate::types::encoding::{Decode, DecodeError, Encode};
use crate::types::hash::Hash;
use crate::virtual_machine::gas::intrinsic_gas;
use crate::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at};

/// Configuration options for a node.
pub struct NodeConfig {
    pub params: ChainParams,
    pub store: Arc<dyn KeyValueStore>,
    /// If set, this node produces blocks and files slashing evidence.
    pub producer: Option<PrivateKey>,
    /// Produce a block on this interval; `None` produces only on request.
    pub block_time: Option<Duration>,
    /// Events buffered per subscriber before slow subscribers start lagging.
    pub event_capacity: usize,
}

impl NodeConfig {
    pub fn new(params: ChainParams, store: Arc<dyn KeyValueStore>) -> Self {
        NodeConfig {
            params,
            store,
            producer: None,
            block_time: None,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),
    #[error("node has no producer key")]
    NotProducer,
    #[error("a block is already being produced")]
    Busy,
    #[error("block production superseded by a competing block")]
    Superseded,
    #[error("sealing failed: {0}")]
    Seal(ConsensusError),
    #[error("node has stopped")]
    Stopped,
}

enum Command {
    Block {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<ChainUpdate, ChainError>>,
    },
    Transaction {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Hash, MempoolError>>,
    },
    Message {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Produce {
        reply: oneshot::Sender<Result<ChainUpdate, NodeError>>,
    },
    Shutdown,
}

/// A block being sealed on the blocking pool.
struct MiningJob {
    id: u64,
    height: u64,
    cancel: Arc<AtomicBool>,
    reply: Option<oneshot::Sender<Result<ChainUpdate, NodeError>>>,
}

struct Sealed {
    id: u64,
    result: Result<Block, ConsensusError>,
}

/// Single writer over a [`Blockchain`] and its [`Mempool`].
pub struct Node {
    chain: Blockchain,
    mempool: Mempool,
    producer: Option<PrivateKey>,
    block_time: Option<Duration>,
    events: broadcast::Sender<NodeEvent>,
    snapshot: Arc<RwLock<ChainSnapshot>>,
    mining: Option<MiningJob>,
    next_job: u64,
}

impl Node {
    /// Creates a node on a fresh chain holding only the genesis block.
    pub fn new(config: NodeConfig) -> Result<Node, NodeError> {
        let mempool = Mempool::new(config.params.clone());
        let chain = Blockchain::with_genesis(config.params, config.store)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let snapshot = Arc::new(RwLock::new(chain.snapshot()));
        info!(
            "node started on genesis {} with {} consensus",
            chain.tip_hash().unwrap_or_else(Hash::zero),
            chain.consensus().name()
        );
        Ok(Node {
            chain,
            mempool,
            producer: config.producer,
            block_time: config.block_time,
            events,
            snapshot,
            mining: None,
            next_job: 0,
        })
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Decodes and appends a block received from a peer.
    pub fn receive_block(&mut self, bytes: &[u8]) -> Result<ChainUpdate, ChainError> {
        let block = Block::from_bytes(bytes)?;
        self.apply_block(block)
    }

    /// Decodes and pools a transaction received from a peer or a client.
    pub fn receive_transaction(&mut self, bytes: &[u8]) -> Result<Hash, MempoolError> {
        let tx = Transaction::from_bytes(bytes)?;
        self.submit_transaction(tx)
    }

    /// Dispatches a gossip envelope by its type tag.
    pub fn receive_message(&mut self, bytes: &[u8]) -> Result<(), NodeError> {
        let message = Message::from_bytes(bytes)?;
        match message.header {
            MessageType::Block => {
                self.receive_block(&message.data)?;
            }
            MessageType::Transaction => {
                self.receive_transaction(&message.data)?;
            }
        }
        Ok(())
    }

    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Hash, MempoolError> {
        let state = self.chain.state();
        let hash = self.mempool.submit(tx.clone(), &state)?;
        debug!("pooled transaction {hash} ({} pending)", self.mempool.len());
        self.emit(NodeEvent::TransactionAccepted(tx));
        Ok(hash)
    }

    /// Builds, seals and appends a block on the current tip, inline.
    pub fn produce_block(&mut self) -> Result<ChainUpdate, NodeError> {
        let (candidate, key) = self.prepare_block()?;
        let mut block = candidate.block;
        self.chain
            .consensus()
            .seal(
                &mut block.header,
                &key,
                self.chain.params().chain_id,
                &AtomicBool::new(false),
            )
            .map_err(NodeError::Seal)?;
        Ok(self.apply_block(block)?)
    }

    /// Moves the node into its own task and returns a handle to it.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel::<Command>(1024);
        let handle = NodeHandle {
            commands,
            events: self.events.clone(),
            snapshot: self.snapshot.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (sealed_tx, mut sealed_rx) = mpsc::channel::<Sealed>(4);
        let mut ticker = self
            .block_time
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command, &sealed_tx),
                },
                Some(sealed) = sealed_rx.recv() => {
                    self.finish_production(sealed);
                }
                _ = tick(&mut ticker) => {
                    if self.producer.is_some() && self.mining.is_none() {
                        self.start_production(None, &sealed_tx);
                    }
                }
            }
        }

        if let Some(job) = self.mining.take() {
            job.cancel.store(true, Ordering::Relaxed);
        }
        info!("node shut down at height {}", self.chain.height());
    }

    fn handle(&mut self, command: Command, sealed_tx: &mpsc::Sender<Sealed>) {
        match command {
            Command::Block { bytes, reply } => {
                let _ = reply.send(self.receive_block(&bytes));
            }
            Command::Transaction { bytes, reply } => {
                let _ = reply.send(self.receive_transaction(&bytes));
            }
            Command::Message { bytes, reply } => {
                let _ = reply.send(self.receive_message(&bytes));
            }
            Command::Produce { reply } => self.start_production(Some(reply), sealed_tx),
            Command::Shutdown => {}
        }
    }

    /// Candidate on the current tip from the best pooled transactions.
    ///
    /// Transactions the candidate had to leave out for reasons other than
    /// space or nonce order are dropped from the pool.
    fn prepare_block(&mut self) -> Result<(Candidate, PrivateKey), NodeError> {
        let key = self.producer.clone().ok_or(NodeError::NotProducer)?;
        let parent = self.chain.tip_hash().ok_or(ChainError::NoGenesis)?;
        let gas = &self.chain.params().gas;
        let txs = self
            .mempool
            .select_for_block(gas.max_block_txs, gas.max_block_gas);
        let candidate = self.chain.build_candidate(&parent, &key, txs, now())?;

        let rejected: Vec<Hash> = candidate
            .excluded
            .iter()
            .filter(|(_, e)| {
                !matches!(
                    e,
                    TxError::GasLimitTooHigh { .. } | TxError::BadNonce { .. }
                )
            })
            .map(|(hash, _)| *hash)
            .collect();
        if !rejected.is_empty() {
            debug!("dropping {} unexecutable pooled transactions", rejected.len());
            self.mempool.remove(&rejected);
        }
        Ok((candidate, key))
    }

    fn start_production(
        &mut self,
        reply: Option<oneshot::Sender<Result<ChainUpdate, NodeError>>>,
        sealed_tx: &mpsc::Sender<Sealed>,
    ) {
        if self.mining.is_some() {
            respond(reply, Err(NodeError::Busy));
            return;
        }
        let (candidate, key) = match self.prepare_block() {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!("not producing a block: {e}");
                respond(reply, Err(e));
                return;
            }
        };

        let id = self.next_job;
        self.next_job += 1;
        let height = candidate.block.index();
        let cancel = Arc::new(AtomicBool::new(false));
        self.mining = Some(MiningJob {
            id,
            height,
            cancel: cancel.clone(),
            reply,
        });

        let consensus = self.chain.consensus().clone();
        let chain_id = self.chain.params().chain_id;
        let sealed_tx = sealed_tx.clone();
        debug!(
            "sealing block {height} with {} transactions",
            candidate.block.transactions.len()
        );
        tokio::task::spawn_blocking(move || {
            let mut block = candidate.block;
            let result = consensus
                .seal(&mut block.header, &key, chain_id, &cancel)
                .map(|()| block);
            let _ = sealed_tx.blocking_send(Sealed { id, result });
        });
    }

    fn finish_production(&mut self, sealed: Sealed) {
        let Some(job) = self.mining.take_if(|job| job.id == sealed.id) else {
            return;
        };
        let outcome = match sealed.result {
            Ok(block) => self.apply_block(block).map_err(NodeError::from),
            Err(ConsensusError::Cancelled) => Err(NodeError::Superseded),
            Err(e) => Err(NodeError::Seal(e)),
        };
        match &outcome {
            Ok(update) => info!("produced block {} at height {}", update.hash, job.height),
            Err(e) => debug!("block {} not produced: {e}", job.height),
        }
        respond(job.reply, outcome);
    }

    fn apply_block(&mut self, block: Block) -> Result<ChainUpdate, ChainError> {
        let hash = block.hash(self.chain.params().chain_id);
        match self.chain.append(block) {
            Ok(update) => {
                self.after_update(&update);
                Ok(update)
            }
            Err(e) => {
                self.report_rejection(hash, &e);
                Err(e)
            }
        }
    }

    fn after_update(&mut self, update: &ChainUpdate) {
        if let Some(tip) = &update.new_tip {
            let state = self.chain.state();
            self.mempool.remove(&update.included);
            let restored = self.mempool.requeue(update.reverted.clone(), &state);
            self.mempool.prune(&state);
            self.publish_snapshot();

            if let Some(job) = self.mining.as_ref().filter(|job| tip.index() >= job.height) {
                debug!("cancelling block {} production, tip moved to {}", job.height, tip.index());
                job.cancel.store(true, Ordering::Relaxed);
            }
            if update.reorg_depth > 0 {
                warn!(
                    "reorganized {} blocks to {} at height {}, {restored} transactions requeued",
                    update.reorg_depth,
                    update.hash,
                    tip.index()
                );
            } else {
                info!("new tip {} at height {}", update.hash, tip.index());
            }
            self.emit(NodeEvent::NewTip {
                block: tip.clone(),
                hash: update.hash,
                reorg_depth: update.reorg_depth,
            });
        }

        if let Some(evidence) = &update.equivocation {
            warn!(
                "equivocation at height {} by the proposer of {}",
                evidence.first.index, update.hash
            );
            self.emit(NodeEvent::Misbehavior(Misbehavior::Equivocation(
                evidence.clone(),
            )));
            self.submit_evidence(evidence);
        }
    }

    /// Pools an evidence transaction signed with the producer key.
    fn submit_evidence(&mut self, evidence: &DoubleSignEvidence) {
        let Some(key) = self.producer.clone() else {
            return;
        };
        let params = self.chain.params();
        if params.stake().is_none() {
            return;
        }
        let data = evidence.to_bytes();
        let gas_limit = intrinsic_gas(TransactionType::Evidence, data.len());
        let fee = u128::from(gas_limit) * u128::from(params.gas.min_gas_price);
        let nonce = self.mempool.next_nonce(&key.address(), &self.chain.state());
        let tx = Transaction::new(
            &key,
            TransactionType::Evidence,
            Address::zero(),
            0,
            data,
            nonce,
            fee,
            gas_limit,
            params.chain_id,
        );
        if let Err(e) = self.submit_transaction(tx) {
            warn!("could not file double-sign evidence: {e}");
        }
    }

    fn report_rejection(&self, hash: Hash, error: &ChainError) {
        match error {
            ChainError::DeepReorg { depth, limit } => {
                crate::error!(
                    "SECURITY ALERT: block {hash} would reorganize {depth} blocks past finality depth {limit}"
                );
                self.emit(NodeEvent::SecurityAlert {
                    block: hash,
                    depth: *depth,
                    limit: *limit,
                });
            }
            e if is_producer_fault(e) => {
                warn!("rejected invalid block {hash}: {e}");
                self.emit(NodeEvent::Misbehavior(Misbehavior::InvalidBlock {
                    hash,
                    reason: e.to_string(),
                }));
            }
            e => debug!("ignored block {hash}: {e}"),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.chain.snapshot();
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

/// Rejections that can only come from a faulty or malicious producer.
fn is_producer_fault(error: &ChainError) -> bool {
    matches!(
        error,
        ChainError::InvalidIndex { .. }
            | ChainError::TimestampBeforeParent { .. }
            | ChainError::InvalidBlock(_)
            | ChainError::MerkleRootMismatch { .. }
            | ChainError::InvalidProof(_)
            | ChainError::StateRootMismatch { .. }
            | ChainError::ReceiptRootMismatch { .. }
            | ChainError::GasUsedMismatch { .. }
            | ChainError::GenesisMismatch { .. }
    )
}

fn respond<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Cloneable client of a spawned [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
    snapshot: Arc<RwLock<ChainSnapshot>>,
}

impl NodeHandle {
    pub async fn receive_block(&self, bytes: Vec<u8>) -> Result<ChainUpdate, NodeError> {
        self.request(|reply| Command::Block { bytes, reply })
            .await?
            .map_err(NodeError::from)
    }

    pub async fn receive_transaction(&self, bytes: Vec<u8>) -> Result<Hash, NodeError> {
        self.request(|reply| Command::Transaction { bytes, reply })
            .await?
            .map_err(NodeError::from)
    }

    pub async fn receive_message(&self, bytes: Vec<u8>) -> Result<(), NodeError> {
        self.request(|reply| Command::Message { bytes, reply })
            .await?
    }

    /// Builds and seals a block on the current tip and waits until it is appended.
    pub async fn produce_block(&self) -> Result<ChainUpdate, NodeError> {
        self.request(|reply| Command::Produce { reply }).await?
    }

    /// Latest canonical view; never waits on the node task.
    pub fn snapshot(&self) -> ChainSnapshot {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Stops the node; a block being sealed is abandoned.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        response.await.map_err(|_| NodeError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ConsensusParams;
    use crate::storage::kv::MemoryStore;
    use crate::utils::test_utils::utils::{FUNDS, dev_params, dev_pos_params, key, transfer};
    use tokio::sync::broadcast::error::TryRecvError;

    fn node(params: ChainParams, producer: Option<PrivateKey>) -> Node {
        let mut config = NodeConfig::new(params, Arc::new(MemoryStore::new()));
        config.producer = producer;
        Node::new(config).unwrap()
    }

    fn tip_bytes(node: &Node) -> Vec<u8> {
        node.chain().tip().unwrap().to_bytes()
    }

    #[test]
    fn transactions_are_pooled_once_and_announced() {
        let mut node = node(dev_params(), None);
        let mut events = node.subscribe();
        let tx = transfer(&key(1), key(2).address(), 10, 0);

        let hash = node.receive_transaction(&tx.to_bytes()).unwrap();
        assert_eq!(hash, tx.id(1337));
        assert!(matches!(
            events.try_recv(),
            Ok(NodeEvent::TransactionAccepted(accepted)) if accepted == tx
        ));

        assert_eq!(
            node.receive_transaction(&tx.to_bytes()),
            Err(MempoolError::Duplicate(hash))
        );
        assert!(matches!(
            node.receive_transaction(&[1, 2, 3]),
            Err(MempoolError::Decode(_))
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn produced_block_clears_included_transactions() {
        let mut node = node(dev_params(), Some(key(3)));
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        node.submit_transaction(tx.clone()).unwrap();

        let update = node.produce_block().unwrap();
        assert_eq!(update.included, vec![tx.id(1337)]);
        assert!(node.mempool().is_empty());
        assert_eq!(node.chain().height(), 1);
        assert_eq!(node.chain().state().balance(&key(2).address()), FUNDS + 10);

        let snapshot = node.snapshot.read().unwrap().clone();
        assert_eq!(snapshot.height, 1);
        assert_eq!(snapshot.tip_hash, update.hash);
    }

    #[test]
    fn production_needs_a_key() {
        let mut node = node(dev_params(), None);
        assert!(matches!(node.produce_block(), Err(NodeError::NotProducer)));
    }

    #[test]
    fn peers_converge_on_gossiped_blocks() {
        let mut producer = node(dev_params(), Some(key(3)));
        let mut follower = node(dev_params(), None);
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        producer.submit_transaction(tx.clone()).unwrap();
        follower.submit_transaction(tx).unwrap();

        producer.produce_block().unwrap();
        let message = Message::block(&producer.chain().tip().unwrap()).to_bytes();
        follower.receive_message(&message).unwrap();

        assert_eq!(follower.chain().tip_hash(), producer.chain().tip_hash());
        assert!(follower.mempool().is_empty());
        assert!(matches!(
            follower.receive_block(&tip_bytes(&producer)),
            Err(ChainError::AlreadyKnown(_))
        ));
    }

    #[test]
    fn invalid_block_is_reported_as_misbehavior() {
        let mut producer = node(dev_params(), Some(key(3)));
        let mut follower = node(dev_params(), None);
        let mut events = follower.subscribe();
        producer.produce_block().unwrap();

        let mut forged = (*producer.chain().tip().unwrap()).clone();
        forged.header.state_root = Hash([9; 32]);
        let forged_hash = forged.hash(1337);
        assert!(follower.receive_block(&forged.to_bytes()).is_err());
        assert!(matches!(
            events.try_recv(),
            Ok(NodeEvent::Misbehavior(Misbehavior::InvalidBlock { hash, .. })) if hash == forged_hash
        ));

        // An orphan is not misbehavior.
        producer.produce_block().unwrap();
        assert!(matches!(
            follower.receive_block(&tip_bytes(&producer)),
            Err(ChainError::UnknownParent(_))
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn competing_tip_cancels_mining_at_that_height() {
        let mut miner = node(dev_params(), Some(key(3)));
        let mut rival = node(dev_params(), Some(key(4)));
        let stale = Arc::new(AtomicBool::new(false));
        miner.mining = Some(MiningJob {
            id: 0,
            height: 1,
            cancel: stale.clone(),
            reply: None,
        });

        rival.produce_block().unwrap();
        miner.receive_block(&tip_bytes(&rival)).unwrap();
        assert!(stale.load(Ordering::Relaxed));

        let ahead = Arc::new(AtomicBool::new(false));
        miner.mining = Some(MiningJob {
            id: 1,
            height: 3,
            cancel: ahead.clone(),
            reply: None,
        });
        rival.produce_block().unwrap();
        miner.receive_block(&tip_bytes(&rival)).unwrap();
        assert!(!ahead.load(Ordering::Relaxed));
    }

    #[test]
    fn fork_past_finality_raises_security_alert() {
        let mut params = dev_params();
        params.fork_choice.finality_depth = 2;
        let mut honest = node(params.clone(), Some(key(3)));
        let mut events = honest.subscribe();
        for _ in 0..3 {
            honest.produce_block().unwrap();
        }
        let tip = honest.chain().tip_hash();

        params.fork_choice.finality_depth = 100;
        let mut attacker = node(params, Some(key(4)));
        attacker.produce_block().unwrap();
        assert!(matches!(
            honest.receive_block(&tip_bytes(&attacker)),
            Err(ChainError::DeepReorg { depth: 3, limit: 2 })
        ));
        assert_eq!(honest.chain().tip_hash(), tip);

        let alert = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| matches!(e, NodeEvent::SecurityAlert { .. }));
        assert!(matches!(
            alert,
            Some(NodeEvent::SecurityAlert { depth: 3, limit: 2, .. })
        ));
    }

    #[test]
    fn equivocation_is_reported_and_evidence_pooled() {
        let params = dev_pos_params();
        let genesis = node(params.clone(), None).chain().tip_hash().unwrap();
        let scout = node(params.clone(), None);
        let proposer = [key(5), key(6)]
            .into_iter()
            .find(|k| scout.chain().build_candidate(&genesis, k, Vec::new(), 1).is_ok())
            .unwrap();

        let mut proposing = node(params.clone(), Some(proposer.clone()));
        proposing.produce_block().unwrap();
        let first = tip_bytes(&proposing);
        let mut twin = proposing
            .chain()
            .build_candidate(&genesis, &proposer, Vec::new(), now() + 60)
            .unwrap()
            .block;
        proposing
            .chain()
            .consensus()
            .seal(&mut twin.header, &proposer, 1337, &AtomicBool::new(false))
            .unwrap();

        let mut watcher = node(params, Some(key(1)));
        let mut events = watcher.subscribe();
        watcher.receive_block(&first).unwrap();
        let update = watcher.receive_block(&twin.to_bytes()).unwrap();
        assert!(update.equivocation.is_some());

        assert!(
            std::iter::from_fn(|| events.try_recv().ok())
                .any(|e| matches!(e, NodeEvent::Misbehavior(Misbehavior::Equivocation(_))))
        );
        let pooled = watcher.mempool().select_for_block(10, u64::MAX);
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].tx_type, TransactionType::Evidence);
        assert_eq!(pooled[0].sender(), key(1).address());
    }

    #[tokio::test]
    async fn handle_serves_requests_and_events() {
        let (handle, task) = node(dev_params(), Some(key(3))).spawn();
        let mut events = handle.subscribe();
        let tx = transfer(&key(1), key(2).address(), 10, 0);

        handle.receive_transaction(tx.to_bytes()).await.unwrap();
        let update = handle.produce_block().await.unwrap();
        assert_eq!(update.included, vec![tx.id(1337)]);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.height, 1);
        assert_eq!(snapshot.state.balance(&key(2).address()), FUNDS + 10);

        assert!(matches!(
            events.recv().await,
            Ok(NodeEvent::TransactionAccepted(_))
        ));
        assert!(matches!(
            events.recv().await,
            Ok(NodeEvent::NewTip { reorg_depth: 0, .. })
        ));

        assert!(matches!(
            handle.receive_block(vec![0xff]).await,
            Err(NodeError::Chain(ChainError::Decode(_)))
        ));

        handle.shutdown().await;
        task.await.unwrap();
        assert!(matches!(
            handle.produce_block().await,
            Err(NodeError::Stopped)
        ));
    }

    #[tokio::test]
    async fn shutdown_abandons_a_running_search() {
        let mut params = dev_params();
        if let ConsensusParams::Work(work) = &mut params.consensus {
            work.initial_difficulty = 200;
        }
        let (handle, task) = node(params, Some(key(3))).spawn();

        let mining = tokio::spawn({
            let handle = handle.clone();
            async move { handle.produce_block().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(handle.produce_block().await, Err(NodeError::Busy)));

        handle.shutdown().await;
        task.await.unwrap();
        assert!(matches!(mining.await.unwrap(), Err(NodeError::Stopped)));
        assert_eq!(handle.snapshot().height, 0);
    }
}
