//! A simulated ledger network that stands in for real node processes.
//!
//! Every node started by the [Ledger] keeps its own chain and mempool and enforces the
//! [Policy] parsed from its startup flags. Transactions and blocks travel between linked
//! nodes as messages delivered by spawned tasks after a configurable latency, so state
//! converges asynchronously (just like a real network observed through RPC).
//!
//! # Behavior
//!
//! - A locally submitted transaction must clear the dust limit and the mempool floor.
//!   A transaction received from a peer must additionally clear the relay fee.
//! - Every admitted transaction is forwarded to all linked peers.
//! - When the mempool exceeds capacity, the entries with the lowest fee rate (ties broken
//!   by id) are evicted and the floor rises to the evicted rate plus the relay fee.
//! - Blocks include pending transactions at or above the block minimum (highest rate
//!   first) and are announced as whole chains. A node adopts any strictly longer chain,
//!   so two blocks produced at the same height never reconcile on their own.
//! - Transactions confirmed only in an abandoned chain are dropped, not restored.

mod policy;
pub use policy::Policy;

use crate::node::{
    Address, Amount, BlockHash, ChainTip, Error, FeeRate, Lifecycle, Linker, MempoolInfo,
    NetworkInfo, Rpc, Transaction, TxId,
};
use commonware_runtime::{Clock, Spawner};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, trace};

/// Configuration for a [Ledger].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Base delay before a message reaches a linked peer.
    pub latency: Duration,

    /// Maximum additional (uniformly random) delay per message.
    pub jitter: Duration,

    /// Maximum total transaction bytes in a block.
    pub max_block_size: usize,

    /// Size of transactions created by [Rpc::send_to_address].
    pub transaction_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter: Duration::from_millis(10),
            max_block_size: 1_000_000,
            transaction_size: 226,
        }
    }
}

struct Block {
    hash: BlockHash,
    transactions: BTreeSet<TxId>,
}

type Chain = Vec<Arc<Block>>;

fn genesis() -> Arc<Block> {
    Arc::new(Block {
        hash: BlockHash::new(Sha256::digest(b"genesis").into()),
        transactions: BTreeSet::new(),
    })
}

#[derive(Clone)]
enum Message {
    Transaction(Transaction),
    Chain(Chain),
}

struct Peer {
    flags: Vec<String>,
    policy: Policy,
    chain: Chain,
    confirmed: HashSet<TxId>,
    mempool: BTreeMap<TxId, Transaction>,
    bytes: usize,
    floor: FeeRate,
    links: BTreeSet<u64>,
    addresses: u64,
}

impl Peer {
    fn new(flags: Vec<String>, policy: Policy) -> Self {
        Self {
            flags,
            policy,
            chain: vec![genesis()],
            confirmed: HashSet::new(),
            mempool: BTreeMap::new(),
            bytes: 0,
            floor: FeeRate::ZERO,
            links: BTreeSet::new(),
            addresses: 0,
        }
    }

    fn tip(&self) -> ChainTip {
        ChainTip {
            height: self.chain.len() as u64 - 1,
            hash: self.chain[self.chain.len() - 1].hash,
        }
    }

    fn remove(&mut self, id: &TxId) -> Option<Transaction> {
        let transaction = self.mempool.remove(id)?;
        self.bytes -= transaction.size;
        Some(transaction)
    }

    /// Admit `transaction` to the mempool, evicting cheaper entries if over capacity.
    fn admit(&mut self, transaction: Transaction, relayed: bool) -> Result<(), Error> {
        if self.mempool.contains_key(&transaction.id) || self.confirmed.contains(&transaction.id)
        {
            return Err(Error::Rejected("txn-already-known".into()));
        }
        if transaction.amount < self.policy.dust_limit {
            return Err(Error::Rejected("dust".into()));
        }
        let rate = transaction.fee_rate();
        if relayed && rate < self.policy.relay_fee {
            return Err(Error::Rejected("min relay fee not met".into()));
        }
        if rate < self.floor {
            return Err(Error::Rejected("mempool min fee not met".into()));
        }

        let id = transaction.id;
        self.bytes += transaction.size;
        self.mempool.insert(id, transaction);

        let mut admitted = true;
        while self.bytes > self.policy.max_mempool {
            let Some(cheapest) = self
                .mempool
                .values()
                .min_by_key(|transaction| (transaction.fee_rate(), transaction.id))
                .map(|transaction| transaction.id)
            else {
                break;
            };
            let Some(evicted) = self.remove(&cheapest) else {
                break;
            };
            self.floor = self
                .floor
                .max(evicted.fee_rate().saturating_add(self.policy.relay_fee));
            debug!(txid = ?evicted.id, floor = ?self.floor, "evicted transaction");
            admitted &= evicted.id != id;
        }
        if !admitted {
            return Err(Error::Rejected("mempool full".into()));
        }
        Ok(())
    }

    /// Replace the chain with `chain` if it is strictly longer.
    fn adopt(&mut self, chain: Chain) -> bool {
        if chain.len() <= self.chain.len() {
            return false;
        }
        self.confirmed = chain
            .iter()
            .flat_map(|block| block.transactions.iter().copied())
            .collect();
        self.chain = chain;
        let mined: Vec<TxId> = self
            .mempool
            .keys()
            .filter(|id| self.confirmed.contains(id))
            .copied()
            .collect();
        for id in mined {
            self.remove(&id);
        }
        true
    }

    /// Extend the chain with one block assembled from the mempool.
    fn mine(&mut self, miner: u64, max_block_size: usize) -> BlockHash {
        let mut candidates: Vec<&Transaction> = self
            .mempool
            .values()
            .filter(|transaction| transaction.fee_rate() >= self.policy.block_min_fee)
            .collect();
        candidates.sort_by_key(|transaction| (Reverse(transaction.fee_rate()), transaction.id));
        let mut size = 0;
        let mut included = BTreeSet::new();
        for transaction in candidates {
            if size + transaction.size > max_block_size {
                continue;
            }
            size += transaction.size;
            included.insert(transaction.id);
        }

        let tip = self.tip();
        let mut hasher = Sha256::new();
        hasher.update(tip.hash);
        hasher.update((tip.height + 1).to_be_bytes());
        hasher.update(miner.to_be_bytes());
        for id in &included {
            hasher.update(id);
        }
        let hash = BlockHash::new(hasher.finalize().into());

        for id in &included {
            self.remove(id);
            self.confirmed.insert(*id);
        }
        self.chain.push(Arc::new(Block {
            hash,
            transactions: included,
        }));
        hash
    }
}

#[derive(Default)]
struct State {
    peers: BTreeMap<u64, Peer>,
    next_peer: u64,
    next_transaction: u64,
}

impl State {
    fn peer(&mut self, index: u64) -> Result<&mut Peer, Error> {
        self.peers.get_mut(&index).ok_or(Error::Stopped)
    }

    fn create(
        &mut self,
        creator: u64,
        to: &Address,
        amount: Amount,
        fee: Amount,
        size: usize,
    ) -> Transaction {
        let nonce = self.next_transaction;
        self.next_transaction += 1;
        let mut hasher = Sha256::new();
        hasher.update(creator.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(to.0.as_bytes());
        hasher.update(amount.base().to_be_bytes());
        hasher.update(fee.base().to_be_bytes());
        Transaction {
            id: TxId::new(hasher.finalize().into()),
            to: to.clone(),
            amount,
            fee,
            size,
        }
    }
}

/// Send `message` from `from` to each of its links (other than `except`).
fn broadcast<E: Spawner + Clock + RngCore>(
    context: &E,
    state: &Arc<Mutex<State>>,
    cfg: &Config,
    from: u64,
    except: Option<u64>,
    message: Message,
) {
    let links: Vec<u64> = {
        let state = state.lock().unwrap();
        match state.peers.get(&from) {
            Some(peer) => peer
                .links
                .iter()
                .filter(|link| Some(**link) != except)
                .copied()
                .collect(),
            None => return,
        }
    };
    for to in links {
        send(context, state, cfg, from, to, message.clone());
    }
}

fn send<E: Spawner + Clock + RngCore>(
    context: &E,
    state: &Arc<Mutex<State>>,
    cfg: &Config,
    from: u64,
    to: u64,
    message: Message,
) {
    let mut context = context.clone();
    let jitter = cfg.jitter.as_millis() as u64;
    let delay = cfg.latency + Duration::from_millis(context.gen_range(0..=jitter));
    let state = state.clone();
    let cfg = *cfg;
    context.spawn(move |context| async move {
        context.sleep(delay).await;
        deliver(&context, &state, &cfg, from, to, message);
    });
}

fn deliver<E: Spawner + Clock + RngCore>(
    context: &E,
    state: &Arc<Mutex<State>>,
    cfg: &Config,
    from: u64,
    to: u64,
    message: Message,
) {
    let forward = {
        let mut state = state.lock().unwrap();
        let Some(peer) = state.peers.get_mut(&to) else {
            trace!(from, to, "dropping message for stopped node");
            return;
        };
        match message {
            Message::Transaction(transaction) => {
                let id = transaction.id;
                match peer.admit(transaction.clone(), true) {
                    Ok(()) => {
                        trace!(from, to, txid = ?id, "accepted relayed transaction");
                        Some(Message::Transaction(transaction))
                    }
                    Err(err) => {
                        trace!(from, to, txid = ?id, ?err, "ignored relayed transaction");
                        None
                    }
                }
            }
            Message::Chain(chain) => {
                if peer.adopt(chain) {
                    trace!(from, to, tip = %peer.tip(), "adopted chain");
                    Some(Message::Chain(peer.chain.clone()))
                } else {
                    None
                }
            }
        }
    };
    if let Some(message) = forward {
        broadcast(context, state, cfg, to, Some(from), message);
    }
}

/// A simulated network of ledger nodes.
///
/// Implements [Lifecycle] and [Linker] for the nodes it starts.
pub struct Ledger<E: Spawner + Clock + RngCore> {
    context: E,
    cfg: Config,
    state: Arc<Mutex<State>>,
}

impl<E: Spawner + Clock + RngCore> Ledger<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        Self {
            context,
            cfg,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Number of nodes currently running.
    pub fn running(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Flags a running node was started with.
    pub fn flags(&self, handle: &Handle<E>) -> Option<Vec<String>> {
        let state = self.state.lock().unwrap();
        state.peers.get(&handle.index).map(|peer| peer.flags.clone())
    }

    /// Peers a running node is linked to.
    pub fn links(&self, handle: &Handle<E>) -> Option<BTreeSet<u64>> {
        let state = self.state.lock().unwrap();
        state.peers.get(&handle.index).map(|peer| peer.links.clone())
    }

    /// Kill a node without going through [Lifecycle::stop_node].
    ///
    /// Any later call on the node's handle fails with [Error::Stopped] (and so does
    /// stopping it).
    pub fn crash(&self, handle: &Handle<E>) {
        let mut state = self.state.lock().unwrap();
        if let Some(peer) = state.peers.remove(&handle.index) {
            for link in peer.links {
                if let Some(other) = state.peers.get_mut(&link) {
                    other.links.remove(&handle.index);
                }
            }
            debug!(index = handle.index, "crashed node");
        }
    }
}

impl<E: Spawner + Clock + RngCore> Lifecycle for Ledger<E> {
    type Handle = Handle<E>;

    async fn start_node(&mut self, flags: &[String]) -> Result<Handle<E>, Error> {
        let policy = Policy::parse(flags)?;
        let index = {
            let mut state = self.state.lock().unwrap();
            let index = state.next_peer;
            state.next_peer += 1;
            state.peers.insert(index, Peer::new(flags.to_vec(), policy));
            index
        };
        debug!(index, ?policy, "started node");
        Ok(Handle {
            index,
            context: self.context.clone(),
            cfg: self.cfg,
            state: self.state.clone(),
        })
    }

    async fn stop_node(&mut self, handle: Handle<E>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let peer = state.peers.remove(&handle.index).ok_or(Error::Stopped)?;
        for link in peer.links {
            if let Some(other) = state.peers.get_mut(&link) {
                other.links.remove(&handle.index);
            }
        }
        debug!(index = handle.index, "stopped node");
        Ok(())
    }
}

impl<E: Spawner + Clock + RngCore> Linker<Handle<E>> for Ledger<E> {
    async fn link_peers(&mut self, a: &Handle<E>, b: &Handle<E>) -> Result<(), Error> {
        if a.index == b.index {
            return Err(Error::Rejected("cannot link node to itself".into()));
        }
        let (chain_a, chain_b) = {
            let mut state = self.state.lock().unwrap();
            if !state.peers.contains_key(&a.index) || !state.peers.contains_key(&b.index) {
                return Err(Error::Stopped);
            }
            let peer = state.peer(a.index)?;
            peer.links.insert(b.index);
            let chain_a = peer.chain.clone();
            let peer = state.peer(b.index)?;
            peer.links.insert(a.index);
            (chain_a, peer.chain.clone())
        };
        debug!(a = a.index, b = b.index, "linked nodes");

        // Newly linked nodes exchange their best chains
        send(
            &self.context,
            &self.state,
            &self.cfg,
            a.index,
            b.index,
            Message::Chain(chain_a),
        );
        send(
            &self.context,
            &self.state,
            &self.cfg,
            b.index,
            a.index,
            Message::Chain(chain_b),
        );
        Ok(())
    }
}

/// Control handle for a node started by a [Ledger].
pub struct Handle<E: Spawner + Clock + RngCore> {
    index: u64,
    context: E,
    cfg: Config,
    state: Arc<Mutex<State>>,
}

impl<E: Spawner + Clock + RngCore> Handle<E> {
    /// Index of the node within its [Ledger].
    pub fn index(&self) -> u64 {
        self.index
    }

    fn submit(&self, transaction: Transaction) -> Result<TxId, Error> {
        let id = transaction.id;
        self.state
            .lock()
            .unwrap()
            .peer(self.index)?
            .admit(transaction.clone(), false)?;
        debug!(index = self.index, txid = ?id, "accepted transaction");
        broadcast(
            &self.context,
            &self.state,
            &self.cfg,
            self.index,
            None,
            Message::Transaction(transaction),
        );
        Ok(id)
    }
}

impl<E: Spawner + Clock + RngCore> Rpc for Handle<E> {
    async fn new_address(&self) -> Result<Address, Error> {
        let mut state = self.state.lock().unwrap();
        let peer = state.peer(self.index)?;
        peer.addresses += 1;
        Ok(Address(format!("n{}a{}", self.index, peer.addresses)))
    }

    async fn send_to_address(&self, address: &Address, amount: Amount) -> Result<TxId, Error> {
        let transaction = {
            let mut state = self.state.lock().unwrap();
            let rate = state.peer(self.index)?.policy.wallet_fee();
            let size = self.cfg.transaction_size;
            state.create(self.index, address, amount, rate.fee(size), size)
        };
        self.submit(transaction)
    }

    async fn create_transaction(
        &self,
        address: &Address,
        amount: Amount,
        fee_rate: FeeRate,
        size: usize,
    ) -> Result<Transaction, Error> {
        let mut state = self.state.lock().unwrap();
        state.peer(self.index)?;
        Ok(state.create(self.index, address, amount, fee_rate.fee(size), size))
    }

    async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<TxId, Error> {
        self.submit(transaction.clone())
    }

    async fn generate(&self, blocks: u64) -> Result<Vec<BlockHash>, Error> {
        let (hashes, chain) = {
            let mut state = self.state.lock().unwrap();
            let peer = state.peer(self.index)?;
            let hashes: Vec<BlockHash> = (0..blocks)
                .map(|_| peer.mine(self.index, self.cfg.max_block_size))
                .collect();
            debug!(index = self.index, tip = %peer.tip(), "generated blocks");
            (hashes, peer.chain.clone())
        };
        if !hashes.is_empty() {
            broadcast(
                &self.context,
                &self.state,
                &self.cfg,
                self.index,
                None,
                Message::Chain(chain),
            );
        }
        Ok(hashes)
    }

    async fn block_transactions(&self, block: &BlockHash) -> Result<BTreeSet<TxId>, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .peer(self.index)?
            .chain
            .iter()
            .find(|candidate| candidate.hash == *block)
            .map(|found| found.transactions.clone())
            .ok_or(Error::UnknownBlock(*block))
    }

    async fn chain_tip(&self) -> Result<ChainTip, Error> {
        Ok(self.state.lock().unwrap().peer(self.index)?.tip())
    }

    async fn raw_mempool(&self) -> Result<BTreeSet<TxId>, Error> {
        let mut state = self.state.lock().unwrap();
        Ok(state.peer(self.index)?.mempool.keys().copied().collect())
    }

    async fn mempool_info(&self) -> Result<MempoolInfo, Error> {
        let mut state = self.state.lock().unwrap();
        let peer = state.peer(self.index)?;
        Ok(MempoolInfo {
            size: peer.mempool.len(),
            bytes: peer.bytes,
        })
    }

    async fn network_info(&self) -> Result<NetworkInfo, Error> {
        Ok(NetworkInfo {
            relay_fee: self.state.lock().unwrap().peer(self.index)?.policy.relay_fee,
        })
    }
}
