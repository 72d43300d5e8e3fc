//! The header-chain engine: accepts headers (or full blocks) from the
//! network, validates work and difficulty scheduling, tracks the
//! highest-work chain through a block store and reorganizes when a
//! heavier fork overtakes the tip.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::mpsc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use spv_types::block::{verify_header, Block, TxVerifyFlags, VerificationError};
use spv_types::codec::CodecError;
use spv_types::difficulty::{target_from_bits, target_to_bits};
use spv_types::hash::H256;
use spv_types::header::{ChainWorkError, Header, StoredBlock};
use spv_types::network::{NetworkConfig, ValidationPolicy};
use spv_types::u256::U256;
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{BlockStore, StoreError};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("wrong difficulty: expected bits {expected:#010x}, got {actual:#010x}")]
    BadDifficulty { expected: u32, actual: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ChainWorkError> for ChainError {
    fn from(err: ChainWorkError) -> Self {
        match err {
            ChainWorkError::InvalidTarget => VerificationError::InvalidTarget.into(),
            ChainWorkError::Overflow => {
                StoreError::Corrupt("cumulative chain work overflowed").into()
            }
        }
    }
}

/// What became of one submitted header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Accepted {
    /// Extended or became the best chain; this is the new chain head.
    Connected(StoredBlock),
    /// Valid and stored, but the best chain is still heavier.
    SideChain(StoredBlock),
    /// Parent unknown; buffered. The caller may want to fetch the
    /// returned ancestor hash.
    Orphan(H256),
    /// Already stored; nothing changed.
    Duplicate(StoredBlock),
}

/// Chain-state transitions, pushed to sinks after the store is
/// consistent.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// The best chain grew by one block.
    NewBestBlock(StoredBlock),
    /// A fork overtook the best chain. `disconnected` lists the
    /// abandoned blocks from the old tip downward; `connected` lists the
    /// adopted ones from the fork point upward.
    Reorganize {
        old_head: StoredBlock,
        new_head: StoredBlock,
        disconnected: Vec<StoredBlock>,
        connected: Vec<StoredBlock>,
    },
}

/// Where chain events go. Implementations decide whether to handle them
/// inline or queue them; either way they must not call back into the
/// engine, which still holds the ingest lock.
pub trait ChainSink: Send + Sync {
    fn push(&self, event: ChainEvent);
}

/// A sink that forwards events into an mpsc channel, for callers that
/// drain them on their own thread.
pub struct ChannelSink {
    sender: Mutex<mpsc::Sender<ChainEvent>>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (ChannelSink, mpsc::Receiver<ChainEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            ChannelSink {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl ChainSink for ChannelSink {
    fn push(&self, event: ChainEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.sender.lock().send(event);
    }
}

/// Engine tuning knobs; the defaults suit a live SPV node.
#[derive(Clone, Copy, Debug, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many parentless headers to hold while their ancestors are in
    /// flight. The oldest is dropped beyond this.
    pub orphan_limit: usize,
    /// Enforce BIP34 coinbase heights when verifying full blocks.
    pub height_in_coinbase: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            orphan_limit: 128,
            height_in_coinbase: false,
        }
    }
}

struct OrphanPool {
    by_parent: HashMap<H256, Vec<Header>>,
    arrival: VecDeque<H256>,
    limit: usize,
}

impl OrphanPool {
    fn new(limit: usize) -> Self {
        OrphanPool {
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
            limit,
        }
    }

    fn len(&self) -> usize {
        self.arrival.len()
    }

    fn insert(&mut self, header: Header) {
        let hash = header.block_hash();
        if self.arrival.contains(&hash) {
            return;
        }
        self.by_parent
            .entry(header.prev_block_hash)
            .or_default()
            .push(header);
        self.arrival.push_back(hash);

        while self.arrival.len() > self.limit {
            let Some(oldest) = self.arrival.pop_front() else {
                break;
            };
            for children in self.by_parent.values_mut() {
                children.retain(|child| child.block_hash() != oldest);
            }
            self.by_parent.retain(|_, children| !children.is_empty());
        }
    }

    /// Removes and returns every buffered header waiting on `parent`.
    fn take_children(&mut self, parent: &H256) -> Vec<Header> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            let hash = child.block_hash();
            self.arrival.retain(|buffered| *buffered != hash);
        }
        children
    }
}

/// The chain engine. One per network, wrapping the block store it owns
/// the write side of.
pub struct ChainEngine<S: BlockStore> {
    config: NetworkConfig,
    engine_config: EngineConfig,
    policy: ValidationPolicy,
    store: S,
    clock: Box<dyn Clock>,
    sinks: Vec<Box<dyn ChainSink>>,
    orphans: Mutex<OrphanPool>,
    /// Serializes whole-header ingestion, making acceptances
    /// linearizable; sinks run under it too.
    ingest_lock: Mutex<()>,
}

impl<S: BlockStore> ChainEngine<S> {
    /// Builds an engine over `store`. A store with no chain head yet is
    /// seeded with the network's genesis block.
    pub fn new(
        config: NetworkConfig,
        store: S,
        policy: ValidationPolicy,
        clock: Box<dyn Clock>,
        sinks: Vec<Box<dyn ChainSink>>,
        engine_config: EngineConfig,
    ) -> Result<Self, ChainError> {
        match store.chain_head() {
            Ok(head) => {
                info!(target: "chain", "chain head at height {} ({})", head.height, head.block_hash);
            }
            Err(StoreError::NotFound) => {
                let genesis = config.genesis_stored_block();
                info!(target: "chain", "seeding fresh store with genesis {}", genesis.block_hash);
                store.put(&genesis)?;
                store.set_chain_head(&genesis)?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(ChainEngine {
            orphans: Mutex::new(OrphanPool::new(engine_config.orphan_limit)),
            config,
            engine_config,
            policy,
            store,
            clock,
            sinks,
            ingest_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The tip of the currently-selected best chain.
    pub fn chain_head(&self) -> Result<StoredBlock, ChainError> {
        Ok(self.store.chain_head()?)
    }

    /// Accepts one 80-byte serialized header.
    pub fn accept_header_bytes(&self, bytes: &[u8]) -> Result<Accepted, ChainError> {
        self.accept_header(Header::parse(bytes)?)
    }

    /// Accepts one parsed header, then drains any orphans it unlocked.
    pub fn accept_header(&self, header: Header) -> Result<Accepted, ChainError> {
        eprintln!("DBG accept_header enter");
        let _guard = self.ingest_lock.lock();
        eprintln!("DBG accept_header got lock");
        let accepted = self.accept_one(header)?;
        if let Accepted::Connected(stored) | Accepted::SideChain(stored) = &accepted {
            self.flush_orphans(stored.block_hash);
        }
        Ok(accepted)
    }

    /// Accepts a serialized block. Bodies are verified before the header
    /// enters the chain; header-only serializations behave exactly like
    /// [`accept_header_bytes`](Self::accept_header_bytes).
    pub fn accept_block_bytes(&self, bytes: &[u8]) -> Result<Accepted, ChainError> {
        self.accept_block(Block::parse(bytes)?)
    }

    /// Accepts a block, verifying its transactions when a body is
    /// present.
    pub fn accept_block(&self, block: Block) -> Result<Accepted, ChainError> {
        let _guard = self.ingest_lock.lock();

        if block.txdata.is_some() {
            // The body rules need the height, which the parent decides;
            // an unknown parent orphans the header before body checks.
            match self.store.get(&block.header.prev_block_hash)? {
                None => {
                    self.buffer_orphan(block.header);
                    return Ok(Accepted::Orphan(block.header.prev_block_hash));
                }
                Some(prev) => {
                    let flags = TxVerifyFlags {
                        height_in_coinbase: self.engine_config.height_in_coinbase,
                    };
                    block.verify_transactions(prev.height + 1, &flags)?;
                }
            }
        }

        let accepted = self.accept_one(block.header)?;
        if let Accepted::Connected(stored) | Accepted::SideChain(stored) = &accepted {
            self.flush_orphans(stored.block_hash);
        }
        Ok(accepted)
    }

    /// Verifies a transaction-inclusion proof against the best chain:
    /// the claimed block must be on it with enough confirmations, and
    /// the proof must hash up to its merkle root.
    pub fn verify_tx_inclusion(
        &self,
        tx_id: &H256,
        block_hash: &H256,
        tx_index: usize,
        merkle_proof: &[H256],
        confirmations: u32,
    ) -> Result<bool, ChainError> {
        let head = self.store.chain_head()?;
        let Some(target) = self.store.get(block_hash)? else {
            return Ok(false);
        };

        if head.height.saturating_sub(target.height) + 1 < confirmations {
            return Ok(false);
        }

        // Walk the best chain down to the claimed height; a side-chain
        // block proves nothing.
        let mut cursor = head;
        while cursor.height > target.height {
            cursor = self
                .store
                .get(&cursor.header.prev_block_hash)?
                .ok_or(StoreError::NotFound)?;
        }
        if cursor.block_hash != *block_hash {
            return Ok(false);
        }

        let root = merkle_tools::compute_root_from_merkle_proof(*tx_id, tx_index, merkle_proof);
        Ok(root == target.header.merkle_root)
    }

    fn accept_one(&self, header: Header) -> Result<Accepted, ChainError> {
        std::thread_local! {
            static DEPTH: std::cell::Cell<u32> = std::cell::Cell::new(0);
        }
        DEPTH.with(|d| {
            let v = d.get() + 1;
            d.set(v);
            if v > 50 {
                panic!("DEPTH EXCEEDED: {v}");
            }
        });
        struct Dec;
        impl Drop for Dec {
            fn drop(&mut self) {
                DEPTH.with(|d| d.set(d.get() - 1));
            }
        }
        let _dec = Dec;
        let hash = header.block_hash();
        if let Some(existing) = self.store.get(&hash)? {
            debug!(target: "chain", "block {hash}: duplicate");
            return Ok(Accepted::Duplicate(existing));
        }

        let Some(prev) = self.store.get(&header.prev_block_hash)? else {
            self.buffer_orphan(header);
            return Ok(Accepted::Orphan(header.prev_block_hash));
        };

        verify_header(&header, &self.policy, self.clock.now())?;
        self.check_difficulty_schedule(&header, &prev)?;

        let stored = prev.build_next(header)?;
        self.store.put(&stored)?;

        let head = self.store.chain_head()?;
        // Strict comparison keeps the first-seen tip on a work tie.
        if stored.chain_work > head.chain_work {
            if stored.header.prev_block_hash == head.block_hash {
                debug!(target: "chain", "block {hash}: extending best chain to height {}", stored.height);
                self.store.set_chain_head(&stored)?;
                self.emit(ChainEvent::NewBestBlock(stored.clone()));
            } else {
                info!(target: "chain", "block {hash}: fork overtook the best chain, reorganizing");
                self.reorganize(&head, &stored)?;
            }
            Ok(Accepted::Connected(stored))
        } else {
            debug!(target: "chain", "block {hash}: stored on side chain at height {}", stored.height);
            Ok(Accepted::SideChain(stored))
        }
    }

    /// Splits the old and new chains at their fork point and switches
    /// the head, reporting both flanks to the sinks.
    fn reorganize(&self, old_head: &StoredBlock, new_head: &StoredBlock) -> Result<(), ChainError> {
        let mut disconnected = Vec::new();
        let mut connected = Vec::new();

        let mut old_cursor = old_head.clone();
        let mut new_cursor = new_head.clone();

        while new_cursor.height > old_cursor.height {
            connected.push(new_cursor.clone());
            new_cursor = self.parent_of(&new_cursor)?;
        }
        while old_cursor.height > new_cursor.height {
            disconnected.push(old_cursor.clone());
            old_cursor = self.parent_of(&old_cursor)?;
        }
        while old_cursor.block_hash != new_cursor.block_hash {
            disconnected.push(old_cursor.clone());
            connected.push(new_cursor.clone());
            old_cursor = self.parent_of(&old_cursor)?;
            new_cursor = self.parent_of(&new_cursor)?;
        }

        // The walk gathered the new flank tip-first; deliver it in
        // connect order. The disconnects stay tip-first.
        connected.reverse();

        self.store.set_chain_head(new_head)?;
        info!(
            target: "chain",
            "reorganized at height {}: -{} +{} blocks, new head {}",
            new_cursor.height,
            disconnected.len(),
            connected.len(),
            new_head.block_hash
        );
        self.emit(ChainEvent::Reorganize {
            old_head: old_head.clone(),
            new_head: new_head.clone(),
            disconnected,
            connected,
        });
        Ok(())
    }

    fn parent_of(&self, block: &StoredBlock) -> Result<StoredBlock, ChainError> {
        Ok(self
            .store
            .get(&block.header.prev_block_hash)?
            .ok_or(StoreError::NotFound)?)
    }

    /// What `bits` this header must carry, per the retargeting schedule.
    /// `None` means the store cannot see far enough back to say, which
    /// happens just above a checkpoint; the check is then skipped.
    fn expected_bits(&self, header: &Header, prev: &StoredBlock) -> Result<Option<u32>, ChainError> {
        let interval = self.config.difficulty_adjustment_interval;

        if (prev.height + 1) % interval != 0 {
            if self.config.pow_allow_min_difficulty_blocks {
                return self.expected_bits_min_difficulty(header, prev);
            }
            return Ok(Some(prev.header.bits));
        }

        // Retarget boundary: find the first block of the closing window.
        let mut first = prev.clone();
        for _ in 0..interval - 1 {
            match self.store.get(&first.header.prev_block_hash)? {
                Some(parent) => first = parent,
                None => {
                    debug!(target: "chain", "retarget window reaches past the checkpoint, skipping bits check");
                    return Ok(None);
                }
            }
        }

        let mut actual_timespan = i64::from(prev.header.time) - i64::from(first.header.time);
        let target_timespan = self.config.pow_target_timespan;
        actual_timespan = actual_timespan.clamp(target_timespan / 4, target_timespan * 4);

        let last_target = target_from_bits(prev.header.bits)
            .ok_or(VerificationError::InvalidTarget)?;
        // No target at or below the pow limit can overflow this multiply.
        let (scaled, overflow) = last_target.mul_u64(actual_timespan as u64);
        let mut new_target = if overflow {
            self.config.pow_limit
        } else {
            scaled / U256::from(target_timespan as u64)
        };
        if new_target > self.config.pow_limit {
            new_target = self.config.pow_limit;
        }

        Ok(Some(target_to_bits(&new_target)))
    }

    /// Testnet's escape hatch: after 20 quiet minutes any block may use
    /// the minimum difficulty; otherwise the schedule continues from the
    /// last block that did not.
    fn expected_bits_min_difficulty(
        &self,
        header: &Header,
        prev: &StoredBlock,
    ) -> Result<Option<u32>, ChainError> {
        let limit_bits = self.config.proof_of_work_limit_bits;
        let gap = u64::from(header.time).saturating_sub(u64::from(prev.header.time));
        if gap > 2 * u64::from(self.config.pow_target_spacing) {
            return Ok(Some(limit_bits));
        }

        let interval = self.config.difficulty_adjustment_interval;
        let mut cursor = prev.clone();
        while cursor.header.bits == limit_bits && cursor.height % interval != 0 {
            match self.store.get(&cursor.header.prev_block_hash)? {
                Some(parent) => cursor = parent,
                None => return Ok(None),
            }
        }
        Ok(Some(cursor.header.bits))
    }

    fn check_difficulty_schedule(
        &self,
        header: &Header,
        prev: &StoredBlock,
    ) -> Result<(), ChainError> {
        if let Some(expected) = self.expected_bits(header, prev)? {
            if expected != header.bits {
                return Err(ChainError::BadDifficulty {
                    expected,
                    actual: header.bits,
                });
            }
        }
        Ok(())
    }

    fn buffer_orphan(&self, header: Header) {
        let mut orphans = self.orphans.lock();
        orphans.insert(header);
        debug!(
            target: "chain",
            "block {}: parent {} unknown, buffered ({} orphans held)",
            header.block_hash(),
            header.prev_block_hash,
            orphans.len()
        );
    }

    /// Re-submits orphans whose ancestry just became known, cascading
    /// through grandchildren.
    fn flush_orphans(&self, parent: H256) {
        let mut ready = VecDeque::from([parent]);
        while let Some(parent) = ready.pop_front() {
            let children = self.orphans.lock().take_children(&parent);
            for child in children {
                let child_hash = child.block_hash();
                match self.accept_one(child) {
                    Ok(Accepted::Connected(_) | Accepted::SideChain(_) | Accepted::Duplicate(_)) => {
                        ready.push_back(child_hash);
                    }
                    Ok(Accepted::Orphan(_)) => {}
                    Err(err) => {
                        warn!(target: "chain", "buffered block {child_hash} rejected on connect: {err}");
                    }
                }
            }
        }
    }

    fn emit(&self, event: ChainEvent) {
        for sink in &self.sinks {
            sink.push(event.clone());
        }
    }
}
