//! The chain-state core: ingests headers and bodies, selects the canonical
//! chain, applies and reverts blocks against the commitment trees, and prunes
//! history below the configured horizons.
//!
//! Every externally triggered event runs inside one storage transaction; its
//! effects become visible atomically at commit, and observer callbacks fire
//! synchronously afterwards in the order the triggering events produced them.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::builder::{self, BuiltBlock};
use crate::config::{HorizonConfig, NodeConfig};
use crate::consensus::{self, ChainParams};
use crate::crypto::{Generators, Kdf};
use crate::errors::{BlockError, ChainError, ChainResult};
use crate::headers::{HeaderDag, StateFlags, StateRecord};
use crate::kernel_tree::KernelTree;
use crate::mempool::TxPool;
use crate::smt::MerkleProof;
use crate::storage::{block_key, Family, Store, StoreTxn};
use crate::sync::{self, CongestionPlan, RequestKind};
use crate::types::{BlockBody, BlockHeader, BlockId, Hash, PeerId};
use crate::utxo_tree::UtxoTree;

use curve25519_dalek::ristretto::CompressedRistretto;
use serde::{Deserialize, Serialize};

/// Notifications the core emits after a transaction commits.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    RequestData {
        id: BlockId,
        body: bool,
        preferred_peer: Option<PeerId>,
    },
    PeerInsane(PeerId),
    NewState(BlockId),
}

/// Capability set the core notifies. Supplied at construction; implementors
/// wire these into the peer layer.
pub trait ChainEvents {
    fn request_data(&self, _id: &BlockId, _body: bool, _preferred_peer: Option<&PeerId>) {}
    fn on_peer_insane(&self, _peer: &PeerId) {}
    fn on_new_state(&self, _tip: &BlockId) {}
}

/// Observer that ignores everything; the default for tools and tests.
pub struct NullEvents;

impl ChainEvents for NullEvents {}

/// Undo log for one applied block: the multiplicity each spent UTXO slot
/// carried before the spend, in input order. Together with the stored body
/// this inverts the apply exactly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RollbackData {
    pub prior_multiplicities: Vec<u32>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct NodeProcessor {
    store: Store,
    dag: HeaderDag,
    utxos: UtxoTree,
    kernels: KernelTree,
    tip: Option<BlockId>,
    genesis_id: BlockId,
    params: ChainParams,
    horizon: HorizonConfig,
    max_block_weight: usize,
    gens: Generators,
    kdf: Kdf,
    events: Box<dyn ChainEvents>,
    pending: Vec<ChainEvent>,
}

impl NodeProcessor {
    /// Open (or create) the chain state under `config.data_dir`. An empty
    /// store is seeded with the deterministic genesis block; an existing one
    /// is rebuilt and cross-checked against the persisted tip.
    pub fn initialize(
        config: &NodeConfig,
        kdf: Kdf,
        events: Box<dyn ChainEvents>,
    ) -> ChainResult<Self> {
        let store = Store::open(&config.data_dir.join("db"))?;
        let params = ChainParams::for_genesis(&config.genesis);
        let gens = Generators::new();
        let (genesis_header, genesis_body) = builder::genesis_block(&config.genesis, &params, &gens)?;
        let genesis_id = genesis_header.id();

        let mut processor = Self {
            store,
            dag: HeaderDag::new(),
            utxos: UtxoTree::new(),
            kernels: KernelTree::new(),
            tip: None,
            genesis_id,
            params,
            horizon: config.horizon,
            max_block_weight: config.max_block_weight,
            gens,
            kdf,
            events,
            pending: Vec::new(),
        };

        match processor.store.read_tip()? {
            None => processor.bootstrap_genesis(&genesis_header, &genesis_body)?,
            Some(tip) => processor.bootstrap_existing(tip)?,
        }
        Ok(processor)
    }

    fn bootstrap_genesis(&mut self, header: &BlockHeader, body: &BlockBody) -> ChainResult<()> {
        let id = header.id();
        let mut txn = self.store.begin();
        txn.put(Family::Bodies, block_key(&id), bincode::serialize(body)?);
        txn.put_kdf_seed_id(&self.kdf.seed_id());
        self.dag.insert(StateRecord {
            header: header.clone(),
            flags: StateFlags {
                reachable: true,
                functional: true,
                active: false,
                insane: false,
            },
            body: true,
            peer: None,
        });
        self.persist_record(&mut txn, &id)?;
        if let Err(verdict) = self.apply_block(&mut txn, &id)? {
            return Err(ChainError::Corrupted(format!(
                "genesis block failed to apply: {verdict}"
            )));
        }
        txn.commit(&self.store)?;
        self.pending.clear();
        info!(genesis = %id, "seeded empty chain state");
        Ok(())
    }

    fn bootstrap_existing(&mut self, tip: BlockId) -> ChainResult<()> {
        for (key, value) in self.store.scan(Family::States)? {
            if key.len() != 40 {
                return Err(ChainError::Corrupted("malformed state key".into()));
            }
            let record: StateRecord = bincode::deserialize(&value)?;
            self.dag.insert(record);
        }
        for (key, value) in self.store.scan(Family::Utxo)? {
            self.utxos.load_leaf(&key, value);
        }
        for (key, _) in self.store.scan(Family::Kernels)? {
            self.kernels.load_leaf(&key);
        }
        if !self.dag.contains(&self.genesis_id) {
            return Err(ChainError::Corrupted(
                "store does not contain this chain's genesis".into(),
            ));
        }
        let tip_record = self.dag.require(&tip)?;
        if !tip_record.flags.active {
            return Err(ChainError::Corrupted("persisted tip is not active".into()));
        }
        if tip_record.header.utxo_root != self.utxos.root()
            || tip_record.header.kernel_root != self.kernels.root()
        {
            return Err(ChainError::Corrupted(
                "rebuilt trees do not match the tip header".into(),
            ));
        }
        match self.store.read_kdf_seed_id()? {
            Some(stored) if stored == self.kdf.seed_id() => {}
            Some(_) => {
                return Err(ChainError::Config(
                    "key seed does not match the one this store was created with".into(),
                ))
            }
            None => return Err(ChainError::Corrupted("kdf seed identifier missing".into())),
        }
        self.tip = Some(tip);
        info!(%tip, headers = self.dag.len(), "restored chain state");
        Ok(())
    }

    pub fn current_state(&self) -> Option<BlockId> {
        self.tip
    }

    pub fn current_header(&self) -> Option<&BlockHeader> {
        let tip = self.tip.as_ref()?;
        self.dag.get(tip).map(|record| &record.header)
    }

    pub fn genesis_id(&self) -> BlockId {
        self.genesis_id
    }

    pub fn header(&self, id: &BlockId) -> Option<&BlockHeader> {
        self.dag.get(id).map(|record| &record.header)
    }

    pub fn state_flags(&self, id: &BlockId) -> Option<StateFlags> {
        self.dag.get(id).map(|record| record.flags)
    }

    /// Read-only handle over the backing store, for serving peers.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Combined digest of the two live tree roots.
    pub fn current_live_root(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.utxos.root());
        hasher.update(&self.kernels.root());
        hasher.finalize().into()
    }

    /// Membership proof for a UTXO slot against the current tip state.
    pub fn utxo_proof(
        &self,
        commitment: &CompressedRistretto,
        maturity: u64,
    ) -> (Hash, MerkleProof) {
        (self.utxos.root(), self.utxos.prove(commitment, maturity))
    }

    pub fn utxo_multiplicity(&self, commitment: &CompressedRistretto, maturity: u64) -> u32 {
        self.utxos.multiplicity(commitment, maturity)
    }

    fn above_body_horizon(&self, height: u64) -> bool {
        if self.horizon.schwarzschild == 0 {
            return true;
        }
        let tip_height = self.tip.map(|tip| tip.height).unwrap_or(0);
        height > tip_height.saturating_sub(self.horizon.schwarzschild)
    }

    /// Whether the node wants this header: unknown to the DAG and above the
    /// body-erasure horizon.
    pub fn is_state_needed(&self, id: &BlockId) -> bool {
        !self.dag.contains(id) && self.above_body_horizon(id.height)
    }

    /// Ingest a header advertised by `peer`. Returns whether anything new
    /// was recorded.
    pub fn on_state(&mut self, header: &BlockHeader, peer: &PeerId) -> ChainResult<bool> {
        let id = header.id();
        if self.dag.contains(&id) || !self.above_body_horizon(id.height) {
            return Ok(false);
        }
        if HeaderDag::validate_self(header, &self.params, unix_now()).is_err()
            || header.height == 0
        {
            // height zero is reserved for the locally seeded genesis
            self.pending.push(ChainEvent::PeerInsane(*peer));
            self.flush_events();
            return Ok(false);
        }

        let mut txn = self.store.begin();
        let parent_id = BlockId {
            height: header.height - 1,
            hash: header.previous_hash,
        };
        let mut flags = StateFlags::default();
        if let Some(parent) = self.dag.get(&parent_id) {
            let parent_insane = parent.flags.insane;
            let parent_reachable = parent.flags.reachable;
            if parent_insane
                || self
                    .dag
                    .validate_against_parent(header, &parent_id, &self.params)
                    .is_err()
            {
                flags.insane = true;
                self.pending.push(ChainEvent::PeerInsane(*peer));
            } else {
                flags.reachable = parent_reachable;
            }
        }
        self.dag.insert(StateRecord {
            header: header.clone(),
            flags,
            body: false,
            peer: Some(*peer),
        });
        self.persist_record(&mut txn, &id)?;
        self.refresh_flags_downward(&mut txn, &id)?;
        self.try_go_up(&mut txn)?;
        txn.commit(&self.store)?;
        debug!(header = %id, "recorded header");
        self.flush_events();
        Ok(true)
    }

    /// Ingest a block body for an already-known header.
    pub fn on_block(&mut self, id: &BlockId, bytes: &[u8], peer: &PeerId) -> ChainResult<bool> {
        let Some(record) = self.dag.get(id) else {
            return Ok(false);
        };
        if record.flags.insane || record.body || !self.above_body_horizon(id.height) {
            return Ok(false);
        }
        if bincode::deserialize::<BlockBody>(bytes).is_err() {
            self.pending.push(ChainEvent::PeerInsane(*peer));
            self.flush_events();
            return Ok(false);
        }

        let mut txn = self.store.begin();
        txn.put(Family::Bodies, block_key(id), bytes.to_vec());
        let parent_functional = match self.dag.parent_of(id) {
            Some(parent) => parent.flags.functional && !parent.flags.insane,
            None => false,
        };
        {
            let record = self
                .dag
                .get_mut(id)
                .ok_or_else(|| ChainError::Corrupted("header vanished mid-ingest".into()))?;
            record.body = true;
            if record.peer.is_none() {
                record.peer = Some(*peer);
            }
            record.flags.functional = record.flags.reachable && parent_functional;
        }
        self.persist_record(&mut txn, id)?;
        self.refresh_flags_downward(&mut txn, id)?;
        self.try_go_up(&mut txn)?;
        txn.commit(&self.store)?;
        debug!(block = %id, "recorded block body");
        self.flush_events();
        Ok(true)
    }

    /// Walk the best candidates that are still missing data and request it.
    pub fn enum_congestions(&mut self) -> CongestionPlan {
        let plan = sync::plan_congestions(&self.dag, self.tip.as_ref());
        for request in &plan.requests {
            self.pending.push(ChainEvent::RequestData {
                id: request.id,
                body: request.kind == RequestKind::Body,
                preferred_peer: request.preferred_peer,
            });
        }
        self.flush_events();
        plan
    }

    /// Assemble a candidate block on the current tip for external mining.
    /// The working state is a snapshot; chain state is untouched.
    pub fn generate_block(&self, pool: &TxPool) -> ChainResult<BuiltBlock> {
        let tip = self
            .tip
            .ok_or_else(|| ChainError::Corrupted("no tip to build on".into()))?;
        let parent = self.dag.require(&tip)?.header.clone();
        let ancestors = self.dag.ancestor_timestamps(&tip, self.params.median_span);
        let built = builder::assemble(
            &parent,
            &ancestors,
            self.utxos.clone(),
            self.kernels.clone(),
            pool,
            &self.params,
            &self.gens,
            &self.kdf,
            self.max_block_weight,
        )?;
        info!(
            height = built.header.height,
            fees = built.fees,
            kernels = built.body.kernels.len(),
            "assembled candidate block"
        );
        Ok(built)
    }

    fn persist_record(&mut self, txn: &mut StoreTxn, id: &BlockId) -> ChainResult<()> {
        let bytes = bincode::serialize(self.dag.require(id)?)?;
        txn.put(Family::States, block_key(id), bytes);
        Ok(())
    }

    /// Re-derive `reachable`/`functional` for the subtree under `start`
    /// after new data arrived, validating orphans against their now-known
    /// parents on first contact.
    fn refresh_flags_downward(&mut self, txn: &mut StoreTxn, start: &BlockId) -> ChainResult<()> {
        let mut stack = vec![*start];
        while let Some(parent_id) = stack.pop() {
            let parent = self.dag.require(&parent_id)?;
            let parent_flags = parent.flags;
            let children: Vec<BlockId> = self.dag.children_of(&parent_id.hash).to_vec();
            for child_id in children {
                let child = self.dag.require(&child_id)?;
                if child.flags.insane {
                    continue;
                }
                let child_header = child.header.clone();
                let child_peer = child.peer;
                let child_body = child.body;
                let old_flags = child.flags;

                if !parent_flags.insane
                    && self
                        .dag
                        .validate_against_parent(&child_header, &parent_id, &self.params)
                        .is_err()
                {
                    let child = self.dag.get_mut(&child_id).ok_or_else(|| {
                        ChainError::Corrupted("child vanished during refresh".into())
                    })?;
                    child.flags.insane = true;
                    child.flags.functional = false;
                    self.persist_record(txn, &child_id)?;
                    if let Some(peer) = child_peer {
                        self.pending.push(ChainEvent::PeerInsane(peer));
                    }
                    continue;
                }

                let mut new_flags = old_flags;
                new_flags.reachable = parent_flags.reachable && !parent_flags.insane;
                new_flags.functional = new_flags.reachable
                    && parent_flags.functional
                    && !parent_flags.insane
                    && child_body;
                if new_flags != old_flags {
                    let child = self.dag.get_mut(&child_id).ok_or_else(|| {
                        ChainError::Corrupted("child vanished during refresh".into())
                    })?;
                    child.flags = new_flags;
                    self.persist_record(txn, &child_id)?;
                    stack.push(child_id);
                }
            }
        }
        Ok(())
    }

    /// Chain selection: move the tip to the functional header with the most
    /// cumulative work, reverting and applying blocks as needed. Bad blocks
    /// are marked irreversibly, which bounds the number of restarts.
    fn try_go_up(&mut self, txn: &mut StoreTxn) -> ChainResult<()> {
        let start_tip = self.tip;
        loop {
            let Some(tip) = self.tip else {
                break;
            };
            let Some(best) = self.dag.best_functional() else {
                break;
            };
            if best == tip {
                break;
            }
            let fork = self.dag.common_ancestor(&best, &tip)?;

            if !self.can_rewind(txn, &fork, &tip)? {
                warn!(candidate = %best, "reorg would cross erased history; refusing");
                let peer = self.dag.require(&best)?.peer;
                self.mark_subtree_not_functional(txn, &best)?;
                if let Some(peer) = peer {
                    self.pending.push(ChainEvent::PeerInsane(peer));
                }
                continue;
            }

            self.rewind_to(txn, &fork)?;

            let mut path = Vec::new();
            let mut walker = best;
            while walker != fork {
                path.push(walker);
                walker = self
                    .dag
                    .require(&walker)?
                    .parent_id()
                    .ok_or_else(|| ChainError::Corrupted("forward path below genesis".into()))?;
            }
            path.reverse();

            let mut failed = None;
            for id in &path {
                match self.apply_block(txn, id)? {
                    Ok(()) => {}
                    Err(verdict) => {
                        failed = Some((*id, verdict));
                        break;
                    }
                }
            }
            match failed {
                None => break,
                Some((bad, verdict)) => {
                    warn!(block = %bad, %verdict, "block failed to apply; marking branch");
                    self.rewind_to(txn, &fork)?;
                    let peer = self.dag.require(&bad)?.peer;
                    self.mark_subtree_not_functional(txn, &bad)?;
                    if let Some(peer) = peer {
                        self.pending.push(ChainEvent::PeerInsane(peer));
                    }
                }
            }
        }

        if self.tip != start_tip {
            if let Some(tip) = self.tip {
                self.prune_old(txn, tip.height)?;
                info!(tip = %tip, "advanced to new tip");
                self.pending.push(ChainEvent::NewState(tip));
            }
        }
        Ok(())
    }

    /// Every block on the path tip→fork must still have its body and undo
    /// log; a reorg across fossil heights is refused.
    fn can_rewind(&self, txn: &StoreTxn, fork: &BlockId, tip: &BlockId) -> ChainResult<bool> {
        let mut cursor = *tip;
        while cursor != *fork {
            let record = self.dag.require(&cursor)?;
            if !record.body {
                return Ok(false);
            }
            if txn
                .get(&self.store, Family::Undo, &block_key(&cursor))?
                .is_none()
            {
                return Ok(false);
            }
            cursor = record
                .parent_id()
                .ok_or_else(|| ChainError::Corrupted("rewind walked past genesis".into()))?;
        }
        Ok(true)
    }

    fn rewind_to(&mut self, txn: &mut StoreTxn, fork: &BlockId) -> ChainResult<()> {
        while let Some(tip) = self.tip {
            if tip == *fork {
                break;
            }
            self.revert_block(txn, &tip)?;
        }
        Ok(())
    }

    fn mark_subtree_not_functional(&mut self, txn: &mut StoreTxn, root: &BlockId) -> ChainResult<()> {
        {
            let record = self
                .dag
                .get_mut(root)
                .ok_or_else(|| ChainError::Corrupted("marking unknown header".into()))?;
            record.flags.insane = true;
            record.flags.functional = false;
        }
        self.persist_record(txn, root)?;
        let mut stack = vec![*root];
        while let Some(parent) = stack.pop() {
            let children: Vec<BlockId> = self.dag.children_of(&parent.hash).to_vec();
            for child_id in children {
                let child = self.dag.get_mut(&child_id).ok_or_else(|| {
                    ChainError::Corrupted("child vanished during marking".into())
                })?;
                if child.flags.functional {
                    child.flags.functional = false;
                    self.persist_record(txn, &child_id)?;
                }
                stack.push(child_id);
            }
        }
        Ok(())
    }

    /// Forward apply. On a verdict failure the trees and the staged writes
    /// roll back to the pre-apply snapshot and the verdict is returned; the
    /// caller decides what to mark.
    fn apply_block(
        &mut self,
        txn: &mut StoreTxn,
        id: &BlockId,
    ) -> ChainResult<Result<(), BlockError>> {
        let header = self.dag.require(id)?.header.clone();
        let bytes = txn
            .get(&self.store, Family::Bodies, &block_key(id))?
            .ok_or_else(|| ChainError::Corrupted(format!("body for {id} missing")))?;
        let body: BlockBody = bincode::deserialize(&bytes)?;

        let utxo_snapshot = self.utxos.clone();
        let kernel_snapshot = self.kernels.clone();
        let savepoint = txn.savepoint();

        let verdict = self.apply_body(txn, &header, &body);
        match verdict {
            Ok(undo) => {
                txn.put(Family::Undo, block_key(id), bincode::serialize(&undo)?);
                {
                    let record = self.dag.get_mut(id).ok_or_else(|| {
                        ChainError::Corrupted("header vanished during apply".into())
                    })?;
                    record.flags.active = true;
                }
                self.persist_record(txn, id)?;
                self.tip = Some(*id);
                txn.put_tip(id)?;
                Ok(Ok(()))
            }
            Err(verdict) => {
                self.utxos = utxo_snapshot;
                self.kernels = kernel_snapshot;
                txn.rollback_to(savepoint);
                Ok(Err(verdict))
            }
        }
    }

    /// The six forward steps of the apply sequence; returns the undo log.
    fn apply_body(
        &mut self,
        txn: &mut StoreTxn,
        header: &BlockHeader,
        body: &BlockBody,
    ) -> Result<RollbackData, BlockError> {
        let height = header.height;
        let mut undo = RollbackData::default();

        for input in &body.inputs {
            if height < input.maturity {
                return Err(BlockError::Immature);
            }
            let prior = self.utxos.decrement(&input.commitment, input.maturity)?;
            self.mirror_utxo(txn, &input.commitment, input.maturity);
            undo.prior_multiplicities.push(prior);
        }

        for output in &body.outputs {
            if !crate::crypto::verify_range(&self.gens, &output.commitment, &output.range_proof) {
                return Err(BlockError::BadProof);
            }
            let maturity = output.maturity_at(height, self.params.coinbase_maturity);
            self.utxos.insert(&output.commitment, maturity);
            self.mirror_utxo(txn, &output.commitment, maturity);
        }

        for kernel in &body.kernels {
            if height < kernel.min_height {
                return Err(BlockError::KernelLocked);
            }
            if kernel.max_height < height {
                return Err(BlockError::KernelExpired);
            }
            if !kernel.verify(&self.gens) {
                return Err(BlockError::BadSignature);
            }
            let hash = kernel.kernel_hash();
            self.kernels.insert(&hash)?;
            txn.put(Family::Kernels, hash.to_vec(), Vec::new());
        }

        if !body.verify_balance(&self.gens, consensus::block_subsidy(height)) {
            return Err(BlockError::BadBalance);
        }

        if header.utxo_root != self.utxos.root() || header.kernel_root != self.kernels.root() {
            return Err(BlockError::BadRoots);
        }

        Ok(undo)
    }

    /// Reverse apply of the current tip block: the forward sequence read
    /// backward using the stored body and undo log. Failures here are never
    /// peer misbehavior, so they are all corruption.
    fn revert_block(&mut self, txn: &mut StoreTxn, id: &BlockId) -> ChainResult<()> {
        let record = self.dag.require(id)?;
        let header = record.header.clone();
        let parent_id = record
            .parent_id()
            .ok_or_else(|| ChainError::Corrupted("cannot revert genesis".into()))?;
        let bytes = txn
            .get(&self.store, Family::Bodies, &block_key(id))?
            .ok_or_else(|| ChainError::Corrupted(format!("body for {id} erased")))?;
        let body: BlockBody = bincode::deserialize(&bytes)?;
        let undo: RollbackData = match txn.get(&self.store, Family::Undo, &block_key(id))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => {
                return Err(ChainError::Corrupted(format!(
                    "undo log for {id} missing when required"
                )))
            }
        };
        if undo.prior_multiplicities.len() != body.inputs.len() {
            return Err(ChainError::Corrupted("undo log does not match body".into()));
        }

        for kernel in body.kernels.iter().rev() {
            let hash = kernel.kernel_hash();
            self.kernels
                .remove(&hash)
                .map_err(|_| ChainError::Corrupted("kernel missing on revert".into()))?;
            txn.delete(Family::Kernels, hash.to_vec());
        }

        for output in body.outputs.iter().rev() {
            let maturity = output.maturity_at(header.height, self.params.coinbase_maturity);
            self.utxos
                .decrement(&output.commitment, maturity)
                .map_err(|_| ChainError::Corrupted("output missing on revert".into()))?;
            self.mirror_utxo(txn, &output.commitment, maturity);
        }

        for (input, prior) in body
            .inputs
            .iter()
            .zip(undo.prior_multiplicities.iter())
            .rev()
        {
            self.utxos.restore(&input.commitment, input.maturity, *prior);
            self.mirror_utxo(txn, &input.commitment, input.maturity);
        }

        let parent_header = &self.dag.require(&parent_id)?.header;
        if parent_header.utxo_root != self.utxos.root()
            || parent_header.kernel_root != self.kernels.root()
        {
            return Err(ChainError::Corrupted(
                "trees do not match the parent header after revert".into(),
            ));
        }

        txn.delete(Family::Undo, block_key(id));
        {
            let record = self
                .dag
                .get_mut(id)
                .ok_or_else(|| ChainError::Corrupted("header vanished during revert".into()))?;
            record.flags.active = false;
        }
        self.persist_record(txn, id)?;
        self.tip = Some(parent_id);
        txn.put_tip(&parent_id)?;
        debug!(block = %id, "reverted block");
        Ok(())
    }

    /// Keep the persisted UTXO family in lock-step with the in-memory tree.
    fn mirror_utxo(
        &mut self,
        txn: &mut StoreTxn,
        commitment: &CompressedRistretto,
        maturity: u64,
    ) {
        let key = crate::utxo_tree::utxo_key(commitment, maturity);
        let count = self.utxos.multiplicity(commitment, maturity);
        if count == 0 {
            txn.delete(Family::Utxo, key);
        } else {
            txn.put(Family::Utxo, key, count.to_be_bytes().to_vec());
        }
    }

    /// Horizon maintenance after the tip moved to `tip_height`: forget stale
    /// branches below the branching horizon, erase bodies and free undo logs
    /// below the schwarzschild horizon.
    fn prune_old(&mut self, txn: &mut StoreTxn, tip_height: u64) -> ChainResult<()> {
        if self.horizon.branching > 0 {
            let bound = tip_height.saturating_sub(self.horizon.branching);
            let stale: Vec<BlockId> = self
                .dag
                .iter()
                .filter(|(id, record)| !record.flags.active && id.height <= bound)
                .map(|(id, _)| *id)
                .collect();
            for root in stale {
                if self.dag.contains(&root) {
                    self.delete_subtree(txn, &root)?;
                }
            }
        }

        if self.horizon.schwarzschild > 0 {
            let bound = tip_height.saturating_sub(self.horizon.schwarzschild);
            let fossils: Vec<BlockId> = self
                .dag
                .iter()
                .filter(|(id, record)| record.flags.active && record.body && id.height <= bound)
                .map(|(id, _)| *id)
                .collect();
            for id in fossils {
                self.dereference_fossil(txn, &id)?;
            }
        }
        Ok(())
    }

    /// Erase the body of a canonical block below the schwarzschild horizon;
    /// the header stays. The undo log has no remaining referent and is freed.
    fn dereference_fossil(&mut self, txn: &mut StoreTxn, id: &BlockId) -> ChainResult<()> {
        txn.delete(Family::Bodies, block_key(id));
        txn.delete(Family::Undo, block_key(id));
        {
            let record = self
                .dag
                .get_mut(id)
                .ok_or_else(|| ChainError::Corrupted("fossil header missing".into()))?;
            record.body = false;
        }
        self.persist_record(txn, id)?;
        debug!(block = %id, "erased fossil body");
        Ok(())
    }

    fn delete_subtree(&mut self, txn: &mut StoreTxn, root: &BlockId) -> ChainResult<()> {
        let mut stack = vec![*root];
        while let Some(id) = stack.pop() {
            if let Some(record) = self.dag.get(&id) {
                if record.flags.active {
                    return Err(ChainError::Corrupted(
                        "branch pruning reached the active chain".into(),
                    ));
                }
            } else {
                continue;
            }
            stack.extend(self.dag.children_of(&id.hash).iter().copied());
            self.dag.remove(&id);
            txn.delete(Family::States, block_key(&id));
            txn.delete(Family::Bodies, block_key(&id));
            txn.delete(Family::Undo, block_key(&id));
            debug!(block = %id, "pruned stale branch member");
        }
        Ok(())
    }

    fn flush_events(&mut self) {
        for event in std::mem::take(&mut self.pending) {
            match event {
                ChainEvent::RequestData {
                    id,
                    body,
                    preferred_peer,
                } => self
                    .events
                    .request_data(&id, body, preferred_peer.as_ref()),
                ChainEvent::PeerInsane(peer) => self.events.on_peer_insane(&peer),
                ChainEvent::NewState(tip) => self.events.on_new_state(&tip),
            }
        }
    }
}
