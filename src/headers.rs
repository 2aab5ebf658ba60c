//! Header DAG: every known header keyed by (height, hash), with the flag
//! lattice that drives chain selection.
//!
//! `reachable`: the ancestor chain back to genesis is known as headers.
//! `functional`: bodies exist for the entire path back to genesis.
//! `active`: currently on the canonical chain reflected by the trees.
//! `insane`: failed validation; kept to avoid refetch loops, never selected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::consensus::{self, ChainParams};
use crate::errors::{ChainError, ChainResult};
use crate::types::{BlockHeader, BlockId, Hash, PeerId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags {
    pub reachable: bool,
    pub functional: bool,
    pub active: bool,
    pub insane: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateRecord {
    pub header: BlockHeader,
    pub flags: StateFlags,
    pub body: bool,
    pub peer: Option<PeerId>,
}

impl StateRecord {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn parent_id(&self) -> Option<BlockId> {
        if self.header.height == 0 {
            return None;
        }
        Some(BlockId {
            height: self.header.height - 1,
            hash: self.header.previous_hash,
        })
    }
}

/// Why a header was rejected as insane. Mapped to peer flagging upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRejection {
    BadPow,
    WrongDifficulty,
    TimestampOutOfRange,
    BadHeight,
    BadChainWork,
    TimestampBeforeMedian,
}

#[derive(Default)]
pub struct HeaderDag {
    records: HashMap<BlockId, StateRecord>,
    children: HashMap<Hash, Vec<BlockId>>,
}

impl HeaderDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &BlockId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &BlockId) -> Option<&mut StateRecord> {
        self.records.get_mut(id)
    }

    pub fn require(&self, id: &BlockId) -> ChainResult<&StateRecord> {
        self.records
            .get(id)
            .ok_or_else(|| ChainError::Corrupted(format!("header {id} missing from the DAG")))
    }

    pub fn insert(&mut self, record: StateRecord) {
        let id = record.id();
        self.children
            .entry(record.header.previous_hash)
            .or_default()
            .push(id);
        self.records.insert(id, record);
    }

    pub fn remove(&mut self, id: &BlockId) -> Option<StateRecord> {
        let record = self.records.remove(id)?;
        if let Some(siblings) = self.children.get_mut(&record.header.previous_hash) {
            siblings.retain(|child| child != id);
            if siblings.is_empty() {
                self.children.remove(&record.header.previous_hash);
            }
        }
        Some(record)
    }

    pub fn children_of(&self, hash: &Hash) -> &[BlockId] {
        self.children
            .get(hash)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &StateRecord)> {
        self.records.iter()
    }

    pub fn parent_of(&self, id: &BlockId) -> Option<&StateRecord> {
        let record = self.records.get(id)?;
        self.records.get(&record.parent_id()?)
    }

    /// Functional header with maximum cumulative work; equal work breaks
    /// toward the lexicographically lower hash so every node agrees.
    pub fn best_functional(&self) -> Option<BlockId> {
        let mut best: Option<(&BlockId, &StateRecord)> = None;
        for (id, record) in &self.records {
            if !record.flags.functional || record.flags.insane {
                continue;
            }
            best = match best {
                None => Some((id, record)),
                Some((best_id, best_record)) => {
                    let work = record.header.chain_work;
                    let best_work = best_record.header.chain_work;
                    if work > best_work || (work == best_work && id.hash < best_id.hash) {
                        Some((id, record))
                    } else {
                        Some((best_id, best_record))
                    }
                }
            };
        }
        best.map(|(id, _)| *id)
    }

    /// Lowest common ancestor of two headers along parent links.
    pub fn common_ancestor(&self, a: &BlockId, b: &BlockId) -> ChainResult<BlockId> {
        let mut a = *a;
        let mut b = *b;
        while a.height > b.height {
            a = self
                .require(&a)?
                .parent_id()
                .ok_or_else(|| ChainError::Corrupted("walked past genesis".into()))?;
        }
        while b.height > a.height {
            b = self
                .require(&b)?
                .parent_id()
                .ok_or_else(|| ChainError::Corrupted("walked past genesis".into()))?;
        }
        while a != b {
            a = self
                .require(&a)?
                .parent_id()
                .ok_or_else(|| ChainError::Corrupted("forks share no ancestor".into()))?;
            b = self
                .require(&b)?
                .parent_id()
                .ok_or_else(|| ChainError::Corrupted("forks share no ancestor".into()))?;
        }
        Ok(a)
    }

    /// Timestamps of up to `span` ancestors starting at `id`, tip-first.
    pub fn ancestor_timestamps(&self, id: &BlockId, span: usize) -> Vec<u64> {
        let mut timestamps = Vec::with_capacity(span);
        let mut cursor = Some(*id);
        while let Some(current) = cursor {
            if timestamps.len() == span {
                break;
            }
            let Some(record) = self.records.get(&current) else {
                break;
            };
            timestamps.push(record.header.timestamp);
            cursor = record.parent_id();
        }
        timestamps
    }

    /// Checks that need nothing but the header itself.
    pub fn validate_self(
        header: &BlockHeader,
        params: &ChainParams,
        now: u64,
    ) -> Result<(), HeaderRejection> {
        if header.height > 0 {
            if header.bits != params.expected_bits(header.height) {
                return Err(HeaderRejection::WrongDifficulty);
            }
            if !consensus::pow_meets_target(&header.pow_digest(), header.bits) {
                return Err(HeaderRejection::BadPow);
            }
        }
        if header.timestamp > now.saturating_add(params.max_drift_secs) {
            return Err(HeaderRejection::TimestampOutOfRange);
        }
        Ok(())
    }

    /// Checks that need the parent chain: height step, declared cumulative
    /// work, and the past-median timestamp rule.
    pub fn validate_against_parent(
        &self,
        header: &BlockHeader,
        parent: &BlockId,
        params: &ChainParams,
    ) -> Result<(), HeaderRejection> {
        let Some(parent_record) = self.records.get(parent) else {
            return Err(HeaderRejection::BadHeight);
        };
        if header.height != parent_record.header.height + 1 {
            return Err(HeaderRejection::BadHeight);
        }
        let expected_work = parent_record
            .header
            .chain_work
            .saturating_add(consensus::work_for_bits(header.bits));
        if header.chain_work != expected_work {
            return Err(HeaderRejection::BadChainWork);
        }
        let ancestors = self.ancestor_timestamps(parent, params.median_span);
        let median = consensus::median_time_past(&ancestors, params.median_span);
        if header.timestamp <= median {
            return Err(HeaderRejection::TimestampBeforeMedian);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, previous_hash: Hash, chain_work: u128, timestamp: u64) -> BlockHeader {
        BlockHeader {
            height,
            previous_hash,
            timestamp,
            bits: 0,
            chain_work,
            utxo_root: [0u8; 32],
            kernel_root: [0u8; 32],
            nonce: 0,
        }
    }

    fn record(header: BlockHeader, functional: bool) -> StateRecord {
        StateRecord {
            header,
            flags: StateFlags {
                reachable: true,
                functional,
                active: false,
                insane: false,
            },
            body: functional,
            peer: None,
        }
    }

    #[test]
    fn best_functional_prefers_work_then_lower_hash() {
        let mut dag = HeaderDag::new();
        let genesis = header(0, [0u8; 32], 0, 1);
        let genesis_hash = genesis.block_hash();
        dag.insert(record(genesis, true));

        let light = header(1, genesis_hash, 1, 2);
        let heavy = header(1, genesis_hash, 2, 3);
        let heavy_id = heavy.id();
        dag.insert(record(light, true));
        dag.insert(record(heavy, true));
        assert_eq!(dag.best_functional(), Some(heavy_id));

        // two functional tips with equal work: the lower hash wins
        let a = header(2, heavy_id.hash, 3, 4);
        let b = header(2, heavy_id.hash, 3, 5);
        let (a_id, b_id) = (a.id(), b.id());
        dag.insert(record(a, true));
        dag.insert(record(b, true));
        let winner = dag.best_functional().expect("winner");
        assert_eq!(winner.hash, a_id.hash.min(b_id.hash));
    }

    #[test]
    fn non_functional_and_insane_are_never_selected() {
        let mut dag = HeaderDag::new();
        let genesis = header(0, [0u8; 32], 0, 1);
        let genesis_id = genesis.id();
        dag.insert(record(genesis, true));

        let orphan = header(1, genesis_id.hash, 10, 2);
        dag.insert(record(orphan.clone(), false));
        assert_eq!(dag.best_functional(), Some(genesis_id));

        let mut bad = record(header(1, genesis_id.hash, 20, 3), true);
        bad.flags.insane = true;
        dag.insert(bad);
        assert_eq!(dag.best_functional(), Some(genesis_id));
    }

    #[test]
    fn common_ancestor_finds_the_fork_point() {
        let mut dag = HeaderDag::new();
        let genesis = header(0, [0u8; 32], 0, 1);
        let genesis_id = genesis.id();
        dag.insert(record(genesis, true));

        let shared = header(1, genesis_id.hash, 1, 2);
        let shared_id = shared.id();
        dag.insert(record(shared, true));

        let left = header(2, shared_id.hash, 2, 3);
        let left_id = left.id();
        dag.insert(record(left, true));

        let right = header(2, shared_id.hash, 2, 4);
        let right_tip = header(3, right.id().hash, 3, 5);
        let right_tip_id = right_tip.id();
        dag.insert(record(right, true));
        dag.insert(record(right_tip, true));

        assert_eq!(
            dag.common_ancestor(&left_id, &right_tip_id).expect("lca"),
            shared_id
        );
        assert_eq!(
            dag.common_ancestor(&left_id, &left_id).expect("lca"),
            left_id
        );
    }

    #[test]
    fn children_index_follows_removal() {
        let mut dag = HeaderDag::new();
        let genesis = header(0, [0u8; 32], 0, 1);
        let genesis_id = genesis.id();
        dag.insert(record(genesis, true));
        let child = header(1, genesis_id.hash, 1, 2);
        let child_id = child.id();
        dag.insert(record(child, false));

        assert_eq!(dag.children_of(&genesis_id.hash), &[child_id]);
        dag.remove(&child_id);
        assert!(dag.children_of(&genesis_id.hash).is_empty());
    }

    #[test]
    fn parent_checks_catch_bad_work_and_time() {
        let params = ChainParams::default();
        let mut dag = HeaderDag::new();
        let genesis = header(0, [0u8; 32], 0, 100);
        let genesis_id = genesis.id();
        dag.insert(record(genesis, true));

        let good = header(1, genesis_id.hash, 1, 101);
        assert_eq!(
            dag.validate_against_parent(&good, &genesis_id, &params),
            Ok(())
        );

        let wrong_work = header(1, genesis_id.hash, 5, 101);
        assert_eq!(
            dag.validate_against_parent(&wrong_work, &genesis_id, &params),
            Err(HeaderRejection::BadChainWork)
        );

        let too_old = header(1, genesis_id.hash, 1, 100);
        assert_eq!(
            dag.validate_against_parent(&too_old, &genesis_id, &params),
            Err(HeaderRejection::TimestampBeforeMedian)
        );

        let wrong_height = header(2, genesis_id.hash, 1, 101);
        assert_eq!(
            dag.validate_against_parent(&wrong_height, &genesis_id, &params),
            Err(HeaderRejection::BadHeight)
        );
    }
}
