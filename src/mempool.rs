//! Transaction pool ordered by profitability and by expiration height.
//!
//! One arena owns the transactions; two `BTreeSet` indices hold composite
//! keys into it. A transaction enters or leaves both indices together, so the
//! sets always describe the same population.

use std::collections::{BTreeSet, HashMap};
use std::cmp::Ordering;

use crate::crypto::Generators;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Hash, Transaction};

pub type TxId = Hash;

#[derive(Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub fee: u64,
    pub weight: u64,
    pub expiry: u64,
}

/// Profit ordering: fee per byte descending, compared by cross-multiplying
/// so no floats enter consensus-adjacent code; ties fall to the absolute fee,
/// then the transaction hash.
#[derive(Clone, PartialEq, Eq)]
struct ProfitKey {
    fee: u64,
    weight: u64,
    txid: TxId,
}

impl Ord for ProfitKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee as u128 * other.weight as u128;
        let rhs = other.fee as u128 * self.weight as u128;
        rhs.cmp(&lhs)
            .then_with(|| other.fee.cmp(&self.fee))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for ProfitKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryKey {
    expiry: u64,
    txid: TxId,
}

pub struct TxPool {
    gens: Generators,
    entries: HashMap<TxId, PoolEntry>,
    profit: BTreeSet<ProfitKey>,
    expiry: BTreeSet<ExpiryKey>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            gens: Generators::new(),
            entries: HashMap::new(),
            profit: BTreeSet::new(),
            expiry: BTreeSet::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    /// Admit a transaction after context-free validation. Chain-state checks
    /// (spendability, maturity) are the block builder's job.
    pub fn add_tx(&mut self, tx: Transaction) -> ChainResult<TxId> {
        tx.validate_context_free(&self.gens)?;
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(ChainError::Transaction("transaction already queued".into()));
        }
        if self.entries.len() >= self.capacity {
            return Err(ChainError::Transaction("mempool full".into()));
        }
        let entry = PoolEntry {
            fee: tx.fee(),
            weight: tx.weight() as u64,
            expiry: tx.expiry_bound(),
            tx,
        };
        self.profit.insert(ProfitKey {
            fee: entry.fee,
            weight: entry.weight,
            txid,
        });
        self.expiry.insert(ExpiryKey {
            expiry: entry.expiry,
            txid,
        });
        self.entries.insert(txid, entry);
        Ok(txid)
    }

    pub fn delete(&mut self, txid: &TxId) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        self.profit.remove(&ProfitKey {
            fee: entry.fee,
            weight: entry.weight,
            txid: *txid,
        });
        self.expiry.remove(&ExpiryKey {
            expiry: entry.expiry,
            txid: *txid,
        });
        Some(entry.tx)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.profit.clear();
        self.expiry.clear();
    }

    /// Evict every transaction that can no longer enter any block at or
    /// after `height`: one ordered walk from the low end of the expiry index.
    pub fn delete_out_of_bound(&mut self, height: u64) -> usize {
        let mut evicted = 0;
        while let Some(first) = self.expiry.first().cloned() {
            if first.expiry > height {
                break;
            }
            self.delete(&first.txid);
            evicted += 1;
        }
        evicted
    }

    /// Stream entries most-profitable-first.
    pub fn iter_profit(&self) -> impl Iterator<Item = &PoolEntry> {
        self.profit
            .iter()
            .filter_map(|key| self.entries.get(&key.txid))
    }

    #[cfg(test)]
    fn indices_agree(&self) -> bool {
        self.profit.len() == self.entries.len() && self.expiry.len() == self.entries.len()
    }
}
