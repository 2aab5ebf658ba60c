//! Authenticated multiset of unspent outputs.
//!
//! Keys concatenate the output commitment with its maturity height, so the
//! same commitment created at different maturities occupies distinct slots,
//! while identical (commitment, maturity) pairs share one leaf whose value is
//! a 32-bit multiplicity.

use curve25519_dalek::ristretto::CompressedRistretto;

use crate::errors::BlockError;
use crate::smt::{MerkleProof, SparseMerkleTree};
use crate::types::Hash;

pub fn utxo_key(commitment: &CompressedRistretto, maturity: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(commitment.as_bytes());
    key.extend_from_slice(&maturity.to_be_bytes());
    key
}

fn decode_multiplicity(value: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[derive(Clone, Default)]
pub struct UtxoTree {
    tree: SparseMerkleTree,
}

impl UtxoTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn multiplicity(&self, commitment: &CompressedRistretto, maturity: u64) -> u32 {
        self.tree
            .get(&utxo_key(commitment, maturity))
            .and_then(decode_multiplicity)
            .unwrap_or(0)
    }

    /// Add one unspent instance; returns the new multiplicity.
    pub fn insert(&mut self, commitment: &CompressedRistretto, maturity: u64) -> u32 {
        let key = utxo_key(commitment, maturity);
        let count = self
            .tree
            .get(&key)
            .and_then(decode_multiplicity)
            .unwrap_or(0)
            .saturating_add(1);
        self.tree.insert(&key, count.to_be_bytes().to_vec());
        count
    }

    /// Spend one instance; the leaf disappears at multiplicity zero. Returns
    /// the multiplicity found before the spend, which the undo log records.
    pub fn decrement(
        &mut self,
        commitment: &CompressedRistretto,
        maturity: u64,
    ) -> Result<u32, BlockError> {
        let key = utxo_key(commitment, maturity);
        let prior = self
            .tree
            .get(&key)
            .and_then(decode_multiplicity)
            .ok_or(BlockError::NoUnspent)?;
        if prior <= 1 {
            self.tree.remove(&key);
        } else {
            self.tree.insert(&key, (prior - 1).to_be_bytes().to_vec());
        }
        Ok(prior)
    }

    /// Put an entry back at an exact multiplicity (reverting a spend) or
    /// erase it (multiplicity zero, reverting an insert beyond its first).
    pub fn restore(&mut self, commitment: &CompressedRistretto, maturity: u64, multiplicity: u32) {
        let key = utxo_key(commitment, maturity);
        if multiplicity == 0 {
            self.tree.remove(&key);
        } else {
            self.tree
                .insert(&key, multiplicity.to_be_bytes().to_vec());
        }
    }

    pub fn prove(&self, commitment: &CompressedRistretto, maturity: u64) -> MerkleProof {
        self.tree.prove(&utxo_key(commitment, maturity))
    }

    /// Rehydrate one persisted leaf while rebuilding the tree on open.
    pub fn load_leaf(&mut self, key: &[u8], value: Vec<u8>) {
        self.tree.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitment(byte: u8) -> CompressedRistretto {
        CompressedRistretto([byte; 32])
    }

    #[test]
    fn duplicate_outputs_accumulate_multiplicity() {
        let mut tree = UtxoTree::new();
        let c = commitment(1);
        assert_eq!(tree.insert(&c, 5), 1);
        assert_eq!(tree.insert(&c, 5), 2);
        assert_eq!(tree.multiplicity(&c, 5), 2);
        // a different maturity is a different slot
        assert_eq!(tree.insert(&c, 6), 1);

        assert_eq!(tree.decrement(&c, 5), Ok(2));
        assert_eq!(tree.decrement(&c, 5), Ok(1));
        assert_eq!(tree.decrement(&c, 5), Err(BlockError::NoUnspent));
        assert_eq!(tree.multiplicity(&c, 6), 1);
    }

    #[test]
    fn decrement_then_restore_round_trips_the_root() {
        let mut tree = UtxoTree::new();
        let c = commitment(2);
        tree.insert(&c, 10);
        tree.insert(&c, 10);
        let before = tree.root();
        let prior = tree.decrement(&c, 10).expect("spend");
        assert_ne!(tree.root(), before);
        tree.restore(&c, 10, prior);
        assert_eq!(tree.root(), before);
    }

    #[test]
    fn spending_unknown_slot_fails() {
        let mut tree = UtxoTree::new();
        let c = commitment(3);
        tree.insert(&c, 4);
        assert_eq!(tree.decrement(&c, 5), Err(BlockError::NoUnspent));
        assert_eq!(tree.decrement(&commitment(4), 4), Err(BlockError::NoUnspent));
    }

    #[test]
    fn proofs_cover_multiplicity() {
        let mut tree = UtxoTree::new();
        let c = commitment(7);
        tree.insert(&c, 3);
        tree.insert(&c, 3);
        let proof = tree.prove(&c, 3);
        assert_eq!(proof.value, Some(2u32.to_be_bytes().to_vec()));
        assert!(crate::smt::SparseMerkleTree::verify_proof(
            &tree.root(),
            &proof
        ));
    }
}
