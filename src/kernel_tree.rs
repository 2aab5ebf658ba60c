//! Authenticated set of transaction kernels, keyed by kernel hash.

use crate::errors::BlockError;
use crate::smt::{MerkleProof, SparseMerkleTree};
use crate::types::Hash;

#[derive(Clone, Default)]
pub struct KernelTree {
    tree: SparseMerkleTree,
}

impl KernelTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn contains(&self, kernel_hash: &Hash) -> bool {
        self.tree.get(kernel_hash).is_some()
    }

    pub fn insert(&mut self, kernel_hash: &Hash) -> Result<(), BlockError> {
        if self.contains(kernel_hash) {
            return Err(BlockError::Duplicate);
        }
        self.tree.insert(kernel_hash, Vec::new());
        Ok(())
    }

    pub fn remove(&mut self, kernel_hash: &Hash) -> Result<(), BlockError> {
        self.tree
            .remove(kernel_hash)
            .map(|_| ())
            .ok_or(BlockError::NotFound)
    }

    pub fn prove(&self, kernel_hash: &Hash) -> MerkleProof {
        self.tree.prove(kernel_hash)
    }

    /// Rehydrate one persisted leaf while rebuilding the tree on open.
    pub fn load_leaf(&mut self, key: &[u8]) {
        self.tree.insert(key, Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_semantics() {
        let mut tree = KernelTree::new();
        let empty = tree.root();
        let k = [1u8; 32];
        assert_eq!(tree.insert(&k), Ok(()));
        assert_eq!(tree.insert(&k), Err(BlockError::Duplicate));
        assert!(tree.contains(&k));
        assert_eq!(tree.remove(&k), Ok(()));
        assert_eq!(tree.remove(&k), Err(BlockError::NotFound));
        assert_eq!(tree.root(), empty);
    }
}
