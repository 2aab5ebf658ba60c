use std::fmt;

use serde::{Deserialize, Serialize};

use super::Hash;

/// Full block header. Identity is the blake3 digest of the canonical
/// serialization; the pre-PoW digest zeroes the nonce so miners grind over a
/// stable prefix, while the final block hash commits to the found nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Hash,
    pub timestamp: u64,
    pub bits: u32,
    pub chain_work: u128,
    pub utxo_root: Hash,
    pub kernel_root: Hash,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serializing block header")
    }

    /// Digest of the header with the nonce zeroed; the PoW input.
    pub fn pre_pow_hash(&self) -> Hash {
        let mut unsealed = self.clone();
        unsealed.nonce = 0;
        blake3::hash(&unsealed.canonical_bytes()).into()
    }

    /// Digest the proof-of-work target is checked against.
    pub fn pow_digest(&self) -> Hash {
        Self::pow_digest_parts(&self.pre_pow_hash(), self.nonce)
    }

    /// Same digest from a precomputed prefix; what the miner grinds over.
    pub fn pow_digest_parts(pre_pow: &Hash, nonce: u64) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(pre_pow);
        hasher.update(&nonce.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn block_hash(&self) -> Hash {
        blake3::hash(&self.canonical_bytes()).into()
    }

    pub fn id(&self) -> BlockId {
        BlockId {
            height: self.height,
            hash: self.block_hash(),
        }
    }

    /// Combined digest of the two tree roots; what external observers
    /// authenticate the live state against.
    pub fn live_root(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.utxo_root);
        hasher.update(&self.kernel_root);
        hasher.finalize().into()
    }
}

/// Stable identity of a header in the DAG: height plus block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub height: u64,
    pub hash: Hash,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, &hex::encode(self.hash)[..12])
    }
}
