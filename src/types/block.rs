use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Generators, SchnorrSignature};

use super::Hash;

/// Reference to an unspent output: the commitment it was created under and
/// the maturity height the spender expects it to carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub commitment: CompressedRistretto,
    pub maturity: u64,
}

/// Confidential output: a Pedersen commitment with an attached range proof.
/// Coinbase outputs mature later than ordinary ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub commitment: CompressedRistretto,
    pub coinbase: bool,
    pub range_proof: Vec<u8>,
}

impl Output {
    pub fn maturity_at(&self, creation_height: u64, coinbase_maturity: u64) -> u64 {
        if self.coinbase {
            creation_height.saturating_add(coinbase_maturity)
        } else {
            creation_height
        }
    }
}

/// Optional hash-lock witness attached to a kernel. The image is part of the
/// kernel identity; the preimage is witness data revealed by the spender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLock {
    pub image: Hash,
    pub preimage: Vec<u8>,
}

impl HashLock {
    pub fn is_satisfied(&self) -> bool {
        crypto::hash_bytes(&self.preimage) == self.image
    }
}

/// Transaction kernel: the excess point proving the zero-sum of its
/// transaction, a signature by that excess, the fee, and validity bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    pub excess: CompressedRistretto,
    pub signature: SchnorrSignature,
    pub fee: u64,
    pub min_height: u64,
    pub max_height: u64,
    pub hash_lock: Option<HashLock>,
}

impl TxKernel {
    /// Kernel identity; also the message its signature commits to. Witness
    /// data (the signature itself, the revealed preimage) stays out.
    pub fn kernel_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"veil.kernel");
        hasher.update(self.excess.as_bytes());
        hasher.update(&self.fee.to_be_bytes());
        hasher.update(&self.min_height.to_be_bytes());
        hasher.update(&self.max_height.to_be_bytes());
        match &self.hash_lock {
            Some(lock) => {
                hasher.update(&[1]);
                hasher.update(&lock.image);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.finalize().into()
    }

    pub fn verify(&self, gens: &Generators) -> bool {
        if let Some(lock) = &self.hash_lock {
            if !lock.is_satisfied() {
                return false;
            }
        }
        crypto::verify_excess(gens, &self.excess, &self.kernel_hash(), &self.signature)
    }
}

/// Body of a block: what the apply engine feeds through the trees.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<TxKernel>,
}

impl BlockBody {
    pub fn total_fee(&self) -> u64 {
        self.kernels
            .iter()
            .fold(0u64, |acc, kernel| acc.saturating_add(kernel.fee))
    }

    pub fn weight(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }

    /// Block-level balance law: fees cancel between transactions and the
    /// coinbase, so only the subsidy remains on the input side.
    ///
    /// `Σ inputs + subsidy·B == Σ outputs + Σ kernel excess`
    pub fn verify_balance(&self, gens: &Generators, subsidy: u64) -> bool {
        let Some(inputs) = sum_points(self.inputs.iter().map(|input| &input.commitment)) else {
            return false;
        };
        let Some(outputs) = sum_points(self.outputs.iter().map(|output| &output.commitment))
        else {
            return false;
        };
        let Some(excesses) = sum_points(self.kernels.iter().map(|kernel| &kernel.excess)) else {
            return false;
        };
        inputs + gens.commit(subsidy, &Scalar::ZERO) == outputs + excesses
    }
}

pub(crate) fn sum_points<'a>(
    points: impl Iterator<Item = &'a CompressedRistretto>,
) -> Option<RistrettoPoint> {
    let mut acc = RistrettoPoint::identity();
    for point in points {
        acc += point.decompress()?;
    }
    Some(acc)
}
