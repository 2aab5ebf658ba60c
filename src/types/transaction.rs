use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Generators};
use crate::errors::{ChainError, ChainResult};

use super::block::{sum_points, Input, Output, TxKernel};
use super::Hash;

/// A transaction is structurally a block body without a coinbase: inputs,
/// outputs and kernels that must balance against the declared fees alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<TxKernel>,
}

impl Transaction {
    pub fn txid(&self) -> Hash {
        blake3::hash(&bincode::serialize(self).expect("serializing transaction")).into()
    }

    pub fn fee(&self) -> u64 {
        self.kernels
            .iter()
            .fold(0u64, |acc, kernel| acc.saturating_add(kernel.fee))
    }

    pub fn weight(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }

    /// Height past which the transaction can never enter a block: the
    /// tightest kernel upper bound.
    pub fn expiry_bound(&self) -> u64 {
        self.kernels
            .iter()
            .map(|kernel| kernel.max_height)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Earliest height at which every kernel is unlocked.
    pub fn min_unlock_height(&self) -> u64 {
        self.kernels
            .iter()
            .map(|kernel| kernel.min_height)
            .max()
            .unwrap_or(0)
    }

    /// Transaction-level balance law, chain state ignored:
    ///
    /// `Σ inputs == Σ outputs + fee·B + Σ kernel excess`
    pub fn verify_balance(&self, gens: &Generators) -> bool {
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
        let fee_point = if self.fee() == 0 {
            RistrettoPoint::identity()
        } else {
            gens.commit(self.fee(), &curve25519_dalek::Scalar::ZERO)
        };
        inputs == outputs + fee_point + excesses
    }

    /// Context-free admission check: structure, proofs, signatures and the
    /// balance law. Nothing here depends on chain state.
    pub fn validate_context_free(&self, gens: &Generators) -> ChainResult<()> {
        if self.kernels.is_empty() {
            return Err(ChainError::Transaction("transaction has no kernels".into()));
        }
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return Err(ChainError::Transaction(
                "transaction moves no outputs".into(),
            ));
        }
        if self.min_unlock_height() > self.expiry_bound() {
            return Err(ChainError::Transaction(
                "kernel lock heights exclude every block".into(),
            ));
        }
        for kernel in &self.kernels {
            if !kernel.verify(gens) {
                return Err(ChainError::Transaction(
                    "kernel signature or hash lock invalid".into(),
                ));
            }
        }
        for output in &self.outputs {
            if output.coinbase {
                return Err(ChainError::Transaction(
                    "coinbase outputs are miner-only".into(),
                ));
            }
            if !crypto::verify_range(gens, &output.commitment, &output.range_proof) {
                return Err(ChainError::Transaction("range proof invalid".into()));
            }
        }
        if !self.verify_balance(gens) {
            return Err(ChainError::Transaction(
                "transaction does not balance".into(),
            ));
        }
        Ok(())
    }
}
