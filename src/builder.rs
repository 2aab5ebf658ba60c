//! Candidate-block assembly: stream the mempool by profitability into a
//! working snapshot of the tip state, close the block with a coinbase, and
//! hand the sealed-but-unmined header back to the caller.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::GenesisConfig;
use crate::consensus::{self, ChainParams};
use crate::crypto::{self, Generators, Kdf, KeyUsage};
use crate::errors::{BlockError, ChainResult};
use crate::kernel_tree::KernelTree;
use crate::mempool::TxPool;
use crate::types::{BlockBody, BlockHeader, Output, Transaction, TxKernel};
use crate::utxo_tree::UtxoTree;

/// Room kept for the coinbase output and kernel when filling to the cap.
const COINBASE_WEIGHT_RESERVE: usize = 1 << 10;

pub struct BuiltBlock {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub bytes: Vec<u8>,
    pub fees: u64,
    /// Pool transactions that made it in, for post-mining eviction.
    pub included: Vec<crate::mempool::TxId>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Move a transaction through the working trees at `height`. Kernel
/// signatures and range proofs were checked at admission; this replays only
/// the state transition the apply engine will later perform.
fn stage_transaction(
    utxos: &mut UtxoTree,
    kernels: &mut KernelTree,
    tx: &Transaction,
    height: u64,
) -> Result<(), BlockError> {
    if height < tx.min_unlock_height() {
        return Err(BlockError::KernelLocked);
    }
    if tx.expiry_bound() < height {
        return Err(BlockError::KernelExpired);
    }
    for input in &tx.inputs {
        if height < input.maturity {
            return Err(BlockError::Immature);
        }
        utxos.decrement(&input.commitment, input.maturity)?;
    }
    for output in &tx.outputs {
        utxos.insert(&output.commitment, output.maturity_at(height, 0));
    }
    for kernel in &tx.kernels {
        kernels.insert(&kernel.kernel_hash())?;
    }
    Ok(())
}

/// Cancel outputs that are spent within the same block against their
/// inputs. The apply engine walks all inputs before any output, so a body
/// must not reference state it creates itself; kernels always survive.
fn cut_through(body: &mut BlockBody, height: u64) {
    use std::collections::HashMap;

    // non-coinbase outputs all mature at the creation height
    let mut created: HashMap<[u8; 32], usize> = HashMap::new();
    for output in body.outputs.iter().filter(|output| !output.coinbase) {
        *created.entry(output.commitment.to_bytes()).or_insert(0) += 1;
    }

    let mut cancelled: HashMap<[u8; 32], usize> = HashMap::new();
    body.inputs.retain(|input| {
        if input.maturity != height {
            return true;
        }
        match created.get_mut(&input.commitment.to_bytes()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *cancelled.entry(input.commitment.to_bytes()).or_insert(0) += 1;
                false
            }
            _ => true,
        }
    });
    body.outputs.retain(|output| {
        if output.coinbase {
            return true;
        }
        match cancelled.get_mut(&output.commitment.to_bytes()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        }
    });
}

/// Coinbase output plus the kernel that closes the block's balance: the
/// kernel key is the negated coinbase blinding, so the pair contributes
/// exactly `(fees + subsidy)·B`.
fn coinbase_pair(
    gens: &Generators,
    kdf: &Kdf,
    height: u64,
    fees: u64,
) -> ChainResult<(Output, TxKernel)> {
    let blinding = kdf.derive(height, KeyUsage::Coinbase, 0);
    let value = fees.saturating_add(consensus::block_subsidy(height));
    let (commitment, range_proof) = crypto::prove_range(gens, value, &blinding)?;
    let output = Output {
        commitment,
        coinbase: true,
        range_proof,
    };
    let kernel_key = -blinding;
    let mut kernel = TxKernel {
        excess: gens.excess(&kernel_key).compress(),
        signature: crypto::sign_excess(gens, &kernel_key, &[0u8; 32]),
        fee: 0,
        min_height: height,
        max_height: u64::MAX,
        hash_lock: None,
    };
    kernel.signature = crypto::sign_excess(gens, &kernel_key, &kernel.kernel_hash());
    Ok((output, kernel))
}

/// Assemble a candidate on top of `parent`. The tree arguments are working
/// snapshots of the tip state and are thrown away afterwards; the block only
/// takes effect once it is mined and re-ingested.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble(
    parent: &BlockHeader,
    ancestor_timestamps: &[u64],
    mut utxos: UtxoTree,
    mut kernels: KernelTree,
    pool: &TxPool,
    params: &ChainParams,
    gens: &Generators,
    kdf: &Kdf,
    max_weight: usize,
) -> ChainResult<BuiltBlock> {
    let height = parent.height + 1;
    let mut body = BlockBody::default();
    let mut fees = 0u64;
    let mut weight = COINBASE_WEIGHT_RESERVE;
    let mut included = Vec::new();

    for entry in pool.iter_profit() {
        if weight + entry.weight as usize > max_weight {
            break;
        }
        let utxo_mark = utxos.clone();
        let kernel_mark = kernels.clone();
        if stage_transaction(&mut utxos, &mut kernels, &entry.tx, height).is_err() {
            utxos = utxo_mark;
            kernels = kernel_mark;
            continue;
        }
        weight += entry.weight as usize;
        fees = fees.saturating_add(entry.fee);
        included.push(entry.tx.txid());
        body.inputs.extend(entry.tx.inputs.iter().cloned());
        body.outputs.extend(entry.tx.outputs.iter().cloned());
        body.kernels.extend(entry.tx.kernels.iter().cloned());
    }

    cut_through(&mut body, height);

    let (coinbase, kernel) = coinbase_pair(gens, kdf, height, fees)?;
    utxos.insert(
        &coinbase.commitment,
        coinbase.maturity_at(height, params.coinbase_maturity),
    );
    kernels
        .insert(&kernel.kernel_hash())
        .map_err(|err| crate::errors::ChainError::Corrupted(format!(
            "coinbase kernel collision: {err}"
        )))?;
    body.outputs.push(coinbase);
    body.kernels.push(kernel);

    let median = consensus::median_time_past(ancestor_timestamps, params.median_span);
    let header = BlockHeader {
        height,
        previous_hash: parent.block_hash(),
        timestamp: unix_now().max(median + 1),
        bits: params.expected_bits(height),
        chain_work: parent
            .chain_work
            .saturating_add(consensus::work_for_bits(params.expected_bits(height))),
        utxo_root: utxos.root(),
        kernel_root: kernels.root(),
        nonce: 0,
    };
    let bytes = bincode::serialize(&body)?;
    Ok(BuiltBlock {
        header,
        body,
        bytes,
        fees,
        included,
    })
}

/// Deterministic empty-chain anchor. The coinbase blinding derives from the
/// chain id alone, so every node computes the identical genesis header.
pub fn genesis_block(
    genesis: &GenesisConfig,
    params: &ChainParams,
    gens: &Generators,
) -> ChainResult<(BlockHeader, BlockBody)> {
    let seed: [u8; 32] = blake3::hash(genesis.chain_id.as_bytes()).into();
    let kdf = Kdf::from_seed(seed);
    let (output, kernel) = coinbase_pair(gens, &kdf, 0, 0)?;

    let mut utxos = UtxoTree::new();
    let mut kernels = KernelTree::new();
    utxos.insert(
        &output.commitment,
        output.maturity_at(0, params.coinbase_maturity),
    );
    kernels
        .insert(&kernel.kernel_hash())
        .map_err(|err| crate::errors::ChainError::Corrupted(format!(
            "genesis kernel collision: {err}"
        )))?;

    let header = BlockHeader {
        height: 0,
        previous_hash: [0u8; 32],
        timestamp: genesis.timestamp,
        bits: genesis.base_bits,
        chain_work: 0,
        utxo_root: utxos.root(),
        kernel_root: kernels.root(),
        nonce: 0,
    };
    let body = BlockBody {
        inputs: Vec::new(),
        outputs: vec![output],
        kernels: vec![kernel],
    };
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_header_is_deterministic() {
        let genesis = GenesisConfig::default();
        let params = ChainParams::with_base_bits(genesis.base_bits);
        let gens = Generators::new();
        let (a, _) = genesis_block(&genesis, &params, &gens).expect("genesis");
        let (b, _) = genesis_block(&genesis, &params, &gens).expect("genesis");
        assert_eq!(a.block_hash(), b.block_hash());

        let other = GenesisConfig {
            chain_id: "veil-other".into(),
            ..GenesisConfig::default()
        };
        let (c, _) = genesis_block(&other, &params, &gens).expect("genesis");
        assert_ne!(a.block_hash(), c.block_hash());
    }

    #[test]
    fn genesis_body_balances() {
        let genesis = GenesisConfig::default();
        let params = ChainParams::with_base_bits(genesis.base_bits);
        let gens = Generators::new();
        let (_, body) = genesis_block(&genesis, &params, &gens).expect("genesis");
        assert!(body.verify_balance(&gens, consensus::block_subsidy(0)));
        assert!(body.kernels[0].verify(&gens));
    }
}
