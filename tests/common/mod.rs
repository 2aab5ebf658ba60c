//! Shared harness: a processor over a temp store, a branch simulator that
//! mirrors the tree state of any fork, and wallet-style helpers for building
//! valid confidential transactions.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use curve25519_dalek::scalar::Scalar;
use tempfile::TempDir;

use veil_chain::builder;
use veil_chain::config::{GenesisConfig, HorizonConfig, NodeConfig};
use veil_chain::consensus::{self, ChainParams};
use veil_chain::crypto::{self, Generators, Kdf, KeyUsage};
use veil_chain::errors::ChainResult;
use veil_chain::kernel_tree::KernelTree;
use veil_chain::processor::{ChainEvents, NodeProcessor};
use veil_chain::types::{
    BlockBody, BlockHeader, BlockId, Input, Output, PeerId, Transaction, TxKernel,
};
use veil_chain::utxo_tree::UtxoTree;

pub const PEER: PeerId = [7u8; 32];

/// Observer that records every callback for assertions.
#[derive(Clone, Default)]
pub struct Recorder {
    pub insane_peers: Arc<Mutex<Vec<PeerId>>>,
    pub new_states: Arc<Mutex<Vec<BlockId>>>,
    pub requests: Arc<Mutex<Vec<(BlockId, bool)>>>,
}

impl ChainEvents for Recorder {
    fn request_data(&self, id: &BlockId, body: bool, _preferred_peer: Option<&PeerId>) {
        self.requests.lock().unwrap().push((*id, body));
    }

    fn on_peer_insane(&self, peer: &PeerId) {
        self.insane_peers.lock().unwrap().push(*peer);
    }

    fn on_new_state(&self, tip: &BlockId) {
        self.new_states.lock().unwrap().push(*tip);
    }
}

pub fn test_config(dir: &std::path::Path, horizon: HorizonConfig) -> NodeConfig {
    NodeConfig {
        data_dir: dir.join("node"),
        seed_path: dir.join("seed.toml"),
        block_interval_ms: 1_000,
        mempool_limit: 64,
        max_block_weight: 1 << 20,
        miner_attempts_per_tick: 64,
        mine_empty_blocks: false,
        horizon,
        genesis: GenesisConfig {
            chain_id: "veil-test".to_string(),
            base_bits: 0,
            timestamp: 1_000,
            coinbase_maturity: 2,
        },
    }
}

/// An output whose opening we know, so tests can spend it later.
#[derive(Clone)]
pub struct OwnedOutput {
    pub value: u64,
    pub blinding: Scalar,
    pub commitment: curve25519_dalek::ristretto::CompressedRistretto,
    pub maturity: u64,
}

impl OwnedOutput {
    pub fn as_input(&self) -> Input {
        Input {
            commitment: self.commitment,
            maturity: self.maturity,
        }
    }
}

/// Tree state of one fork, maintained outside the processor so tests can
/// compute valid roots for any branch they extend.
#[derive(Clone)]
pub struct Branch {
    pub header: BlockHeader,
    pub utxos: UtxoTree,
    pub kernels: KernelTree,
}

pub struct Harness {
    pub dir: TempDir,
    pub config: NodeConfig,
    pub params: ChainParams,
    pub gens: Generators,
    pub kdf: Kdf,
    pub recorder: Recorder,
    pub processor: NodeProcessor,
}

pub fn harness() -> Harness {
    harness_with_horizon(HorizonConfig::default())
}

pub fn harness_with_horizon(horizon: HorizonConfig) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(dir.path(), horizon);
    let params = ChainParams::for_genesis(&config.genesis);
    let kdf = Kdf::from_seed([42u8; 32]);
    let recorder = Recorder::default();
    let processor =
        NodeProcessor::initialize(&config, kdf.clone(), Box::new(recorder.clone()))
            .expect("initialize processor");
    Harness {
        dir,
        config,
        params,
        gens: Generators::new(),
        kdf,
        recorder,
        processor,
    }
}

impl Harness {
    /// Branch state right after genesis, including the spendable genesis
    /// coinbase (its blinding derives from the chain id alone).
    pub fn genesis_branch(&self) -> (Branch, OwnedOutput) {
        let (header, body) =
            builder::genesis_block(&self.config.genesis, &self.params, &self.gens)
                .expect("genesis block");
        let mut utxos = UtxoTree::new();
        let mut kernels = KernelTree::new();
        let coinbase = &body.outputs[0];
        let maturity = coinbase.maturity_at(0, self.params.coinbase_maturity);
        utxos.insert(&coinbase.commitment, maturity);
        kernels
            .insert(&body.kernels[0].kernel_hash())
            .expect("genesis kernel");

        let genesis_kdf =
            Kdf::from_seed(*blake3::hash(self.config.genesis.chain_id.as_bytes()).as_bytes());
        let owned = OwnedOutput {
            value: consensus::block_subsidy(0),
            blinding: genesis_kdf.derive(0, KeyUsage::Coinbase, 0),
            commitment: coinbase.commitment,
            maturity,
        };
        (
            Branch {
                header,
                utxos,
                kernels,
            },
            owned,
        )
    }

    /// Build a valid block extending `parent` with the given transactions.
    /// `salt` varies the coinbase derivation so sibling forks stay distinct.
    /// Returns the extended branch state, the serialized body, and the new
    /// coinbase opening.
    pub fn make_block(
        &self,
        parent: &Branch,
        txs: &[Transaction],
        salt: u32,
    ) -> (Branch, Vec<u8>, OwnedOutput) {
        let height = parent.header.height + 1;
        let mut utxos = parent.utxos.clone();
        let mut kernels = parent.kernels.clone();
        let mut body = BlockBody::default();
        let mut fees = 0u64;

        for tx in txs {
            for input in &tx.inputs {
                utxos
                    .decrement(&input.commitment, input.maturity)
                    .expect("test transaction spends a live output");
            }
            for output in &tx.outputs {
                utxos.insert(
                    &output.commitment,
                    output.maturity_at(height, self.params.coinbase_maturity),
                );
            }
            for kernel in &tx.kernels {
                kernels
                    .insert(&kernel.kernel_hash())
                    .expect("test kernel is fresh");
            }
            fees += tx.fee();
            body.inputs.extend(tx.inputs.iter().cloned());
            body.outputs.extend(tx.outputs.iter().cloned());
            body.kernels.extend(tx.kernels.iter().cloned());
        }

        let blinding = self.kdf.derive(height, KeyUsage::Coinbase, salt);
        let value = fees + consensus::block_subsidy(height);
        let (commitment, range_proof) =
            crypto::prove_range(&self.gens, value, &blinding).expect("coinbase proof");
        let coinbase = Output {
            commitment,
            coinbase: true,
            range_proof,
        };
        let maturity = coinbase.maturity_at(height, self.params.coinbase_maturity);
        utxos.insert(&coinbase.commitment, maturity);
        let kernel_key = -blinding;
        let mut kernel = TxKernel {
            excess: self.gens.excess(&kernel_key).compress(),
            signature: crypto::sign_excess(&self.gens, &kernel_key, &[0u8; 32]),
            fee: 0,
            min_height: height,
            max_height: u64::MAX,
            hash_lock: None,
        };
        kernel.signature =
            crypto::sign_excess(&self.gens, &kernel_key, &kernel.kernel_hash());
        kernels.insert(&kernel.kernel_hash()).expect("coinbase kernel");
        body.outputs.push(coinbase);
        body.kernels.push(kernel);

        let header = BlockHeader {
            height,
            previous_hash: parent.header.block_hash(),
            timestamp: parent.header.timestamp + 1,
            bits: self.params.base_bits,
            chain_work: parent
                .header
                .chain_work
                .saturating_add(consensus::work_for_bits(self.params.base_bits)),
            utxo_root: utxos.root(),
            kernel_root: kernels.root(),
            nonce: 0,
        };
        let bytes = bincode_serialize(&body);
        let owned = OwnedOutput {
            value,
            blinding,
            commitment,
            maturity,
        };
        (
            Branch {
                header,
                utxos,
                kernels,
            },
            bytes,
            owned,
        )
    }

    /// Feed a block through the public ingest path.
    pub fn ingest(&mut self, branch: &Branch, bytes: &[u8]) -> ChainResult<bool> {
        self.processor.on_state(&branch.header, &PEER)?;
        self.processor.on_block(&branch.header.id(), bytes, &PEER)
    }

    pub fn tip(&self) -> BlockId {
        self.processor.current_state().expect("tip")
    }
}

fn bincode_serialize(body: &BlockBody) -> Vec<u8> {
    bincode::serialize(body).expect("serialize body")
}

/// Build a balanced transaction spending `inputs` into `outputs` given as
/// (value, blinding) pairs; whatever value is left over is the fee.
pub fn transfer(
    gens: &Generators,
    inputs: &[&OwnedOutput],
    outputs: &[(u64, Scalar)],
    max_height: u64,
) -> (Transaction, Vec<OwnedOutput>) {
    let in_value: u64 = inputs.iter().map(|input| input.value).sum();
    let out_value: u64 = outputs.iter().map(|(value, _)| value).sum();
    assert!(in_value >= out_value, "transfer overspends");
    let fee = in_value - out_value;

    let tx_inputs: Vec<Input> = inputs.iter().map(|input| input.as_input()).collect();
    let mut tx_outputs = Vec::new();
    let mut owned = Vec::new();
    for (value, blinding) in outputs {
        let (commitment, range_proof) =
            crypto::prove_range(gens, *value, blinding).expect("range proof");
        tx_outputs.push(Output {
            commitment,
            coinbase: false,
            range_proof,
        });
        owned.push(OwnedOutput {
            value: *value,
            blinding: *blinding,
            commitment,
            // filled in by the caller once the creation height is known
            maturity: 0,
        });
    }

    let in_blind: Scalar = inputs.iter().map(|input| input.blinding).sum();
    let out_blind: Scalar = outputs.iter().map(|(_, blinding)| blinding).sum();
    let excess_key = in_blind - out_blind;
    let mut kernel = TxKernel {
        excess: gens.excess(&excess_key).compress(),
        signature: crypto::sign_excess(gens, &Scalar::ZERO, &[0u8; 32]),
        fee,
        min_height: 0,
        max_height,
        hash_lock: None,
    };
    kernel.signature = crypto::sign_excess(gens, &excess_key, &kernel.kernel_hash());

    (
        Transaction {
            inputs: tx_inputs,
            outputs: tx_outputs,
            kernels: vec![kernel],
        },
        owned,
    )
}
