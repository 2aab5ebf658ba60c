//! Runtime wrapper: owns the processor and the mempool, drives local block
//! production on a timer, and feeds mined blocks back through the same
//! ingest path peers use.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::consensus;
use crate::crypto::Kdf;
use crate::errors::{ChainError, ChainResult};
use crate::mempool::{TxId, TxPool};
use crate::processor::{ChainEvents, NodeProcessor};
use crate::sync::CongestionPlan;
use crate::types::{BlockHeader, BlockId, PeerId, Transaction};

/// Peer id used when the node ingests its own blocks.
const LOCAL_PEER: PeerId = [0u8; 32];

/// Observer that surfaces core callbacks into the log; the peer layer
/// replaces this when one is attached.
struct LogEvents;

impl ChainEvents for LogEvents {
    fn request_data(&self, id: &BlockId, body: bool, preferred_peer: Option<&PeerId>) {
        debug!(
            %id,
            body,
            has_preference = preferred_peer.is_some(),
            "requesting missing data"
        );
    }

    fn on_peer_insane(&self, peer: &PeerId) {
        warn!(peer = %hex::encode(peer), "peer supplied insane data");
    }

    fn on_new_state(&self, tip: &BlockId) {
        info!(%tip, "new chain tip");
    }
}

pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    processor: RwLock<NodeProcessor>,
    pool: RwLock<TxPool>,
    block_interval: Duration,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let kdf = Kdf::load_or_generate(&config.seed_path)?;
        let processor = NodeProcessor::initialize(&config, kdf, Box::new(LogEvents))?;
        let pool = TxPool::new(config.mempool_limit);
        let inner = Arc::new(NodeInner {
            block_interval: Duration::from_millis(config.block_interval_ms),
            config,
            processor: RwLock::new(processor),
            pool: RwLock::new(pool),
        });
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    pub async fn start(self) -> ChainResult<()> {
        self.inner.run().await
    }
}

impl NodeHandle {
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<TxId> {
        self.inner.pool.write().add_tx(tx)
    }

    pub fn current_state(&self) -> Option<BlockId> {
        self.inner.processor.read().current_state()
    }

    pub fn current_header(&self) -> Option<BlockHeader> {
        self.inner.processor.read().current_header().cloned()
    }

    pub fn congestions(&self) -> CongestionPlan {
        self.inner.processor.write().enum_congestions()
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.pool.read().len()
    }
}

impl NodeInner {
    async fn run(self: Arc<Self>) -> ChainResult<()> {
        info!(
            interval_ms = self.block_interval.as_millis() as u64,
            "starting block production loop"
        );
        let mut ticker = time::interval(self.block_interval);
        loop {
            ticker.tick().await;
            match self.produce_block() {
                Ok(()) => {}
                Err(err @ ChainError::Corrupted(_)) => {
                    // no recovery from a corrupted store; bail out
                    return Err(err);
                }
                Err(err) => warn!(?err, "block production failed"),
            }
        }
    }

    fn produce_block(&self) -> ChainResult<()> {
        let mut processor = self.processor.write();
        let mut pool = self.pool.write();

        if let Some(tip) = processor.current_state() {
            let expired = pool.delete_out_of_bound(tip.height);
            if expired > 0 {
                debug!(expired, "evicted expired transactions");
            }
        }
        if pool.is_empty() && !self.config.mine_empty_blocks {
            return Ok(());
        }

        let built = processor.generate_block(&pool)?;
        let mut header = built.header.clone();
        let Some(nonce) = mine(&header, self.config.miner_attempts_per_tick) else {
            debug!(height = header.height, "no nonce found this tick");
            return Ok(());
        };
        header.nonce = nonce;

        let id = header.id();
        processor.on_state(&header, &LOCAL_PEER)?;
        let dirty = processor.on_block(&id, &built.bytes, &LOCAL_PEER)?;
        if !dirty {
            warn!(block = %id, "locally mined block was not accepted");
            return Ok(());
        }
        for txid in &built.included {
            pool.delete(txid);
        }
        info!(block = %id, fees = built.fees, "mined block");
        Ok(())
    }
}

/// Bounded proof-of-work search from a random starting nonce.
fn mine(header: &BlockHeader, attempts: u64) -> Option<u64> {
    let pre_pow = header.pre_pow_hash();
    let start: u64 = rand::thread_rng().gen();
    for step in 0..attempts {
        let nonce = start.wrapping_add(step);
        let digest = BlockHeader::pow_digest_parts(&pre_pow, nonce);
        if consensus::pow_meets_target(&digest, header.bits) {
            return Some(nonce);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mining_finds_a_nonce_for_trivial_targets() {
        let header = BlockHeader {
            height: 1,
            previous_hash: [0u8; 32],
            timestamp: 1,
            bits: 0,
            chain_work: 1,
            utxo_root: [0u8; 32],
            kernel_root: [0u8; 32],
            nonce: 0,
        };
        assert!(mine(&header, 1).is_some());

        let mut hard = header;
        hard.bits = 8;
        if let Some(nonce) = mine(&hard, 4096) {
            hard.nonce = nonce;
            assert!(consensus::pow_meets_target(&hard.pow_digest(), hard.bits));
        }
    }
}
