//! Chain-state core for a confidential UTXO blockchain node.
//!
//! The [`processor::NodeProcessor`] owns the authenticated state: a UTXO
//! commitment tree with multiplicity, a kernel commitment tree, the header
//! DAG with fork tracking, and the undo-logged apply/revert engine that moves
//! the canonical tip. [`mempool::TxPool`] and [`builder`] assemble candidate
//! blocks on top of it, [`sync`] plans requests for missing data, and
//! [`node::Node`] wraps the whole core in a tokio-driven production loop.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap a
//! node and [`node::Node`]/[`node::NodeHandle`] to operate it; the processor
//! is also usable directly for embedding and testing.

pub mod builder;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod headers;
pub mod kernel_tree;
pub mod mempool;
pub mod node;
pub mod processor;
pub mod smt;
pub mod storage;
pub mod sync;
pub mod types;
pub mod utxo_tree;
