mod block;
mod header;
mod transaction;

pub use block::{BlockBody, HashLock, Input, Output, TxKernel};
pub use header::{BlockHeader, BlockId};
pub use transaction::Transaction;

pub type Hash = [u8; 32];

/// Opaque identity of the peer that advertised a header or body.
pub type PeerId = [u8; 32];
