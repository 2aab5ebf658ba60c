use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("database schema version {found} requires migration to {required}")]
    MigrationRequired { found: u32, required: u32 },
    #[error("state corrupted: {0}")]
    Corrupted(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Verdict raised while applying a single block. These are recoverable at the
/// chain level: the offending header is marked not-functional and selection
/// moves on, so they deliberately do not convert into [`ChainError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("input spends an unknown or exhausted output")]
    NoUnspent,
    #[error("input spends an output before its maturity height")]
    Immature,
    #[error("malformed input")]
    BadInput,
    #[error("kernel already present")]
    Duplicate,
    #[error("kernel not present")]
    NotFound,
    #[error("output range proof invalid")]
    BadProof,
    #[error("kernel signature or witness invalid")]
    BadSignature,
    #[error("kernel locked until a later height")]
    KernelLocked,
    #[error("kernel valid only until an earlier height")]
    KernelExpired,
    #[error("block does not satisfy the balance equation")]
    BadBalance,
    #[error("declared roots do not match the recomputed trees")]
    BadRoots,
}
