use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("marshalling error: {0}")]
    Marshalling(String),
    #[error("transaction rejected: {0}")]
    TransactionRejected(String),
    #[error("unknown reference: {0}")]
    UnknownReference(String),
    #[error("timed out waiting for the response of {0}")]
    PollTimeout(String),
    #[error("node error: {0}")]
    Node(String),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    pub fn rejected(message: impl Into<String>) -> Self {
        ChainError::TransactionRejected(message.into())
    }

    pub fn marshalling(message: impl Into<String>) -> Self {
        ChainError::Marshalling(message.into())
    }
}
