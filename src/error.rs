use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid action: {0}")]
    InvalidAction(&'static str),
    #[error("path error for {path:?}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("corrupt database: {0}")]
    CorruptDatabase(String),
    #[error("key ordering violation: timestamp {timestamp} is not within {skew_ms}ms above max {max_timestamp}")]
    KeyOrdering {
        timestamp: i64,
        max_timestamp: i64,
        skew_ms: i64,
    },
    #[error("key not found")]
    KeyNotFound,
    #[error("transaction has no terminating row yet")]
    TransactionActive,
    #[error("stored value failed to decode: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("operation on a tombstoned handle")]
    Tombstoned,
    #[error("file watcher: {0}")]
    Watcher(#[from] notify::Error),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptDatabase(msg.into())
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
