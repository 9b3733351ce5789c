use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("serializer failure: {0}")]
    Serializer(String),
}

impl CacheError {
    /// Flattens an error into the form carried across task boundaries.
    ///
    /// Serializer work runs on background threads; failures there are
    /// recorded as strings on the affected page or transaction and handed
    /// back to every waiter.
    pub(crate) fn to_carried(&self) -> String {
        self.to_string()
    }
}
