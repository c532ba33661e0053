use crate::db_types::EncodingError;
use crate::{Family, Identity};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to initialize: {0}")]
    InitError(String),
    #[error("DB seems to be in a bad state: {0}")]
    BadStateError(String),
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
    #[error("Fjall error")]
    FjallError(#[from] fjall::Error),
    #[error("Bytes encoding error")]
    EncodingError(#[from] EncodingError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    /// sticky: once a stream sees this it keeps returning it
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("frontier for {identity}/{family} did not move after {rounds} rounds")]
    NoProgress {
        identity: Identity,
        family: Family,
        rounds: usize,
    },
}

impl From<StorageError> for StreamError {
    fn from(e: StorageError) -> Self {
        StreamError::StoreUnavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
    #[error("stream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("stream lock was poisoned")]
    Poisoned,
}
