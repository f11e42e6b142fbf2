//! Error taxonomy for the synchronization engine.
//!
//! Adapter-level errors (`CrdtError`, `StoreError`, `PubSubError`,
//! `ProtocolError`) convert into the caller-facing [`SyncError`] so that
//! replica and node operations can propagate them with `?`.

use std::time::Duration;

use crate::protocol::{DocumentId, ProtocolError};

/// Errors raised by a CRDT adapter.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// Change set bytes could not be decoded
    Decode(String),
    /// Decoded change set could not be integrated
    Apply(String),
    /// The mutator could not be applied to the document
    Mutation(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Change decode error: {e}"),
            Self::Apply(e) => write!(f, "Change apply error: {e}"),
            Self::Mutation(e) => write!(f, "Mutation error: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}

impl From<yrs::encoding::read::Error> for CrdtError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CrdtError::Decode(e.to_string())
    }
}

/// Content store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// LZ4 compression or decompression failed
    Compression(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Stored bytes do not hash to their key
    Corrupted(String),
    /// The store cannot serve requests right now
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Corrupted(e) => write!(f, "Corrupted blob: {e}"),
            Self::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Publish/subscribe adapter errors.
#[derive(Debug, Clone)]
pub enum PubSubError {
    /// Transport is not connected
    NotConnected,
    /// No subscription exists for the topic
    NotSubscribed(String),
    /// Frame encoding or decoding failed
    Protocol(ProtocolError),
    /// Underlying transport I/O failure
    Io(String),
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Pubsub transport not connected"),
            Self::NotSubscribed(topic) => write!(f, "Not subscribed to topic {topic}"),
            Self::Protocol(e) => write!(f, "Pubsub protocol error: {e}"),
            Self::Io(e) => write!(f, "Pubsub I/O error: {e}"),
        }
    }
}

impl std::error::Error for PubSubError {}

impl From<ProtocolError> for PubSubError {
    fn from(e: ProtocolError) -> Self {
        PubSubError::Protocol(e)
    }
}

/// Errors surfaced to callers of the replica and node APIs.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// No replica is open under this document id
    NotOpen(DocumentId),
    /// The replica has been closed
    Closed(DocumentId),
    Crdt(CrdtError),
    Store(StoreError),
    PubSub(PubSubError),
    Protocol(ProtocolError),
    /// An adapter call did not complete in time
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOpen(id) => write!(f, "Document {id} is not open"),
            Self::Closed(id) => write!(f, "Document {id} has been closed"),
            Self::Crdt(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::PubSub(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<CrdtError> for SyncError {
    fn from(e: CrdtError) -> Self {
        SyncError::Crdt(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<PubSubError> for SyncError {
    fn from(e: PubSubError) -> Self {
        SyncError::PubSub(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_open_display() {
        let err = SyncError::NotOpen(DocumentId::from("notes"));
        assert_eq!(err.to_string(), "Document notes is not open");
    }

    #[test]
    fn test_timeout_display() {
        let err = SyncError::Timeout {
            operation: "publish",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "publish timed out after 250ms");
    }

    #[test]
    fn test_adapter_errors_convert() {
        let err: SyncError = StoreError::Unavailable("offline".into()).into();
        assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));

        let err: SyncError = PubSubError::NotConnected.into();
        assert!(matches!(err, SyncError::PubSub(PubSubError::NotConnected)));

        let err: PubSubError = ProtocolError::Timeout.into();
        assert!(matches!(err, PubSubError::Protocol(ProtocolError::Timeout)));
    }
}
