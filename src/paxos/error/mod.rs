//! Error handling for the replication stack.
//!
//! Transient conditions (send failures, stale messages) are handled at the
//! call site by retry or rating adjustment and never surface here. Fatal
//! conditions are split between this type (storage, configuration) and
//! assertions: an inconsistency between persisted state and memory, or a
//! duplicate decision with a different value, aborts the process rather
//! than risk corrupting the replicated log.

use std::result;

use thiserror::Error;

/// Wrapper Result for the Rust standard library Result type.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A stable storage operation failed. The replica must halt rather
    /// than acknowledge an operation it did not persist.
    #[error("stable storage failure: {0}")]
    StorageIo(#[from] std::io::Error),

    /// A received frame could not be decoded.
    #[error("malformed message: {0}")]
    Codec(&'static str),

    /// The encoded form of a durable record could not be read or written.
    #[error("snapshot encoding failure: {0}")]
    SnapshotEncoding(#[from] bincode::Error),

    /// A message could not be handed to the transport.
    #[error("send to {target} failed: {reason}")]
    NetworkSend { target: String, reason: String },

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A recognized configuration option selects a protocol variant this
    /// implementation does not provide.
    #[error("unsupported option: {0}")]
    UnsupportedOption(&'static str),

    /// The batching pipeline was reached under a crash model where the
    /// client batch store does not exist.
    #[error("client batching is not available under the configured crash model")]
    BatchingUnavailable,

    /// An internal channel was closed while the system is still running.
    #[error("internal channel disconnected: {0}")]
    Disconnected(&'static str),
}
