//! Error types shared by the benchmark engines and the transport seam.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A single write was rejected by the transport
    #[error("write failed on channel '{channel}': {reason}")]
    WriteFailed { channel: String, reason: String },

    /// A writer or reader could not be created
    #[error("failed to create {kind} for channel '{channel}'")]
    EntityCreation { kind: &'static str, channel: String },

    /// The matched-peer status could not be read
    #[error("matched status unavailable on channel '{channel}'")]
    StatusUnavailable { channel: String },

    /// The transport has been shut down
    #[error("transport closed")]
    Closed,
}

/// Errors that end a benchmark round without a result.
#[derive(Error, Debug)]
pub enum BenchError {
    /// No peer could be matched on the named channel
    #[error("peer match failed on channel '{channel}': {reason}")]
    PeerMatch { channel: String, reason: String },

    /// The round was cancelled by the caller
    #[error("round {round} cancelled")]
    Cancelled { round: u32 },

    /// The round did not complete before its deadline
    #[error("round {round} did not complete within {timeout:?}")]
    DeadlineExceeded { round: u32, timeout: Duration },

    /// The round configuration is not usable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// CPU counters could not be opened
    #[error("resource sampler unavailable: {0}")]
    SamplerUnavailable(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, BenchError>;
