//! Error taxonomy (see spec §7 / SPEC_FULL.md "Ambient: Error taxonomy").
//!
//! Protocol-level errors are never propagated as `Err` out of a frame
//! handler — they are logged and the offending envelope/frame is discarded
//! (§7 "Protocol" policy). The types below exist for the remaining kinds:
//! transport, validation, durability, and transfer failures, each scoped to
//! a single frame/transfer/session rather than the whole process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay is offline")]
    RelayOffline,
    #[error("timed out waiting for relay to become ready")]
    ReadyTimeout,
    #[error("timed out waiting for frame ack")]
    AckTimeout,
    #[error("target peer unreachable")]
    TargetUnreachable,
    #[error("connection lost")]
    ConnectionLost,
    #[error("shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file exceeds maximum size of {max} bytes (was {actual})")]
    FileTooLarge { max: u64, actual: u64 },
    #[error("invalid chunk index {index} for total {total}")]
    InvalidChunkIndex { index: u64, total: u64 },
    #[error("chunk total mismatch: expected {expected}, got {actual}")]
    ChunkTotalMismatch { expected: u64, actual: u64 },
    #[error("sha256 mismatch on finalize")]
    HashMismatch,
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("poisoned store mutex")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Top-level error surfaced by message-service operations (§4.6). An explicit
/// result variant rather than exceptions-for-control-flow, per §9.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("peer is offline")]
    PeerOffline,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("message not found")]
    NotFound,
    #[error("message belongs to another sender")]
    NotOwner,
}
