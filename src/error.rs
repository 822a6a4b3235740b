//! Error types for urpc.

use std::io;

use thiserror::Error;

use crate::sm::RejectReason;

/// Error type for urpc operations.
///
/// Datapath anomalies (malformed packets, stale request numbers, unknown
/// sessions) are never surfaced through this type; the engine drops the
/// packet and bumps a counter. These variants cover the caller-visible
/// contracts only.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad size, bad session number, or a call from the wrong thread.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Transient: the session is healthy but has no free credits. Retry
    /// after running the event loop.
    #[error("no credits available on session")]
    NoCredits,
    /// Session is not in the Connected state.
    #[error("session {0} is not connected")]
    SessionNotConnected(u16),
    /// No session with this number exists.
    #[error("session {0} not found")]
    SessionNotFound(u16),
    /// Hugepage allocator exhaustion or registration failure.
    #[error("out of memory")]
    OutOfMemory,
    /// The remote endpoint rejected our connect request.
    #[error("connect rejected: {0}")]
    ConnectRejected(RejectReason),
    /// The session was torn down with requests still outstanding.
    #[error("session reset")]
    SessionReset,
    /// Fatal transport failure (link down, socket error).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Malformed packet on a control-plane socket.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
}

/// Result type for urpc operations.
pub type Result<T> = std::result::Result<T, Error>;
