//! Broker status and error types.

use crate::connection::ConnId;
use std::io;

/// Non-error outcome of one [`IoThread::run`](crate::thread::IoThread::run)
/// invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Forward progress was made (or there was nothing to do).
    Ok,
    /// At least one connection is waiting on socket readiness.
    IoWait,
    /// The server is shutting down; the driver should stop calling `run`.
    Shutdown,
    /// A drain shutdown was requested and jobs are still outstanding;
    /// the driver should keep calling `run` until `Shutdown` is returned.
    ShutdownGraceful,
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer closed the connection or the socket failed fatally.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Transport-level I/O failure other than a clean close.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The byte stream does not frame into valid packets.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol_gearman::ParseError),

    /// A per-connection packet backlog limit was hit; treated like an
    /// allocation failure for the inbound slot.
    #[error("packet backlog exceeded ({0} packets pending)")]
    Backlog(usize),

    /// The processing thread could not be started.
    #[error("processing thread setup failed: {0}")]
    ThreadSetup(io::Error),

    /// The command executor rejected a packet fatally.
    #[error("executor error: {0}")]
    Executor(String),

    /// A packet was posted to a connection that no longer exists (or whose
    /// slot has been reused).
    #[error("connection is gone")]
    ConnectionGone,
}

/// A fatal error on a specific connection, surfaced from `run` so the
/// embedder can tear the connection down.
#[derive(Debug, thiserror::Error)]
#[error("connection {conn}: {error}")]
pub struct ConnError {
    pub conn: ConnId,
    pub error: Error,
}

impl ConnError {
    pub(crate) fn new(conn: ConnId, error: Error) -> Self {
        Self { conn, error }
    }
}
