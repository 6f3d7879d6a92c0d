use thiserror::Error;

use crate::scanout::ScanoutError;

/// Errors that terminate server startup. Steady-state failures are handled
/// locally (per-operation acks, client disconnects) and never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to open scanout backend: {0}")]
    ScanoutOpen(#[from] ScanoutError),

    #[error("failed to bind server socket {path}: {source}")]
    SocketBind {
        path: String,
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single client operation. Maps onto the failure sentinel of
/// the command's ack; the connection survives.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("object {0:#x} is not owned by this client")]
    NotOwned(u64),

    #[error("pixel format not supported on this path")]
    UnsupportedFormat,

    #[error("client buffer quota exceeded")]
    QuotaExceeded,

    #[error("shared memory pool: {0}")]
    ShmPool(#[source] std::io::Error),

    #[error("buffer import rejected: {0}")]
    Import(#[from] ScanoutError),
}
