//! Error taxonomy shared by the session, the kernel manager and the kernel.

use crate::cell::CellState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel could not be started. Never retried automatically.
    #[error("Failed to start kernel: {0}")]
    Spawn(String),

    /// The kernel died or stopped answering; only a restart recovers.
    #[error("Kernel is dead: {0}")]
    KernelDead(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Kernel is busy with run {0}")]
    Busy(String),

    #[error("No cell with id {0}")]
    NoSuchCell(usize),

    #[error("Cell {0} is not a code cell")]
    NotCode(usize),

    #[error("Cell {id} cannot be run while {state}")]
    InvalidState { id: usize, state: CellState },

    #[error("No cell is running")]
    NotRunning,

    /// The connection was shut down; no further operations are valid on it.
    #[error("Kernel connection is closed")]
    ConnectionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
