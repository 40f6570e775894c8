//! nanb - not-a-notebook.
//!
//! Runs a plain source file cell by cell against a persistent interpreter
//! living in a separate kernel process, without storing any execution state
//! in the file itself.
//!
//! The client side (`session`, `kernel_manager`) and the kernel side
//! (`kernel`) talk over a per-session Unix socket using length-prefixed JSON
//! frames (see `connection.rs` and `protocol.rs`).

#[cfg(not(unix))]
compile_error!("nanb needs Unix domain sockets and POSIX signals");

use std::path::PathBuf;

pub mod cell;
pub mod connection;
pub mod error;
pub mod execution_queue;
pub mod kernel;
pub mod kernel_manager;
pub mod protocol;
pub mod session;
pub mod settings;

pub use cell::{parse, Cell, CellKind, CellState, OutputChunk};
pub use error::{Error, Result};
pub use kernel_manager::{KernelConnection, KernelLauncher, KernelManager, Liveness};
pub use session::{Session, SessionEvent};
pub use settings::Settings;

/// Name of the kernel executable spawned for every session.
pub const KERNEL_BINARY_NAME: &str = "nanb-kernel";

/// Environment variable that overrides kernel binary discovery.
pub const KERNEL_PATH_ENV: &str = "NANB_KERNEL_PATH";

/// Default configuration directory (`~/.nanb`).
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nanb")
}
