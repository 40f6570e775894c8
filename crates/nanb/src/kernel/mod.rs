//! The kernel process: a socket server in front of a persistent interpreter.

pub mod evaluator;
pub mod server;

pub use evaluator::{EvalEvent, Evaluator, PythonEvaluator};
pub use server::{KernelServer, ServeExit, ServerConfig};
