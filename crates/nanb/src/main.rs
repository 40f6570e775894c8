//! nanb-kernel entry point.
//!
//! Spawned by the kernel manager, one per session. Starts the interpreter,
//! listens on the given Unix socket and serves a single client.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use nanb::connection::clear_stale_socket;
use nanb::kernel::{KernelServer, PythonEvaluator, ServeExit, ServerConfig};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "nanb-kernel")]
#[command(about = "Execution kernel for nanb sessions")]
struct Cli {
    /// Unix socket to listen on
    #[arg(long)]
    socket_file: PathBuf,

    /// Interpreter program
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Extra interpreter argument (repeatable)
    #[arg(long = "interpreter-arg", allow_hyphen_values = true)]
    interpreter_args: Vec<String>,

    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "10000")]
    heartbeat_timeout_ms: u64,

    #[arg(long, default_value = "2000")]
    interrupt_grace_ms: u64,

    /// Bound on interpreter startup and on waiting for the client
    #[arg(long, default_value = "10000")]
    startup_timeout_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    info!(
        "[kernel] Starting (pid {}) on {}",
        std::process::id(),
        cli.socket_file.display()
    );

    let startup_timeout = Duration::from_millis(cli.startup_timeout_ms);
    let (evaluator, events) =
        PythonEvaluator::spawn(cli.interpreter.clone(), cli.interpreter_args.clone(), startup_timeout)
            .await?;

    clear_stale_socket(&cli.socket_file).await?;
    let listener = UnixListener::bind(&cli.socket_file)?;

    // SIGINT is the interrupt request; the server decides what it means.
    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            if interrupt_tx.send(()).is_err() {
                break;
            }
        }
    });
    let mut sigterm = signal(SignalKind::terminate())?;

    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(cli.heartbeat_timeout_ms),
        interrupt_grace: Duration::from_millis(cli.interrupt_grace_ms),
        accept_timeout: startup_timeout,
    };
    let server = KernelServer::new(evaluator, events, config);

    let result = tokio::select! {
        result = server.serve(listener, interrupt_rx) => result,
        _ = sigterm.recv() => {
            info!("[kernel] Received SIGTERM");
            Ok(ServeExit::Shutdown)
        }
    };

    if let Err(e) = std::fs::remove_file(&cli.socket_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("[kernel] Failed to remove socket: {}", e);
        }
    }

    match result {
        Ok(ServeExit::InterpreterDied(reason)) => {
            error!("[kernel] Exiting: interpreter died: {}", reason);
            std::process::exit(1);
        }
        Ok(exit) => {
            info!("[kernel] Exiting: {:?}", exit);
            Ok(())
        }
        Err(e) => {
            error!("[kernel] Exiting with error: {}", e);
            Err(e.into())
        }
    }
}
