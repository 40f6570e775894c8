//! Shared fixtures: a scripted evaluator, an in-process kernel launcher and
//! a raw wire-level kernel for failure cases.
//!
//! The scripted language has one command per line:
//!
//! - `set NAME VALUE` binds a variable
//! - `print NAME` writes the value (NameError if unbound)
//! - `echo TEXT` / `warn TEXT` write to stdout / stderr
//! - `sleep MS` sleeps, honouring interrupts
//! - `spin` runs until interrupted
//! - `stubborn` runs forever and ignores interrupts
//! - `fail MESSAGE` fails the run
//! - `crash` kills the interpreter

#![allow(dead_code)]

pub mod raw_kernel;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nanb::cell::{parse, CellState};
use nanb::connection::socket_path;
use nanb::kernel::{EvalEvent, Evaluator, KernelServer, ServerConfig};
use nanb::kernel_manager::{ConnectionTiming, InterruptTarget, KernelConnection, KernelLauncher};
use nanb::protocol::{RunId, RunStatus, Stream};
use nanb::{Error, Result, Session, SessionEvent, Settings};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

pub struct ScriptedEvaluator {
    vars: Arc<Mutex<HashMap<String, String>>>,
    interrupted: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<EvalEvent>,
    current: Option<JoinHandle<()>>,
}

impl ScriptedEvaluator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EvalEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                vars: Arc::new(Mutex::new(HashMap::new())),
                interrupted: Arc::new(AtomicBool::new(false)),
                events_tx,
                current: None,
            },
            events_rx,
        )
    }
}

fn output(events: &mpsc::UnboundedSender<EvalEvent>, run_id: RunId, stream: Stream, text: String) {
    let _ = events.send(EvalEvent::Output {
        run_id,
        stream,
        data: text.into_bytes(),
    });
}

async fn run_script(
    run_id: RunId,
    source: String,
    vars: Arc<Mutex<HashMap<String, String>>>,
    interrupted: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EvalEvent>,
) {
    let done = |status: RunStatus, detail: Option<String>| EvalEvent::Done {
        run_id,
        status,
        error_detail: detail,
    };

    for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if interrupted.load(Ordering::SeqCst) {
            let _ = events.send(done(RunStatus::Interrupted, Some("KeyboardInterrupt".into())));
            return;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "set" => {
                let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                vars.lock().unwrap().insert(name.to_string(), value.to_string());
            }
            "print" => {
                let value = vars.lock().unwrap().get(rest).cloned();
                match value {
                    Some(value) => output(&events, run_id, Stream::Stdout, format!("{}\n", value)),
                    None => {
                        let detail = format!("NameError: name '{}' is not defined", rest);
                        let _ = events.send(done(RunStatus::Error, Some(detail)));
                        return;
                    }
                }
            }
            "echo" => output(&events, run_id, Stream::Stdout, format!("{}\n", rest)),
            "warn" => output(&events, run_id, Stream::Stderr, format!("{}\n", rest)),
            "sleep" => {
                let ms: u64 = rest.parse().unwrap_or(0);
                let until = tokio::time::Instant::now() + Duration::from_millis(ms);
                while tokio::time::Instant::now() < until {
                    if interrupted.load(Ordering::SeqCst) {
                        let _ = events.send(done(RunStatus::Interrupted, Some("KeyboardInterrupt".into())));
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            "spin" => loop {
                if interrupted.load(Ordering::SeqCst) {
                    let _ = events.send(done(RunStatus::Interrupted, Some("KeyboardInterrupt".into())));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
            "stubborn" => loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
            "fail" => {
                let _ = events.send(done(RunStatus::Error, Some(rest.to_string())));
                return;
            }
            "crash" => {
                let _ = events.send(EvalEvent::Exited {
                    reason: "interpreter crashed".to_string(),
                });
                return;
            }
            other => {
                let detail = format!("SyntaxError: unknown command '{}'", other);
                let _ = events.send(done(RunStatus::Error, Some(detail)));
                return;
            }
        }
    }
    let _ = events.send(done(RunStatus::Ok, None));
}

impl Evaluator for ScriptedEvaluator {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn execute(&mut self, run_id: RunId, _cell_id: usize, source: &str) -> Result<()> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.current = Some(tokio::spawn(run_script(
            run_id,
            source.to_string(),
            self.vars.clone(),
            self.interrupted.clone(),
            self.events_tx.clone(),
        )));
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        if let Some(task) = self.current.take() {
            task.abort();
        }
        self.vars.lock().unwrap().clear();
        self.interrupted.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.current.take() {
            task.abort();
        }
    }
}

/// Runs a [`KernelServer`] with a [`ScriptedEvaluator`] inside the test
/// process for every spawn.
pub struct InProcessLauncher {
    dir: TempDir,
    pub server_config: ServerConfig,
    pub timing: ConnectionTiming,
    pub spawns: AtomicUsize,
    /// Make the next spawn fail.
    pub fail_next: AtomicBool,
    servers: Mutex<Vec<AbortHandle>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            server_config: ServerConfig {
                heartbeat_interval: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_secs(5),
                interrupt_grace: Duration::from_millis(300),
                accept_timeout: Duration::from_secs(5),
            },
            timing: ConnectionTiming {
                heartbeat_interval: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_secs(5),
                shutdown_grace: Duration::from_secs(2),
            },
            spawns: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            servers: Mutex::new(Vec::new()),
        }
    }

    pub fn socket_prefix(&self) -> String {
        self.dir.path().join("kernel_").to_string_lossy().into_owned()
    }

    /// Abort the most recent kernel as if it had been killed externally.
    pub fn kill_current(&self) {
        if let Some(server) = self.servers.lock().unwrap().last() {
            server.abort();
        }
    }
}

impl KernelLauncher for InProcessLauncher {
    async fn spawn(&self) -> Result<KernelConnection> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Spawn("scripted spawn failure".to_string()));
        }

        let path: PathBuf = socket_path(&self.socket_prefix());
        let listener = UnixListener::bind(&path)?;
        let (evaluator, events) = ScriptedEvaluator::new();
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        let server = KernelServer::new(evaluator, events, self.server_config.clone());
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener, interrupt_rx).await;
        });
        self.servers.lock().unwrap().push(handle.abort_handle());

        KernelConnection::establish(
            path,
            None,
            InterruptTarget::Channel(interrupt_tx),
            "test-session",
            self.timing.clone(),
            tokio::time::Instant::now() + Duration::from_secs(5),
        )
        .await
    }
}

/// Settings tuned for fast tests.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.kernel.interrupt_grace_ms = 300;
    settings.kernel.interrupt_timeout_ms = 3_000;
    settings
}

pub async fn scripted_session(text: &str) -> Session<InProcessLauncher> {
    scripted_session_with(text, test_settings()).await
}

pub async fn scripted_session_with(text: &str, settings: Settings) -> Session<InProcessLauncher> {
    Session::new(parse(text), InProcessLauncher::new(), settings)
        .await
        .unwrap()
}

/// Drive the session until `cell` reaches `state`.
pub async fn wait_for_state<L: KernelLauncher>(
    session: &mut Session<L>,
    cell: usize,
    state: CellState,
) {
    let wait = async {
        while session.cell(cell).map(|c| c.state()) != Some(state) {
            if session.next_event().await.is_none() {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("cell {} never became {}", cell, state));
}

/// Drive the session until the kernel is reported dead.
pub async fn wait_for_kernel_dead<L: KernelLauncher>(session: &mut Session<L>) -> String {
    let wait = async {
        loop {
            match session.next_event().await {
                Some(SessionEvent::KernelDead { reason }) => return reason,
                Some(_) => {}
                None => panic!("session closed before the kernel died"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("kernel never reported dead")
}
