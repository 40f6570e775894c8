//! Client side of the kernel process.
//!
//! [`KernelManager`] launches `nanb-kernel` processes; [`KernelConnection`] is
//! the live link to one of them. Each connection runs two background tasks:
//!
//! - a reader that decodes kernel frames, tracks the heartbeat deadline,
//!   updates [`Liveness`] and forwards [`KernelEvent`]s to the owner,
//! - a writer that serializes outgoing requests and client heartbeats.
//!
//! Interrupts bypass the socket entirely (SIGINT to the kernel process) so
//! they are never queued behind a busy kernel.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{clear_stale_socket, recv_json_frame, send_json_frame, socket_path};
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, Hello, KernelMessage, RunId, RunStatus, Stream};
use crate::settings::Settings;
use crate::{KERNEL_BINARY_NAME, KERNEL_PATH_ENV};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Client-side view of the kernel. A connection only exists once the
/// handshake is done, so it starts out `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ready,
    Busy,
    /// Terminal: only a restart recovers.
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Ready => write!(f, "ready"),
            Liveness::Busy => write!(f, "busy"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}

/// How interrupts reach the kernel.
#[derive(Debug, Clone)]
pub enum InterruptTarget {
    /// SIGINT to a kernel process.
    Process(u32),
    /// A kernel running inside this process.
    Channel(mpsc::UnboundedSender<()>),
}

/// Events forwarded from the connection's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Started {
        run_id: RunId,
    },
    Output {
        run_id: RunId,
        stream: Stream,
        data: Vec<u8>,
    },
    Finished {
        run_id: RunId,
        status: RunStatus,
        error_detail: Option<String>,
    },
    /// A frame could not be decoded or the kernel reported an error.
    /// `run_id` names the run that was in flight, if any; in that case a
    /// `Lost` follows because the run's result can no longer be trusted.
    TransportError {
        run_id: Option<RunId>,
        message: String,
    },
    /// The connection is gone. Always the last event.
    Lost { reason: String },
}

/// Heartbeat and shutdown timings of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionTiming {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ConnectionTiming {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            heartbeat_interval: settings.kernel.heartbeat_interval(),
            heartbeat_timeout: settings.kernel.heartbeat_timeout(),
            shutdown_grace: settings.kernel.shutdown_grace(),
        }
    }
}

impl Default for ConnectionTiming {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A live (or dead) link to one kernel.
pub struct KernelConnection {
    pid: Option<u32>,
    socket_path: PathBuf,
    interrupt: Option<InterruptTarget>,
    started_at: Option<DateTime<Utc>>,
    interpreter: String,
    timing: ConnectionTiming,
    liveness_tx: Arc<watch::Sender<Liveness>>,
    liveness: watch::Receiver<Liveness>,
    /// Run the kernel has started and not yet finished.
    current_run: watch::Receiver<Option<RunId>>,
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    events: mpsc::UnboundedReceiver<KernelEvent>,
    tasks: Vec<JoinHandle<()>>,
    dead_reason: Option<String>,
    closed: bool,
}

impl KernelConnection {
    /// Connect to a kernel listening on `socket_path` and complete the
    /// handshake before `deadline`.
    ///
    /// If `process` is given it is watched for early exit while connecting,
    /// and owned by the connection afterwards.
    pub async fn establish(
        socket_path: PathBuf,
        mut process: Option<Child>,
        interrupt: InterruptTarget,
        session_id: &str,
        timing: ConnectionTiming,
        deadline: Instant,
    ) -> Result<Self> {
        let stream = loop {
            if let Some(child) = process.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(Error::Spawn(format!("kernel exited during startup ({})", status)));
                }
            }
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => {
                    return Err(Error::Timeout(format!(
                        "kernel socket {} not accepting connections: {}",
                        socket_path.display(),
                        e
                    )));
                }
                Err(_) => tokio::time::sleep(CONNECT_POLL_INTERVAL).await,
            }
        };
        let (mut reader, mut writer) = stream.into_split();

        send_json_frame(&mut writer, &Hello::new(session_id)).await?;
        let reply = tokio::time::timeout_at(deadline, recv_json_frame::<_, KernelMessage>(&mut reader))
            .await
            .map_err(|_| Error::Timeout("kernel did not answer the handshake".to_string()))??;

        let (started_at, interpreter) = match reply {
            Some(KernelMessage::Ready {
                pid,
                started_at,
                interpreter,
                ..
            }) => {
                info!(
                    "[kernel-manager] Kernel ready (pid {}, {}) on {}",
                    pid,
                    interpreter,
                    socket_path.display()
                );
                (started_at, interpreter)
            }
            Some(KernelMessage::Error { message }) => {
                return Err(Error::Spawn(format!("kernel refused handshake: {}", message)));
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected ready from kernel, got {:?}",
                    other
                )));
            }
            None => return Err(Error::ConnectionClosed),
        };

        let (liveness_tx, liveness) = watch::channel(Liveness::Ready);
        let liveness_tx = Arc::new(liveness_tx);
        let (current_run_tx, current_run) = watch::channel(None);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let pid = process.as_ref().and_then(Child::id);
        let mut tasks = vec![
            tokio::spawn(read_loop(
                reader,
                events_tx.clone(),
                liveness_tx.clone(),
                current_run_tx,
                timing.heartbeat_timeout,
            )),
            tokio::spawn(write_loop(writer, outgoing_rx, timing.heartbeat_interval)),
        ];
        if let Some(child) = process {
            tasks.push(tokio::spawn(watch_process(
                child,
                events_tx,
                liveness_tx.clone(),
            )));
        }

        Ok(Self {
            pid,
            socket_path,
            interrupt: Some(interrupt),
            started_at: Some(started_at),
            interpreter,
            timing,
            liveness_tx,
            liveness,
            current_run,
            outgoing: Some(outgoing_tx),
            events,
            tasks,
            dead_reason: None,
            closed: false,
        })
    }

    /// A connection that is already dead, used when no kernel could be
    /// started.
    pub fn dead(reason: impl Into<String>) -> Self {
        let (liveness_tx, liveness) = watch::channel(Liveness::Dead);
        let (_, events) = mpsc::unbounded_channel();
        Self {
            pid: None,
            socket_path: PathBuf::new(),
            interrupt: None,
            started_at: None,
            interpreter: String::new(),
            timing: ConnectionTiming::default(),
            liveness_tx: Arc::new(liveness_tx),
            liveness,
            current_run: watch::channel(None).1,
            outgoing: None,
            events,
            tasks: Vec::new(),
            dead_reason: Some(reason.into()),
            closed: false,
        }
    }

    /// Kernel process id; `None` for in-process kernels.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Why the connection died, once it has.
    pub fn dead_reason(&self) -> Option<&str> {
        self.dead_reason.as_deref()
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.liveness() == Liveness::Dead {
            let reason = self
                .dead_reason
                .clone()
                .unwrap_or_else(|| "connection lost".to_string());
            return Err(Error::KernelDead(reason));
        }
        Ok(())
    }

    /// Submit a run. Output and the result arrive through [`Self::next_event`].
    ///
    /// Fails with [`Error::Busy`] while the kernel is running something else.
    pub fn execute(&self, run_id: RunId, cell_id: usize, source: &str) -> Result<()> {
        self.check_usable()?;
        let current = *self.current_run.borrow();
        if let Some(current) = current {
            return Err(Error::Busy(current.to_string()));
        }
        let outgoing = self.outgoing.as_ref().ok_or(Error::ConnectionClosed)?;
        outgoing
            .send(ClientMessage::Execute {
                run_id,
                cell_id,
                source: source.to_string(),
            })
            .map_err(|_| Error::KernelDead("connection writer stopped".to_string()))
    }

    /// Ask the kernel to stop the running code. Works while the kernel is
    /// busy; does not wait for the outcome.
    pub fn interrupt(&self) -> Result<()> {
        self.check_usable()?;
        match self.interrupt.as_ref() {
            Some(InterruptTarget::Process(pid)) => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                debug!("[kernel-manager] Sending SIGINT to kernel {}", pid);
                kill(Pid::from_raw(*pid as i32), Signal::SIGINT)
                    .map_err(|e| Error::KernelDead(format!("failed to signal kernel: {}", e)))
            }
            Some(InterruptTarget::Channel(tx)) => tx
                .send(())
                .map_err(|_| Error::KernelDead("kernel stopped listening".to_string())),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Next event from the kernel, `None` once the connection has nothing
    /// more to report. Cancel safe.
    pub async fn next_event(&mut self) -> Option<KernelEvent> {
        loop {
            let event = self.events.recv().await?;
            if let KernelEvent::Lost { reason } = &event {
                // The reader and the process watcher both report the loss.
                if self.dead_reason.is_some() {
                    continue;
                }
                self.dead_reason = Some(reason.clone());
            }
            return Some(event);
        }
    }

    /// Gracefully stop the kernel: send `Shutdown`, wait up to the shutdown
    /// grace, then kill its process group. The connection is unusable
    /// afterwards.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(outgoing) = self.outgoing.take() {
            if self.liveness() != Liveness::Dead && outgoing.send(ClientMessage::Shutdown).is_ok() {
                let mut liveness = self.liveness.clone();
                let exited = tokio::time::timeout(
                    self.timing.shutdown_grace,
                    liveness.wait_for(|l| *l == Liveness::Dead),
                )
                .await
                .map(|waited| waited.is_ok())
                .unwrap_or(false);
                if !exited {
                    warn!(
                        "[kernel-manager] Kernel did not exit within {:?}",
                        self.timing.shutdown_grace
                    );
                }
            }
        }

        self.kill_process_group();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.remove_socket();
        self.liveness_tx.send_replace(Liveness::Dead);
        if self.dead_reason.is_none() {
            self.dead_reason = Some("kernel shut down".to_string());
        }
        info!("[kernel-manager] Kernel shutdown complete");
    }

    fn kill_process_group(&mut self) {
        if let Some(pgid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!(
                        "[kernel-manager] Failed to kill process group {}: {}",
                        pgid, e
                    );
                }
            }
        }
    }

    fn remove_socket(&self) {
        if self.socket_path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "[kernel-manager] Failed to remove socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for KernelConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.kill_process_group();
        self.remove_socket();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<KernelEvent>,
    liveness: Arc<watch::Sender<Liveness>>,
    current_run: watch::Sender<Option<RunId>>,
    heartbeat_timeout: Duration,
) {
    let mut current: Option<RunId> = None;
    let mut shutting_down = false;

    let reason = loop {
        let received =
            tokio::time::timeout(heartbeat_timeout, recv_json_frame::<_, KernelMessage>(&mut reader))
                .await;
        let message = match received {
            Err(_) => break format!("no heartbeat from kernel for {:?}", heartbeat_timeout),
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) if shutting_down => break "kernel shut down".to_string(),
            Ok(Ok(None)) => break "connection closed by kernel".to_string(),
            Ok(Err(Error::Protocol(message))) => {
                warn!("[kernel-manager] {}", message);
                let _ = events.send(KernelEvent::TransportError {
                    run_id: current,
                    message: message.clone(),
                });
                // The frame may have been the run's result; nothing after it
                // can be matched up reliably.
                if let Some(run_id) = current {
                    break format!("undecodable frame during run {}: {}", run_id, message);
                }
                continue;
            }
            Ok(Err(e)) => break format!("transport failed: {}", e),
        };

        let event = match message {
            KernelMessage::Heartbeat => continue,
            KernelMessage::ShuttingDown => {
                shutting_down = true;
                continue;
            }
            KernelMessage::Ready { .. } => {
                warn!("[kernel-manager] Unexpected ready after handshake");
                continue;
            }
            KernelMessage::Error { message } => KernelEvent::TransportError {
                run_id: None,
                message,
            },
            KernelMessage::ExecutionStarted { run_id } => {
                current = Some(run_id);
                current_run.send_replace(current);
                liveness.send_replace(Liveness::Busy);
                KernelEvent::Started { run_id }
            }
            KernelMessage::OutputChunk {
                run_id,
                stream,
                data,
            } => KernelEvent::Output {
                run_id,
                stream,
                data,
            },
            KernelMessage::ExecutionResult {
                run_id,
                status,
                error_detail,
            } => {
                if current == Some(run_id) {
                    current = None;
                    current_run.send_replace(None);
                    liveness.send_replace(Liveness::Ready);
                }
                KernelEvent::Finished {
                    run_id,
                    status,
                    error_detail,
                }
            }
        };
        if events.send(event).is_err() {
            return;
        }
    };

    if shutting_down {
        info!("[kernel-manager] {}", reason);
    } else {
        error!("[kernel-manager] Kernel lost: {}", reason);
    }
    liveness.send_replace(Liveness::Dead);
    let _ = events.send(KernelEvent::Lost { reason });
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = heartbeat.tick() => ClientMessage::Heartbeat,
        };
        if let Err(e) = send_json_frame(&mut writer, &message).await {
            warn!("[kernel-manager] Failed to write to kernel: {}", e);
            break;
        }
    }
}

async fn watch_process(
    mut child: Child,
    events: mpsc::UnboundedSender<KernelEvent>,
    liveness: Arc<watch::Sender<Liveness>>,
) {
    let reason = match child.wait().await {
        Ok(status) => format!("kernel process exited ({})", status),
        Err(e) => format!("failed to wait for kernel process: {}", e),
    };
    liveness.send_replace(Liveness::Dead);
    let _ = events.send(KernelEvent::Lost { reason });
}

/// Something that can produce kernel connections.
pub trait KernelLauncher: Send + Sync {
    /// Start a fresh kernel and connect to it.
    fn spawn(&self) -> impl Future<Output = Result<KernelConnection>> + Send;

    /// Tear `old` down completely, then start a fresh kernel.
    fn restart(
        &self,
        mut old: KernelConnection,
    ) -> impl Future<Output = Result<KernelConnection>> + Send {
        async move {
            old.shutdown().await;
            drop(old);
            self.spawn().await
        }
    }
}

/// Launches `nanb-kernel` processes.
pub struct KernelManager {
    settings: Settings,
    session_id: String,
    kernel_binary: Option<PathBuf>,
    log_level: String,
}

impl KernelManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            session_id: uuid::Uuid::new_v4().to_string(),
            kernel_binary: None,
            log_level: "info".to_string(),
        }
    }

    /// Use this kernel binary instead of searching for one.
    pub fn with_kernel_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_binary = Some(path.into());
        self
    }

    /// Log level passed to spawned kernels.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Locate the kernel binary: explicit path, settings, `NANB_KERNEL_PATH`,
    /// next to the current executable, then `PATH`.
    pub fn find_kernel_binary(&self) -> Result<PathBuf> {
        if let Some(path) = self
            .kernel_binary
            .clone()
            .or_else(|| self.settings.kernel.kernel_binary.clone())
        {
            return Ok(path);
        }
        if let Some(path) = std::env::var_os(KERNEL_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let sibling = dir.join(KERNEL_BINARY_NAME);
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
        which::which(KERNEL_BINARY_NAME)
            .map_err(|e| Error::Spawn(format!("{} not found: {}", KERNEL_BINARY_NAME, e)))
    }

    fn log_stdio(&self) -> (Stdio, Stdio) {
        let log_file = &self.settings.server.log_file;
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .and_then(|file| Ok((file.try_clone()?, file)));
        match opened {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!(
                    "[kernel-manager] Cannot open kernel log {}: {}",
                    log_file.display(),
                    e
                );
                (Stdio::null(), Stdio::null())
            }
        }
    }

    async fn launch(&self) -> Result<KernelConnection> {
        let binary = self.find_kernel_binary()?;
        let socket = socket_path(&self.settings.server.socket_prefix);
        clear_stale_socket(&socket).await?;

        let kernel = &self.settings.kernel;
        let (program, args) = self.settings.interpreter();
        let (stdout, stderr) = self.log_stdio();

        let mut cmd = Command::new(&binary);
        cmd.arg("--socket-file")
            .arg(&socket)
            .arg("--interpreter")
            .arg(program);
        for arg in args {
            cmd.arg(format!("--interpreter-arg={}", arg));
        }
        cmd.arg("--heartbeat-interval-ms")
            .arg(kernel.heartbeat_interval_ms.to_string())
            .arg("--heartbeat-timeout-ms")
            .arg(kernel.heartbeat_timeout_ms.to_string())
            .arg("--interrupt-grace-ms")
            .arg(kernel.interrupt_grace_ms.to_string())
            .arg("--startup-timeout-ms")
            .arg(kernel.spawn_timeout_ms.to_string())
            .arg("--log-level")
            .arg(&self.log_level)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // Own process group so the terminal's Ctrl-C doesn't reach the
        // kernel and shutdown can kill the interpreter along with it.
        cmd.process_group(0);

        info!(
            "[kernel-manager] Starting {} on {}",
            binary.display(),
            socket.display()
        );
        let process = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to run {}: {}", binary.display(), e)))?;
        let pid = process
            .id()
            .ok_or_else(|| Error::Spawn("kernel exited immediately".to_string()))?;

        let deadline = Instant::now() + kernel.spawn_timeout();
        KernelConnection::establish(
            socket.clone(),
            Some(process),
            InterruptTarget::Process(pid),
            &self.session_id,
            ConnectionTiming::from_settings(&self.settings),
            deadline,
        )
        .await
        .map_err(|e| {
            let _ = std::fs::remove_file(&socket);
            e
        })
    }
}

impl KernelLauncher for KernelManager {
    async fn spawn(&self) -> Result<KernelConnection> {
        self.launch().await.map_err(|e| match e {
            Error::Spawn(_) => e,
            other => Error::Spawn(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dead_connection_rejects_operations() {
        let mut conn = KernelConnection::dead("no kernel");
        assert_eq!(conn.liveness(), Liveness::Dead);
        assert!(conn.pid().is_none());
        assert!(matches!(
            conn.execute(RunId::new(), 0, "x = 1"),
            Err(Error::KernelDead(reason)) if reason == "no kernel"
        ));
        assert!(matches!(conn.interrupt(), Err(Error::KernelDead(_))));
        assert!(conn.next_event().await.is_none());

        conn.shutdown().await;
        assert!(conn.is_closed());
        assert!(matches!(
            conn.execute(RunId::new(), 0, "x = 1"),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_spawn_fails_without_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.server.socket_prefix = dir.path().join("sock_").to_string_lossy().into_owned();
        settings.server.log_file = dir.path().join("kernel.log");
        let manager =
            KernelManager::new(settings).with_kernel_binary(dir.path().join("missing-kernel"));

        match manager.spawn().await {
            Err(Error::Spawn(message)) => assert!(message.contains("missing-kernel")),
            Err(other) => panic!("expected spawn error, got {}", other),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[tokio::test]
    async fn test_spawn_detects_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.server.socket_prefix = dir.path().join("sock_").to_string_lossy().into_owned();
        settings.server.log_file = dir.path().join("kernel.log");
        settings.kernel.spawn_timeout_ms = 5_000;
        // `false` ignores its arguments and exits 1.
        let Ok(false_bin) = which::which("false") else {
            return;
        };
        let manager = KernelManager::new(settings).with_kernel_binary(false_bin);

        let started = std::time::Instant::now();
        assert!(matches!(manager.spawn().await, Err(Error::Spawn(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_explicit_binary_wins() {
        let mut settings = Settings::default();
        settings.kernel.kernel_binary = Some(PathBuf::from("/opt/nanb/settings-kernel"));
        let manager = KernelManager::new(settings.clone());
        assert_eq!(
            manager.find_kernel_binary().unwrap(),
            PathBuf::from("/opt/nanb/settings-kernel")
        );

        let manager = KernelManager::new(settings).with_kernel_binary("/opt/nanb/explicit");
        assert_eq!(
            manager.find_kernel_binary().unwrap(),
            PathBuf::from("/opt/nanb/explicit")
        );
    }

    #[test]
    fn test_liveness_display() {
        assert_eq!(Liveness::Busy.to_string(), "busy");
        assert_eq!(Liveness::Dead.to_string(), "dead");
    }
}
