//! A hand-driven kernel speaking the wire protocol directly, for failure
//! modes the real kernel never produces.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nanb::connection::{recv_json_control_frame, recv_json_frame, send_json_frame, socket_path, write_frame};
use nanb::kernel_manager::{ConnectionTiming, InterruptTarget, KernelConnection, KernelLauncher};
use nanb::protocol::{ClientMessage, Hello, KernelMessage, RunStatus, Stream, PROTOCOL_VERSION};
use nanb::Result;
use tempfile::TempDir;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;

const GARBAGE: &[u8] = b"{\"type\": \"execution_res";

/// What the first kernel does once it accepted a run. Kernels started by
/// later spawns always behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehaviour {
    /// Answers the run normally, then sends an undecodable frame.
    GarbageAfterResult,
    /// Sends an undecodable frame where the run's result belongs, then keeps
    /// heartbeating.
    GarbageResult,
    /// Acknowledges the run, then goes quiet without closing the socket.
    FallSilent,
}

pub struct RawKernelLauncher {
    dir: TempDir,
    behaviour: Misbehaviour,
    pub timing: ConnectionTiming,
    pub spawns: AtomicUsize,
}

impl RawKernelLauncher {
    pub fn new(behaviour: Misbehaviour) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            behaviour,
            timing: ConnectionTiming {
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_timeout: Duration::from_millis(400),
                shutdown_grace: Duration::from_secs(1),
            },
            spawns: AtomicUsize::new(0),
        }
    }

    /// Heartbeat period of the fake kernel; well inside the client timeout.
    fn kernel_heartbeat(&self) -> Duration {
        self.timing.heartbeat_timeout / 4
    }
}

impl KernelLauncher for RawKernelLauncher {
    async fn spawn(&self) -> Result<KernelConnection> {
        let first = self.spawns.fetch_add(1, Ordering::SeqCst) == 0;
        let behaviour = first.then_some(self.behaviour);

        let prefix = self.dir.path().join("raw_").to_string_lossy().into_owned();
        let path: PathBuf = socket_path(&prefix);
        let listener = UnixListener::bind(&path)?;
        tokio::spawn(serve(listener, behaviour, self.kernel_heartbeat()));

        let (interrupt_tx, _) = mpsc::unbounded_channel();
        KernelConnection::establish(
            path,
            None,
            InterruptTarget::Channel(interrupt_tx),
            "raw-session",
            self.timing.clone(),
            tokio::time::Instant::now() + Duration::from_secs(5),
        )
        .await
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: KernelMessage) -> bool {
    send_json_frame(writer, &message).await.is_ok()
}

async fn serve(listener: UnixListener, behaviour: Option<Misbehaviour>, heartbeat: Duration) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (mut reader, mut writer) = stream.into_split();
    if !matches!(recv_json_control_frame::<_, Hello>(&mut reader).await, Ok(Some(_))) {
        return;
    }
    let ready = KernelMessage::Ready {
        pid: std::process::id(),
        protocol_version: PROTOCOL_VERSION,
        started_at: chrono::Utc::now(),
        interpreter: "raw".to_string(),
    };
    if !send(&mut writer, ready).await {
        return;
    }

    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(Some(message)) = recv_json_frame::<_, ClientMessage>(&mut reader).await {
            if requests_tx.send(message).is_err() {
                break;
            }
        }
    });

    let mut ticks = tokio::time::interval(heartbeat);
    let mut silent = false;
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(ClientMessage::Execute { run_id, source, .. }) => {
                    if !send(&mut writer, KernelMessage::ExecutionStarted { run_id }).await {
                        return;
                    }
                    if behaviour == Some(Misbehaviour::FallSilent) {
                        silent = true;
                        continue;
                    }
                    if behaviour == Some(Misbehaviour::GarbageResult) {
                        if write_frame(&mut writer, GARBAGE).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    let chunk = KernelMessage::OutputChunk {
                        run_id,
                        stream: Stream::Stdout,
                        data: format!("{}\n", source.trim()).into_bytes(),
                    };
                    let result = KernelMessage::ExecutionResult {
                        run_id,
                        status: RunStatus::Ok,
                        error_detail: None,
                    };
                    if !send(&mut writer, chunk).await || !send(&mut writer, result).await {
                        return;
                    }
                    if behaviour == Some(Misbehaviour::GarbageAfterResult)
                        && write_frame(&mut writer, GARBAGE).await.is_err()
                    {
                        return;
                    }
                }
                Some(ClientMessage::Shutdown) => {
                    let _ = send(&mut writer, KernelMessage::ShuttingDown).await;
                    return;
                }
                Some(ClientMessage::Heartbeat) => {}
                None => return,
            },
            _ = ticks.tick(), if !silent => {
                if !send(&mut writer, KernelMessage::Heartbeat).await {
                    return;
                }
            }
        }
    }
}
