//! Kernel side of the connection.
//!
//! Serves exactly one client: accepts it, answers the handshake, then turns
//! `Execute` requests into evaluator runs and streams the evaluator's events
//! back until the client leaves, asks for shutdown, goes silent, or the
//! interpreter dies.

use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{recv_json_control_frame, recv_json_frame, send_json_frame};
use crate::error::{Error, Result};
use crate::kernel::evaluator::{EvalEvent, Evaluator};
use crate::protocol::{ClientMessage, Hello, KernelMessage, RunId, RunStatus, PROTOCOL_VERSION};

/// Timing knobs for the kernel server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub heartbeat_interval: Duration,
    /// The kernel exits when the client has been silent this long.
    pub heartbeat_timeout: Duration,
    /// How long an interrupted run may keep going before the interpreter is
    /// replaced.
    pub interrupt_grace: Duration,
    /// How long to wait for the client to connect and say hello.
    pub accept_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            interrupt_grace: Duration::from_secs(2),
            accept_timeout: Duration::from_secs(10),
        }
    }
}

/// Why [`KernelServer::serve`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    ClientDisconnected,
    ClientSilent,
    InterpreterDied(String),
}

struct ActiveRun {
    run_id: RunId,
    cell_id: usize,
    started: Instant,
    grace_deadline: Option<Instant>,
}

pub struct KernelServer<E: Evaluator> {
    evaluator: E,
    events: mpsc::UnboundedReceiver<EvalEvent>,
    config: ServerConfig,
}

impl<E: Evaluator> KernelServer<E> {
    pub fn new(evaluator: E, events: mpsc::UnboundedReceiver<EvalEvent>, config: ServerConfig) -> Self {
        Self {
            evaluator,
            events,
            config,
        }
    }

    /// Serve one client on `listener`.
    ///
    /// `interrupts` delivers one `()` per interrupt request (SIGINT in the
    /// kernel binary).
    pub async fn serve(
        mut self,
        listener: UnixListener,
        mut interrupts: mpsc::UnboundedReceiver<()>,
    ) -> Result<ServeExit> {
        let (stream, _) = tokio::time::timeout(self.config.accept_timeout, listener.accept())
            .await
            .map_err(|_| Error::Timeout("no client connected".to_string()))??;
        let (mut reader, mut writer) = stream.into_split();

        let hello: Hello = tokio::time::timeout(
            self.config.accept_timeout,
            recv_json_control_frame(&mut reader),
        )
        .await
        .map_err(|_| Error::Timeout("client sent no hello".to_string()))??
        .ok_or(Error::ConnectionClosed)?;

        if hello.protocol_version != PROTOCOL_VERSION {
            let message = format!(
                "protocol version mismatch: client {}, kernel {}",
                hello.protocol_version, PROTOCOL_VERSION
            );
            let _ = send_json_frame(
                &mut writer,
                &KernelMessage::Error {
                    message: message.clone(),
                },
            )
            .await;
            return Err(Error::Protocol(message));
        }

        send_json_frame(
            &mut writer,
            &KernelMessage::Ready {
                pid: std::process::id(),
                protocol_version: PROTOCOL_VERSION,
                started_at: Utc::now(),
                interpreter: self.evaluator.describe(),
            },
        )
        .await?;
        info!("[kernel] Session {} connected", hello.session_id);

        // Reader task: the channel closes when the client goes away.
        let (requests_tx, mut requests) = mpsc::unbounded_channel::<ClientMessage>();
        let reader_task = tokio::spawn(async move {
            loop {
                match recv_json_frame::<_, ClientMessage>(&mut reader).await {
                    Ok(Some(msg)) => {
                        if requests_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(Error::Protocol(e)) => warn!("[kernel] Dropping bad frame: {}", e),
                    Err(e) => {
                        warn!("[kernel] Client read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();
        let mut active: Option<ActiveRun> = None;

        let exit = loop {
            let grace_deadline = active.as_ref().and_then(|run| run.grace_deadline);
            let far_future = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        info!("[kernel] Client disconnected");
                        break ServeExit::ClientDisconnected;
                    };
                    last_seen = Instant::now();
                    match request {
                        ClientMessage::Heartbeat => {}
                        ClientMessage::Shutdown => {
                            info!("[kernel] Shutdown requested");
                            let _ = send_json_frame(&mut writer, &KernelMessage::ShuttingDown).await;
                            break ServeExit::Shutdown;
                        }
                        ClientMessage::Execute { run_id, cell_id, source } => {
                            if let Some(busy) = &active {
                                warn!("[kernel] Rejecting run {} while {} is in flight", run_id, busy.run_id);
                                let reply = KernelMessage::ExecutionResult {
                                    run_id,
                                    status: RunStatus::Error,
                                    error_detail: Some("kernel busy".to_string()),
                                };
                                if send(&mut writer, &reply).await.is_err() {
                                    break ServeExit::ClientDisconnected;
                                }
                                continue;
                            }
                            match self.evaluator.execute(run_id, cell_id, &source).await {
                                Ok(()) => {
                                    debug!("[kernel] Started run {} for cell {}", run_id, cell_id);
                                    active = Some(ActiveRun {
                                        run_id,
                                        cell_id,
                                        started: Instant::now(),
                                        grace_deadline: None,
                                    });
                                    if send(&mut writer, &KernelMessage::ExecutionStarted { run_id }).await.is_err() {
                                        break ServeExit::ClientDisconnected;
                                    }
                                }
                                Err(e) => {
                                    error!("[kernel] Could not start run {}: {}", run_id, e);
                                    let reply = KernelMessage::ExecutionResult {
                                        run_id,
                                        status: RunStatus::Error,
                                        error_detail: Some(e.to_string()),
                                    };
                                    if send(&mut writer, &reply).await.is_err() {
                                        break ServeExit::ClientDisconnected;
                                    }
                                }
                            }
                        }
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Some(EvalEvent::Output { run_id, stream, data }) => {
                            if active.as_ref().map(|run| run.run_id) != Some(run_id) {
                                debug!("[kernel] Dropping output of finished run {}", run_id);
                                continue;
                            }
                            let chunk = KernelMessage::OutputChunk { run_id, stream, data };
                            if send(&mut writer, &chunk).await.is_err() {
                                break ServeExit::ClientDisconnected;
                            }
                        }
                        Some(EvalEvent::Done { run_id, status, error_detail }) => {
                            if active.as_ref().map(|run| run.run_id) != Some(run_id) {
                                debug!("[kernel] Ignoring result of stale run {}", run_id);
                                continue;
                            }
                            let Some(run) = active.take() else { continue };
                            if finish(&mut writer, run, status, error_detail).await.is_err() {
                                break ServeExit::ClientDisconnected;
                            }
                        }
                        Some(EvalEvent::Exited { reason }) => {
                            error!("[kernel] Interpreter died: {}", reason);
                            if let Some(run) = active.take() {
                                let detail = format!("interpreter died: {}", reason);
                                let _ = finish(&mut writer, run, RunStatus::Error, Some(detail)).await;
                            }
                            break ServeExit::InterpreterDied(reason);
                        }
                        None => {
                            break ServeExit::InterpreterDied("evaluator event stream closed".to_string());
                        }
                    }
                }

                Some(()) = interrupts.recv() => {
                    let Some(run) = active.as_mut() else {
                        debug!("[kernel] Interrupt while idle, ignoring");
                        continue;
                    };
                    info!("[kernel] Interrupting run {}", run.run_id);
                    if let Err(e) = self.evaluator.interrupt() {
                        warn!("[kernel] Failed to interrupt interpreter: {}", e);
                    }
                    if run.grace_deadline.is_none() {
                        run.grace_deadline = Some(Instant::now() + self.config.interrupt_grace);
                    }
                }

                _ = tokio::time::sleep_until(grace_deadline.unwrap_or(far_future)), if grace_deadline.is_some() => {
                    let Some(run) = active.take() else { continue };
                    warn!(
                        "[kernel] Run {} ignored interrupt for {:?}, replacing interpreter",
                        run.run_id, self.config.interrupt_grace
                    );
                    if let Err(e) = self.evaluator.reset().await {
                        error!("[kernel] Interpreter reset failed: {}", e);
                        let detail = format!("interpreter reset failed: {}", e);
                        let _ = finish(&mut writer, run, RunStatus::Error, Some(detail)).await;
                        break ServeExit::InterpreterDied(e.to_string());
                    }
                    let detail = "interrupt ignored; interpreter restarted and state lost".to_string();
                    if finish(&mut writer, run, RunStatus::Interrupted, Some(detail)).await.is_err() {
                        break ServeExit::ClientDisconnected;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        warn!(
                            "[kernel] No frame from client for {:?}, exiting",
                            last_seen.elapsed()
                        );
                        break ServeExit::ClientSilent;
                    }
                    if send(&mut writer, &KernelMessage::Heartbeat).await.is_err() {
                        break ServeExit::ClientDisconnected;
                    }
                }
            }
        };

        reader_task.abort();
        self.evaluator.shutdown().await;
        info!("[kernel] Serve loop finished: {:?}", exit);
        Ok(exit)
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &KernelMessage) -> Result<()> {
    send_json_frame(writer, msg).await.map_err(|e| {
        warn!("[kernel] Failed to write to client: {}", e);
        e
    })
}

/// Report the terminal result of `run` and write its execution record.
async fn finish(
    writer: &mut OwnedWriteHalf,
    run: ActiveRun,
    status: RunStatus,
    error_detail: Option<String>,
) -> Result<()> {
    info!(
        "[kernel] run_id={} cell_id={} status={} duration_ms={}",
        run.run_id,
        run.cell_id,
        status,
        run.started.elapsed().as_millis()
    );
    send(
        writer,
        &KernelMessage::ExecutionResult {
            run_id: run.run_id,
            status,
            error_detail,
        },
    )
    .await
}
