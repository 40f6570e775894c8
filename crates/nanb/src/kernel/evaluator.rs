//! The interpreter behind the kernel.
//!
//! An [`Evaluator`] owns the actual interpreter state. The server hands it one
//! source at a time and consumes the [`EvalEvent`]s it produces on a channel
//! created alongside it.

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::{RunId, RunStatus, Stream};

/// Embedded driver executed by the Python interpreter.
const PYTHON_DRIVER: &str = include_str!("driver.py");

/// Events produced by an evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalEvent {
    Output {
        run_id: RunId,
        stream: Stream,
        data: Vec<u8>,
    },
    Done {
        run_id: RunId,
        status: RunStatus,
        error_detail: Option<String>,
    },
    /// The interpreter is gone and cannot run anything else.
    Exited { reason: String },
}

/// A persistent interpreter that runs one source at a time.
pub trait Evaluator: Send {
    /// Human readable interpreter description, reported in `Ready`.
    fn describe(&self) -> String;

    /// Start running `source`. Output and the terminal `Done` arrive as events.
    fn execute(
        &mut self,
        run_id: RunId,
        cell_id: usize,
        source: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ask the running source to stop. Must not block.
    fn interrupt(&mut self) -> Result<()>;

    /// Replace the interpreter with a fresh one; all state is lost.
    fn reset(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// One line written by the driver on its event stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DriverEvent {
    Ready,
    Output {
        run_id: RunId,
        stream: Stream,
        #[serde(with = "crate::protocol::base64_bytes")]
        data: Vec<u8>,
    },
    Done {
        run_id: RunId,
        status: RunStatus,
        #[serde(default)]
        detail: Option<String>,
    },
}

#[derive(Serialize)]
struct DriverRequest<'a> {
    run_id: RunId,
    cell_id: usize,
    source: &'a str,
}

/// A running interpreter child.
struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    /// Set before the child is killed on purpose so its reader doesn't
    /// report the exit.
    retired: Arc<AtomicBool>,
}

impl Interpreter {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn stop(mut self, grace: Duration) {
        self.retired.store(true, Ordering::SeqCst);
        drop(self.stdin);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("[evaluator] Interpreter exited with {}", status),
            Ok(Err(e)) => warn!("[evaluator] Failed to wait for interpreter: {}", e),
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    warn!("[evaluator] Failed to kill interpreter: {}", e);
                }
            }
        }
    }
}

/// Evaluator backed by a persistent Python interpreter process.
pub struct PythonEvaluator {
    program: String,
    args: Vec<String>,
    startup_timeout: Duration,
    interpreter: Option<Interpreter>,
    events_tx: mpsc::UnboundedSender<EvalEvent>,
}

impl PythonEvaluator {
    /// Start the interpreter and wait until the driver reports ready.
    pub async fn spawn(
        program: impl Into<String>,
        args: Vec<String>,
        startup_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EvalEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut evaluator = Self {
            program: program.into(),
            args,
            startup_timeout,
            interpreter: None,
            events_tx,
        };
        evaluator.interpreter = Some(evaluator.start_interpreter().await?);
        Ok((evaluator, events_rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.interpreter.as_ref().and_then(Interpreter::pid)
    }

    async fn start_interpreter(&self) -> Result<Interpreter> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-u")
            .arg("-c")
            .arg(PYTHON_DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start {}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("interpreter stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("interpreter stdout not captured".to_string()))?;

        let retired = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_driver_events(
            stdout,
            self.events_tx.clone(),
            retired.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(
                    "[evaluator] Interpreter {} ready (pid {:?})",
                    self.program,
                    child.id()
                );
                Ok(Interpreter {
                    child,
                    stdin,
                    retired,
                })
            }
            Ok(Err(_)) => {
                retired.store(true, Ordering::SeqCst);
                let status = child.wait().await.ok();
                Err(Error::Spawn(format!(
                    "interpreter {} exited during startup ({:?})",
                    self.program, status
                )))
            }
            Err(_) => {
                retired.store(true, Ordering::SeqCst);
                let _ = child.kill().await;
                Err(Error::Timeout(format!(
                    "interpreter {} not ready after {:?}",
                    self.program, self.startup_timeout
                )))
            }
        }
    }
}

/// Forward driver events until the driver's stdout closes.
async fn read_driver_events(
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::UnboundedSender<EvalEvent>,
    retired: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "interpreter exited".to_string(),
            Err(e) => break format!("interpreter stream failed: {}", e),
        };
        let event = match serde_json::from_str::<DriverEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("[evaluator] Ignoring malformed driver line: {}", e);
                continue;
            }
        };
        let forwarded = match event {
            DriverEvent::Ready => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
                continue;
            }
            DriverEvent::Output {
                run_id,
                stream,
                data,
            } => EvalEvent::Output {
                run_id,
                stream,
                data,
            },
            DriverEvent::Done {
                run_id,
                status,
                detail,
            } => EvalEvent::Done {
                run_id,
                status,
                error_detail: detail,
            },
        };
        if events_tx.send(forwarded).is_err() {
            return;
        }
    };

    if !retired.load(Ordering::SeqCst) {
        let _ = events_tx.send(EvalEvent::Exited { reason });
    }
}

impl Evaluator for PythonEvaluator {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn execute(&mut self, run_id: RunId, cell_id: usize, source: &str) -> Result<()> {
        let interpreter = self
            .interpreter
            .as_mut()
            .ok_or_else(|| Error::KernelDead("no interpreter".to_string()))?;

        let mut line = serde_json::to_vec(&DriverRequest {
            run_id,
            cell_id,
            source,
        })?;
        line.push(b'\n');

        let write = async {
            interpreter.stdin.write_all(&line).await?;
            interpreter.stdin.flush().await
        };
        write
            .await
            .map_err(|e| Error::KernelDead(format!("interpreter not accepting input: {}", e)))
    }

    fn interrupt(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self
            .pid()
            .ok_or_else(|| Error::KernelDead("no interpreter".to_string()))?;
        kill(Pid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|e| Error::KernelDead(format!("failed to signal interpreter: {}", e)))
    }

    async fn reset(&mut self) -> Result<()> {
        if let Some(old) = self.interpreter.take() {
            info!("[evaluator] Replacing interpreter (pid {:?})", old.pid());
            old.stop(Duration::ZERO).await;
        }
        self.interpreter = Some(self.start_interpreter().await?);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(interpreter) = self.interpreter.take() {
            interpreter.stop(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_event_wire_format() {
        let run_id = RunId::new();
        let line = format!(
            r#"{{"event": "output", "run_id": "{}", "stream": "result", "data": "NDIK"}}"#,
            serde_json::to_value(run_id).unwrap().as_str().unwrap()
        );
        match serde_json::from_str::<DriverEvent>(&line).unwrap() {
            DriverEvent::Output {
                run_id: parsed,
                stream,
                data,
            } => {
                assert_eq!(parsed, run_id);
                assert_eq!(stream, Stream::Result);
                assert_eq!(data, b"42\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_driver_done_with_null_detail() {
        let run_id = RunId::new();
        let line = format!(
            r#"{{"event": "done", "run_id": "{}", "status": "interrupted", "detail": null}}"#,
            serde_json::to_value(run_id).unwrap().as_str().unwrap()
        );
        let event: DriverEvent = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            event,
            DriverEvent::Done {
                status: RunStatus::Interrupted,
                detail: None,
                ..
            }
        ));
    }

    #[test]
    fn test_driver_request_shape() {
        let request = DriverRequest {
            run_id: RunId::new(),
            cell_id: 2,
            source: "print('hi')",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["cell_id"], 2);
        assert_eq!(json["source"], "print('hi')");
    }

    #[test]
    fn test_driver_script_speaks_the_event_names() {
        for name in ["\"ready\"", "\"output\"", "\"done\"", "\"result\""] {
            assert!(PYTHON_DRIVER.contains(name), "driver is missing {}", name);
        }
    }
}
