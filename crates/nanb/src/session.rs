//! Session controller.
//!
//! A [`Session`] owns the parsed cells, the kernel connection and the run
//! queue, and is the only thing that changes cell state. Commands take
//! `&mut self`; kernel events are applied one at a time by
//! [`Session::next_event`], which also reports every change to the caller.
//!
//! Run policy: `run_cell` queues. The head of the queue is dispatched as soon
//! as nothing is running and the kernel is ready. A run the session abandons
//! (its cell was reloaded, or its interrupt timed out) still occupies the
//! kernel, so dispatch waits for its result.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::cell::{parse, Cell, CellState, OutputChunk};
use crate::error::{Error, Result};
use crate::execution_queue::ExecutionQueue;
use crate::kernel_manager::{KernelConnection, KernelEvent, KernelLauncher, KernelManager, Liveness};
use crate::protocol::{RunId, RunStatus, Stream};
use crate::settings::Settings;

/// Something the caller may want to redraw.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { cell: usize, state: CellState },
    Output { cell: usize, stream: Stream, data: Vec<u8> },
    KernelDead { reason: String },
}

/// The run the session is waiting on.
#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    cell: usize,
    started: Instant,
    /// Set once the user asked for an interrupt.
    interrupt_deadline: Option<Instant>,
}

pub struct Session<L: KernelLauncher = KernelManager> {
    cells: Vec<Cell>,
    kernel: KernelConnection,
    launcher: L,
    settings: Settings,
    queue: ExecutionQueue,
    active: Option<ActiveRun>,
    /// A run the session gave up on that the kernel is still executing.
    /// Nothing is dispatched until its result arrives.
    draining: Option<RunId>,
    events: VecDeque<SessionEvent>,
    /// The kernel connection has reported everything it ever will.
    kernel_drained: bool,
    closed: bool,
}

impl Session<KernelManager> {
    /// Parse the file at `path` and start a kernel for it.
    pub async fn open(path: impl AsRef<Path>, settings: Settings) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let launcher = KernelManager::new(settings.clone());
        Self::new(parse(&text), launcher, settings).await
    }
}

impl<L: KernelLauncher> Session<L> {
    /// Start a kernel with `launcher` and wrap it around `cells`.
    pub async fn new(cells: Vec<Cell>, launcher: L, settings: Settings) -> Result<Self> {
        let kernel = launcher.spawn().await?;
        info!(
            "[session] Kernel started for {} cells (pid {:?})",
            cells.len(),
            kernel.pid()
        );
        Ok(Self {
            cells,
            kernel,
            launcher,
            settings,
            queue: ExecutionQueue::new(),
            active: None,
            draining: None,
            events: VecDeque::new(),
            kernel_drained: false,
            closed: false,
        })
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, id: usize) -> Option<&Cell> {
        self.cells.get(id)
    }

    pub fn kernel(&self) -> &KernelConnection {
        &self.kernel
    }

    pub fn liveness(&self) -> Liveness {
        self.kernel.liveness()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Id of the cell whose run the session is waiting on.
    pub fn running_cell(&self) -> Option<usize> {
        self.active.as_ref().map(|run| run.cell)
    }

    /// Nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Queue a code cell for execution.
    pub fn run_cell(&mut self, id: usize) -> Result<()> {
        self.enqueue(id, false)?;
        self.dispatch();
        Ok(())
    }

    /// Queue every code cell in file order. Cells that are already queued or
    /// running are left alone. Returns how many cells were queued.
    pub fn run_all(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.ensure_kernel_alive()?;
        let ids: Vec<usize> = self
            .cells
            .iter()
            .filter(|cell| cell.is_code() && cell.state().can_run())
            .map(|cell| cell.id)
            .collect();
        for &id in &ids {
            self.enqueue(id, true)?;
        }
        self.dispatch();
        Ok(ids.len())
    }

    /// Interrupt the running cell and cancel everything queued behind it.
    pub fn interrupt(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(run) = self.active.as_ref() else {
            return Err(Error::NotRunning);
        };
        if self.cells[run.cell].state() != CellState::Running {
            return Err(Error::NotRunning);
        }
        if run.interrupt_deadline.is_some() {
            debug!("[session] Interrupt already requested for run {}", run.run_id);
            return Ok(());
        }

        self.kernel.interrupt()?;
        info!("[session] Interrupt requested for cell {}", run.cell);

        let deadline = Instant::now() + self.settings.kernel.interrupt_timeout();
        if let Some(run) = self.active.as_mut() {
            run.interrupt_deadline = Some(deadline);
        }
        for queued in self.queue.clear_pending() {
            self.set_state(queued.cell_id, queued.prior_state);
        }
        Ok(())
    }

    /// Drop the output of one cell.
    pub fn clear_output(&mut self, id: usize) -> Result<()> {
        let cell = self.cells.get_mut(id).ok_or(Error::NoSuchCell(id))?;
        cell.clear_output();
        Ok(())
    }

    /// Drop the output of every cell.
    pub fn clear_all(&mut self) {
        for cell in &mut self.cells {
            cell.clear_output();
        }
    }

    /// Replace the kernel with a fresh one. Every cell goes back to idle.
    ///
    /// If the new kernel can't be started the session keeps a dead
    /// connection and the start-up error is returned.
    pub async fn restart_kernel(&mut self) -> Result<()> {
        self.ensure_open()?;
        info!("[session] Restarting kernel");

        let old = std::mem::replace(&mut self.kernel, KernelConnection::dead("kernel restarting"));
        self.active = None;
        self.draining = None;
        self.queue.reset();
        for id in 0..self.cells.len() {
            self.cells[id].clear_output();
            if self.cells[id].state() != CellState::Idle {
                self.set_state(id, CellState::Idle);
            }
        }

        match self.launcher.restart(old).await {
            Ok(kernel) => {
                self.kernel = kernel;
                self.kernel_drained = false;
                Ok(())
            }
            Err(e) => {
                warn!("[session] Kernel restart failed: {}", e);
                self.kernel = KernelConnection::dead(e.to_string());
                self.kernel_drained = true;
                self.events.push_back(SessionEvent::KernelDead {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Re-parse the source. Cells whose kind, text and position are unchanged
    /// keep their state and output; every other cell starts out idle.
    pub fn reload(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let mut fresh = parse(text);
        let mut previous: Vec<Option<Cell>> =
            std::mem::take(&mut self.cells).into_iter().map(Some).collect();

        let mut kept = vec![false; previous.len()];
        for cell in &mut fresh {
            if let Some(slot) = previous.get_mut(cell.id) {
                if slot.as_ref().is_some_and(|old| old.same_content(cell)) {
                    if let Some(old) = slot.take() {
                        cell.inherit(old);
                        kept[cell.id] = true;
                    }
                }
            }
        }
        self.cells = fresh;

        // Runs for cells that changed or vanished no longer belong anywhere.
        for (id, was_kept) in kept.iter().enumerate() {
            if *was_kept {
                continue;
            }
            if self.queue.remove(id).is_some() {
                debug!("[session] Dropped queued cell {} on reload", id);
            }
            if self.active.as_ref().is_some_and(|run| run.cell == id) {
                if let Some(run) = self.active.take() {
                    info!("[session] Orphaning run {} of reloaded cell {}", run.run_id, id);
                    self.queue.complete(id);
                    self.draining = Some(run.run_id);
                }
            }
            if id < self.cells.len() {
                self.events.push_back(SessionEvent::StateChanged {
                    cell: id,
                    state: self.cells[id].state(),
                });
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Shut the kernel down. The session accepts no further commands.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.active = None;
        self.draining = None;
        for queued in self.queue.reset() {
            self.set_state(queued.cell_id, queued.prior_state);
        }
        self.kernel.shutdown().await;
        info!("[session] Closed");
    }

    /// Wait for the next change. Returns `None` once the session is shut
    /// down; otherwise waits for the kernel as long as it takes. Cancel safe.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }

            let deadline = self.active.as_ref().and_then(|run| run.interrupt_deadline);
            let far_future = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                event = self.kernel.next_event(), if !self.kernel_drained => match event {
                    Some(event) => self.apply(event),
                    None => self.kernel_drained = true,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => {
                    self.interrupt_timed_out();
                }
                else => std::future::pending::<()>().await,
            }
        }
    }

    /// Process events until nothing is queued or running.
    pub async fn run_until_idle(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            match tokio::time::timeout_at(deadline, self.next_event()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "session still busy after {:?}",
                        timeout
                    )))
                }
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn ensure_kernel_alive(&self) -> Result<()> {
        if self.kernel.liveness() == Liveness::Dead {
            let reason = self.kernel.dead_reason().unwrap_or("kernel is not running");
            return Err(Error::KernelDead(reason.to_string()));
        }
        Ok(())
    }

    fn enqueue(&mut self, id: usize, from_run_all: bool) -> Result<()> {
        self.ensure_open()?;
        let cell = self.cells.get(id).ok_or(Error::NoSuchCell(id))?;
        if !cell.is_code() {
            return Err(Error::NotCode(id));
        }
        let prior = cell.state();
        if !prior.can_run() {
            return Err(Error::InvalidState { id, state: prior });
        }
        self.ensure_kernel_alive()?;

        self.queue.enqueue(id, prior, from_run_all);
        self.set_state(id, CellState::Pending);
        Ok(())
    }

    fn set_state(&mut self, id: usize, state: CellState) {
        if let Some(cell) = self.cells.get_mut(id) {
            cell.set_state(state);
            self.events
                .push_back(SessionEvent::StateChanged { cell: id, state });
        }
    }

    fn push_output(&mut self, id: usize, stream: Stream, data: Vec<u8>) {
        if let Some(cell) = self.cells.get_mut(id) {
            cell.push_output(OutputChunk::new(stream, data.clone()));
            self.events.push_back(SessionEvent::Output {
                cell: id,
                stream,
                data,
            });
        }
    }

    /// Send the head of the queue to the kernel if it can take it.
    fn dispatch(&mut self) {
        if self.closed
            || self.active.is_some()
            || self.draining.is_some()
            || self.kernel.liveness() != Liveness::Ready
        {
            return;
        }
        let Some(next) = self.queue.dequeue() else {
            return;
        };
        let id = next.cell_id;
        let run_id = RunId::new();
        self.cells[id].clear_output();

        match self.kernel.execute(run_id, id, &self.cells[id].source) {
            Ok(()) => {
                debug!("[session] Dispatched cell {} as run {}", id, run_id);
                self.active = Some(ActiveRun {
                    run_id,
                    cell: id,
                    started: Instant::now(),
                    interrupt_deadline: None,
                });
            }
            Err(e) => {
                warn!("[session] Failed to dispatch cell {}: {}", id, e);
                self.queue.complete(id);
                let detail = e.to_string();
                self.push_output(id, Stream::Error, detail.clone().into_bytes());
                self.cells[id].set_error(Some(detail));
                self.set_state(id, CellState::Failed);
                self.cancel_run_all();
            }
        }
    }

    fn apply(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::Started { run_id } => {
                let Some(run) = self.active.as_ref().filter(|run| run.run_id == run_id) else {
                    debug!("[session] Ignoring start of orphaned run {}", run_id);
                    return;
                };
                let id = run.cell;
                if self.cells[id].state() == CellState::Pending {
                    self.set_state(id, CellState::Running);
                }
            }
            KernelEvent::Output {
                run_id,
                stream,
                data,
            } => {
                let Some(run) = self.active.as_ref().filter(|run| run.run_id == run_id) else {
                    debug!("[session] Dropping output of orphaned run {}", run_id);
                    return;
                };
                if run.interrupt_deadline.is_some() {
                    debug!("[session] Dropping output of interrupted run {}", run_id);
                    return;
                }
                let id = run.cell;
                self.push_output(id, stream, data);
            }
            KernelEvent::Finished {
                run_id,
                status,
                error_detail,
            } => {
                if self.active.as_ref().map(|run| run.run_id) == Some(run_id) {
                    self.finish_active(status, error_detail);
                } else if self.draining == Some(run_id) {
                    debug!("[session] Orphaned run {} drained", run_id);
                    self.draining = None;
                } else {
                    debug!("[session] Ignoring result of unknown run {}", run_id);
                }
                self.dispatch();
            }
            KernelEvent::TransportError { run_id, message } => {
                warn!("[session] Transport error: {}", message);
                let hit_active = run_id.is_some()
                    && self.active.as_ref().map(|run| run.run_id) == run_id;
                if hit_active {
                    self.finish_active(RunStatus::Error, Some(format!("transport error: {}", message)));
                }
            }
            KernelEvent::Lost { reason } => self.kernel_lost(reason),
        }
    }

    /// Resolve the active run with a terminal status.
    fn finish_active(&mut self, status: RunStatus, error_detail: Option<String>) {
        let Some(run) = self.active.take() else {
            return;
        };
        let id = run.cell;
        self.queue.complete(id);

        let state = match status {
            RunStatus::Ok => CellState::Succeeded,
            RunStatus::Error => CellState::Failed,
            RunStatus::Interrupted => CellState::Interrupted,
        };
        info!(
            "[session] Cell {} finished: {} after {:?}",
            id,
            state,
            run.started.elapsed()
        );

        if state == CellState::Failed {
            if let Some(detail) = &error_detail {
                self.push_output(id, Stream::Error, detail.clone().into_bytes());
            }
        }
        if state != CellState::Succeeded {
            self.cells[id].set_error(error_detail);
        }
        self.set_state(id, state);

        if state != CellState::Succeeded {
            self.cancel_run_all();
        }
    }

    /// Cancel the rest of a `run_all` after a failure, unless configured to
    /// keep going.
    fn cancel_run_all(&mut self) {
        if self.settings.continue_on_error {
            return;
        }
        for queued in self.queue.cancel_run_all() {
            self.set_state(queued.cell_id, queued.prior_state);
        }
    }

    fn interrupt_timed_out(&mut self) {
        let Some(run) = self.active.take() else {
            return;
        };
        warn!(
            "[session] Run {} did not stop within {:?}, giving up on it",
            run.run_id,
            self.settings.kernel.interrupt_timeout()
        );
        self.queue.complete(run.cell);
        self.draining = Some(run.run_id);
        self.cells[run.cell].set_error(Some("interrupt timed out".to_string()));
        self.set_state(run.cell, CellState::Interrupted);
    }

    fn kernel_lost(&mut self, reason: String) {
        warn!("[session] Kernel died: {}", reason);
        self.draining = None;
        if let Some(run) = self.active.take() {
            let detail = format!("kernel died: {}", reason);
            self.queue.complete(run.cell);
            self.push_output(run.cell, Stream::Error, detail.clone().into_bytes());
            self.cells[run.cell].set_error(Some(detail));
            self.set_state(run.cell, CellState::Failed);
        }
        for queued in self.queue.reset() {
            self.set_state(queued.cell_id, queued.prior_state);
        }
        self.events.push_back(SessionEvent::KernelDead { reason });
    }
}
