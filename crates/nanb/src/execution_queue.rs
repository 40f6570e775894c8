//! FIFO run queue owned by the session.
//!
//! Holds pending cell ids plus the one currently executing. The session
//! dispatches the head of the queue whenever nothing is executing and the
//! kernel is ready.

use std::collections::VecDeque;

use crate::cell::CellState;

/// A cell waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCell {
    pub cell_id: usize,
    /// State to restore if the entry is cancelled before it runs.
    pub prior_state: CellState,
    /// Queued by `run_all`; cancelled together when one of them fails.
    pub from_run_all: bool,
}

/// Pending cell ids in FIFO order, plus the one the kernel is running.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    pending: VecDeque<QueuedCell>,
    executing: Option<usize>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell; `prior_state` is restored if it is cancelled.
    pub fn enqueue(&mut self, cell_id: usize, prior_state: CellState, from_run_all: bool) {
        self.pending.push_back(QueuedCell {
            cell_id,
            prior_state,
            from_run_all,
        });
    }

    /// Pop the head and mark it executing. `None` while a cell executes.
    pub fn dequeue(&mut self) -> Option<QueuedCell> {
        if self.executing.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.executing = Some(next.cell_id);
        Some(next)
    }

    /// Clear the executing marker if it belongs to `cell_id`.
    pub fn complete(&mut self, cell_id: usize) {
        if self.executing == Some(cell_id) {
            self.executing = None;
        }
    }

    /// Drain every pending entry. The executing cell is untouched.
    pub fn clear_pending(&mut self) -> Vec<QueuedCell> {
        self.pending.drain(..).collect()
    }

    /// Remove pending entries that were queued by `run_all`.
    pub fn cancel_run_all(&mut self) -> Vec<QueuedCell> {
        let (cancelled, kept): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|q| q.from_run_all);
        self.pending = kept.into();
        cancelled
    }

    /// Remove one pending entry.
    pub fn remove(&mut self, cell_id: usize) -> Option<QueuedCell> {
        let index = self.pending.iter().position(|q| q.cell_id == cell_id)?;
        self.pending.remove(index)
    }

    /// Drop everything, including the executing marker.
    pub fn reset(&mut self) -> Vec<QueuedCell> {
        self.executing = None;
        self.clear_pending()
    }

    /// Nothing pending and nothing executing.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }
}
