//! Per-task record.

use crate::task::park::ParkQueue;
use crate::types::{Phase, TaskId};
use core::fmt;

/// Which of a task's two park queues a waiter sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// Parked until the task completes with a result.
    Await,
    /// Parked until the task finishes cancelling.
    Cancel,
}

/// Where a task's own waiter entry currently lives.
///
/// Recorded at park time so that departure (resume, retraction, unwind) can
/// pull the entry back out of the queue it sits in. This is the single-shot
/// "retract my linkage when I leave" obligation, kept as plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParkSite {
    pub target: TaskId,
    pub queue: WaitKind,
}

/// Cleanup callback run when the task unwinds (or completes).
pub(crate) type Cleanup = Box<dyn FnOnce() + Send>;

/// Internal record for one task.
///
/// Invariants:
/// - `phase` never decreases (enforced by [`advance_phase`](Self::advance_phase)).
/// - `result` is set at most once, and only while `phase` is still `Active`.
/// - `children` holds only unsettled children, in creation order; settled
///   children detach themselves.
pub(crate) struct TaskRecord<V> {
    pub id: TaskId,
    pub phase: Phase,
    pub result: Option<V>,
    /// True while the task executes synchronously on the host's stack,
    /// including while its descendants are being synchronously cancelled.
    pub running: bool,
    pub parent: Option<TaskId>,
    /// Unsettled children in creation order; the back is the most recent.
    pub children: Vec<TaskId>,
    pub await_waiters: ParkQueue,
    pub cancel_waiters: ParkQueue,
    /// Where this task's own waiter entry lives, if parked.
    pub parked_on: Option<ParkSite>,
    /// Bumped on every park and departure; resume tokens carry the value
    /// they were minted with, so stale tokens miss.
    pub park_seq: u32,
    /// LIFO cleanup stack, run once at settle.
    pub cleanups: Vec<Cleanup>,
}

impl<V> TaskRecord<V> {
    pub fn new(id: TaskId, parent: Option<TaskId>) -> Self {
        Self {
            id,
            phase: Phase::Active,
            result: None,
            running: true,
            parent,
            children: Vec::new(),
            await_waiters: ParkQueue::new(),
            cancel_waiters: ParkQueue::new(),
            parked_on: None,
            park_seq: 0,
            cleanups: Vec::new(),
        }
    }

    /// Advances the phase. Phases are monotone; moving backwards is a logic
    /// error and panics.
    pub fn advance_phase(&mut self, to: Phase) {
        assert!(
            to >= self.phase,
            "phase regression on {:?}: {} -> {}",
            self.id,
            self.phase,
            to
        );
        self.phase = to;
    }

    /// True once the task has a result or finished cancelling.
    pub fn is_settled(&self) -> bool {
        self.result.is_some() || self.phase == Phase::Cancelled
    }
}

impl<V> fmt::Debug for TaskRecord<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("has_result", &self.result.is_some())
            .field("running", &self.running)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("parked_on", &self.parked_on)
            .field("park_seq", &self.park_seq)
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}
