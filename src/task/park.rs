//! Park queues: waiter lists hanging off a task.
//!
//! Every task carries two queues, one for waiters observing "this task
//! completed" and one for "this task finished cancelling". Entries pair the
//! parked task with the resume token minted at park time; removal from the
//! middle must be tolerated because a parked task can be torn down (and its
//! linkage retracted) while others stay parked behind it.
//!
//! No ordering is promised to waiters beyond "eventually resumed".

use crate::types::{ResumeToken, TaskId};
use smallvec::SmallVec;

/// A parked task plus the token that resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub task: TaskId,
    pub token: ResumeToken,
}

/// Ordered list of parked waiters. Two waiters per task is the common case,
/// so entries stay inline until a queue actually grows.
#[derive(Debug, Default)]
pub(crate) struct ParkQueue {
    entries: SmallVec<[Waiter; 2]>,
}

impl ParkQueue {
    pub const fn new() -> Self {
        Self {
            entries: SmallVec::new_const(),
        }
    }

    /// Pushes a waiter. Most recent waiter sits at the back.
    pub fn push(&mut self, task: TaskId, token: ResumeToken) {
        self.entries.push(Waiter { task, token });
    }

    /// Removes every entry parked by `task`. Safe when the queue is empty or
    /// the task never parked here.
    pub fn remove(&mut self, task: TaskId) {
        self.entries.retain(|waiter| waiter.task != task);
    }

    /// Takes all entries, leaving the queue empty.
    pub fn drain(&mut self) -> SmallVec<[Waiter; 2]> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries without removing them (GC traversal).
    pub fn iter(&self) -> impl Iterator<Item = &Waiter> {
        self.entries.iter()
    }
}
