//! Identifier types.
//!
//! Tasks live in an arena and are referred to by [`TaskId`], a
//! generation-checked handle: a reaped slot that is later reused yields a
//! different generation, so stale ids fail lookup instead of aliasing a new
//! task.

use crate::util::ArenaIndex;
use core::fmt;

/// Unique identifier for a task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(ArenaIndex);

impl TaskId {
    /// Creates a task id from its arena slot.
    #[inline]
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    /// Returns the underlying arena slot.
    #[inline]
    #[must_use]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Creates a task id with explicit slot and generation, for tests that
    /// need ids without a live task set.
    #[must_use]
    pub fn new_for_test(index: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(index, generation))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Handle to a parked continuation, held by the scheduler.
///
/// A token is minted each time a task parks and is invalidated when the task
/// departs that park (resume, retraction, or unwind), so a token scheduled
/// twice, or scheduled for a task that has since moved on, resolves to a
/// harmless no-op in [`TaskSet::resume`](crate::task::TaskSet::resume).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResumeToken {
    task: TaskId,
    seq: u32,
}

impl ResumeToken {
    #[inline]
    #[must_use]
    pub(crate) const fn new(task: TaskId, seq: u32) -> Self {
        Self { task, seq }
    }

    /// Returns the task this token resumes.
    #[inline]
    #[must_use]
    pub const fn task(self) -> TaskId {
        self.task
    }

    #[inline]
    #[must_use]
    pub(crate) const fn seq(self) -> u32 {
        self.seq
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({:?}@{})", self.task, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_equality_includes_generation() {
        let a = TaskId::new_for_test(3, 0);
        let b = TaskId::new_for_test(3, 1);
        assert_ne!(a, b);
        assert_eq!(a, TaskId::new_for_test(3, 0));
    }

    #[test]
    fn debug_formats_are_compact() {
        let id = TaskId::new_for_test(7, 2);
        assert_eq!(format!("{id:?}"), "TaskId(7:2)");
    }
}
