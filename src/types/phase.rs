//! The cancellation phase lattice.

use core::fmt;

/// Cancellation phase of a task.
///
/// Phases are ordered and only ever advance:
///
/// ```text
/// Active < CancelRequested < CancelStarted < Cancelled
/// ```
///
/// - `Active`: normal execution. A completed task also carries this phase,
///   with its result slot set.
/// - `CancelRequested`: someone asked for cancellation, but the task has not
///   yet reached a suspension point where teardown can begin.
/// - `CancelStarted`: teardown is underway; descendants are being cancelled
///   and the task's own unwind follows.
/// - `Cancelled`: terminal. All descendants were cancelled first and every
///   cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Phase {
    /// Normal execution (or normal completion, if the result slot is set).
    Active,
    /// Cancellation requested, not yet acknowledged.
    CancelRequested,
    /// Teardown in progress.
    CancelStarted,
    /// Terminal: cancelled, fully unwound.
    Cancelled,
}

impl Phase {
    /// Returns true if this phase is terminal.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if cancellation has been requested or is in progress,
    /// including the terminal phase.
    #[inline]
    #[must_use]
    pub const fn is_interrupted(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::CancelRequested => "cancel-requested",
            Self::CancelStarted => "cancel-started",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
