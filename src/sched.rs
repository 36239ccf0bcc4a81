//! Scheduler contract.
//!
//! Weft does not schedule; the host does. The core's only demand is a way to
//! hand a parked continuation back to the execution queue. Unpark paths call
//! [`Scheduler::make_resumable`] for each waiter they release; the host
//! later feeds each token to [`TaskSet::resume`](crate::task::TaskSet::resume)
//! and, on `Run`, re-enters the operation the task was parked in.
//!
//! Tokens may arrive more than once or outlive the task they name; `resume`
//! filters stale ones, so schedulers are free to be sloppy about retraction.

use crate::types::ResumeToken;

/// Execution-queue handle consumed by unpark paths.
pub trait Scheduler {
    /// Marks a parked continuation as resumable.
    fn make_resumable(&mut self, token: ResumeToken);
}
