//! Task lifecycle and the staged cancellation protocol.
//!
//! A [`TaskSet`] owns every task record in one hierarchy-forest. Tasks are
//! cooperative continuations: the host runs their bodies and calls into the
//! set at suspension points; the set answers with an [`Op`] telling the host
//! whether to keep running, park, or stop because the task was cancelled.
//!
//! # Cancellation protocol
//!
//! A task's [`Phase`] only ever advances:
//!
//! 1. `Active -> CancelRequested`: [`TaskSet::request_cancel`] records the
//!    request. A task that is `running` has not reached a suspension point
//!    yet; the rest of the protocol waits until it does.
//! 2. `CancelRequested -> CancelStarted`: teardown begins, either driven by
//!    the canceller (the task was already suspended) or by the task itself
//!    at its next suspension point.
//! 3. Descendants unwind first, most recent child first. A child that is
//!    still executing blocks its parent, which parks on that child's cancel
//!    queue until the child's own unwind completes.
//! 4. `CancelStarted -> Cancelled`: with all children settled, the task's
//!    cleanup stack runs (inside an open transaction, so partial side
//!    effects of unwinding revert as a unit), its waiters are released, and
//!    it detaches from its parent.
//!
//! At the moment a task reaches `Cancelled`, every one of its descendants
//! already has.
//!
//! # Re-entry
//!
//! Operations that park return [`Op::Yield`]. When the scheduler later gets
//! `Run` from [`TaskSet::resume`], the host re-enters the same operation
//! with the same arguments; the operation pulls its answer from current
//! state. Tokens are generation-checked, so duplicate or outdated wakeups
//! fall out as [`Resumed::Stale`].

pub(crate) mod park;
pub(crate) mod record;

use crate::error::{Error, ErrorKind};
use crate::gc::{Trace, Visitor};
use crate::sched::Scheduler;
use crate::tracing_compat::{debug, trace};
use crate::txn::Substrate;
use crate::types::{Op, Phase, ResumeToken, TaskId};
use crate::util::Arena;
use park::Waiter;
use record::{ParkSite, TaskRecord, WaitKind};
use smallvec::SmallVec;

/// Answer from [`TaskSet::request_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CancelReadiness {
    /// The task reached `CancelStarted` with every descendant settled; the
    /// caller may unwind it now.
    Ready,
    /// The task (or one of its descendants) is still executing, or another
    /// path is already driving its teardown. Cancellation continues at the
    /// next suspension point.
    NotReady,
}

/// Answer from [`TaskSet::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Resumed {
    /// The token is current: the task is running again. Re-enter the
    /// operation it was parked in.
    Run(TaskId),
    /// The token is outdated or the task is gone; ignore it.
    Stale,
}

/// Outcome of tearing down a task's children.
enum ChildTeardown {
    /// Every child is settled.
    Complete,
    /// A child is still executing; the task parked on it and yields.
    Blocked(ResumeToken),
}

/// Arena-backed set of task records forming one or more task trees.
#[derive(Debug, Default)]
pub struct TaskSet<V> {
    tasks: Arena<TaskRecord<V>>,
}

impl<V> TaskSet<V> {
    /// Creates an empty task set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Arena::new(),
        }
    }

    /// Returns the number of live task records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no task records are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns true if `id` refers to a live task.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains(id.arena_index())
    }

    fn record(&self, id: TaskId) -> Result<&TaskRecord<V>, Error> {
        self.tasks
            .get(id.arena_index())
            .ok_or(Error::new(ErrorKind::TaskNotFound))
    }

    fn record_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord<V>, Error> {
        self.tasks
            .get_mut(id.arena_index())
            .ok_or(Error::new(ErrorKind::TaskNotFound))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Creates a new task, optionally attached as the youngest child of
    /// `parent`. The new task starts `Active` and running; the host drives
    /// its body.
    pub fn spawn(&mut self, parent: Option<TaskId>) -> Result<TaskId, Error> {
        if let Some(parent) = parent {
            let rec = self.record(parent)?;
            if rec.is_settled() {
                return Err(Error::with_context(ErrorKind::TaskSettled, "spawn"));
            }
        }
        let idx = self
            .tasks
            .insert_with(|idx| TaskRecord::new(TaskId::from_arena(idx), parent));
        let id = TaskId::from_arena(idx);
        if let Some(parent) = parent {
            self.record_mut(parent)?.children.push(id);
        }
        debug!(task = ?id, parent = ?parent, "spawned");
        Ok(id)
    }

    /// Registers a cleanup to run when the task settles. Cleanups run in
    /// reverse registration order; during cancellation they run inside an
    /// open transaction.
    pub fn push_cleanup<F>(&mut self, id: TaskId, cleanup: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let rec = self.record_mut(id)?;
        if rec.is_settled() {
            return Err(Error::with_context(ErrorKind::TaskSettled, "push_cleanup"));
        }
        rec.cleanups.push(Box::new(cleanup));
        Ok(())
    }

    /// Drops a settled task record. Fails with [`ErrorKind::TaskStillLive`]
    /// while the task is unsettled or waiters are still parked on it.
    pub fn reap(&mut self, id: TaskId) -> Result<(), Error> {
        let rec = self.record(id)?;
        if !rec.is_settled() || !rec.await_waiters.is_empty() || !rec.cancel_waiters.is_empty() {
            return Err(Error::new(ErrorKind::TaskStillLive));
        }
        self.tasks.remove(id.arena_index());
        trace!(task = ?id, "reaped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parking
    // ------------------------------------------------------------------

    /// Parks `waiter` on one of `target`'s queues and mints the token that
    /// resumes it. The park site is recorded on the waiter so departure
    /// retracts the entry.
    fn park(&mut self, waiter: TaskId, target: TaskId, queue: WaitKind) -> Result<ResumeToken, Error> {
        let token = {
            let rec = self.record_mut(waiter)?;
            rec.park_seq = rec.park_seq.wrapping_add(1);
            rec.running = false;
            rec.parked_on = Some(ParkSite { target, queue });
            ResumeToken::new(waiter, rec.park_seq)
        };
        let target_rec = self.record_mut(target)?;
        match queue {
            WaitKind::Await => target_rec.await_waiters.push(waiter, token),
            WaitKind::Cancel => target_rec.cancel_waiters.push(waiter, token),
        }
        trace!(waiter = ?waiter, target = ?target, queue = ?queue, "parked");
        Ok(token)
    }

    /// Pulls the task's waiter entry back out of whatever queue it sits in
    /// and invalidates any outstanding token. Safe when not parked.
    fn retract_park(&mut self, id: TaskId) {
        let site = {
            let Some(rec) = self.tasks.get_mut(id.arena_index()) else {
                return;
            };
            let Some(site) = rec.parked_on.take() else {
                return;
            };
            rec.park_seq = rec.park_seq.wrapping_add(1);
            site
        };
        if let Some(target) = self.tasks.get_mut(site.target.arena_index()) {
            match site.queue {
                WaitKind::Await => target.await_waiters.remove(id),
                WaitKind::Cancel => target.cancel_waiters.remove(id),
            }
        }
        trace!(task = ?id, target = ?site.target, "park retracted");
    }

    /// Hands drained waiters to the scheduler. Waiters that moved on since
    /// parking (stale token) are skipped. A waiter mid-teardown is only
    /// resumed from cancel queues: that is a parent (or canceller) waiting
    /// on this task's unwind. Normal resumption of a cancelling task is a
    /// no-op.
    fn release_waiters(
        &mut self,
        drained: SmallVec<[Waiter; 2]>,
        allow_teardown: bool,
        sched: &mut dyn Scheduler,
    ) {
        for waiter in drained {
            let Some(rec) = self.tasks.get_mut(waiter.task.arena_index()) else {
                continue;
            };
            if rec.park_seq != waiter.token.seq() {
                continue;
            }
            rec.parked_on = None;
            let resumable = match rec.phase {
                Phase::Active => true,
                Phase::CancelStarted => allow_teardown,
                Phase::CancelRequested | Phase::Cancelled => false,
            };
            if resumable {
                trace!(waiter = ?waiter.task, "made resumable");
                sched.make_resumable(waiter.token);
            }
        }
    }

    /// Validates a scheduled token. On `Run`, the task is marked running and
    /// the host must re-enter the operation that parked it.
    pub fn resume(&mut self, token: ResumeToken) -> Resumed {
        let Some(rec) = self.tasks.get_mut(token.task().arena_index()) else {
            return Resumed::Stale;
        };
        if rec.park_seq != token.seq() || rec.running || rec.is_settled() {
            return Resumed::Stale;
        }
        rec.park_seq = rec.park_seq.wrapping_add(1);
        rec.parked_on = None;
        rec.running = true;
        trace!(task = ?token.task(), "resumed");
        Resumed::Run(token.task())
    }

    // ------------------------------------------------------------------
    // Completion and awaiting
    // ------------------------------------------------------------------

    /// Finishes the task normally with `value`.
    ///
    /// Before the result is published, any still-live children are cancelled
    /// (most recent first); a child that cannot finish yet parks this task
    /// and yields, and the host re-enters `complete` with the value again
    /// after resume. A task whose cancellation was requested before it got
    /// here finishes through the cancel path instead and produces no result.
    pub fn complete(
        &mut self,
        id: TaskId,
        value: V,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<Op<()>, Error> {
        {
            let rec = self.record_mut(id)?;
            if rec.phase == Phase::Cancelled {
                return Err(Error::with_context(ErrorKind::TaskSettled, "complete"));
            }
            if rec.result.is_some() {
                return Err(Error::new(ErrorKind::ResultAlreadySet));
            }
            if rec.phase == Phase::CancelRequested {
                rec.advance_phase(Phase::CancelStarted);
            }
        }

        if self.record(id)?.phase == Phase::Active {
            match self.cancel_children(id, sched, txn)? {
                ChildTeardown::Blocked(token) => Ok(Op::Yield(token)),
                ChildTeardown::Complete => {
                    self.retract_park(id);
                    let mut cleanups = std::mem::take(&mut self.record_mut(id)?.cleanups);
                    while let Some(cleanup) = cleanups.pop() {
                        cleanup();
                    }
                    let (awaiters, parent) = {
                        let rec = self.record_mut(id)?;
                        debug_assert!(
                            rec.cancel_waiters.is_empty(),
                            "cancel waiters on a task completing normally"
                        );
                        rec.result = Some(value);
                        rec.running = false;
                        (rec.await_waiters.drain(), rec.parent)
                    };
                    debug!(task = ?id, "completed");
                    self.release_waiters(awaiters, false, sched);
                    self.detach(id, parent);
                    Ok(Op::Return(()))
                }
            }
        } else {
            // Cancellation won the race to the task's natural end.
            match self.cancel_children(id, sched, txn)? {
                ChildTeardown::Blocked(token) => Ok(Op::Yield(token)),
                ChildTeardown::Complete => {
                    self.unwind(id, sched, txn)?;
                    Ok(Op::Cancelled)
                }
            }
        }
    }

    /// Suspension point: waits for `target`'s result.
    ///
    /// Drives the waiter's own pending cancellation first; a waiter that
    /// must unwind never parks. With the target already completed the result
    /// is returned immediately; with the target cancelled the wait fails
    /// with [`ErrorKind::TargetCancelled`]; otherwise the waiter parks on
    /// the target's await queue.
    pub fn await_result(
        &mut self,
        waiter: TaskId,
        target: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<Op<V>, Error>
    where
        V: Clone,
    {
        match self.checkpoint(waiter, sched, txn)? {
            Op::Return(()) => {}
            Op::Yield(token) => return Ok(Op::Yield(token)),
            Op::Cancelled => return Ok(Op::Cancelled),
        }
        if waiter == target {
            return Err(Error::with_context(ErrorKind::Internal, "task awaiting itself"));
        }
        let rec = self.record(target)?;
        if let Some(result) = &rec.result {
            return Ok(Op::Return(result.clone()));
        }
        if rec.phase == Phase::Cancelled {
            return Err(Error::new(ErrorKind::TargetCancelled));
        }
        let token = self.park(waiter, target, WaitKind::Await)?;
        Ok(Op::Yield(token))
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Requests cancellation of `id` and drives it as far as it can go
    /// without suspending the caller.
    ///
    /// Raises the phase to at least `CancelRequested`. A running task defers
    /// the rest to its next suspension point; a task already mid-teardown is
    /// left to the path driving it. A suspended task is taken to
    /// `CancelStarted` and its children torn down; `Ready` means the caller
    /// may now unwind it.
    pub fn request_cancel(
        &mut self,
        id: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<CancelReadiness, Error> {
        {
            let rec = self.record_mut(id)?;
            if rec.is_settled() {
                return Ok(CancelReadiness::Ready);
            }
            if rec.phase < Phase::CancelRequested {
                rec.advance_phase(Phase::CancelRequested);
                debug!(task = ?id, "cancel requested");
            }
            if rec.running {
                return Ok(CancelReadiness::NotReady);
            }
            if rec.phase == Phase::CancelStarted {
                // Another path is driving the teardown unless it already ran
                // out of children, in which case only the unwind remains.
                if rec.children.is_empty() {
                    return Ok(CancelReadiness::Ready);
                }
                return Ok(CancelReadiness::NotReady);
            }
            rec.advance_phase(Phase::CancelStarted);
            debug!(task = ?id, "cancel started");
        }
        match self.cancel_children(id, sched, txn)? {
            ChildTeardown::Complete => {
                // Suspended until a caller unwinds it.
                self.record_mut(id)?.running = false;
                Ok(CancelReadiness::Ready)
            }
            ChildTeardown::Blocked(_) => Ok(CancelReadiness::NotReady),
        }
    }

    /// Tears down `id`'s children, most recent first.
    ///
    /// The task is marked running for the duration so a concurrently
    /// scheduled resume of it becomes a no-op. A child that is ready is
    /// unwound synchronously before the next one is taken; a child that is
    /// not leaves this task parked on the child's cancel queue.
    fn cancel_children(
        &mut self,
        id: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<ChildTeardown, Error> {
        self.record_mut(id)?.running = true;
        loop {
            let Some(child) = self.record(id)?.children.last().copied() else {
                return Ok(ChildTeardown::Complete);
            };
            match self.request_cancel(child, sched, txn)? {
                CancelReadiness::Ready => self.unwind(child, sched, txn)?,
                CancelReadiness::NotReady => {
                    trace!(task = ?id, child = ?child, "blocked on child teardown");
                    self.record_mut(id)?.running = false;
                    self.retract_park(id);
                    let token = self.park(id, child, WaitKind::Cancel)?;
                    return Ok(ChildTeardown::Blocked(token));
                }
            }
        }
    }

    /// Runs the task's cleanup stack inside an open transaction and settles
    /// it as cancelled. Children must already be settled.
    fn unwind(
        &mut self,
        id: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<(), Error> {
        let mut cleanups = {
            let rec = self.record_mut(id)?;
            debug_assert_eq!(rec.phase, Phase::CancelStarted, "unwind before teardown");
            debug_assert!(rec.children.is_empty(), "unwind with live children");
            rec.running = true;
            std::mem::take(&mut rec.cleanups)
        };
        self.retract_park(id);
        if !cleanups.is_empty() {
            txn.open_transaction(&mut || {
                while let Some(cleanup) = cleanups.pop() {
                    cleanup();
                }
            });
        }
        self.finish_cancel(id, sched)
    }

    /// Terminal step of cancellation: advance to `Cancelled`, release
    /// waiters (including a parent parked on this task's teardown), detach.
    fn finish_cancel(&mut self, id: TaskId, sched: &mut dyn Scheduler) -> Result<(), Error> {
        let (cancel_waiters, await_waiters, parent) = {
            let rec = self.record_mut(id)?;
            rec.advance_phase(Phase::Cancelled);
            rec.running = false;
            (
                rec.cancel_waiters.drain(),
                rec.await_waiters.drain(),
                rec.parent,
            )
        };
        debug!(task = ?id, "cancelled");
        self.release_waiters(cancel_waiters, true, sched);
        self.release_waiters(await_waiters, false, sched);
        self.detach(id, parent);
        Ok(())
    }

    /// Removes a settled task from its parent's child list.
    fn detach(&mut self, id: TaskId, parent: Option<TaskId>) {
        if let Some(parent) = parent {
            if let Some(rec) = self.tasks.get_mut(parent.arena_index()) {
                rec.children.retain(|&child| child != id);
            }
        }
    }

    /// Suspension-point query: may this task keep running?
    ///
    /// Returns `Return(())` when nothing is pending. With a cancellation
    /// request pending, teardown starts here: the task either unwinds now
    /// (`Cancelled`) or parks until a still-executing child finishes
    /// (`Yield`).
    pub fn checkpoint(
        &mut self,
        id: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<Op<()>, Error> {
        {
            let rec = self.record_mut(id)?;
            if rec.is_settled() {
                return Err(Error::with_context(ErrorKind::TaskSettled, "checkpoint"));
            }
            if rec.phase == Phase::CancelRequested {
                rec.advance_phase(Phase::CancelStarted);
                debug!(task = ?id, "cancel started");
            }
        }
        if self.record(id)?.phase == Phase::CancelStarted {
            match self.cancel_children(id, sched, txn)? {
                ChildTeardown::Complete => {
                    self.unwind(id, sched, txn)?;
                    Ok(Op::Cancelled)
                }
                ChildTeardown::Blocked(token) => Ok(Op::Yield(token)),
            }
        } else {
            Ok(Op::Return(()))
        }
    }

    /// Cancels `target`, suspending the caller if teardown cannot finish
    /// synchronously.
    ///
    /// A settled target makes this a no-op, so cancelling twice is
    /// harmless. When the target is ready, its unwind runs on the caller's
    /// stack; when it is not, the caller parks on the target's cancel queue
    /// and re-enters after the target reaches `Cancelled`. A task cancelling
    /// itself treats the call as its suspension point and unwinds from here.
    pub fn cancel(
        &mut self,
        caller: TaskId,
        target: TaskId,
        sched: &mut dyn Scheduler,
        txn: &dyn Substrate,
    ) -> Result<Op<()>, Error> {
        match self.checkpoint(caller, sched, txn)? {
            Op::Return(()) => {}
            Op::Yield(token) => return Ok(Op::Yield(token)),
            Op::Cancelled => return Ok(Op::Cancelled),
        }
        {
            let rec = self.record(target)?;
            if rec.is_settled() {
                return Ok(Op::Return(()));
            }
        }
        match self.request_cancel(target, sched, txn)? {
            CancelReadiness::Ready => {
                self.unwind(target, sched, txn)?;
                Ok(Op::Return(()))
            }
            CancelReadiness::NotReady if caller == target => {
                // The call itself is this task's suspension point.
                self.record_mut(caller)?.running = false;
                match self.checkpoint(caller, sched, txn)? {
                    Op::Cancelled => Ok(Op::Cancelled),
                    Op::Yield(token) => Ok(Op::Yield(token)),
                    Op::Return(()) => unreachable!("self-cancel must start teardown"),
                }
            }
            CancelReadiness::NotReady => {
                let token = self.park(caller, target, WaitKind::Cancel)?;
                Ok(Op::Yield(token))
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns the task's cancellation phase.
    pub fn phase(&self, id: TaskId) -> Result<Phase, Error> {
        Ok(self.record(id)?.phase)
    }

    /// Returns the task's result, if completed.
    pub fn peek_result(&self, id: TaskId) -> Result<Option<&V>, Error> {
        Ok(self.record(id)?.result.as_ref())
    }

    /// Returns the task's parent, if attached.
    pub fn parent(&self, id: TaskId) -> Result<Option<TaskId>, Error> {
        Ok(self.record(id)?.parent)
    }

    /// Returns the task's unsettled children in creation order.
    pub fn children(&self, id: TaskId) -> Result<&[TaskId], Error> {
        Ok(self.record(id)?.children.as_slice())
    }

    /// Returns true while the task executes on the host's stack.
    pub fn is_running(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.running)
    }

    /// True while the task is executing normally: phase `Active` and no
    /// result yet.
    pub fn is_active(&self, id: TaskId) -> Result<bool, Error> {
        let rec = self.record(id)?;
        Ok(rec.phase == Phase::Active && rec.result.is_none())
    }

    /// True once the task finished normally; completion requires the result
    /// slot to be set.
    pub fn is_completed(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.result.is_some())
    }

    /// True while teardown is underway but not finished.
    pub fn is_cancelling(&self, id: TaskId) -> Result<bool, Error> {
        let phase = self.record(id)?.phase;
        Ok(matches!(phase, Phase::CancelRequested | Phase::CancelStarted))
    }

    /// True once the task reached the terminal `Cancelled` phase.
    pub fn is_cancelled(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.phase == Phase::Cancelled)
    }

    /// True once the task completed or was cancelled.
    pub fn is_settled(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.is_settled())
    }

    /// True while the task is neither completed nor cancelled.
    pub fn is_unsettled(&self, id: TaskId) -> Result<bool, Error> {
        Ok(!self.record(id)?.is_settled())
    }

    /// True while no cancellation has ever been requested.
    pub fn is_uninterrupted(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.phase == Phase::Active)
    }

    /// True once cancellation has been requested, in progress or done.
    pub fn is_interrupted(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.record(id)?.phase.is_interrupted())
    }

    // ------------------------------------------------------------------
    // GC exposure
    // ------------------------------------------------------------------

    fn trace_record(rec: &TaskRecord<V>, visitor: &mut dyn Visitor)
    where
        V: Trace,
    {
        if let Some(result) = &rec.result {
            result.trace(visitor);
        }
        if let Some(parent) = rec.parent {
            visitor.visit_task(parent);
        }
        for &child in &rec.children {
            visitor.visit_task(child);
        }
        for waiter in rec.await_waiters.iter() {
            visitor.visit_task(waiter.task);
        }
        for waiter in rec.cancel_waiters.iter() {
            visitor.visit_task(waiter.task);
        }
    }

    /// Exposes one task's reference-holding fields to the collector.
    pub fn trace_task(&self, id: TaskId, visitor: &mut dyn Visitor) -> Result<(), Error>
    where
        V: Trace,
    {
        Self::trace_record(self.record(id)?, visitor);
        Ok(())
    }

    /// Exposes every live task to the collector.
    pub fn trace_all(&self, visitor: &mut dyn Visitor)
    where
        V: Trace,
    {
        for (_, rec) in self.tasks.iter() {
            Self::trace_record(rec, visitor);
        }
    }
}
