//! Cancellation protocol integration tests.
//!
//! Invariants under test:
//!
//! 1. Phases only ever advance: Active <= CancelRequested <= CancelStarted
//!    <= Cancelled.
//! 2. When a task reaches `Cancelled`, every one of its descendants already
//!    has.
//! 3. Children unwind in reverse creation order (most recent first).
//! 4. Cancelling twice is idempotent; the second call is a no-op.
//! 5. A running task cannot be cancelled until it reaches a suspension
//!    point.

mod common;

use common::*;
use weft::lab::FifoScheduler;
use weft::txn::UntrackedSubstrate;
use weft::{Op, Phase, TaskSet};

fn fixture() -> (TaskSet<u32>, FifoScheduler, UntrackedSubstrate) {
    (TaskSet::new(), FifoScheduler::new(), UntrackedSubstrate)
}

// ============================================================================
// The canonical interleaving: P spawns X then Y; Y spawns Z; P is cancelled
// while Y awaits Z and Z is still executing.
// ============================================================================

#[test]
fn cancel_tree_waits_on_running_grandchild() {
    let (mut tasks, mut sched, txn) = fixture();
    let log = new_log();

    let canceller = tasks.spawn(None).unwrap();
    let idle = tasks.spawn(None).unwrap(); // long-lived park target for X

    let p = tasks.spawn(None).unwrap();
    let x = tasks.spawn(Some(p)).unwrap();
    let y = tasks.spawn(Some(p)).unwrap();
    let z = tasks.spawn(Some(y)).unwrap();

    for (id, tag) in [(p, "P"), (x, "X"), (y, "Y"), (z, "Z")] {
        tag_cleanup(&mut tasks, id, &log, tag);
    }

    // X parks on an unrelated task; Z keeps running; Y awaits its child Z;
    // P awaits Y.
    assert!(tasks.await_result(x, idle, &mut sched, &txn).unwrap().is_yield());
    assert!(tasks.await_result(y, z, &mut sched, &txn).unwrap().is_yield());
    assert!(tasks.await_result(p, y, &mut sched, &txn).unwrap().is_yield());

    // Cancel P. Teardown starts with the youngest child Y, which must wait
    // for its own running child Z; the canceller parks.
    let op = tasks.cancel(canceller, p, &mut sched, &txn).unwrap();
    assert!(op.is_yield());
    assert_eq!(tasks.phase(p).unwrap(), Phase::CancelStarted);
    assert_eq!(tasks.phase(y).unwrap(), Phase::CancelStarted);
    assert_eq!(tasks.phase(z).unwrap(), Phase::CancelRequested);
    assert_eq!(tasks.phase(x).unwrap(), Phase::Active, "X untouched until Y unwinds");

    // Z reaches a suspension point and unwinds there.
    assert_eq!(tasks.checkpoint(z, &mut sched, &txn).unwrap(), Op::Cancelled);
    assert!(tasks.is_cancelled(z).unwrap());
    assert!(tasks.is_cancelling(y).unwrap(), "Y still mid-teardown");

    // Y was parked on Z's teardown; it resumes, re-enters its await, and
    // unwinds. Only then is X asked to cancel.
    let resumed = resume_next(&mut tasks, &mut sched).expect("Y resumes");
    assert_eq!(resumed, y);
    assert_eq!(tasks.phase(x).unwrap(), Phase::Active);
    let op = tasks.await_result(y, z, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Cancelled);
    assert!(tasks.is_cancelled(y).unwrap());

    // P resumes, unwinds X synchronously (it is parked), then itself.
    let resumed = resume_next(&mut tasks, &mut sched).expect("P resumes");
    assert_eq!(resumed, p);
    let op = tasks.await_result(p, y, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Cancelled);
    assert!(tasks.is_cancelled(x).unwrap());
    assert!(tasks.is_cancelled(p).unwrap());

    // Unwind order: deepest first, then reverse creation order among P's
    // children, parent last.
    assert_eq!(log_entries(&log), vec!["Z", "Y", "X", "P"]);

    // The canceller re-enters its cancel, now a no-op.
    let resumed = resume_next(&mut tasks, &mut sched).expect("canceller resumes");
    assert_eq!(resumed, canceller);
    let op = tasks.cancel(canceller, p, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Return(()));
}

// ============================================================================
// Reverse creation order among siblings
// ============================================================================

#[test]
fn children_unwind_most_recent_first() {
    let (mut tasks, mut sched, txn) = fixture();
    let log = new_log();

    let idle = tasks.spawn(None).unwrap();
    let parent = tasks.spawn(None).unwrap();
    let c1 = tasks.spawn(Some(parent)).unwrap();
    let c2 = tasks.spawn(Some(parent)).unwrap();
    let c3 = tasks.spawn(Some(parent)).unwrap();
    for (id, tag) in [(c1, "C1"), (c2, "C2"), (c3, "C3")] {
        tag_cleanup(&mut tasks, id, &log, tag);
        assert!(tasks.await_result(id, idle, &mut sched, &txn).unwrap().is_yield());
    }

    // With the parent and every child suspended, the whole teardown runs
    // synchronously on the canceller's stack.
    assert!(tasks.await_result(parent, idle, &mut sched, &txn).unwrap().is_yield());
    let driver = tasks.spawn(None).unwrap();
    let op = tasks.cancel(driver, parent, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Return(()));

    assert_eq!(log_entries(&log), vec!["C3", "C2", "C1"]);
    for id in [c1, c2, c3, parent] {
        assert!(tasks.is_cancelled(id).unwrap());
    }
}

// ============================================================================
// Descendants settle before the ancestor
// ============================================================================

#[test]
fn descendants_cancelled_when_ancestor_is() {
    let (mut tasks, mut sched, txn) = fixture();
    let idle = tasks.spawn(None).unwrap();

    let root = tasks.spawn(None).unwrap();
    let mid = tasks.spawn(Some(root)).unwrap();
    let leaf = tasks.spawn(Some(mid)).unwrap();

    for id in [leaf, mid, root] {
        assert!(tasks.await_result(id, idle, &mut sched, &txn).unwrap().is_yield());
    }

    let driver = tasks.spawn(None).unwrap();
    assert_eq!(
        tasks.cancel(driver, root, &mut sched, &txn).unwrap(),
        Op::Return(())
    );

    // Terminal ancestor implies terminal descendants.
    assert!(tasks.is_cancelled(root).unwrap());
    assert!(tasks.is_cancelled(mid).unwrap());
    assert!(tasks.is_cancelled(leaf).unwrap());
}

// ============================================================================
// Idempotence and races
// ============================================================================

#[test]
fn cancel_is_idempotent() {
    let (mut tasks, mut sched, txn) = fixture();
    let driver = tasks.spawn(None).unwrap();
    let idle = tasks.spawn(None).unwrap();
    let victim = tasks.spawn(None).unwrap();
    assert!(tasks.await_result(victim, idle, &mut sched, &txn).unwrap().is_yield());

    assert_eq!(
        tasks.cancel(driver, victim, &mut sched, &txn).unwrap(),
        Op::Return(())
    );
    let phase_after_first = tasks.phase(victim).unwrap();

    assert_eq!(
        tasks.cancel(driver, victim, &mut sched, &txn).unwrap(),
        Op::Return(())
    );
    assert_eq!(tasks.phase(victim).unwrap(), phase_after_first);
    assert_eq!(phase_after_first, Phase::Cancelled);
}

#[test]
fn cancelling_a_completed_task_is_a_no_op() {
    let (mut tasks, mut sched, txn) = fixture();
    let driver = tasks.spawn(None).unwrap();
    let done = tasks.spawn(None).unwrap();
    let op = tasks.complete(done, 9, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Return(()));

    assert_eq!(
        tasks.cancel(driver, done, &mut sched, &txn).unwrap(),
        Op::Return(())
    );
    assert_eq!(tasks.peek_result(done).unwrap(), Some(&9));
    assert_eq!(tasks.phase(done).unwrap(), Phase::Active);
}

#[test]
fn running_task_is_only_cancellable_at_suspension_points() {
    let (mut tasks, mut sched, txn) = fixture();
    let driver = tasks.spawn(None).unwrap();
    let busy = tasks.spawn(None).unwrap();

    let op = tasks.cancel(driver, busy, &mut sched, &txn).unwrap();
    assert!(op.is_yield(), "busy task has not suspended yet");
    assert_eq!(tasks.phase(busy).unwrap(), Phase::CancelRequested);
    assert!(tasks.is_unsettled(busy).unwrap());

    // The request sits until the task itself reaches a suspension point.
    assert_eq!(tasks.checkpoint(busy, &mut sched, &txn).unwrap(), Op::Cancelled);
    assert!(tasks.is_cancelled(busy).unwrap());
}

// ============================================================================
// Natural completion interacting with cancellation
// ============================================================================

#[test]
fn completion_cancels_live_children_first() {
    let (mut tasks, mut sched, txn) = fixture();
    let log = new_log();

    let parent = tasks.spawn(None).unwrap();
    let child = tasks.spawn(Some(parent)).unwrap(); // left running
    tag_cleanup(&mut tasks, child, &log, "child");

    // Parent reaches its natural end while the child still runs: the parent
    // parks on the child's teardown.
    let op = tasks.complete(parent, 5, &mut sched, &txn).unwrap();
    assert!(op.is_yield());
    assert_eq!(tasks.phase(child).unwrap(), Phase::CancelRequested);
    assert!(tasks.peek_result(parent).unwrap().is_none());

    // Child suspends and unwinds; parent re-enters complete and publishes.
    assert_eq!(tasks.checkpoint(child, &mut sched, &txn).unwrap(), Op::Cancelled);
    let resumed = resume_next(&mut tasks, &mut sched).expect("parent resumes");
    assert_eq!(resumed, parent);
    let op = tasks.complete(parent, 5, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Return(()));

    assert_eq!(tasks.peek_result(parent).unwrap(), Some(&5));
    assert_eq!(log_entries(&log), vec!["child"]);
}

#[test]
fn cancel_requested_task_finishes_cancelled_at_its_natural_end() {
    let (mut tasks, mut sched, txn) = fixture();
    let driver = tasks.spawn(None).unwrap();
    let worker = tasks.spawn(None).unwrap();

    assert!(tasks.cancel(driver, worker, &mut sched, &txn).unwrap().is_yield());
    assert_eq!(tasks.phase(worker).unwrap(), Phase::CancelRequested);

    // The worker reaches its natural end; the pending request wins and no
    // result is published.
    let op = tasks.complete(worker, 11, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Cancelled);
    assert!(tasks.is_cancelled(worker).unwrap());
    assert!(tasks.peek_result(worker).unwrap().is_none());
}

// ============================================================================
// Awaiters and results
// ============================================================================

#[test]
fn awaiters_all_receive_the_result() {
    let (mut tasks, mut sched, txn) = fixture();
    let producer = tasks.spawn(None).unwrap();
    let consumers: Vec<_> = (0..3).map(|_| tasks.spawn(None).unwrap()).collect();

    for &consumer in &consumers {
        assert!(tasks
            .await_result(consumer, producer, &mut sched, &txn)
            .unwrap()
            .is_yield());
    }

    let op = tasks.complete(producer, 77, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Return(()));

    let mut resumed = Vec::new();
    while let Some(id) = resume_next(&mut tasks, &mut sched) {
        let op = tasks.await_result(id, producer, &mut sched, &txn).unwrap();
        assert_eq!(op, Op::Return(77));
        resumed.push(id);
    }
    resumed.sort();
    let mut expected = consumers.clone();
    expected.sort();
    assert_eq!(resumed, expected, "every parked awaiter eventually resumed");
}

#[test]
fn phase_history_is_monotone_through_a_full_cancellation() {
    let (mut tasks, mut sched, txn) = fixture();
    let driver = tasks.spawn(None).unwrap();
    let victim = tasks.spawn(None).unwrap();

    let mut history = vec![tasks.phase(victim).unwrap()];
    assert!(tasks.cancel(driver, victim, &mut sched, &txn).unwrap().is_yield());
    history.push(tasks.phase(victim).unwrap());
    let op = tasks.checkpoint(victim, &mut sched, &txn).unwrap();
    assert_eq!(op, Op::Cancelled);
    history.push(tasks.phase(victim).unwrap());

    assert!(
        history.windows(2).all(|pair| pair[0] <= pair[1]),
        "phase regressed: {history:?}"
    );
    assert_eq!(history.last(), Some(&Phase::Cancelled));
}
