//! Weft: a cooperative task-cancellation core with a transactional,
//! insertion-ordered map.
//!
//! Weft is a linked-in runtime component, not a standalone executor. A host
//! (an interpreter, a scheduler loop, a test harness) drives task bodies;
//! weft owns the lifecycle state those bodies share:
//!
//! - [`task::TaskSet`]: arena-backed task records with a staged, cooperative
//!   cancellation protocol. Tasks form a tree; cancelling a task tears down
//!   its descendants depth-first (most recent child first) before the task
//!   itself unwinds.
//! - [`map::TransactMap`]: an open-addressing associative container with a
//!   separate insertion-order table. Mutations made inside an open
//!   transaction are speculative: they become visible immediately, and are
//!   discarded wholesale if the transaction aborts.
//!
//! # Driving model
//!
//! Tasks are continuations, not threads. Every potentially-suspending
//! operation ([`task::TaskSet::await_result`], [`task::TaskSet::cancel`],
//! [`task::TaskSet::complete`]) returns an [`Op`]:
//!
//! - [`Op::Return`]: the operation finished; keep running the task.
//! - [`Op::Yield`]: the calling task is parked. The scheduler receives the
//!   [`ResumeToken`] (directly, or through an unpark) and later calls
//!   [`task::TaskSet::resume`]; the host then re-enters the same operation,
//!   which now pulls its answer from current state.
//! - [`Op::Cancelled`]: the calling task was cancelled and has fully
//!   unwound. Stop driving it.
//!
//! Suspension only happens inside these operations; a task that never calls
//! one cannot be cancelled until it completes on its own.
//!
//! # External contracts
//!
//! Two collaborators are consumed, never implemented here: a transaction
//! substrate ([`txn::Substrate`]) providing atomic, abortable regions, and a
//! scheduler ([`sched::Scheduler`]) that accepts resumable continuations.
//! One contract is exposed: [`gc::Trace`], through which tasks and maps
//! reveal every reference-holding field to a tracing collector, including
//! mid-mutation under the map's lock.
//!
//! The [`lab`] module carries deterministic in-crate doubles of both consumed
//! contracts for tests.

#![forbid(unsafe_code)]

pub mod error;
pub mod gc;
pub mod lab;
pub mod map;
pub mod sched;
pub mod task;
pub mod txn;
pub mod types;
pub mod util;

pub(crate) mod tracing_compat;

pub use error::{Error, ErrorKind};
pub use gc::{Trace, Visitor};
pub use map::{FrozenMap, TransactMap};
pub use sched::Scheduler;
pub use task::{CancelReadiness, Resumed, TaskSet};
pub use txn::Substrate;
pub use types::{Op, Phase, ResumeToken, TaskId};
