//! Deterministic doubles of the consumed contracts, for tests.
//!
//! Real hosts bring their own transactional memory and scheduler. The lab
//! versions here are small, deterministic, and inspectable:
//!
//! - [`LabSubstrate`]: transactions are driven by hand (`begin` / `commit` /
//!   `abort`); abort handlers run in reverse registration order, exactly
//!   once, before `abort` returns. Root registrations are counted so tests
//!   can assert the discipline was followed.
//! - [`FifoScheduler`]: resumable tokens queue in arrival order and are
//!   popped by the test's drive loop.

use crate::gc::Trace;
use crate::sched::Scheduler;
use crate::tracing_compat::trace;
use crate::txn::Substrate;
use crate::types::ResumeToken;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Configuration for the lab substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabConfig {
    /// Panic when an abort handler is registered outside a transaction
    /// instead of silently dropping it.
    pub strict_handlers: bool,
}

#[derive(Default)]
struct LabState {
    depth: u32,
    abort_handlers: Vec<Box<dyn FnOnce() + Send>>,
    roots: Vec<Box<dyn Trace + Send>>,
    aux_bytes: usize,
}

/// Hand-driven transaction substrate.
#[derive(Clone, Default)]
pub struct LabSubstrate {
    config: LabConfig,
    state: Arc<Mutex<LabState>>,
}

impl LabSubstrate {
    /// Creates a substrate with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a substrate with the given configuration.
    #[must_use]
    pub fn with_config(config: LabConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(LabState::default())),
        }
    }

    /// Opens a transaction. Transactions nest; handlers collected at any
    /// depth resolve together at the outermost commit or abort.
    pub fn begin(&self) {
        self.state.lock().depth += 1;
    }

    /// Commits the innermost transaction. At the outermost level this drops
    /// every registered abort handler unrun and releases roots.
    pub fn commit(&self) {
        let dropped = {
            let mut state = self.state.lock();
            assert!(state.depth > 0, "commit without open transaction");
            state.depth -= 1;
            if state.depth == 0 {
                state.aux_bytes = 0;
                state.roots.clear();
                std::mem::take(&mut state.abort_handlers)
            } else {
                Vec::new()
            }
        };
        // Handlers drop outside the lock; a handler's drop glue may re-enter
        // the structures it guards.
        drop(dropped);
        trace!("lab transaction committed");
    }

    /// Aborts the whole transaction stack: every abort handler runs exactly
    /// once, in reverse registration order, before this returns.
    pub fn abort(&self) {
        let handlers = {
            let mut state = self.state.lock();
            assert!(state.depth > 0, "abort without open transaction");
            state.depth = 0;
            state.aux_bytes = 0;
            state.roots.clear();
            std::mem::take(&mut state.abort_handlers)
        };
        for handler in handlers.into_iter().rev() {
            handler();
        }
        trace!("lab transaction aborted");
    }

    /// Number of roots currently registered.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.state.lock().roots.len()
    }

    /// Auxiliary bytes currently accounted.
    #[must_use]
    pub fn aux_bytes(&self) -> usize {
        self.state.lock().aux_bytes
    }

    /// Number of abort handlers currently registered.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.state.lock().abort_handlers.len()
    }
}

impl Substrate for LabSubstrate {
    fn in_transaction(&self) -> bool {
        self.state.lock().depth > 0
    }

    fn open_transaction(&self, body: &mut dyn FnMut()) {
        self.begin();
        body();
        self.commit();
    }

    fn register_abort_handler(&self, on_abort: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        if state.depth == 0 {
            drop(state);
            assert!(
                !self.config.strict_handlers,
                "abort handler registered outside a transaction"
            );
            return;
        }
        state.abort_handlers.push(on_abort);
    }

    fn add_root(&self, root: Box<dyn Trace + Send>) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.roots.push(root);
        }
    }

    fn add_aux_root(&self, bytes: usize) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.aux_bytes += bytes;
        }
    }
}

impl std::fmt::Debug for LabSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LabSubstrate")
            .field("depth", &state.depth)
            .field("handlers", &state.abort_handlers.len())
            .field("roots", &state.roots.len())
            .field("aux_bytes", &state.aux_bytes)
            .finish()
    }
}

/// First-in-first-out scheduler double.
#[derive(Debug, Default)]
pub struct FifoScheduler {
    queue: VecDeque<ResumeToken>,
}

impl FifoScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the next resumable token.
    pub fn pop(&mut self) -> Option<ResumeToken> {
        self.queue.pop_front()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Scheduler for FifoScheduler {
    fn make_resumable(&mut self, token: ResumeToken) {
        self.queue.push_back(token);
    }
}
