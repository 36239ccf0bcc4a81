//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use weft::lab::FifoScheduler;
use weft::{Resumed, TaskId, TaskSet};

/// Order-of-events log shared with cleanup closures.
pub type EventLog = Arc<Mutex<Vec<&'static str>>>;

pub fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn log_entries(log: &EventLog) -> Vec<&'static str> {
    log.lock().unwrap().clone()
}

/// Registers a cleanup that records `tag` when the task settles.
pub fn tag_cleanup<V>(tasks: &mut TaskSet<V>, id: TaskId, log: &EventLog, tag: &'static str) {
    let log = Arc::clone(log);
    tasks
        .push_cleanup(id, move || log.lock().unwrap().push(tag))
        .expect("task must be unsettled");
}

/// Pops scheduled tokens until one actually resumes a task.
pub fn resume_next<V>(tasks: &mut TaskSet<V>, sched: &mut FifoScheduler) -> Option<TaskId> {
    while let Some(token) = sched.pop() {
        if let Resumed::Run(id) = tasks.resume(token) {
            return Some(id);
        }
    }
    None
}
