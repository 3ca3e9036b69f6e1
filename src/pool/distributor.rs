//! Task distribution for the worker pool
//!
//! Workers pull page tasks from a shared [`PageDistributor`] until it is
//! empty or stopped. The distributor also records why a pass stopped
//! early and the first fatal error; everything a worker produces per
//! task stays in the worker and is merged once the pass joins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::Error;
use crate::models::PageTask;

/// Why a pass stopped before the task list ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Cancelled,
    Fatal,
}

/// Shared work source for one pass of one partition.
pub struct PageDistributor {
    tasks: Mutex<VecDeque<PageTask>>,
    stopped: AtomicBool,
    stop_cause: Mutex<Option<StopCause>>,
    first_error: Mutex<Option<Error>>,
}

impl PageDistributor {
    pub fn new(tasks: Vec<PageTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into()),
            stopped: AtomicBool::new(false),
            stop_cause: Mutex::new(None),
            first_error: Mutex::new(None),
        }
    }

    /// Next task, or `None` once the list is empty or the pass stopped.
    pub fn next(&self) -> Option<PageTask> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.tasks.lock().unwrap().pop_front()
    }

    /// Stop handing out tasks. The first cause sticks.
    pub fn stop(&self, cause: StopCause) {
        let mut stop_cause = self.stop_cause.lock().unwrap();
        if stop_cause.is_none() {
            *stop_cause = Some(cause);
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_cause(&self) -> Option<StopCause> {
        *self.stop_cause.lock().unwrap()
    }

    /// Record a fatal error. The first one wins and stops the pass.
    pub fn record_error(&self, error: Error) {
        {
            let mut first = self.first_error.lock().unwrap();
            if first.is_none() {
                *first = Some(error);
            }
        }
        self.stop(StopCause::Fatal);
    }

    pub fn take_error(&self) -> Option<Error> {
        self.first_error.lock().unwrap().take()
    }

    /// Tasks not yet handed out.
    pub fn remaining(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}
