use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::WorkerError;
use crate::types::job::{FailureReport, Job};

/// Tracks every job this worker has fetched but not yet reported.
///
/// A job ID lives in at most one place at a time:
///
/// * `started`: fetched and handed to a consumer;
/// * `completed`: the consumer succeeded, an `ACK` is owed;
/// * `failed`: the consumer failed, a `FAIL` is owed.
///
/// Consumers finish concurrently on their own tasks and move their job from
/// `started` into one of the queues; the scheduler loop reads sizes and
/// drains the queues.
#[derive(Debug, Default)]
pub struct JobsState {
    started: DashMap<String, Arc<Job>>,
    completed: Mutex<VecDeque<String>>,
    failed: Mutex<VecDeque<FailureReport>>,
    /// Raised whenever a job leaves `started`.
    finished: Notify,
}

impl JobsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly fetched job.
    ///
    /// An ID that is already started means the broker or this worker broke
    /// the uniqueness guarantee, which is fatal.
    pub fn start(&self, job: Arc<Job>) -> Result<(), WorkerError> {
        match self.started.entry(job.jid.clone()) {
            Entry::Occupied(e) => {
                Err(WorkerError::DuplicateJob(e.key().clone()))
            },
            Entry::Vacant(e) => {
                e.insert(job);
                Ok(())
            },
        }
    }

    /// Moves a job from `started` to `completed`. Returns false, changing
    /// nothing, if the job wasn't started.
    pub fn complete(&self, jid: &str) -> bool {
        if self.started.remove(jid).is_none() {
            return false;
        }

        self.completed.lock().push_back(jid.to_owned());
        self.finished.notify_waiters();
        true
    }

    /// Moves a job from `started` to `failed`. Returns false, changing
    /// nothing, if the job wasn't started.
    pub fn fail(&self, report: FailureReport) -> bool {
        if self.started.remove(&report.jid).is_none() {
            return false;
        }

        self.failed.lock().push_back(report);
        self.finished.notify_waiters();
        true
    }

    pub fn started_len(&self) -> usize {
        self.started.len()
    }

    pub fn is_started(&self, jid: &str) -> bool {
        self.started.contains_key(jid)
    }

    pub fn started_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> =
            self.started.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn completed_len(&self) -> usize {
        self.completed.lock().len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.lock().len()
    }

    /// Empties the completed queue, returning what it held.
    pub fn take_completed(&self) -> Vec<String> {
        self.completed.lock().drain(..).collect()
    }

    /// Empties the failed queue, returning what it held.
    pub fn take_failed(&self) -> Vec<FailureReport> {
        self.failed.lock().drain(..).collect()
    }

    /// Puts back an `ACK` that couldn't be delivered.
    pub fn requeue_completed(&self, jid: String) {
        self.completed.lock().push_back(jid);
    }

    /// Puts back a `FAIL` that couldn't be delivered.
    pub fn requeue_failed(&self, report: FailureReport) {
        self.failed.lock().push_back(report);
    }

    /// Waits until fewer than `cap` jobs are started.
    pub async fn wait_for_capacity(&self, cap: usize) {
        loop {
            // Register interest before checking, so a job finishing in
            // between isn't missed.
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.started.len() < cap {
                return;
            }

            notified.await;
        }
    }
}
