use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::job::Job;

/// Business logic for the jobs on one queue.
///
/// Implementations run on their own tasks, concurrently with each other and
/// with the scheduler. Returning `Err` (or panicking) reports the job as
/// failed; returning `Ok` acknowledges it.
///
/// `cancel` fires only once the worker has stopped waiting for in-flight
/// jobs during shutdown. Consumers may watch it to give up early; nothing
/// forces them to.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    async fn consume(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// An error a consumer can return to control the error type the broker
/// records for the failure. Any other error is recorded as `"Error"`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    pub errtype: String,
    pub message: String,
}

impl JobError {
    pub fn new(errtype: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errtype: errtype.into(),
            message: message.into(),
        }
    }
}

/// Which consumer handles which queue.
///
/// Queues are polled in the order they were registered. Registering a queue
/// twice replaces its consumer but keeps its original position.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Vec<(String, Arc<dyn JobConsumer>)>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: JobConsumer + 'static>(
        self,
        queue: impl Into<String>,
        consumer: C,
    ) -> Self {
        self.register_arc(queue, Arc::new(consumer))
    }

    pub fn register_arc(
        mut self,
        queue: impl Into<String>,
        consumer: Arc<dyn JobConsumer>,
    ) -> Self {
        let queue = queue.into();
        match self.consumers.iter_mut().find(|(q, _)| *q == queue) {
            Some(slot) => slot.1 = consumer,
            None => self.consumers.push((queue, consumer)),
        }
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobConsumer>> {
        self.consumers
            .iter()
            .find(|(q, _)| q == queue)
            .map(|(_, c)| c.clone())
    }

    /// Registered `(queue, consumer)` pairs, in polling order.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&str, &Arc<dyn JobConsumer>)> + '_ {
        self.consumers.iter().map(|(q, c)| (q.as_str(), c))
    }

    /// Registered queue names, in polling order.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|(q, _)| q)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.queues()).finish()
    }
}
