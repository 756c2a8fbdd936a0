use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_RESERVE_FOR: u32 = 60;
const DEFAULT_RETRY: i32 = -1;

/// A unit of work as stored by the broker.
///
/// Jobs are pushed with `PUSH` and come back from `FETCH` as the JSON body
/// of a bulk reply. Once fetched, a job is only ever read: the worker tracks
/// it by `jid` and never changes its fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Broker-unique job ID.
    pub jid: String,
    /// Queue the job was pushed to.
    pub queue: String,
    /// Tag the consumer uses to tell kinds of work apart.
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds the broker keeps the job reserved for a worker before
    /// handing it out again.
    #[serde(default = "default_reserve_for")]
    pub reserve_for: u32,
    /// Retry budget; -1 leaves the choice to the broker.
    #[serde(default = "default_retry")]
    pub retry: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Present when the job has failed at least once before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

fn default_reserve_for() -> u32 {
    DEFAULT_RESERVE_FOR
}

fn default_retry() -> i32 {
    DEFAULT_RETRY
}

impl Job {
    /// Creates a job with a freshly generated ID.
    pub fn new<Q, T, A, S>(queue: Q, jobtype: T, args: A) -> Self
    where
        Q: Into<String>,
        T: Into<String>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jid: Uuid::new_v4().to_string(),
            queue: queue.into(),
            jobtype: jobtype.into(),
            args: args.into_iter().map(Into::into).collect(),
            reserve_for: DEFAULT_RESERVE_FOR,
            retry: DEFAULT_RETRY,
            created_at: None,
            enqueued_at: None,
            failure: None,
        }
    }

    pub fn with_id(mut self, jid: impl Into<String>) -> Self {
        self.jid = jid.into();
        self
    }

    pub fn with_reserve_for(mut self, seconds: u32) -> Self {
        self.reserve_for = seconds;
        self
    }

    pub fn with_retry(mut self, retry: i32) -> Self {
        self.retry = retry;
        self
    }
}

/// The broker's record of an earlier failed attempt at a job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Failure {
    pub retry_count: i32,
    pub remaining: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub message: String,
    #[serde(alias = "errtype")]
    pub error_type: String,
}

/// What the worker tells the broker about a job whose consumer failed.
///
/// Built from a consumer's error at the dispatch boundary; never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureReport {
    pub jid: String,
    pub errtype: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl FailureReport {
    pub fn new(
        jid: impl Into<String>,
        errtype: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            jid: jid.into(),
            errtype: errtype.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }
}
