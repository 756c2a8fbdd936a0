use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::job::{FailureReport, Job};

/// A command sent by the worker to the broker.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Identifies the worker. Must be the first command after the greeting.
    ///
    /// On the wire: `HELLO {"hostname":..,"v":..,"wid":..}`
    Hello(Hello),
    /// Liveness signal. Answered with `+OK`, or with a bulk reply carrying a
    /// state change the broker wants the worker to make.
    ///
    /// On the wire: `BEAT {"wid":..}`
    Beat { wid: String },
    /// Reserves the next job on a queue. Answered with `$-1` when the queue
    /// is empty, otherwise with the job as a bulk reply.
    ///
    /// On the wire: `FETCH <queue>`
    Fetch { queue: String },
    /// Enqueues a job.
    ///
    /// On the wire: `PUSH <job-json>`
    Push(Job),
    /// Marks a reserved job as done. `-ERR Job not found` means the broker
    /// has already taken the reservation back.
    ///
    /// On the wire: `ACK {"jid":..}`
    Ack { jid: String },
    /// Marks a reserved job as failed, with the same not-found semantics as
    /// `Ack`.
    ///
    /// On the wire: `FAIL {"jid":..,"errtype":..,"message":..}`
    Fail(FailureReport),
    /// Tells the broker the connection is about to close.
    ///
    /// On the wire: `END`
    End,
}

impl Command {
    /// The command verb, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Hello(_) => "HELLO",
            Command::Beat { .. } => "BEAT",
            Command::Fetch { .. } => "FETCH",
            Command::Push(_) => "PUSH",
            Command::Ack { .. } => "ACK",
            Command::Fail(_) => "FAIL",
            Command::End => "END",
        }
    }
}

/// Payload of a `HELLO` command.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hello {
    pub hostname: String,
    #[serde(rename = "v")]
    pub version: u32,
    pub wid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
    /// Plain password, only used to derive `pwdhash` against the salt from
    /// the broker's greeting. Never sent.
    #[serde(skip)]
    pub password: Option<String>,
}

impl Hello {
    pub fn new(
        hostname: impl Into<String>,
        version: u32,
        wid: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            version,
            wid: wid.into(),
            labels: Vec::new(),
            pid: Some(std::process::id()),
            pwdhash: None,
            password: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

/// The JSON document following `+HI`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Greeting {
    /// Broker protocol version.
    #[serde(default)]
    pub v: u32,
    /// Password hashing iterations, present when the broker requires one.
    #[serde(default, rename = "i")]
    pub iterations: Option<u32>,
    /// Password salt, present when the broker requires one.
    #[serde(default, rename = "s")]
    pub salt: Option<String>,
}

/// State the broker asks a worker to move to, carried by a `BEAT` reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatState {
    /// Nothing to change (plain `+OK`).
    Running,
    /// Stop fetching new jobs but keep reporting and heartbeating.
    Quiet,
    /// Finish up and disconnect.
    Terminate,
}

/// A reply from the broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// On the wire: `+<text>`, e.g. `+OK` or `+HI {...}`.
    Simple(String),
    /// On the wire: `-<text>`, e.g. `-ERR Job not found`.
    Error(String),
    /// On the wire: `$<n_bytes>` plus data, or `$-1` for nothing.
    Bulk(Option<Bytes>),
}

impl Reply {
    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(text) if text == "OK")
    }

    /// True for the broker's answer to `ACK`/`FAIL` on a job it no longer
    /// holds a reservation for.
    pub fn is_job_not_found(&self) -> bool {
        matches!(self, Reply::Error(text) if text.contains("Job not found"))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reply::Simple(text) => write!(f, "+{text}"),
            Reply::Error(text) => write!(f, "-{text}"),
            Reply::Bulk(None) => f.write_str("$-1"),
            Reply::Bulk(Some(data)) => write!(f, "${} <bulk>", data.len()),
        }
    }
}
