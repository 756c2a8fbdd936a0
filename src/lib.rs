//! Worker runtime and protocol client for Faktory-compatible job servers.
//!
//! [`client::Client`] speaks the line protocol one command at a time;
//! [`worker::Worker`] drives a client, running fetched jobs on registered
//! [`consumer::JobConsumer`]s and reporting their results.
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod jobs_state;
pub mod parser;
pub mod reply_reader;
pub mod types;
pub mod worker;

pub(crate) mod util;

pub use client::{Client, Outcome};
pub use config::WorkerConfig;
pub use consumer::{ConsumerRegistry, JobConsumer, JobError};
pub use error::{ClientError, WorkerError};
pub use types::job::{FailureReport, Job};
pub use worker::{ShutdownReport, Worker};
