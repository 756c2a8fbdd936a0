use std::io;

use thiserror::Error;

use crate::parser::ParsingError;

/// Failure to learn the broker's answer to a command.
///
/// A definitive answer from the broker, including a refusal, is never a
/// `ClientError`; see [`Outcome`](crate::client::Outcome). After any of these
/// the connection's read side is in an unknown state and should be
/// re-established before it is relied on again.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(
        "no complete reply after {attempts} empty reads \
         ({buffered} bytes buffered)"
    )]
    NoReply { attempts: u32, buffered: usize },

    #[error("malformed reply: {0}")]
    Parse(#[from] ParsingError),

    #[error("could not decode reply payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("could not encode command: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("expected a +HI greeting, got {0}")]
    Greeting(String),

    #[error("unexpected reply to {verb}: {reply}")]
    UnexpectedReply { verb: &'static str, reply: String },
}

/// Reasons a [`Worker`](crate::worker::Worker) can't start or must stop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no consumer registered for any queue")]
    NoConsumers,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not establish broker connection: {0}")]
    Connection(#[source] ClientError),

    #[error("broker refused handshake: {0}")]
    HandshakeRejected(String),

    /// The broker handed out a job ID that is already being worked on.
    #[error("job {0} is already started; job IDs must be unique")]
    DuplicateJob(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}
