//! A client for the Faktory job server protocol.
//!
//! One `Client` owns one connection and issues one command at a time: every
//! operation writes a command and waits for its reply before returning.
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{
    self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::reply_reader::ReplyReader;
use crate::types::job::{FailureReport, Job};
use crate::types::protocol::{BeatState, Command, Greeting, Hello, Reply};
use crate::types::serialisable::FaktorySerialisable;
use crate::util::escape_wire;

/// The broker's definitive answer to a command.
///
/// Anything short of a definitive answer is a
/// [`ClientError`](crate::error::ClientError) instead, so "the broker said
/// no" and "we don't know what the broker said" are never confused.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Outcome<T = ()> {
    Ok(T),
    /// `-ERR Job not found`: the job is no longer reserved by this worker.
    NotFound,
    /// Any other `-ERR` reply, with the broker's message.
    Rejected(String),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::NotFound => Outcome::NotFound,
            Outcome::Rejected(msg) => Outcome::Rejected(msg),
        }
    }
}

pub struct Client<S: AsyncRead + AsyncWrite + Unpin> {
    reader: ReplyReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    greeting: Greeting,
}

impl Client<TcpStream> {
    /// Opens a TCP connection to the broker and waits for its greeting.
    pub async fn connect(
        host: &str,
        port: u16,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream =
            TcpStream::connect((host, port))
                .await
                .map_err(|source| ClientError::Connect {
                    addr: format!("{host}:{port}"),
                    source,
                })?;
        stream.set_nodelay(true)?;

        debug!(host, port, "connected to broker");

        Self::establish(stream, read_timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Wraps an already-open stream and waits for the `+HI` greeting.
    pub async fn establish(
        stream: S,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let (r, writer) = io::split(stream);
        let mut reader = ReplyReader::new(r, read_timeout);

        let greeting = match reader.read_reply().await? {
            Reply::Simple(text) if text.starts_with("HI") => {
                parse_greeting(&text[2..])?
            },
            other => return Err(ClientError::Greeting(other.to_string())),
        };

        debug!(version = greeting.v, "broker greeted");

        Ok(Self {
            reader,
            writer,
            greeting,
        })
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Identifies this worker. Must be issued once, right after connecting,
    /// before any other command.
    ///
    /// If `hello` carries a password and the greeting carried a salt, the
    /// password hash is filled in here.
    pub async fn handshake(
        &mut self,
        mut hello: Hello,
    ) -> Result<Outcome, ClientError> {
        if let (Some(password), Some(salt)) =
            (hello.password.as_deref(), self.greeting.salt.as_deref())
        {
            let iterations = self.greeting.iterations.unwrap_or(1);
            hello.pwdhash = Some(password_hash(password, salt, iterations));
        }

        let reply = self.round_trip(&Command::Hello(hello)).await?;
        expect_ok("HELLO", reply)
    }

    /// Sends one heartbeat. Throttling is up to the caller.
    pub async fn heartbeat(
        &mut self,
        wid: &str,
    ) -> Result<Outcome<BeatState>, ClientError> {
        #[derive(Deserialize)]
        struct BeatReply {
            state: BeatState,
        }

        let cmd = Command::Beat {
            wid: wid.to_owned(),
        };

        match self.round_trip(&cmd).await? {
            reply if reply.is_ok() => Ok(Outcome::Ok(BeatState::Running)),
            Reply::Bulk(Some(data)) => {
                let beat: BeatReply =
                    serde_json::from_slice(&data).map_err(ClientError::Decode)?;
                Ok(Outcome::Ok(beat.state))
            },
            Reply::Error(msg) => Ok(Outcome::Rejected(msg)),
            other => Err(unexpected("BEAT", other)),
        }
    }

    /// Reserves the next job on `queue`, or returns `Ok(None)` when there is
    /// nothing to do.
    pub async fn fetch(
        &mut self,
        queue: &str,
    ) -> Result<Outcome<Option<Job>>, ClientError> {
        let cmd = Command::Fetch {
            queue: queue.to_owned(),
        };

        match self.round_trip(&cmd).await? {
            Reply::Bulk(None) => Ok(Outcome::Ok(None)),
            Reply::Bulk(Some(data)) => {
                let job: Job = serde_json::from_slice(&data).map_err(|e| {
                    trace!(payload = escape_wire(&data), "undecodable job");
                    ClientError::Decode(e)
                })?;
                Ok(Outcome::Ok(Some(job)))
            },
            Reply::Error(msg) => Ok(Outcome::Rejected(msg)),
            other => Err(unexpected("FETCH", other)),
        }
    }

    pub async fn push(&mut self, job: &Job) -> Result<Outcome, ClientError> {
        let reply = self.round_trip(&Command::Push(job.clone())).await?;
        expect_ok("PUSH", reply)
    }

    /// Reports a job as done. `Outcome::NotFound` means the broker already
    /// took the reservation back; there is nothing left to report.
    pub async fn ack(&mut self, jid: &str) -> Result<Outcome, ClientError> {
        let cmd = Command::Ack {
            jid: jid.to_owned(),
        };
        let reply = self.round_trip(&cmd).await?;
        expect_ok("ACK", reply)
    }

    /// Reports a job as failed, with the same not-found semantics as `ack`.
    pub async fn fail(
        &mut self,
        report: &FailureReport,
    ) -> Result<Outcome, ClientError> {
        let reply = self.round_trip(&Command::Fail(report.clone())).await?;
        expect_ok("FAIL", reply)
    }

    /// Says goodbye and closes the write side. The broker doesn't reply.
    pub async fn end(mut self) -> Result<(), ClientError> {
        self.send(&Command::End).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, cmd: &Command) -> Result<(), ClientError> {
        let line = cmd.serialise_faktory().map_err(ClientError::Encode)?;
        trace!(line = escape_wire(&line), "sending command");

        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn round_trip(
        &mut self,
        cmd: &Command,
    ) -> Result<Reply, ClientError> {
        let res = match self.send(cmd).await {
            Ok(()) => self.reader.read_reply().await,
            Err(e) => Err(e),
        };

        if let Err(error) = &res {
            debug!(
                verb = cmd.verb(),
                %error,
                "command got no definitive reply"
            );
            self.reader.discard();
        }

        res
    }
}

fn expect_ok(verb: &'static str, reply: Reply) -> Result<Outcome, ClientError> {
    if reply.is_ok() {
        Ok(Outcome::Ok(()))
    } else if reply.is_job_not_found() {
        Ok(Outcome::NotFound)
    } else if let Reply::Error(msg) = reply {
        Ok(Outcome::Rejected(msg))
    } else {
        Err(unexpected(verb, reply))
    }
}

fn unexpected(verb: &'static str, reply: Reply) -> ClientError {
    ClientError::UnexpectedReply {
        verb,
        reply: reply.to_string(),
    }
}

/// Parses whatever follows `HI` in the greeting; a bare `+HI` is fine.
fn parse_greeting(rest: &str) -> Result<Greeting, ClientError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(Greeting::default());
    }

    serde_json::from_str(rest).map_err(ClientError::Decode)
}

/// Hex SHA-256 of `password + salt`, re-hashed until `iterations` rounds
/// have been applied.
pub fn password_hash(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::new()
        .chain_update(password.as_bytes())
        .chain_update(salt.as_bytes())
        .finalize();

    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }

    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Plays the broker's side of a duplex stream: sends `greeting`, then for
    /// each `(prefix, reply)` reads one command line, checks it starts with
    /// `prefix` and answers with `reply`. Returns the lines it read.
    fn script(
        server: DuplexStream,
        greeting: &'static str,
        steps: Vec<(&'static str, &'static str)>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (r, mut w) = io::split(server);
            let mut lines = BufReader::new(r).lines();
            let mut seen = Vec::new();

            w.write_all(greeting.as_bytes()).await.unwrap();
            for (prefix, reply) in steps {
                let line = lines.next_line().await.unwrap().unwrap();
                assert!(line.starts_with(prefix), "{line:?} vs {prefix:?}");
                seen.push(line);
                w.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_greeting_must_be_hi() {
        let (client, server) = io::duplex(1024);
        let _broker = script(server, "-ERR go away\r\n", vec![]);

        let res = Client::establish(client, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ClientError::Greeting(_))));
    }

    #[tokio::test]
    async fn test_handshake_sends_password_hash() {
        let (client, server) = io::duplex(1024);
        let broker = script(
            server,
            "+HI {\"v\":2,\"i\":3,\"s\":\"pepper\"}\r\n",
            vec![("HELLO ", "+OK\r\n")],
        );

        let mut c = Client::establish(client, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(c.greeting().iterations, Some(3));

        let hello =
            Hello::new("host", 2, "w1").with_password(Some("secret".into()));
        assert_eq!(c.handshake(hello).await.unwrap(), Outcome::Ok(()));

        let seen = broker.await.unwrap();
        let sent: serde_json::Value =
            serde_json::from_str(&seen[0]["HELLO ".len()..]).unwrap();
        assert_eq!(sent["pwdhash"], password_hash("secret", "pepper", 3));
        assert_eq!(sent["wid"], "w1");
        assert!(sent.get("password").is_none());
    }

    #[test]
    fn test_password_hash_iterations() {
        let once = password_hash("secret", "pepper", 1);
        assert_eq!(once, hex::encode(Sha256::digest(b"secretpepper")));

        let twice = password_hash("secret", "pepper", 2);
        let expected = Sha256::digest(Sha256::digest(b"secretpepper"));
        assert_eq!(twice, hex::encode(expected));
        assert_eq!(password_hash("secret", "pepper", 0), once);
    }

    #[tokio::test]
    async fn test_outcomes() {
        let (client, server) = io::duplex(1024);
        let _broker = script(
            server,
            "+HI\r\n",
            vec![
                ("ACK ", "-ERR Job not found\r\n"),
                ("FAIL ", "-ERR Something else\r\n"),
                ("FETCH nope", "-ERR Invalid queue\r\n"),
                ("BEAT ", "$21\r\n{\"state\":\"terminate\"}\r\n"),
                ("BEAT ", "+OK\r\n"),
                ("ACK ", "$-1\r\n"),
            ],
        );

        let mut c = Client::establish(client, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(c.ack("C").await.unwrap(), Outcome::NotFound);
        assert_eq!(
            c.fail(&FailureReport::new("D", "Error", "boom"))
                .await
                .unwrap(),
            Outcome::Rejected("ERR Something else".into())
        );
        assert_eq!(
            c.fetch("nope").await.unwrap(),
            Outcome::Rejected("ERR Invalid queue".into())
        );
        assert_eq!(
            c.heartbeat("w1").await.unwrap(),
            Outcome::Ok(BeatState::Terminate)
        );
        assert_eq!(
            c.heartbeat("w1").await.unwrap(),
            Outcome::Ok(BeatState::Running)
        );
        assert!(matches!(
            c.ack("E").await,
            Err(ClientError::UnexpectedReply { verb: "ACK", .. })
        ));
    }
}
