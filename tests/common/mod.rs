//! An in-process stand-in for the job broker, good enough to drive `Client`
//! and `Worker` through their paths.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use faktory_worker::{Job, WorkerConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Job>>,
    reserved: HashSet<String>,
    /// Jobs the broker pretends to have reclaimed: ACK/FAIL answer not found.
    forgotten: HashSet<String>,
    /// Every command line received, in order, without its CRLF.
    commands: Vec<String>,
    acked: Vec<String>,
    failed: Vec<Value>,
    /// Bulk state to answer BEAT with instead of `+OK`.
    beat_state: Option<&'static str>,
    /// Write bulk replies in two halves with a pause in between.
    split_bulk: bool,
    /// Close the connection, without replying, on the next command with
    /// this verb.
    hang_up_on: Option<&'static str>,
    /// Hand out this ID on every fetch, whatever the stored job's is.
    force_jid: Option<String>,
    /// Answer this many upcoming commands with the verb using a generic
    /// `-ERR` instead of handling them.
    reject: HashMap<&'static str, usize>,
    connections: usize,
    /// Connections whose `serve` task is still running.
    open: usize,
}

pub struct MockBroker {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let cancel = CancellationToken::new();

        {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let conn = tokio::select! {
                        accept = listener.accept() => accept.unwrap().0,
                        _ = cancel.cancelled() => return,
                    };
                    {
                        let mut state = state.lock();
                        state.connections += 1;
                        state.open += 1;
                    }
                    let state = state.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        serve(conn, state.clone(), cancel).await;
                        state.lock().open -= 1;
                    });
                }
            });
        }

        Self {
            addr,
            state,
            cancel,
        }
    }

    /// A worker config pointed at this broker, with short timings.
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            poll_interval: Duration::from_millis(20),
            read_timeout: Duration::from_millis(500),
            ..WorkerConfig::default()
        }
    }

    pub fn enqueue(&self, job: Job) {
        self.state
            .lock()
            .queues
            .entry(job.queue.clone())
            .or_default()
            .push_back(job);
    }

    pub fn forget(&self, jid: &str) {
        self.state.lock().forgotten.insert(jid.to_owned());
    }

    pub fn set_beat_state(&self, state: &'static str) {
        self.state.lock().beat_state = Some(state);
    }

    pub fn split_bulk(&self) {
        self.state.lock().split_bulk = true;
    }

    pub fn hang_up_on(&self, verb: &'static str) {
        self.state.lock().hang_up_on = Some(verb);
    }

    pub fn reject_next(&self, verb: &'static str, times: usize) {
        self.state.lock().reject.insert(verb, times);
    }

    pub fn force_jid(&self, jid: &str) {
        self.state.lock().force_jid = Some(jid.to_owned());
    }

    /// Waits until every connection has been fully read and closed, so the
    /// command log holds everything clients sent.
    pub async fn settle(&self) {
        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.lock().open > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "timed out waiting for the mock broker to settle");
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    pub fn failed(&self) -> Vec<Value> {
        self.state.lock().failed.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }
}

async fn serve(
    conn: TcpStream,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
) {
    let (r, mut w) = conn.into_split();
    let mut lines = BufReader::new(r).lines();

    w.write_all(b"+HI {\"v\":2}\r\n").await.unwrap();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
            _ = cancel.cancelled() => return,
        };

        let (verb, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let reply = {
            let mut state = state.lock();
            state.commands.push(line.clone());

            if state.hang_up_on == Some(verb) {
                state.hang_up_on = None;
                return;
            }

            match respond(&mut state, verb, rest) {
                Some(reply) => reply,
                None => return,
            }
        };

        let split = state.lock().split_bulk
            && reply.starts_with(b"$")
            && reply.len() > 8;
        if split {
            let (a, b) = reply.split_at(reply.len() / 2);
            w.write_all(a).await.unwrap();
            w.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            w.write_all(b).await.unwrap();
        } else if w.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn bulk(body: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

fn respond(state: &mut State, verb: &str, rest: &str) -> Option<Vec<u8>> {
    let ok = b"+OK\r\n".to_vec();
    let not_found = b"-ERR Job not found\r\n".to_vec();

    if let Some(left) = state.reject.get_mut(verb) {
        if *left > 0 {
            *left -= 1;
            return Some(b"-ERR Internal error\r\n".to_vec());
        }
    }

    Some(match verb {
        "HELLO" => ok,
        "BEAT" => match state.beat_state {
            Some(s) => bulk(format!("{{\"state\":\"{s}\"}}").as_bytes()),
            None => ok,
        },
        "FETCH" => {
            let job = state.queues.get_mut(rest).and_then(VecDeque::pop_front);
            match job {
                Some(mut job) => {
                    if let Some(jid) = &state.force_jid {
                        job.jid = jid.clone();
                    }
                    state.reserved.insert(job.jid.clone());
                    bulk(&serde_json::to_vec(&job).unwrap())
                },
                None => b"$-1\r\n".to_vec(),
            }
        },
        "PUSH" => match serde_json::from_str::<Job>(rest) {
            Ok(job) => {
                let queue = state.queues.entry(job.queue.clone()).or_default();
                queue.push_back(job);
                ok
            },
            Err(e) => format!("-ERR {e}\r\n").into_bytes(),
        },
        "ACK" | "FAIL" => {
            let payload: Value = serde_json::from_str(rest).unwrap();
            let jid = payload["jid"].as_str().unwrap().to_owned();
            if state.forgotten.contains(&jid) || !state.reserved.remove(&jid) {
                not_found
            } else {
                if verb == "ACK" {
                    state.acked.push(jid);
                } else {
                    state.failed.push(payload);
                }
                ok
            }
        },
        "END" => return None,
        _ => format!("-ERR unknown command {verb}\r\n").into_bytes(),
    })
}
