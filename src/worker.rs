//! The scheduling loop: fetches jobs, hands them to consumers, reports
//! results back to the broker and drains cleanly on shutdown.
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::client::{Client, Outcome};
use crate::config::WorkerConfig;
use crate::consumer::{ConsumerRegistry, JobConsumer, JobError};
use crate::error::WorkerError;
use crate::jobs_state::JobsState;
use crate::types::job::{FailureReport, Job};
use crate::types::protocol::{BeatState, Hello};
use crate::types::states::WorkerState;

/// Minimum spacing between two heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

type Connection = Client<TcpStream>;

/// Decides when the next heartbeat is due.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatClock {
    last: Instant,
    interval: Duration,
}

impl HeartbeatClock {
    pub fn starting_at(last: Instant, interval: Duration) -> Self {
        Self { last, interval }
    }

    /// True once strictly more than `interval` has passed since the last
    /// heartbeat.
    pub fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) > self.interval
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }
}

/// What was left over when a worker stopped.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Jobs still running when the grace period ran out. They are neither
    /// acknowledged nor failed; the broker re-issues them once their
    /// reservation expires.
    pub stragglers: Vec<String>,
    /// Finished jobs whose `ACK`/`FAIL` could not be delivered.
    pub unreported: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty() && self.unreported == 0
    }
}

/// A report owed to the broker.
enum Report {
    Ack(String),
    Fail(FailureReport),
}

impl Report {
    fn jid(&self) -> &str {
        match self {
            Report::Ack(jid) => jid,
            Report::Fail(report) => &report.jid,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Report::Ack(_) => "ACK",
            Report::Fail(_) => "FAIL",
        }
    }

    fn requeue(self, jobs: &JobsState) {
        match self {
            Report::Ack(jid) => jobs.requeue_completed(jid),
            Report::Fail(report) => jobs.requeue_failed(report),
        }
    }
}

/// Pulls jobs from the broker and runs them on registered consumers.
///
/// All broker I/O happens serially on the task calling [`Worker::run`];
/// consumers run on tasks of their own and only talk back through the
/// shared [`JobsState`].
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    consumers: ConsumerRegistry,
    jobs: Arc<JobsState>,
    /// Every consumer task, so the drain can tell when they're all done.
    tracker: TaskTracker,
    /// Handed to consumers; fired once the worker stops waiting for them.
    handler_cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    heartbeat: HeartbeatClock,
    /// Set when the broker asks this worker to stop fetching.
    quiet: bool,
}

impl Worker {
    pub fn new(
        mut config: WorkerConfig,
        consumers: ConsumerRegistry,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        if consumers.is_empty() {
            return Err(WorkerError::NoConsumers);
        }

        let worker_id = config
            .worker_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let (state, _) = watch::channel(WorkerState::Starting);

        Ok(Self {
            config,
            worker_id,
            consumers,
            jobs: Arc::new(JobsState::new()),
            tracker: TaskTracker::new(),
            handler_cancel: CancellationToken::new(),
            state,
            heartbeat: HeartbeatClock::starting_at(
                Instant::now(),
                HEARTBEAT_INTERVAL,
            ),
            quiet: false,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Shared job bookkeeping, for observing a running worker.
    pub fn jobs(&self) -> Arc<JobsState> {
        self.jobs.clone()
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Connects, works until `shutdown` fires (or the broker asks the worker
    /// to terminate), then drains and disconnects.
    ///
    /// Errors are fatal: failing to connect or handshake, failing to
    /// reconnect after the connection broke, or a duplicate job ID.
    #[instrument(name = "worker", skip_all, fields(wid = %self.worker_id))]
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
    ) -> Result<ShutdownReport, WorkerError> {
        info!(
            queues = ?self.consumers,
            parallel_jobs = self.config.parallel_jobs,
            "worker starting"
        );

        let mut client = match self.start().await {
            Ok(client) => client,
            Err(error) => {
                error!(%error, "worker could not start");
                self.set_state(WorkerState::Stopped);
                return Err(error);
            },
        };

        self.set_state(WorkerState::Running);

        if let Err(error) = self.work(&mut client, &shutdown).await {
            error!(%error, "worker stopping on fatal error");
            self.abandon().await;
            self.set_state(WorkerState::Stopped);
            return Err(error);
        }

        self.set_state(WorkerState::Draining);
        let report = self.drain(&mut client).await;

        if let Err(error) = client.end().await {
            debug!(%error, "could not end connection cleanly");
        }

        self.set_state(WorkerState::Stopped);
        info!("worker stopped");

        Ok(report)
    }

    async fn start(&mut self) -> Result<Connection, WorkerError> {
        self.set_state(WorkerState::Connecting);
        let mut client = self.connect().await?;

        self.set_state(WorkerState::Handshaking);
        self.handshake(&mut client).await?;

        info!("connected to broker");
        Ok(client)
    }

    async fn connect(&self) -> Result<Connection, WorkerError> {
        Client::connect(
            &self.config.host,
            self.config.port,
            self.config.read_timeout,
        )
        .await
        .map_err(WorkerError::Connection)
    }

    async fn handshake(
        &mut self,
        client: &mut Connection,
    ) -> Result<(), WorkerError> {
        let hello = Hello::new(
            self.config.worker_hostname.clone(),
            self.config.protocol_version,
            self.worker_id.clone(),
        )
        .with_labels(self.config.labels.clone())
        .with_password(self.config.password.clone());

        match client.handshake(hello).await.map_err(WorkerError::Connection)? {
            Outcome::Ok(()) => {
                // The broker counts the handshake as a sign of life.
                self.heartbeat.mark(Instant::now());
                Ok(())
            },
            Outcome::Rejected(msg) => Err(WorkerError::HandshakeRejected(msg)),
            Outcome::NotFound => {
                Err(WorkerError::HandshakeRejected("not found".into()))
            },
        }
    }

    /// Replaces a connection whose state is unknown with a fresh one.
    async fn reconnect(
        &mut self,
        client: &mut Connection,
    ) -> Result<(), WorkerError> {
        warn!("re-establishing broker connection");

        let mut fresh = self.connect().await?;
        self.handshake(&mut fresh).await?;
        *client = fresh;

        info!("broker connection re-established");
        Ok(())
    }

    async fn work(
        &mut self,
        client: &mut Connection,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerError> {
        loop {
            if shutdown.is_cancelled() {
                info!("stop requested");
                return Ok(());
            }

            self.flush(client).await?;

            if !self.quiet {
                self.fill(client, shutdown).await?;
            }

            match self.beat(client).await? {
                Some(BeatState::Quiet) if !self.quiet => {
                    info!("broker quieted worker; no longer fetching");
                    self.quiet = true;
                },
                Some(BeatState::Terminate) => {
                    info!("broker asked worker to terminate");
                    return Ok(());
                },
                _ => {},
            }

            self.idle(shutdown).await;
        }
    }

    /// Fetches from every queue, in registration order, until each one has
    /// come back empty this cycle or the concurrency cap is reached.
    async fn fill(
        &mut self,
        client: &mut Connection,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let consumers: Vec<(String, Arc<dyn JobConsumer>)> = self
            .consumers
            .iter()
            .map(|(q, c)| (q.to_owned(), c.clone()))
            .collect();
        let mut empty = vec![false; consumers.len()];

        while empty.contains(&false) {
            for (i, (queue, consumer)) in consumers.iter().enumerate() {
                if empty[i] {
                    continue;
                }

                if shutdown.is_cancelled()
                    || self.jobs.started_len() >= self.config.parallel_jobs
                {
                    return Ok(());
                }

                match client.fetch(queue).await {
                    Ok(Outcome::Ok(Some(job))) => {
                        self.dispatch(queue, job, consumer.clone())?
                    },
                    Ok(Outcome::Ok(None)) => empty[i] = true,
                    Ok(other) => {
                        warn!(%queue, reply = ?other, "broker refused fetch");
                        empty[i] = true;
                    },
                    Err(error) => {
                        warn!(%queue, %error, "fetch got no answer");
                        empty[i] = true;
                        self.reconnect(client).await?;
                    },
                }
            }
        }

        Ok(())
    }

    /// Registers a job and starts its consumer on a task of its own.
    fn dispatch(
        &self,
        queue: &str,
        job: Job,
        consumer: Arc<dyn JobConsumer>,
    ) -> Result<(), WorkerError> {
        let job = Arc::new(job);
        self.jobs.start(job.clone())?;

        let span = info_span!(
            "job",
            jid = %job.jid,
            queue,
            jobtype = %job.jobtype
        );
        let jobs = self.jobs.clone();
        let cancel = self.handler_cancel.clone();

        self.tracker.spawn(
            async move {
                debug!("job started");

                let outcome = AssertUnwindSafe(consumer.consume(&job, cancel))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(())) => {
                        debug!("job completed");
                        jobs.complete(&job.jid);
                    },
                    Ok(Err(err)) => {
                        let report = failure_report(&job.jid, &err);
                        error!(
                            error = %report.message,
                            "job failed and will be reported as FAIL"
                        );
                        jobs.fail(report);
                    },
                    Err(panic) => {
                        let message = panic_message(&*panic);
                        error!(error = %message, "job panicked");
                        let report =
                            FailureReport::new(&job.jid, "panic", message);
                        jobs.fail(report);
                    },
                }
            }
            .instrument(span),
        );

        Ok(())
    }

    /// Delivers every owed `ACK`, then every owed `FAIL`.
    ///
    /// Reports that can't be delivered go back on their queue for a later
    /// flush. On a fatal error everything not yet delivered is put back too.
    async fn flush(
        &mut self,
        client: &mut Connection,
    ) -> Result<(), WorkerError> {
        let mut pending: VecDeque<Report> = self
            .jobs
            .take_completed()
            .into_iter()
            .map(Report::Ack)
            .chain(self.jobs.take_failed().into_iter().map(Report::Fail))
            .collect();

        while let Some(report) = pending.pop_front() {
            match self.deliver(client, &report).await {
                Ok(true) => {},
                Ok(false) => report.requeue(&self.jobs),
                Err(error) => {
                    report.requeue(&self.jobs);
                    for report in pending {
                        report.requeue(&self.jobs);
                    }
                    return Err(error);
                },
            }
        }

        Ok(())
    }

    /// Sends one report, retrying once straight away. Returns whether the
    /// job is now resolved as far as the broker is concerned.
    async fn deliver(
        &mut self,
        client: &mut Connection,
        report: &Report,
    ) -> Result<bool, WorkerError> {
        let (jid, verb) = (report.jid(), report.verb());

        for attempt in 1..=2 {
            let res = match report {
                Report::Ack(jid) => client.ack(jid).await,
                Report::Fail(failure) => client.fail(failure).await,
            };

            match res {
                Ok(Outcome::Ok(())) => {
                    debug!(jid, verb, "reported job");
                    return Ok(true);
                },
                Ok(Outcome::NotFound) => {
                    debug!(jid, verb, "job already resolved by broker");
                    return Ok(true);
                },
                Ok(Outcome::Rejected(msg)) => {
                    warn!(
                        jid,
                        verb,
                        attempt,
                        reply = %msg,
                        "broker refused report"
                    );
                },
                Err(error) => {
                    warn!(jid, verb, attempt, %error, "report got no answer");
                    self.reconnect(client).await?;
                },
            }
        }

        Ok(false)
    }

    /// Sends a heartbeat if one is due, returning the state the broker
    /// answered with.
    async fn beat(
        &mut self,
        client: &mut Connection,
    ) -> Result<Option<BeatState>, WorkerError> {
        let now = Instant::now();
        if !self.heartbeat.due(now) {
            return Ok(None);
        }
        self.heartbeat.mark(now);

        match client.heartbeat(&self.worker_id).await {
            Ok(Outcome::Ok(state)) => Ok(Some(state)),
            Ok(other) => {
                warn!(reply = ?other, "broker refused heartbeat");
                Ok(None)
            },
            Err(error) => {
                warn!(%error, "heartbeat got no answer");
                self.reconnect(client).await?;
                Ok(None)
            },
        }
    }

    /// Waits out the poll interval. At capacity, wakes early as soon as a
    /// job finishes.
    async fn idle(&self, shutdown: &CancellationToken) {
        let cap = self.config.parallel_jobs;
        let at_capacity = self.jobs.started_len() >= cap;

        select! {
            _ = shutdown.cancelled() => {},
            _ = sleep(self.config.poll_interval) => {},
            _ = self.jobs.wait_for_capacity(cap), if at_capacity => {},
        }
    }

    /// Stops fetching, reports what is finished, waits up to the grace
    /// period for the rest, then reports again.
    async fn drain(&mut self, client: &mut Connection) -> ShutdownReport {
        info!("worker draining");

        let mut connected = true;
        if let Err(error) = self.flush(client).await {
            error!(%error, "could not deliver reports");
            connected = false;
        }

        self.tracker.close();
        let in_flight = self.jobs.started_len();

        if in_flight > 0 {
            info!(
                in_flight,
                grace = ?self.config.shutdown_timeout,
                "waiting for in-progress jobs"
            );

            let deadline = Instant::now() + self.config.shutdown_timeout;
            loop {
                let step =
                    deadline.min(Instant::now() + self.config.poll_interval);
                if timeout_at(step, self.tracker.wait()).await.is_ok()
                    || Instant::now() >= deadline
                {
                    break;
                }

                if connected {
                    if let Err(error) = self.beat(client).await {
                        error!(%error, "lost broker connection while draining");
                        connected = false;
                    }
                }
            }
        }

        self.handler_cancel.cancel();

        if connected {
            if let Err(error) = self.flush(client).await {
                error!(%error, "could not deliver reports");
            }
        }

        let stragglers = self.jobs.started_ids();
        if !stragglers.is_empty() {
            warn!(
                count = stragglers.len(),
                jids = ?stragglers,
                "jobs were not completed; leaving them to the broker"
            );
        } else if in_flight > 0 {
            info!(in_flight, "all in-progress jobs completed");
        }

        let unreported = self.jobs.completed_len() + self.jobs.failed_len();
        if unreported > 0 {
            warn!(unreported, "some job reports could not be delivered");
        }

        ShutdownReport {
            stragglers,
            unreported,
        }
    }

    /// Stops every handler after a fatal error. Nothing is reported to the
    /// broker: it reclaims whatever this worker held once the reservations
    /// expire.
    async fn abandon(&self) {
        self.handler_cancel.cancel();
        self.tracker.close();

        let grace = self.config.shutdown_timeout;
        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(?grace, "handlers still running after cancellation");
        }

        error!(
            abandoned = ?self.jobs.started_ids(),
            completed = self.jobs.completed_len(),
            failed = self.jobs.failed_len(),
            "dropping unreported jobs"
        );
    }

    fn set_state(&self, state: WorkerState) {
        debug!(%state, "worker state");
        self.state.send_replace(state);
    }
}

/// Converts a consumer's error into the report sent with `FAIL`.
fn failure_report(jid: &str, err: &anyhow::Error) -> FailureReport {
    let errtype = err
        .downcast_ref::<JobError>()
        .map_or_else(|| "Error".to_owned(), |e| e.errtype.clone());

    let mut message = format!("{err:#}");
    if message.is_empty() {
        message = errtype.clone();
    }

    let backtrace = err.chain().skip(1).map(|c| c.to_string()).collect();

    FailureReport::new(jid, errtype, message).with_backtrace(backtrace)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "consumer panicked".to_owned()
    }
}
