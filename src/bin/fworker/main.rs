mod args;

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use faktory_worker::types::protocol::Hello;
use faktory_worker::{Client, FailureReport, Job, Outcome, WorkerConfig};
use tokio::net::TcpStream;
use tracing::{error, info, Level};
use uuid::Uuid;

use crate::args::{Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .init();
    }

    match begin(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %format!("{error:#}"), "command failed");
            ExitCode::FAILURE
        },
    }
}

async fn begin(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_yaml_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    // BEAT must carry the same ID as HELLO.
    let wid = config
        .worker_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut client = connect(&config, &wid).await?;

    match args.command {
        Command::Push {
            queue,
            jobtype,
            jid,
            args,
        } => {
            let mut job = Job::new(queue, jobtype, args);
            if let Some(jid) = jid {
                job = job.with_id(jid);
            }

            expect("PUSH", client.push(&job).await?)?;
            info!(jid = %job.jid, queue = %job.queue, "pushed job");
            println!("{}", job.jid);
        },
        Command::Fetch { queue, ack, fail } => {
            let Some(job) = expect("FETCH", client.fetch(&queue).await?)? else {
                info!(%queue, "queue is empty");
                println!("no job");
                return end(client).await;
            };

            println!("{}", serde_json::to_string(&job)?);

            if ack {
                expect("ACK", client.ack(&job.jid).await?)?;
                info!(jid = %job.jid, "acknowledged job");
            } else if let Some(message) = fail {
                let report = FailureReport::new(&job.jid, "Error", message);
                expect("FAIL", client.fail(&report).await?)?;
                info!(jid = %job.jid, "failed job");
            }
        },
        Command::Beat => {
            let state = expect("BEAT", client.heartbeat(&wid).await?)?;
            println!("{state:?}");
        },
    }

    end(client).await
}

async fn connect(
    config: &WorkerConfig,
    wid: &str,
) -> Result<Client<TcpStream>> {
    let mut client =
        Client::connect(&config.host, config.port, config.read_timeout)
            .await
            .context("connecting to broker")?;

    let hello = Hello::new(
        config.worker_hostname.clone(),
        config.protocol_version,
        wid,
    )
    .with_labels(config.labels.clone())
    .with_password(config.password.clone());

    expect("HELLO", client.handshake(hello).await?)?;
    Ok(client)
}

async fn end(client: Client<TcpStream>) -> Result<()> {
    client.end().await.context("closing connection")
}

fn expect<T>(verb: &str, outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Ok(v) => Ok(v),
        Outcome::NotFound => bail!("{verb}: job not found"),
        Outcome::Rejected(msg) => bail!("broker refused {verb}: {msg}"),
    }
}
