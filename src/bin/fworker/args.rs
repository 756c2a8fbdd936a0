use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// YAML worker config to read connection settings from.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Broker host, overriding the config.
    #[arg(short = 'H', long)]
    pub(crate) host: Option<String>,
    /// Broker (TCP) port, overriding the config.
    #[arg(short, long)]
    pub(crate) port: Option<u16>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Pushes one job and prints its ID.
    Push {
        #[arg(short, long, default_value = "default")]
        queue: String,
        #[arg(short, long)]
        jobtype: String,
        /// Job ID to use instead of a generated one.
        #[arg(long)]
        jid: Option<String>,
        /// Arguments passed to the job's consumer.
        args: Vec<String>,
    },
    /// Fetches one job and prints it as JSON.
    Fetch {
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Acknowledges the job straight away.
        #[arg(long, conflicts_with = "fail")]
        ack: bool,
        /// Fails the job straight away with this message.
        #[arg(long)]
        fail: Option<String>,
    },
    /// Sends one heartbeat and prints the state the broker answers with.
    Beat,
}
