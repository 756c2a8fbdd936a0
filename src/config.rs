use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Settings for a [`Worker`](crate::worker::Worker).
///
/// Every field has a default, so a YAML file only needs to name what it
/// changes. Durations are written as (possibly fractional) seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Broker host name or IP address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Protocol version announced in `HELLO`.
    pub protocol_version: u32,
    /// How long the drain waits for in-flight jobs before giving up on them.
    #[serde(with = "seconds")]
    pub shutdown_timeout: Duration,
    /// Pause between poll cycles.
    #[serde(with = "seconds")]
    pub poll_interval: Duration,
    /// Most jobs allowed to run at once.
    pub parallel_jobs: usize,
    /// Display name shown by the broker.
    pub worker_hostname: String,
    /// Unique per worker process; generated once at startup when unset.
    pub worker_id: Option<String>,
    pub labels: Vec<String>,
    pub password: Option<String>,
    /// Longest a single socket read may take before it counts as empty.
    #[serde(with = "seconds")]
    pub read_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 7419,
            protocol_version: 2,
            shutdown_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            parallel_jobs: 25,
            worker_hostname: "fworker".into(),
            worker_id: None,
            labels: Vec::new(),
            password: None,
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).context("parsing worker config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.host.is_empty() {
            return Err(WorkerError::InvalidConfig("host is empty".into()));
        }
        if self.parallel_jobs == 0 {
            return Err(WorkerError::InvalidConfig(
                "parallel_jobs must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// (De)serialises a `Duration` as a number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
