use std::fmt;

/// Lifecycle of a [`Worker`](crate::worker::Worker).
///
/// `Running` and `Draining` are the only long-lived states; a worker never
/// moves backwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Starting,
    Connecting,
    Handshaking,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use WorkerState::*;

        f.write_str(match self {
            Starting => "starting",
            Connecting => "connecting",
            Handshaking => "handshaking",
            Running => "running",
            Draining => "draining",
            Stopped => "stopped",
        })
    }
}
