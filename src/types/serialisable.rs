use serde::Serialize;

use super::protocol::Command;

/// Types implementing FaktorySerialisable can be written to the broker
/// connection in the worker -> broker direction.
pub trait FaktorySerialisable {
    /// Converts the value into a CRLF-terminated wire command.
    fn serialise_faktory(&self) -> serde_json::Result<Vec<u8>>;
}

/// Builds `<verb> <json>\r\n`.
fn with_json<T: Serialize>(
    verb: &str,
    payload: &T,
) -> serde_json::Result<Vec<u8>> {
    let mut line = Vec::with_capacity(verb.len() + 64);
    line.extend_from_slice(verb.as_bytes());
    line.push(b' ');
    serde_json::to_writer(&mut line, payload)?;
    line.extend_from_slice(b"\r\n");
    Ok(line)
}

#[derive(Serialize)]
struct Jid<'a> {
    jid: &'a str,
}

#[derive(Serialize)]
struct Wid<'a> {
    wid: &'a str,
}

impl FaktorySerialisable for Command {
    fn serialise_faktory(&self) -> serde_json::Result<Vec<u8>> {
        use Command::*;

        match self {
            Hello(hello) => with_json("HELLO", hello),
            Beat { wid } => with_json("BEAT", &Wid { wid }),
            Fetch { queue } => Ok(format!("FETCH {queue}\r\n").into_bytes()),
            Push(job) => with_json("PUSH", job),
            Ack { jid } => with_json("ACK", &Jid { jid }),
            Fail(report) => with_json("FAIL", report),
            End => Ok(b"END\r\n".to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{FailureReport, Job};
    use crate::types::protocol::Hello;

    #[track_caller]
    fn wire(cmd: Command) -> String {
        String::from_utf8(cmd.serialise_faktory().unwrap()).unwrap()
    }

    #[test]
    fn test_serialise_commands() {
        assert_eq!(
            wire(Command::Fetch {
                queue: "default".into()
            }),
            "FETCH default\r\n"
        );
        assert_eq!(
            wire(Command::Ack { jid: "A".into() }),
            "ACK {\"jid\":\"A\"}\r\n"
        );
        assert_eq!(
            wire(Command::Beat { wid: "w1".into() }),
            "BEAT {\"wid\":\"w1\"}\r\n"
        );
        assert_eq!(wire(Command::End), "END\r\n");
        assert_eq!(
            wire(Command::Fail(FailureReport::new("B", "Timeout", "slow"))),
            "FAIL {\"jid\":\"B\",\"errtype\":\"Timeout\",\"message\":\"slow\"}\r\n"
        );
    }

    #[test]
    fn test_payloads_are_single_line() {
        let job = Job::new("default", "Echo", ["line one\r\nline two"]);
        let push = wire(Command::Push(job));
        assert!(push.starts_with("PUSH {"));
        assert_eq!(push.matches("\r\n").count(), 1);

        let mut hello = Hello::new("host", 2, "w1");
        hello.pid = None;
        assert_eq!(
            wire(Command::Hello(hello)),
            "HELLO {\"hostname\":\"host\",\"v\":2,\"wid\":\"w1\"}\r\n"
        );
    }
}
