use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep, timeout};
use tracing::trace;

use crate::error::ClientError;
use crate::parser::ReplyCodec;
use crate::types::protocol::Reply;
use crate::util::escape_wire;

/// Unproductive reads tolerated before giving up on a reply.
pub const RECEIVE_ATTEMPTS: u32 = 5;
/// Pause after an unproductive read.
pub const RECEIVE_BACKOFF: Duration = Duration::from_millis(50);

/// Reads broker replies from a stream.
///
/// Bytes accumulate in an internal buffer until `ReplyCodec` can cut a whole
/// reply out of it. A read that returns nothing (or doesn't return within
/// `read_timeout`) is treated as transient and retried after a short pause;
/// only `RECEIVE_ATTEMPTS` such reads are allowed per reply. Reads that add
/// bytes to a partial reply don't count against that budget.
pub struct ReplyReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but doesn't yet form a whole reply.
    buf: BytesMut,
    codec: ReplyCodec,
    /// Data source
    reader: T,
    read_timeout: Duration,
}

impl<T: AsyncRead + Unpin> ReplyReader<T> {
    pub fn new(reader: T, read_timeout: Duration) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            codec: ReplyCodec::default(),
            reader,
            read_timeout,
        }
    }

    /// Reads the next reply.
    ///
    /// Pipelined replies that arrived in the same read are returned by
    /// subsequent calls without touching the reader.
    pub async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut empty_reads = 0;

        loop {
            if let Some(reply) = self.codec.decode(&mut self.buf)? {
                trace!(%reply, "received reply");
                return Ok(reply);
            }

            if empty_reads >= RECEIVE_ATTEMPTS {
                trace!(
                    buffered = escape_wire(&self.buf),
                    "no complete reply"
                );
                return Err(ClientError::NoReply {
                    attempts: empty_reads,
                    buffered: self.buf.len(),
                });
            }

            let read = self.reader.read_buf(&mut self.buf);
            let n_bytes_read = match timeout(self.read_timeout, read).await {
                Ok(read) => read?,
                Err(_elapsed) => 0,
            };

            if n_bytes_read == 0 {
                empty_reads += 1;
                sleep(RECEIVE_BACKOFF).await;
            }
        }
    }

    /// Drops anything buffered. Used once a reply has been given up on, so
    /// stale bytes are never mistaken for the answer to a later command.
    pub fn discard(&mut self) {
        self.buf.clear();
        self.codec = ReplyCodec::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test_reassembles_fragmented_replies() {
        let json = r#"{"jid":"A","queue":"default","jobtype":"Noop"}"#;
        let header = format!("${}\r\n", json.len());
        let (j1, j2) = json.split_at(7);

        let chunks: Vec<Vec<u8>> = vec![
            b"+H".to_vec(),
            b"I {\"v\":2}\r".to_vec(),
            b"\n".to_vec(),
            header.into_bytes(),
            j1.as_bytes().to_vec(),
            j2.as_bytes().to_vec(),
            b"\r\n$-1\r\n+OK\r\n".to_vec(),
        ];

        // We can ensure correct fragmentation of reads by explicitly
        // yielding between each write.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in chunks {
                client.write_all(&buf).await.unwrap();
                yield_now().await;
            }
            // Keep the stream open so the reader never sees end-of-stream.
            std::future::pending::<()>().await;
        });

        let mut rr = ReplyReader::new(server, Duration::from_secs(1));

        assert_eq!(
            rr.read_reply().await.unwrap(),
            Reply::Simple("HI {\"v\":2}".into())
        );
        assert_eq!(
            rr.read_reply().await.unwrap(),
            Reply::Bulk(Some(Bytes::copy_from_slice(json.as_bytes())))
        );
        assert_eq!(rr.read_reply().await.unwrap(), Reply::Bulk(None));
        assert!(rr.read_reply().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_empty_reads() {
        let (client, server) = io::duplex(64);
        drop(client);

        let mut rr = ReplyReader::new(server, Duration::from_secs(1));

        match rr.read_reply().await {
            Err(ClientError::NoReply { attempts, .. }) => {
                assert_eq!(attempts, RECEIVE_ATTEMPTS)
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gives_up_on_silent_peer() {
        let (mut client, server) = io::duplex(64);
        client.write_all(b"$20\r\nonly-part").await.unwrap();

        let mut rr = ReplyReader::new(server, Duration::from_millis(10));

        match rr.read_reply().await {
            Err(ClientError::NoReply { buffered, .. }) => {
                assert_eq!(buffered, b"$20\r\nonly-part".len())
            },
            other => panic!("unexpected {other:?}"),
        }

        rr.discard();
        client.write_all(b"+OK\r\n").await.unwrap();
        assert!(rr.read_reply().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_garbage_is_a_parse_error() {
        let (mut client, server) = io::duplex(64);
        client.write_all(b"?what\r\n").await.unwrap();

        let mut rr = ReplyReader::new(server, Duration::from_secs(1));
        assert!(matches!(
            rr.read_reply().await,
            Err(ClientError::Parse(_))
        ));
    }
}
