//! implements a decoder for replies on the Faktory TCP protocol.
use std::fmt;

use bytes::{Buf, BytesMut};
use itertools::Itertools;

use crate::types::protocol::Reply;

/// Largest bulk payload accepted from the broker.
pub const MAX_BULK_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    /// The reply line didn't follow the framing rules.
    BadFormat,
    /// The reply began with a type byte this client doesn't understand.
    UnknownReply(u8),
    /// A bulk reply declared more than `MAX_BULK_LEN` bytes.
    TooLarge(usize),
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadFormat => f.write_str("bad format"),
            Self::UnknownReply(b) => {
                write!(f, "unknown reply type {:?}", char::from(*b))
            },
            Self::TooLarge(n) => write!(f, "bulk reply of {n} bytes too large"),
        }
    }
}

impl std::error::Error for ParsingError {}

/// Decodes replies out of a buffer that fills up one socket read at a time.
///
/// A reply is either a single CRLF-terminated line (`+...`, `-...`, `$-1`)
/// or a `$<n>` header line followed by exactly `n` payload bytes and a CRLF.
/// `decode` never consumes a partial reply: it returns `Ok(None)` until the
/// buffer holds the whole frame, so frames may arrive split across any
/// number of reads.
#[derive(Debug, Default)]
pub struct ReplyCodec {
    /// Index in the buffer from which a CRLF ending the header line may
    /// appear (before which no CRLF has been seen).
    maybe_crlf_from: usize,
}

impl ReplyCodec {
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Reply>, ParsingError> {
        // We need to scan from one position earlier than where the last scan
        // stopped in case a \r arrived at the end of one read and the \n at
        // the start of the next.
        let Some(eol) = buf
            .iter()
            .skip(self.maybe_crlf_from)
            .tuple_windows::<(_, _)>()
            .position(|x| x == (&b'\r', &b'\n'))
            .map(|p| p + self.maybe_crlf_from)
        else {
            self.maybe_crlf_from = buf.len().saturating_sub(1);
            return Ok(None);
        };

        let reply = match buf[0] {
            b'+' => Reply::Simple(take_line(buf, eol)?),
            b'-' => Reply::Error(take_line(buf, eol)?),
            b'$' => {
                let len = parse_len(&buf[1..eol])?;
                let Some(len) = len else {
                    buf.advance(eol + 2);
                    self.maybe_crlf_from = 0;
                    return Ok(Some(Reply::Bulk(None)));
                };

                if len > MAX_BULK_LEN {
                    return Err(ParsingError::TooLarge(len));
                }

                // Header, payload, trailing CRLF.
                let total = eol + 2 + len + 2;
                if buf.len() < total {
                    // The header stays in the buffer, so the next scan finds
                    // the same CRLF again; only the payload is outstanding.
                    buf.reserve(total - buf.len());
                    return Ok(None);
                }

                if &buf[total - 2..total] != b"\r\n" {
                    return Err(ParsingError::BadFormat);
                }

                let frame = buf.split_to(total).freeze();
                Reply::Bulk(Some(frame.slice(eol + 2..eol + 2 + len)))
            },
            other => return Err(ParsingError::UnknownReply(other)),
        };

        self.maybe_crlf_from = 0;
        Ok(Some(reply))
    }
}

/// Removes the line ending at `eol` (plus its CRLF) from the buffer and
/// returns its text without the leading type byte.
fn take_line(buf: &mut BytesMut, eol: usize) -> Result<String, ParsingError> {
    let line = buf.split_to(eol + 2);
    String::from_utf8(line[1..eol].to_vec())
        .map_err(|_| ParsingError::BadFormat)
}

/// Parses the length of a `$` header. `-1` means no payload.
fn parse_len(token: &[u8]) -> Result<Option<usize>, ParsingError> {
    if token == b"-1" {
        return Ok(None);
    }

    if token.is_empty() {
        return Err(ParsingError::BadFormat);
    }

    let mut r = 0usize;
    for v in token {
        match v {
            b'0'..=b'9' => {
                r = r
                    .checked_mul(10)
                    .ok_or(ParsingError::BadFormat)?
                    .checked_add((*v - b'0') as usize)
                    .ok_or(ParsingError::BadFormat)?
            },
            _ => return Err(ParsingError::BadFormat),
        };
    }

    Ok(Some(r))
}
