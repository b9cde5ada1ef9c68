//! Wire-protocol codec.
//!
//! Requests come in two shapes, selected by the first byte: `*` starts a
//! multi-bulk request (`*N`, then `N` repetitions of `$len` + payload),
//! anything else is an inline request: one line split into quoted
//! whitespace-separated tokens. Replies use the RESP-like grammar: status
//! `+...`, error `-ERR ...`, integer `:n`, bulk `$len`, multi-bulk `*n`,
//! null bulk `$-1`.
//!
//! Parsing is incremental: a parser keeps per-client cursor state and
//! consumes the query buffer request by request, leaving pipelined trailing
//! bytes in place.

use once_cell::sync::Lazy;

use crate::{
    buffer::Buffer,
    object::{RStr, StrObject},
};

/// Hard limit on the length of an inline request line.
pub const INLINE_MAX_SIZE: usize = 64 * 1024;
/// Hard limit on the argument count of a multi-bulk request.
pub const MULTIBULK_MAX_ARGS: i64 = 1024 * 1024;
/// Hard limit on a single bulk argument.
pub const BULK_MAX_SIZE: i64 = 512 * 1024 * 1024;
/// A query buffer growing past this closes the client.
pub const QUERY_BUF_MAX: usize = 512 * 1024 * 1024;
/// Bytes asked from the socket per read event.
pub const READ_CHUNK: usize = 16 * 1024;
/// Size of the per-client static reply buffer, and the coalescing bound for
/// reply overflow chunks.
pub const REPLY_BUF_SIZE: usize = 16 * 1024;
/// Per-event write cap, so one fast consumer cannot starve the rest.
pub const WRITE_MAX_PER_EVENT: usize = 64 * 1024;

/// Canned replies, shared for the life of the process.
pub mod shared {
    pub const OK: &[u8] = b"+OK\r\n";
    pub const ERR: &[u8] = b"-ERR\r\n";
    pub const PONG: &[u8] = b"+PONG\r\n";
    pub const CZERO: &[u8] = b":0\r\n";
    pub const CONE: &[u8] = b":1\r\n";
    pub const NULLBULK: &[u8] = b"$-1\r\n";
    pub const CRLF: &[u8] = b"\r\n";
    pub const EMPTYMULTIBULK: &[u8] = b"*0\r\n";
    pub const WRONGTYPEERR: &[u8] =
        b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";
    pub const NOKEYERR: &[u8] = b"-ERR no such key\r\n";
    pub const MAXCLIENTSERR: &[u8] = b"-ERR max number of clients reached\r\n";
}

/// Bulk and multi-bulk headers below this size are interned.
pub const SHARED_HDR_LEN: usize = 32;

static BULK_HEADERS: Lazy<Vec<Vec<u8>>> = Lazy::new(|| {
    (0..SHARED_HDR_LEN)
        .map(|n| format!("${n}\r\n").into_bytes())
        .collect()
});

static MULTIBULK_HEADERS: Lazy<Vec<Vec<u8>>> = Lazy::new(|| {
    (0..SHARED_HDR_LEN)
        .map(|n| format!("*{n}\r\n").into_bytes())
        .collect()
});

pub fn bulk_header(len: usize) -> Option<&'static [u8]> {
    BULK_HEADERS.get(len).map(Vec::as_slice)
}

pub fn multibulk_header(count: usize) -> Option<&'static [u8]> {
    MULTIBULK_HEADERS.get(count).map(Vec::as_slice)
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Framing errors; the message text is sent to the client verbatim behind
/// an `-ERR ` prefix, and the connection closes once it is flushed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol error: too big inline request")]
    InlineTooLarge,
    #[error("Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,
    #[error("Protocol error: too big mbulk count string")]
    MultibulkCountLineTooLarge,
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedBulkHeader(char),
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
    #[error("Protocol error: too big bulk count string")]
    BulkCountLineTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestType {
    #[default]
    Unknown,
    Inline,
    MultiBulk,
}

/// Per-client incremental parser state.
#[derive(Debug, Default)]
pub struct Parser {
    pub req_type: RequestType,
    /// Bulk arguments still expected for the current multi-bulk request.
    remaining: i64,
    /// Length of the bulk currently being read, `None` before its header.
    bulk_len: Option<i64>,
    /// Arguments collected so far for the current request.
    args: Vec<RStr>,
}

impl Parser {
    /// Consume at most one request from the head of `buf`.
    ///
    /// `Ok(None)` means more input is needed; `Ok(Some(argv))` is a complete
    /// request (empty for a blank inline line: skip and keep going); an
    /// error means the connection is beyond repair and should close after
    /// the error reply.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<Option<Vec<RStr>>> {
        if self.req_type == RequestType::Unknown {
            self.req_type = match buf.first() {
                Some(b'*') => RequestType::MultiBulk,
                Some(_) => RequestType::Inline,
                None => return Ok(None),
            };
        }
        match self.req_type {
            RequestType::Inline => self.parse_inline(buf),
            RequestType::MultiBulk => self.parse_multibulk(buf),
            RequestType::Unknown => Ok(None),
        }
    }

    fn finish(&mut self) -> Vec<RStr> {
        self.req_type = RequestType::Unknown;
        self.remaining = 0;
        self.bulk_len = None;
        std::mem::take(&mut self.args)
    }

    fn parse_inline(&mut self, buf: &mut Buffer) -> Result<Option<Vec<RStr>>> {
        let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
            if buf.len() > INLINE_MAX_SIZE {
                return Err(ProtocolError::InlineTooLarge);
            }
            return Ok(None);
        };
        if newline > INLINE_MAX_SIZE {
            return Err(ProtocolError::InlineTooLarge);
        }

        let mut line = &buf[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let tokens = split_args(line).ok_or(ProtocolError::UnbalancedQuotes)?;
        self.args = tokens
            .iter()
            .map(|t| StrObject::from_slice(t))
            .collect();
        buf.advance(newline + 1);
        Ok(Some(self.finish()))
    }

    fn parse_multibulk(&mut self, buf: &mut Buffer) -> Result<Option<Vec<RStr>>> {
        if self.remaining == 0 {
            let Some(line) = take_line(buf, ProtocolError::MultibulkCountLineTooLarge)? else {
                return Ok(None);
            };
            let count =
                parse_decimal(&line[1..]).ok_or(ProtocolError::InvalidMultibulkLength)?;
            if count > MULTIBULK_MAX_ARGS {
                return Err(ProtocolError::InvalidMultibulkLength);
            }
            if count <= 0 {
                // Null/empty array: no command, carry on with the tail.
                return Ok(Some(self.finish()));
            }
            self.remaining = count;
            self.args = Vec::with_capacity(count as usize);
        }

        while self.remaining > 0 {
            let len = match self.bulk_len {
                Some(len) => len,
                None => {
                    let Some(line) = take_line(buf, ProtocolError::BulkCountLineTooLarge)?
                    else {
                        return Ok(None);
                    };
                    let first = *line.first().ok_or(ProtocolError::InvalidBulkLength)?;
                    if first != b'$' {
                        return Err(ProtocolError::ExpectedBulkHeader(first as char));
                    }
                    let len =
                        parse_decimal(&line[1..]).ok_or(ProtocolError::InvalidBulkLength)?;
                    if !(0..=BULK_MAX_SIZE).contains(&len) {
                        return Err(ProtocolError::InvalidBulkLength);
                    }
                    self.bulk_len = Some(len);
                    len
                }
            };

            let len = len as usize;
            if buf.len() < len + 2 {
                return Ok(None);
            }
            let payload = buf.split_to(len);
            buf.advance(2);
            self.args.push(StrObject::from_bytes(payload));
            self.bulk_len = None;
            self.remaining -= 1;
        }

        Ok(Some(self.finish()))
    }
}

/// Pop one CRLF-terminated line off the buffer head, excluding the
/// terminator. An unterminated line longer than the inline bound is fatal.
fn take_line(buf: &mut Buffer, overflow: ProtocolError) -> Result<Option<Vec<u8>>> {
    let Some(cr) = buf.iter().position(|b| *b == b'\r') else {
        if buf.len() > INLINE_MAX_SIZE {
            return Err(overflow);
        }
        return Ok(None);
    };
    if buf.len() < cr + 2 {
        // Wait for the \n.
        return Ok(None);
    }
    let line = buf[..cr].to_vec();
    buf.advance(cr + 2);
    Ok(Some(line))
}

fn parse_decimal(digits: &[u8]) -> Option<i64> {
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Split an inline request line into arguments, honoring single and double
/// quotes with C-style escapes (`\n`, `\r`, `\t`, `\a`, `\b`, `\xHH`, and
/// backslash-escaped quotes). Returns `None` on unbalanced quoting.
pub fn split_args(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    fn at(line: &[u8], i: usize) -> u8 {
        line.get(i).copied().unwrap_or(0)
    }

    fn hex_value(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            return Some(out);
        }

        let mut current = Vec::new();
        let mut in_quotes = false;
        let mut in_single_quotes = false;
        let mut done = false;
        while !done {
            if in_quotes {
                if at(line, i) == b'\\' && at(line, i + 1) == b'x' {
                    if let (Some(hi), Some(lo)) =
                        (hex_value(at(line, i + 2)), hex_value(at(line, i + 3)))
                    {
                        current.push(hi * 16 + lo);
                        i += 3;
                    } else {
                        current.push(b'\\');
                    }
                } else if at(line, i) == b'\\' && i + 1 < line.len() {
                    i += 1;
                    current.push(match at(line, i) {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'b' => 0x08,
                        b'a' => 0x07,
                        other => other,
                    });
                } else if at(line, i) == b'"' {
                    // The closing quote must be followed by a separator.
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    done = true;
                } else if i >= line.len() {
                    // Unterminated quotes.
                    return None;
                } else {
                    current.push(line[i]);
                }
            } else if in_single_quotes {
                if at(line, i) == b'\\' && at(line, i + 1) == b'\'' {
                    i += 1;
                    current.push(b'\'');
                } else if at(line, i) == b'\'' {
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    done = true;
                } else if i >= line.len() {
                    return None;
                } else {
                    current.push(line[i]);
                }
            } else {
                match at(line, i) {
                    0 | b' ' | b'\n' | b'\r' | b'\t' => done = true,
                    b'"' => in_quotes = true,
                    b'\'' => in_single_quotes = true,
                    other => current.push(other),
                }
            }
            if i < line.len() {
                i += 1;
            }
        }
        out.push(current);
    }
}
