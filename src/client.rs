//! Per-connection client state.

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, Write},
    net::SocketAddr,
};

use bitflags::bitflags;
use mio::{
    event::Source,
    net::{TcpStream, UnixStream},
    Interest, Registry, Token,
};

use crate::{
    buffer::Buffer,
    object::RStr,
    protocol::{Parser, REPLY_BUF_SIZE},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        /// Flush outstanding replies, then close.
        const CLOSE_AFTER_REPLY = 1;
        /// Scheduled for release on the next cron tick.
        const CLOSE_ASAP = 1 << 1;
        /// Already linked into the pending-writes list.
        const PENDING_WRITE = 1 << 2;
    }
}

/// A client socket: TCP or Unix domain.
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    pub fn peer_name(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .peer_addr()
                .map_or_else(|_| String::from("?:?"), |a: SocketAddr| a.to_string()),
            Self::Unix(_) => String::from("unix-socket"),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl Source for Conn {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}

pub struct Client {
    pub conn: Conn,
    /// Registration token; doubles as the slot index in the client table.
    pub token: usize,
    pub name: String,
    pub flags: ClientFlags,
    /// Selected database index.
    pub db: usize,

    /// Raw bytes read off the socket, pending requests included.
    pub query: Buffer,
    pub parser: Parser,
    /// Arguments of the request currently being executed.
    pub argv: Vec<RStr>,

    /// Static reply buffer with written/sent cursors.
    pub reply_buf: Box<[u8; REPLY_BUF_SIZE]>,
    pub reply_buf_len: usize,
    /// Progress cursor into the static buffer, or into the head chunk of
    /// the overflow list once the static buffer drained.
    pub reply_sent: usize,
    /// Overflow reply chunks, oldest first.
    pub reply_list: VecDeque<Buffer>,
    /// Bytes currently queued in the overflow list.
    pub reply_list_bytes: usize,
    /// Total bytes ever queued for this client.
    pub total_replied: u64,
}

impl Client {
    pub fn new(conn: Conn, token: usize) -> Self {
        let name = conn.peer_name();
        Self {
            conn,
            token,
            name,
            flags: ClientFlags::empty(),
            db: 0,
            query: Buffer::new(),
            parser: Parser::default(),
            argv: Vec::new(),
            reply_buf: Box::new([0; REPLY_BUF_SIZE]),
            reply_buf_len: 0,
            reply_sent: 0,
            reply_list: VecDeque::new(),
            reply_list_bytes: 0,
            total_replied: 0,
        }
    }

    pub fn has_pending_replies(&self) -> bool {
        self.reply_buf_len > 0 || !self.reply_list.is_empty()
    }

    /// Queue reply bytes: the static buffer while it suffices, the overflow
    /// list after that. Consecutive small replies coalesce into the list
    /// tail up to the chunk bound.
    pub fn add_reply(&mut self, data: &[u8]) {
        if self.flags.contains(ClientFlags::CLOSE_AFTER_REPLY) {
            return;
        }
        self.total_replied += data.len() as u64;

        if self.reply_list.is_empty() && self.reply_buf_len + data.len() <= REPLY_BUF_SIZE {
            self.reply_buf[self.reply_buf_len..self.reply_buf_len + data.len()]
                .copy_from_slice(data);
            self.reply_buf_len += data.len();
            return;
        }

        self.reply_list_bytes += data.len();
        if let Some(tail) = self.reply_list.back_mut() {
            if tail.len() + data.len() <= REPLY_BUF_SIZE {
                tail.extend_from_slice(data);
                return;
            }
        }
        let mut chunk = Buffer::with_capacity(data.len().max(1024));
        chunk.extend_from_slice(data);
        self.reply_list.push_back(chunk);
    }

    /// Drop the executed request's argv, ready for the next pipelined one.
    pub fn reset(&mut self) {
        self.argv.clear();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("query_len", &self.query.len())
            .field("pending", &self.has_pending_replies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use mio::net::TcpStream;

    use super::{Client, ClientFlags, Conn};
    use crate::protocol::REPLY_BUF_SIZE;

    fn test_client() -> (Client, std::net::TcpListener) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        let client = Client::new(Conn::Tcp(TcpStream::from_std(stream)), 5);
        (client, listener)
    }

    #[test]
    fn small_replies_use_the_static_buffer() {
        let (mut client, _listener) = test_client();
        assert!(!client.has_pending_replies());

        client.add_reply(b"+OK\r\n");
        client.add_reply(b":1\r\n");
        assert!(client.has_pending_replies());
        assert_eq!(client.reply_buf_len, 9);
        assert!(client.reply_list.is_empty());
        assert_eq!(&client.reply_buf[..9], b"+OK\r\n:1\r\n");
        assert_eq!(client.total_replied, 9);
    }

    #[test]
    fn overflow_spills_to_the_list_and_coalesces() {
        let (mut client, _listener) = test_client();
        let big = vec![b'x'; REPLY_BUF_SIZE];
        client.add_reply(&big);
        assert_eq!(client.reply_buf_len, REPLY_BUF_SIZE);

        // The static buffer is full: the next replies go to the list.
        client.add_reply(b"abc");
        client.add_reply(b"def");
        assert_eq!(client.reply_list.len(), 1);
        assert_eq!(&client.reply_list[0][..], b"abcdef");

        // A chunk never grows past the bound; a new one is started.
        let huge = vec![b'y'; REPLY_BUF_SIZE];
        client.add_reply(&huge);
        assert_eq!(client.reply_list.len(), 2);
        assert_eq!(client.reply_list_bytes, 6 + REPLY_BUF_SIZE);
    }

    #[test]
    fn replies_after_close_flag_are_dropped() {
        let (mut client, _listener) = test_client();
        client.flags |= ClientFlags::CLOSE_AFTER_REPLY;
        client.add_reply(b"+OK\r\n");
        assert!(!client.has_pending_replies());
        assert_eq!(client.total_replied, 0);
    }
}
