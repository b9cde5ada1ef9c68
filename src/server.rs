//! Server state, connection admission, the cron timer and the main loop.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use mio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use crate::{
    bgtask::BgWorkers,
    client::{Client, ClientFlags, Conn},
    commands::CommandTable,
    config::Config,
    db::Db,
    event::{EventLoop, EventMask},
    memory::used_memory,
    net,
    protocol::{shared, QUERY_BUF_MAX, READ_CHUNK},
};

const MAX_ACCEPTS_PER_CALL: usize = 1000;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("network setup failed")]
    Net(#[from] net::NetError),
    #[error("event loop failure")]
    Event(#[from] crate::event::EventError),
    #[error("I/O related error")]
    Io(#[from] std::io::Error),
    #[error("listener fd {fd} does not fit an event loop of size {size}")]
    ListenerOutOfRange { fd: usize, size: usize },
}

pub struct Server {
    pub config: Config,
    pub el: EventLoop,

    listener: Option<TcpListener>,
    listener_token: Option<usize>,
    unix_listener: Option<UnixListener>,
    unix_token: Option<usize>,

    /// Connected clients, indexed by fd/token.
    pub clients: Vec<Option<Client>>,
    pub clients_count: usize,
    /// Clients with queued output, drained by the before-poll hook.
    pub pending_writes: Vec<usize>,
    /// Clients scheduled for release on the next cron tick.
    pub close_asap: Vec<usize>,

    pub dbs: Vec<Db>,
    pub commands: CommandTable,
    pub workers: Option<BgWorkers>,

    shutdown_requested: Arc<AtomicBool>,
    pidfile_written: bool,

    pub served: u64,
    pub rejected: u64,
    pub commands_processed: u64,
    pub cronloops: u64,
    pub used_memory_snapshot: usize,
    start: Instant,
}

impl Server {
    /// Build the full server state and bind the listeners. Nothing is
    /// accepted until [`Server::run`].
    pub fn new(config: Config, shutdown_requested: Arc<AtomicBool>) -> Result<Self> {
        let size = config.max_clients + crate::config::RESERVED_FDS;
        let el = EventLoop::new(size)?;

        let listener = net::tcp_listener(config.bind.as_deref(), config.port, config.tcp_backlog)?;
        let unix_listener = match &config.unix_domain_socket {
            Some(path) => Some(net::unix_listener(path, config.unix_domain_perm)?),
            None => None,
        };

        let dbs = (0..config.max_dbs).map(Db::new).collect();

        let mut server = Self {
            el,
            listener: Some(listener),
            listener_token: None,
            unix_listener,
            unix_token: None,
            clients: std::iter::repeat_with(|| None).take(size).collect(),
            clients_count: 0,
            pending_writes: Vec::new(),
            close_asap: Vec::new(),
            dbs,
            commands: CommandTable::new(),
            workers: Some(BgWorkers::start()?),
            shutdown_requested,
            pidfile_written: false,
            served: 0,
            rejected: 0,
            commands_processed: 0,
            cronloops: 0,
            used_memory_snapshot: 0,
            start: Instant::now(),
            config,
        };
        server.register_listeners()?;
        Ok(server)
    }

    fn register_listeners(&mut self) -> Result<()> {
        use std::os::fd::AsRawFd;

        if let Some(listener) = self.listener.as_mut() {
            let token = listener.as_raw_fd() as usize;
            self.el
                .add_event(listener, token, EventMask::READ)
                .map_err(|_| ServerError::ListenerOutOfRange {
                    fd: token,
                    size: self.el.size(),
                })?;
            self.listener_token = Some(token);
        }
        if let Some(listener) = self.unix_listener.as_mut() {
            let token = listener.as_raw_fd() as usize;
            self.el
                .add_event(listener, token, EventMask::READ)
                .map_err(|_| ServerError::ListenerOutOfRange {
                    fd: token,
                    size: self.el.size(),
                })?;
            self.unix_token = Some(token);
        }
        Ok(())
    }

    /// Address of the TCP listener (useful with `port = 0`).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn client_mut(&mut self, id: usize) -> Option<&mut Client> {
        self.clients.get_mut(id).and_then(Option::as_mut)
    }

    pub fn write_pidfile(&mut self) {
        let path = &self.config.pidfile;
        match std::fs::write(path, format!("{}\n", std::process::id())) {
            Ok(()) => self.pidfile_written = true,
            Err(err) => warn!(path = %path.display(), "can't write pidfile: {err}"),
        }
    }

    /// The main loop: one [`Server::run_once`] iteration until stopped.
    pub fn run(&mut self) -> Result<()> {
        let period = self.cron_period_ms();
        self.el.add_timer(period, server_cron);

        while !self.el.stopped() {
            self.run_once()?;
        }
        Ok(())
    }

    /// A single reactor iteration: drain pending writes, poll with the
    /// timer-derived timeout, dispatch reads before writes, then run due
    /// timers.
    pub fn run_once(&mut self) -> Result<()> {
        self.handle_pending_writes();

        let timeout = self.el.next_timeout();
        self.el.poll(timeout)?;

        for fired in self.el.take_fired() {
            if Some(fired.token) == self.listener_token {
                if fired.readable {
                    self.accept_tcp();
                }
                continue;
            }
            if Some(fired.token) == self.unix_token {
                if fired.readable {
                    self.accept_unix();
                }
                continue;
            }

            // An earlier callback may have freed this client; the mask
            // check keeps stale events from resurrecting it.
            if fired.readable && self.el.interest(fired.token).contains(EventMask::READ) {
                self.read_from_client(fired.token);
            }
            if fired.writable && self.el.interest(fired.token).contains(EventMask::WRITE) {
                self.write_to_client(fired.token, true);
            }
        }

        while let Some(timer) = self.el.pop_due_timer() {
            EventLoop::run_timer(self, timer);
        }
        Ok(())
    }

    fn cron_period_ms(&self) -> u64 {
        (1000 / u64::from(self.config.cron_frequency.max(1))).max(1)
    }

    fn accept_tcp(&mut self) {
        for _ in 0..MAX_ACCEPTS_PER_CALL {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = net::set_client_options(&stream) {
                        debug!("can't set client socket options: {err}");
                    }
                    self.admit(Conn::Tcp(stream));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("accepting client connection: {err}");
                    return;
                }
            }
        }
        // Accept cap reached with a possibly non-empty backlog; re-arm the
        // edge-triggered registration so the rest is picked up next tick.
        if let (Some(listener), Some(token)) = (self.listener.as_mut(), self.listener_token) {
            self.el.rearm(listener, token);
        }
    }

    fn accept_unix(&mut self) {
        for _ in 0..MAX_ACCEPTS_PER_CALL {
            let Some(listener) = self.unix_listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, _)) => self.admit(Conn::Unix(stream)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("accepting client connection: {err}");
                    return;
                }
            }
        }
        if let (Some(listener), Some(token)) = (self.unix_listener.as_mut(), self.unix_token) {
            self.el.rearm(listener, token);
        }
    }

    fn admit(&mut self, mut conn: Conn) {
        if self.clients_count >= self.config.max_clients {
            // Best effort: the peer may never see this if the buffer is full.
            let _ = conn.write(shared::MAXCLIENTSERR);
            self.rejected += 1;
            return;
        }

        let token = conn.raw_fd() as usize;
        if let Err(err) = self.el.add_event(&mut conn, token, EventMask::READ) {
            warn!("can't register client connection: {err}");
            self.rejected += 1;
            return;
        }

        let client = Client::new(conn, token);
        debug!(client = %client.name, "accepted connection");
        match self.clients.get_mut(token) {
            Some(slot) => {
                *slot = Some(client);
                self.served += 1;
                self.clients_count += 1;
            }
            None => {
                // add_event bounds tokens by the loop size, which equals the
                // client table size; a mismatch is a bug worth hearing about.
                error!(token, "client token out of table bounds, dropping");
                self.rejected += 1;
            }
        }
    }

    /// Drain the socket into the query buffer, then run the pipelined
    /// requests. Readiness is edge-triggered, so reading must continue
    /// until the kernel reports `WouldBlock`; a lone fixed-size read would
    /// strand whatever is left in the socket buffer.
    fn read_from_client(&mut self, id: usize) {
        let mut eof = false;
        loop {
            let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
                return;
            };
            let old_len = client.query.len();
            client.query.resize(old_len + READ_CHUNK);
            let read = client.conn.read(&mut client.query[old_len..]);
            match read {
                Ok(0) => {
                    client.query.truncate(old_len);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    client.query.truncate(old_len + n);
                    if client.query.len() > QUERY_BUF_MAX {
                        warn!(
                            client = %client.name,
                            "closing client that reached max query buffer length"
                        );
                        self.free_client(id);
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    client.query.truncate(old_len);
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    client.query.truncate(old_len);
                }
                Err(err) => {
                    client.query.truncate(old_len);
                    error!(client = %client.name, "error reading from client: {err}");
                    self.free_client(id);
                    return;
                }
            }
        }

        self.process_input(id);

        if eof {
            let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
                return;
            };
            debug!(client = %client.name, "client closed connection");
            if client.has_pending_replies() {
                // Data and EOF arrived in one readiness burst: flush the
                // replies for what was processed, then close.
                client.flags |= ClientFlags::CLOSE_AFTER_REPLY;
            } else {
                self.free_client(id);
            }
        }
    }

    /// Run every complete pipelined request sitting in the query buffer.
    fn process_input(&mut self, id: usize) {
        loop {
            let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
                return;
            };
            if client
                .flags
                .intersects(ClientFlags::CLOSE_AFTER_REPLY | ClientFlags::CLOSE_ASAP)
            {
                return;
            }
            if client.query.is_empty() {
                return;
            }

            match client.parser.parse(&mut client.query) {
                Ok(None) => return,
                Ok(Some(argv)) => {
                    if argv.is_empty() {
                        continue;
                    }
                    client.argv = argv;
                    self.process_command(id);
                }
                Err(err) => {
                    self.reply_error(id, &err.to_string());
                    if let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) {
                        client.flags |= ClientFlags::CLOSE_AFTER_REPLY;
                    }
                    return;
                }
            }
        }
    }

    /// Immediately release a client: unregister, close, unlink.
    pub fn free_client(&mut self, id: usize) {
        let Some(mut client) = self.clients.get_mut(id).and_then(Option::take) else {
            return;
        };
        self.el
            .del_event(&mut client.conn, id, EventMask::READ | EventMask::WRITE);
        self.clients_count -= 1;
        self.pending_writes.retain(|pending| *pending != id);
        self.close_asap.retain(|pending| *pending != id);
        debug!(client = %client.name, "connection released");
    }

    /// Schedule a client for release on the next cron tick.
    pub fn free_client_async(&mut self, id: usize) {
        let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
            return;
        };
        if !client.flags.contains(ClientFlags::CLOSE_ASAP) {
            client.flags |= ClientFlags::CLOSE_ASAP;
            self.close_asap.push(id);
        }
    }

    /// Orderly teardown: flush what can be flushed, close the listeners,
    /// drop the pidfile and stop the workers.
    pub fn prepare_shutdown(&mut self) {
        self.handle_pending_writes();

        if let Some(mut listener) = self.listener.take() {
            if let Some(token) = self.listener_token.take() {
                self.el
                    .del_event(&mut listener, token, EventMask::READ | EventMask::WRITE);
            }
        }
        if let Some(mut listener) = self.unix_listener.take() {
            if let Some(token) = self.unix_token.take() {
                self.el
                    .del_event(&mut listener, token, EventMask::READ | EventMask::WRITE);
            }
            if let Some(path) = &self.config.unix_domain_socket {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), "can't remove unix socket: {err}");
                }
            }
        }

        if self.pidfile_written {
            if let Err(err) = std::fs::remove_file(&self.config.pidfile) {
                warn!(path = %self.config.pidfile.display(), "can't remove pidfile: {err}");
            }
            self.pidfile_written = false;
        }

        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        info!("server shut down cleanly");
    }

    /// Human-readable server/memory snapshot for the `info` command.
    pub fn info(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = write!(
            out,
            "# Server\r\n\
             version:{}\r\n\
             process_id:{}\r\n\
             uptime_in_seconds:{}\r\n\
             hz:{}\r\n\
             cronloops:{}\r\n\
             \r\n\
             # Clients\r\n\
             connected_clients:{}\r\n\
             served_clients:{}\r\n\
             rejected_clients:{}\r\n\
             \r\n\
             # Memory\r\n\
             used_memory:{}\r\n\
             used_memory_human:{}\r\n\
             max_memory:{}\r\n\
             \r\n\
             # Stats\r\n\
             total_commands_processed:{}\r\n\
             lazyfree_pending_tasks:{}\r\n\
             lazyfree_processed_tasks:{}\r\n",
            env!("CARGO_PKG_VERSION"),
            std::process::id(),
            self.start.elapsed().as_secs(),
            self.config.cron_frequency,
            self.cronloops,
            self.clients_count,
            self.served,
            self.rejected,
            used_memory(),
            crate::memory::human_bytes(used_memory()),
            self.config.max_memory,
            self.commands_processed,
            self.workers.as_ref().map_or(0, BgWorkers::pending),
            self.workers.as_ref().map_or(0, BgWorkers::processed),
        );

        let _ = write!(out, "\r\n# Keyspace\r\n");
        for db in &self.dbs {
            if !db.is_empty() {
                let _ = write!(out, "db{}:keys={}\r\n", db.id, db.len());
            }
        }
        out
    }
}

/// The periodic housekeeping timer: honor the shutdown flag, release
/// async-closed clients, refresh the memory snapshot.
pub fn server_cron(server: &mut Server) -> i64 {
    server.cronloops += 1;

    if server.shutdown_requested.load(Ordering::Relaxed) {
        info!("received shutdown request, exiting");
        server.prepare_shutdown();
        server.el.stop();
        return 0;
    }

    let scheduled = std::mem::take(&mut server.close_asap);
    for id in scheduled {
        server.free_client(id);
    }

    server.used_memory_snapshot = used_memory();

    server.cron_period_ms() as i64
}
