//! The command table and dispatcher.
//!
//! The table is compiled once at startup into a dictionary keyed by the
//! lowercased command name. Dispatch resolves the first argument, checks
//! arity, times the handler and keeps per-command call statistics. `quit`
//! short-circuits before the table: it replies and flags the connection to
//! close once the reply is flushed.

mod admin;
mod fts;
mod map;
mod queue;
mod string;

use std::time::Instant;

use bitflags::bitflags;

use crate::{
    client::ClientFlags,
    dict::Dict,
    object::RStr,
    protocol::shared,
    server::Server,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        const WRITE = 1;
        const READONLY = 1 << 1;
        const DENY_OOM = 1 << 2;
        const ADMIN = 1 << 3;
        const FAST = 1 << 4;
    }
}

pub type CommandHandler = fn(&mut Server, usize);

/// Static description of one command.
pub struct CommandSpec {
    pub name: &'static str,
    pub handler: CommandHandler,
    /// Positive: exact argument count. Negative: at least `|arity|`.
    pub arity: i32,
    pub flags: CommandFlags,
    pub first_key: u8,
    pub last_key: u8,
    pub key_step: u8,
}

/// A table entry: the spec plus its runtime call statistics.
pub struct CommandEntry {
    pub spec: &'static CommandSpec,
    pub calls: u64,
    pub microseconds: u64,
}

const W: CommandFlags = CommandFlags::WRITE;
const R: CommandFlags = CommandFlags::READONLY;
const F: CommandFlags = CommandFlags::FAST;
const A: CommandFlags = CommandFlags::ADMIN;
const M: CommandFlags = CommandFlags::DENY_OOM;

#[rustfmt::skip]
static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "ping",     handler: admin::ping,      arity: -1, flags: F,          first_key: 0, last_key: 0, key_step: 0 },
    CommandSpec { name: "echo",     handler: admin::echo,      arity:  2, flags: F,          first_key: 0, last_key: 0, key_step: 0 },
    CommandSpec { name: "info",     handler: admin::info,      arity:  1, flags: A,          first_key: 0, last_key: 0, key_step: 0 },
    CommandSpec { name: "shutdown", handler: admin::shutdown,  arity: -1, flags: A,          first_key: 0, last_key: 0, key_step: 0 },

    CommandSpec { name: "type",     handler: string::type_of,  arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "get",      handler: string::get,      arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "set",      handler: string::set,      arity:  3, flags: W.union(M), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "del",      handler: string::del,      arity:  2, flags: W,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "exists",   handler: string::exists,   arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "len",      handler: string::len,      arity:  1, flags: R.union(F), first_key: 0, last_key: 0, key_step: 0 },

    CommandSpec { name: "rget",     handler: map::rget,        arity:  3, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rset",     handler: map::rset,        arity:  4, flags: W.union(M), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rdel",     handler: map::rdel,        arity:  3, flags: W,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rlen",     handler: map::rlen,        arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rexists",  handler: map::rexists,     arity:  3, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rkeys",    handler: map::rkeys,       arity:  2, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rvalues",  handler: map::rvalues,     arity:  2, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rgetall",  handler: map::rgetall,     arity:  2, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "rpget",    handler: map::rpget,       arity:  3, flags: R,          first_key: 1, last_key: 1, key_step: 1 },

    CommandSpec { name: "qpush",    handler: queue::qpush,     arity:  4, flags: W.union(M), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "qpop",     handler: queue::qpop,      arity:  2, flags: W.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "qpopn",    handler: queue::qpopn,     arity:  3, flags: W,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "qpeek",    handler: queue::qpeek,     arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "qlen",     handler: queue::qlen,      arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },

    CommandSpec { name: "dset",     handler: fts::dset,        arity:  4, flags: W.union(M), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "dget",     handler: fts::dget,        arity:  3, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "dsearch",  handler: fts::dsearch,     arity:  3, flags: R,          first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "dlen",     handler: fts::dlen,        arity:  2, flags: R.union(F), first_key: 1, last_key: 1, key_step: 1 },
    CommandSpec { name: "ddel",     handler: fts::ddel,        arity:  3, flags: W,          first_key: 1, last_key: 1, key_step: 1 },
];

/// The command dictionary, keyed by lowercase name.
pub struct CommandTable {
    entries: Dict<CommandEntry>,
}

impl CommandTable {
    #[must_use]
    pub fn new() -> Self {
        let mut entries = Dict::new();
        for spec in COMMANDS {
            entries.insert(
                spec.name.as_bytes(),
                CommandEntry {
                    spec,
                    calls: 0,
                    microseconds: 0,
                },
            );
        }
        Self { entries }
    }

    pub fn get(&self, name: &[u8]) -> Option<&CommandEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &[u8]) -> Option<&mut CommandEntry> {
        self.entries.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A command outcome, queued through the reply pipeline.
pub(crate) enum Reply {
    Ok,
    Null,
    WrongType,
    Status(&'static str),
    Int(i64),
    Bulk(RStr),
}

pub(crate) fn send(srv: &mut Server, id: usize, reply: Reply) {
    match reply {
        Reply::Ok => srv.reply(id, shared::OK),
        Reply::Null => srv.reply(id, shared::NULLBULK),
        Reply::WrongType => srv.reply(id, shared::WRONGTYPEERR),
        Reply::Status(status) => srv.reply_status(id, status),
        Reply::Int(value) => srv.reply_integer(id, value),
        Reply::Bulk(obj) => srv.reply_bulk_obj(id, &obj),
    }
}

impl Server {
    pub fn arg(&self, id: usize, idx: usize) -> Option<RStr> {
        self.clients.get(id)?.as_ref()?.argv.get(idx).cloned()
    }

    pub fn argc(&self, id: usize) -> usize {
        self.clients
            .get(id)
            .and_then(Option::as_ref)
            .map_or(0, |c| c.argv.len())
    }

    pub fn client_db(&self, id: usize) -> usize {
        self.clients
            .get(id)
            .and_then(Option::as_ref)
            .map_or(0, |c| c.db)
    }

    fn reset_client(&mut self, id: usize) {
        if let Some(client) = self.client_mut(id) {
            client.reset();
        }
    }

    /// Look up and execute the command held in the client's argv, then
    /// reset the client for the next pipelined request.
    pub fn process_command(&mut self, id: usize) {
        self.commands_processed += 1;

        let Some(name_arg) = self.arg(id, 0) else {
            self.reset_client(id);
            return;
        };
        let name = name_arg.as_bytes().to_ascii_lowercase();

        if name == b"quit" {
            self.reply(id, shared::OK);
            if let Some(client) = self.client_mut(id) {
                client.flags |= ClientFlags::CLOSE_AFTER_REPLY;
            }
            self.reset_client(id);
            return;
        }

        let Some(entry) = self.commands.get(&name) else {
            let shown = String::from_utf8_lossy(&name_arg.as_bytes()).into_owned();
            self.reply_error(id, &format!("unknown command '{shown}'"));
            self.reset_client(id);
            return;
        };
        let spec = entry.spec;

        let argc = self.argc(id) as i32;
        if (spec.arity > 0 && argc != spec.arity) || argc < spec.arity.abs() {
            self.reply_error(
                id,
                &format!("wrong number of arguments for '{}' command", spec.name),
            );
            self.reset_client(id);
            return;
        }

        let started = Instant::now();
        (spec.handler)(self, id);
        let elapsed = started.elapsed().as_micros() as u64;
        if let Some(entry) = self.commands.get_mut(&name) {
            entry.calls += 1;
            entry.microseconds += elapsed;
        }

        self.reset_client(id);
    }
}

#[cfg(test)]
mod tests {
    use super::CommandTable;

    #[test]
    fn table_resolves_known_commands() {
        let table = CommandTable::new();
        assert!(table.get(b"get").is_some());
        assert!(table.get(b"dsearch").is_some());
        assert!(table.get(b"nope").is_none());
        // Lookups are by exact lowercase name; dispatch lowercases first.
        assert!(table.get(b"GET").is_none());
        assert_eq!(table.len(), 29);
    }

    #[test]
    fn arity_signs() {
        let table = CommandTable::new();
        assert_eq!(table.get(b"ping").unwrap().spec.arity, -1);
        assert_eq!(table.get(b"set").unwrap().spec.arity, 3);
        assert_eq!(table.get(b"qpopn").unwrap().spec.arity, 3);
    }
}
