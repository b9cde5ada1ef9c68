//! Plain string commands and generic keyspace commands.

use super::{send, Reply};
use crate::{
    object::{StrObject, Value},
    protocol::shared,
    server::Server,
};

/// `get key` — bulk value, null on miss, error on non-string values.
pub fn get(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Str(s)) => Reply::Bulk(s.clone()),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `set key value` — always `+OK`; the value is integer-encoded when it
/// parses as a canonical integer.
pub fn set(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(value) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);

    // With lazy deletes configured the displaced value goes through the
    // async path; a plain overwrite would always free it inline.
    if srv.config.lazyfree_server_del {
        match srv.workers.as_ref() {
            Some(workers) => srv.dbs[dbi].del_async(&key, workers),
            None => srv.dbs[dbi].del_sync(&key),
        };
    }

    let encoded = StrObject::try_encode(&value);
    srv.dbs[dbi].set_key(&key, Value::Str(encoded));
    srv.reply(id, shared::OK);
}

/// `del key` — :1 when the key existed.
pub fn del(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let deleted = match (srv.config.lazyfree_server_del, srv.workers.as_ref()) {
        (true, Some(workers)) => srv.dbs[dbi].del_async(&key, workers),
        _ => srv.dbs[dbi].del_sync(&key),
    };
    send(srv, id, Reply::Int(i64::from(deleted)));
}

/// `exists key` — :1/:0.
pub fn exists(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let found = srv.dbs[dbi].contains(&key);
    send(srv, id, Reply::Int(i64::from(found)));
}

/// `len` — number of keys in the selected database.
pub fn len(srv: &mut Server, id: usize) {
    let dbi = srv.client_db(id);
    let count = srv.dbs[dbi].len() as i64;
    send(srv, id, Reply::Int(count));
}

/// `type key` — `+string`/`+trie`/`+none`/`+unknown`.
pub fn type_of(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let name = srv.dbs[dbi]
        .lookup(&key)
        .map_or("none", Value::type_name);
    send(srv, id, Reply::Status(name));
}
