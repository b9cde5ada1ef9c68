//! Prefix-map (crit-bit dictionary) commands.
//!
//! A missing top-level key replies null bulk; a key of another type replies
//! the wrong-type error; field misses reply the command's own miss value.

use super::{send, Reply};
use crate::{
    object::{RStr, StrObject, Value},
    server::Server,
};

/// Which half of each entry an enumeration emits.
#[derive(Clone, Copy)]
enum Fields {
    Keys,
    Values,
    Both,
}

/// `rget map field` — bulk value or null.
pub fn rget(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(field) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Map(map)) => match map.get(&field.as_bytes()) {
            Some(value) => Reply::Bulk(value.clone()),
            None => Reply::Null,
        },
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `rset map field value` — create the map on demand, `+OK`.
pub fn rset(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(field) = srv.arg(id, 2) else { return };
    let Some(value) = srv.arg(id, 3) else { return };
    let dbi = srv.client_db(id);

    let db = &mut srv.dbs[dbi];
    if db.lookup(&key).is_none() {
        db.set_key(&key, Value::new_map());
    }
    let reply = match db.lookup_mut(&key) {
        Some(Value::Map(map)) => {
            map.insert(&field.as_bytes(), StrObject::try_encode(&value));
            Reply::Ok
        }
        _ => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `rdel map field` — :1/:0.
pub fn rdel(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(field) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup_mut(&key) {
        None => Reply::Null,
        Some(Value::Map(map)) => Reply::Int(i64::from(map.remove(&field.as_bytes()).is_some())),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `rlen map` — :N.
pub fn rlen(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Map(map)) => Reply::Int(map.len() as i64),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `rexists map field` — :1/:0.
pub fn rexists(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(field) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Map(map)) => Reply::Int(i64::from(map.contains_key(&field.as_bytes()))),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

pub fn rkeys(srv: &mut Server, id: usize) {
    enumerate(srv, id, None, Fields::Keys);
}

pub fn rvalues(srv: &mut Server, id: usize) {
    enumerate(srv, id, None, Fields::Values);
}

/// `rgetall map` — multi-bulk of interleaved field, value pairs.
pub fn rgetall(srv: &mut Server, id: usize) {
    enumerate(srv, id, None, Fields::Both);
}

/// `rpget map prefix` — like `rgetall`, restricted to fields starting with
/// the prefix, in lexicographic field order.
pub fn rpget(srv: &mut Server, id: usize) {
    let Some(prefix) = srv.arg(id, 2) else { return };
    enumerate(srv, id, Some(prefix), Fields::Both);
}

fn enumerate(srv: &mut Server, id: usize, prefix: Option<RStr>, fields: Fields) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);

    let entries: Vec<(Vec<u8>, RStr)> = match srv.dbs[dbi].lookup(&key) {
        None => {
            send(srv, id, Reply::Null);
            return;
        }
        Some(Value::Map(map)) => {
            let collect = |iter: crate::dict::Iter<'_, RStr>| -> Vec<(Vec<u8>, RStr)> {
                iter.map(|(k, v)| (k.to_vec(), v.clone())).collect()
            };
            match &prefix {
                Some(p) => collect(map.prefix_iter(&p.as_bytes())),
                None => collect(map.iter()),
            }
        }
        Some(_) => {
            send(srv, id, Reply::WrongType);
            return;
        }
    };

    let per_entry = match fields {
        Fields::Keys | Fields::Values => 1,
        Fields::Both => 2,
    };
    srv.reply_multibulk_len(id, entries.len() * per_entry);
    for (field, value) in &entries {
        if matches!(fields, Fields::Keys | Fields::Both) {
            srv.reply_bulk(id, field);
        }
        if matches!(fields, Fields::Values | Fields::Both) {
            srv.reply_bulk_obj(id, value);
        }
    }
}
