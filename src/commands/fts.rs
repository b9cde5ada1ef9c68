//! Full-text search commands.

use super::{send, Reply};
use crate::{
    object::{StrObject, Value},
    server::Server,
};

/// `dset index title document` — add (or replace) a document, `+OK`.
pub fn dset(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(title) = srv.arg(id, 2) else { return };
    let Some(body) = srv.arg(id, 3) else { return };
    let dbi = srv.client_db(id);

    let db = &mut srv.dbs[dbi];
    if db.lookup(&key).is_none() {
        db.set_key(&key, Value::new_fts());
    }
    let reply = match db.lookup_mut(&key) {
        Some(Value::Fts(fts)) => {
            fts.add(&StrObject::try_encode(&title), &body);
            Reply::Ok
        }
        _ => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `dget index title` — bulk document body or null.
pub fn dget(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(title) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Fts(fts)) => match fts.get(&title) {
            Some(doc) => Reply::Bulk(doc.body.clone()),
            None => Reply::Null,
        },
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `dsearch index query` — multi-bulk of interleaved title, body pairs in
/// descending BM25 score order.
pub fn dsearch(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(query) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);

    let hits = match srv.dbs[dbi].lookup(&key) {
        None => {
            send(srv, id, Reply::Null);
            return;
        }
        Some(Value::Fts(fts)) => fts.search(&query.as_bytes()),
        Some(_) => {
            send(srv, id, Reply::WrongType);
            return;
        }
    };

    srv.reply_multibulk_len(id, hits.len() * 2);
    for hit in hits {
        srv.reply_bulk_obj(id, &hit.title);
        srv.reply_bulk_obj(id, &hit.body);
    }
}

/// `dlen index` — :N documents.
pub fn dlen(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Fts(fts)) => Reply::Int(fts.len() as i64),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `ddel index title` — :1/:0.
pub fn ddel(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(title) = srv.arg(id, 2) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup_mut(&key) {
        None => Reply::Null,
        Some(Value::Fts(fts)) => Reply::Int(i64::from(fts.del(&title))),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}
