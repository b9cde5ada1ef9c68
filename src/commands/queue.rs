//! Priority-queue commands: a min-heap of scored string values.

use super::{send, Reply};
use crate::{
    object::{QueueItem, StrObject, Value},
    server::Server,
};

/// `qpush queue score value` — enqueue with a double score, `+OK`.
pub fn qpush(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(score_arg) = srv.arg(id, 2) else { return };
    let Some(value) = srv.arg(id, 3) else { return };
    let Some(score) = score_arg.to_f64() else {
        srv.reply_error(id, "value is not a valid float");
        return;
    };
    let dbi = srv.client_db(id);

    let db = &mut srv.dbs[dbi];
    if db.lookup(&key).is_none() {
        db.set_key(&key, Value::new_queue());
    }
    let reply = match db.lookup_mut(&key) {
        Some(Value::Queue(heap)) => {
            heap.push(QueueItem {
                score,
                value: StrObject::try_encode(&value),
            });
            Reply::Ok
        }
        _ => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `qpop queue` — bulk lowest-scored value or null.
pub fn qpop(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup_mut(&key) {
        None => Reply::Null,
        Some(Value::Queue(heap)) => match heap.pop() {
            Some(item) => Reply::Bulk(item.value),
            None => Reply::Null,
        },
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `qpopn queue n` — multi-bulk of up to `n` values in score order.
pub fn qpopn(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let Some(count_arg) = srv.arg(id, 2) else { return };
    let Some(count) = count_arg.to_i64() else {
        srv.reply_error(id, "value is not an integer or out of range");
        return;
    };
    if count < 0 {
        srv.reply_error(id, "invalid non-negative integer");
        return;
    }
    let dbi = srv.client_db(id);

    let popped = match srv.dbs[dbi].lookup_mut(&key) {
        None => {
            send(srv, id, Reply::Null);
            return;
        }
        Some(Value::Queue(heap)) => {
            let take = (count as usize).min(heap.len());
            let mut popped = Vec::with_capacity(take);
            for _ in 0..take {
                match heap.pop() {
                    Some(item) => popped.push(item.value),
                    None => break,
                }
            }
            popped
        }
        Some(_) => {
            send(srv, id, Reply::WrongType);
            return;
        }
    };

    srv.reply_multibulk_len(id, popped.len());
    for value in &popped {
        srv.reply_bulk_obj(id, value);
    }
}

/// `qpeek queue` — bulk lowest-scored value without removing it.
pub fn qpeek(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Queue(heap)) => match heap.peek() {
            Some(item) => Reply::Bulk(item.value.clone()),
            None => Reply::Null,
        },
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}

/// `qlen queue` — :N.
pub fn qlen(srv: &mut Server, id: usize) {
    let Some(key) = srv.arg(id, 1) else { return };
    let dbi = srv.client_db(id);
    let reply = match srv.dbs[dbi].lookup(&key) {
        None => Reply::Null,
        Some(Value::Queue(heap)) => Reply::Int(heap.len() as i64),
        Some(_) => Reply::WrongType,
    };
    send(srv, id, reply);
}
