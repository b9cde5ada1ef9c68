//! Administrative commands.

use tracing::info;

use crate::{protocol::shared, server::Server};

/// `ping [message]` — `+PONG`, or a bulk echo of the message.
pub fn ping(srv: &mut Server, id: usize) {
    match srv.argc(id) {
        1 => srv.reply(id, shared::PONG),
        2 => {
            if let Some(msg) = srv.arg(id, 1) {
                srv.reply_bulk_obj(id, &msg);
            }
        }
        _ => srv.reply_error(id, "wrong number of arguments for 'ping' command"),
    }
}

/// `echo message` — bulk echo.
pub fn echo(srv: &mut Server, id: usize) {
    if let Some(msg) = srv.arg(id, 1) {
        srv.reply_bulk_obj(id, &msg);
    }
}

/// `info` — server/memory stats as one bulk string.
pub fn info(srv: &mut Server, id: usize) {
    let text = srv.info();
    srv.reply_bulk(id, text.as_bytes());
}

/// `shutdown` — orderly teardown, then exit 0.
pub fn shutdown(srv: &mut Server, _id: usize) {
    info!("shutdown requested by client");
    srv.prepare_shutdown();
    std::process::exit(0);
}
