//! Reply queueing and the deferred write path.
//!
//! Handlers never write to a socket directly. Output lands in the client's
//! static buffer (or its overflow list), the client is linked into the
//! pending-writes list, and the before-poll hook tries a direct write for
//! each linked client, avoiding a poll round trip for the common case. A
//! write handler is installed only when a socket cannot take the whole
//! backlog at once.

use std::io::{ErrorKind, Write};

use tracing::error;

use crate::{
    client::ClientFlags,
    event::EventMask,
    memory::used_memory,
    object::RStr,
    protocol::{self, shared, WRITE_MAX_PER_EVENT},
    server::Server,
};

impl Server {
    /// Flag the client for deferred writing. Returns false when the client
    /// is gone and the reply should be discarded.
    fn prepare_client_to_write(&mut self, id: usize) -> bool {
        let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        if !client.has_pending_replies() && !client.flags.contains(ClientFlags::PENDING_WRITE) {
            client.flags |= ClientFlags::PENDING_WRITE;
            self.pending_writes.push(id);
        }
        true
    }

    /// Queue raw, already-framed reply bytes.
    pub fn reply(&mut self, id: usize, data: &[u8]) {
        if !self.prepare_client_to_write(id) {
            return;
        }
        if let Some(client) = self.client_mut(id) {
            client.add_reply(data);
        }
    }

    pub fn reply_status(&mut self, id: usize, status: &str) {
        self.reply(id, format!("+{status}\r\n").as_bytes());
    }

    /// `-ERR <msg>`; newlines in the message would corrupt the framing and
    /// are flattened to spaces.
    pub fn reply_error(&mut self, id: usize, msg: &str) {
        let sanitized = msg.replace(['\r', '\n'], " ");
        self.reply(id, format!("-ERR {sanitized}\r\n").as_bytes());
    }

    pub fn reply_integer(&mut self, id: usize, value: i64) {
        match value {
            0 => self.reply(id, shared::CZERO),
            1 => self.reply(id, shared::CONE),
            _ => self.reply(id, format!(":{value}\r\n").as_bytes()),
        }
    }

    pub fn reply_bulk(&mut self, id: usize, data: &[u8]) {
        match protocol::bulk_header(data.len()) {
            Some(header) => self.reply(id, header),
            None => self.reply(id, format!("${}\r\n", data.len()).as_bytes()),
        }
        self.reply(id, data);
        self.reply(id, shared::CRLF);
    }

    pub fn reply_bulk_obj(&mut self, id: usize, obj: &RStr) {
        let bytes = obj.as_bytes();
        match protocol::bulk_header(bytes.len()) {
            Some(header) => self.reply(id, header),
            None => self.reply(id, format!("${}\r\n", bytes.len()).as_bytes()),
        }
        self.reply(id, &bytes);
        self.reply(id, shared::CRLF);
    }

    pub fn reply_null_bulk(&mut self, id: usize) {
        self.reply(id, shared::NULLBULK);
    }

    pub fn reply_multibulk_len(&mut self, id: usize, count: usize) {
        match protocol::multibulk_header(count) {
            Some(header) => self.reply(id, header),
            None => self.reply(id, format!("*{count}\r\n").as_bytes()),
        }
    }

    /// Before-poll hook: try to flush every client with queued output
    /// directly, installing a write handler only for the leftovers.
    pub fn handle_pending_writes(&mut self) {
        let pending = std::mem::take(&mut self.pending_writes);
        for id in pending {
            let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            client.flags.remove(ClientFlags::PENDING_WRITE);

            if !self.write_to_client(id, false) {
                continue;
            }

            let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            if client.has_pending_replies() {
                let token = client.token;
                if let Err(err) = self.el.add_event(&mut client.conn, token, EventMask::WRITE) {
                    error!(client = %client.name, "can't install write handler: {err}");
                    client.flags |= ClientFlags::CLOSE_ASAP;
                    self.close_asap.push(id);
                }
            }
        }
    }

    /// Push queued output to the socket. Returns false if the client was
    /// freed along the way.
    ///
    /// A single episode writes at most [`WRITE_MAX_PER_EVENT`] bytes so one
    /// drainable client cannot starve the rest; when used memory is past
    /// the configured limit the cap is ignored and the backlog is flushed
    /// to reclaim the buffers.
    pub fn write_to_client(&mut self, id: usize, handler_installed: bool) -> bool {
        let max_memory = self.config.max_memory;
        let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };

        let mut total = 0usize;
        let mut fatal = false;
        let mut capped = false;
        while client.has_pending_replies() {
            let write_result = if client.reply_buf_len > 0 {
                let data = &client.reply_buf[client.reply_sent..client.reply_buf_len];
                match client.conn.write(data) {
                    Ok(0) => {
                        fatal = true;
                        break;
                    }
                    Ok(n) => {
                        client.reply_sent += n;
                        total += n;
                        if client.reply_sent == client.reply_buf_len {
                            client.reply_buf_len = 0;
                            client.reply_sent = 0;
                        }
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            } else {
                let Some(head) = client.reply_list.front() else {
                    break;
                };
                if head.is_empty() {
                    client.reply_list.pop_front();
                    continue;
                }
                let chunk_len = head.len();
                match client.conn.write(&head[client.reply_sent..]) {
                    Ok(0) => {
                        fatal = true;
                        break;
                    }
                    Ok(n) => {
                        client.reply_sent += n;
                        total += n;
                        if client.reply_sent == chunk_len {
                            client.reply_list.pop_front();
                            client.reply_list_bytes -= chunk_len;
                            client.reply_sent = 0;
                        }
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            };

            match write_result {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(client = %client.name, "error writing to client: {err}");
                    fatal = true;
                    break;
                }
            }

            if total > WRITE_MAX_PER_EVENT && (max_memory == 0 || used_memory() < max_memory) {
                capped = true;
                break;
            }
        }

        if fatal {
            self.free_client(id);
            return false;
        }

        let Some(client) = self.clients.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        if client.has_pending_replies() {
            if capped && handler_installed {
                // The socket stayed writable; only the fairness cap stopped
                // the episode. Re-arm so the next poll reports it again.
                let token = client.token;
                self.el.rearm(&mut client.conn, token);
            }
        } else {
            client.reply_sent = 0;
            if handler_installed {
                let token = client.token;
                self.el.del_event(&mut client.conn, token, EventMask::WRITE);
            }
            if client.flags.contains(ClientFlags::CLOSE_AFTER_REPLY) {
                self.free_client(id);
                return false;
            }
        }
        true
    }
}
