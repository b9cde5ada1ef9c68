#![deny(unsafe_code)]
#![warn(
    rust_2018_idioms,
    clippy::all,
    clippy::clone_on_ref_ptr,
    clippy::format_push_string,
    clippy::get_unwrap,
    clippy::mem_forget,
    clippy::rc_buffer,
    clippy::self_named_module_files,
    clippy::str_to_string,
    clippy::wildcard_imports,
    clippy::string_add,
    clippy::string_to_string,
    clippy::try_err
)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

//! Rhino-Rox: an in-memory, single-process key-value server speaking a
//! line/bulk text protocol over TCP.
//!
//! A single reactor thread owns the event loop and every client, keyspace
//! and object; commands operate on a small set of numbered databases
//! holding typed values: plain strings, prefix-searchable string maps
//! backed by a crit-bit tree, score-ordered queues backed by a binary
//! min-heap, and BM25-ranked full-text indexes. Deleting a large value can
//! be offloaded to a background lazy-free worker to keep reactor latency
//! flat.

pub mod bgtask;
pub mod buffer;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod dict;
pub mod event;
pub mod fts;
pub mod memory;
pub mod minheap;
pub mod net;
pub mod object;
pub mod protocol;
mod reply;
pub mod server;

pub use self::{
    buffer::Buffer,
    config::Config,
    dict::Dict,
    minheap::MinHeap,
    object::{RStr, StrObject, Value},
    server::Server,
};
