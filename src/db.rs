//! The keyspace: numbered databases mapping keys to typed values.

use crate::{
    bgtask::{BgWorkers, Task, TaskKind},
    dict::Dict,
    object::{RStr, Value},
};

/// Values whose free effort exceeds this are released on the lazy-free
/// worker; below it, freeing inline is cheaper than queueing.
pub const LAZYFREE_THRESHOLD: usize = 64;

/// A single logical database.
#[derive(Debug)]
pub struct Db {
    pub id: usize,
    pub dict: Dict<Value>,
}

impl Db {
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self {
            id,
            dict: Dict::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn lookup(&self, key: &RStr) -> Option<&Value> {
        self.dict.get(&key.as_bytes())
    }

    pub fn lookup_mut(&mut self, key: &RStr) -> Option<&mut Value> {
        self.dict.get_mut(&key.as_bytes())
    }

    pub fn contains(&self, key: &RStr) -> bool {
        self.dict.contains_key(&key.as_bytes())
    }

    /// Set a key to a new value, whether it existed or not. The displaced
    /// value, if any, is returned for the caller to release.
    pub fn set_key(&mut self, key: &RStr, value: Value) -> Option<Value> {
        self.dict.insert(&key.as_bytes(), value)
    }

    /// Delete a key, releasing the value inline.
    pub fn del_sync(&mut self, key: &RStr) -> bool {
        self.dict.remove(&key.as_bytes()).is_some()
    }

    /// Delete a key, handing large values to the lazy-free worker. Values
    /// cheap to free are still released inline: queueing them would cost
    /// more than the free itself.
    pub fn del_async(&mut self, key: &RStr, workers: &BgWorkers) -> bool {
        match self.dict.remove(&key.as_bytes()) {
            Some(value) => {
                if value.lazyfree_effort() > LAZYFREE_THRESHOLD {
                    workers.submit(TaskKind::LazyFree, Task::Free(value));
                }
                true
            }
            None => false,
        }
    }
}
