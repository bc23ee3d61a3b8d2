//! Client for memcached's binary protocol, spread over several shards.
//!
//! Each key belongs to exactly one shard, picked by a crc32 of the key. Every
//! shard has its own connection pool; connections are authenticated before
//! they are first used and are only ever used by one operation at a time.

mod auth;
mod config;
mod conn;
mod errors;
mod item;
#[cfg(test)]
mod mock;
mod pool;
pub mod protocol;
mod selector;

use std::collections::HashMap;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

pub use crate::auth::negotiate;
pub use crate::config::Config;
pub use crate::conn::{Conn, ServerAddr};
pub use crate::errors::{ConnError, FlushFailures, OperationError, ProtocolError};
pub use crate::item::Item;
pub use crate::pool::{ConnPool, Factory, PoolConfig, ServerList, Servers};
pub use crate::selector::{pick_shard, ServerSelector};

use crate::protocol::{be_u64, parse_response, send_command, Opcode, Response};

pub type Result<T> = std::result::Result<T, OperationError>;

const MAX_KEY_LEN: usize = 250;

/// Keys are at most 250 bytes of printable ASCII, with no spaces.
pub fn legal_key(key: &str) -> bool {
    key.len() <= MAX_KEY_LEN && key.bytes().all(|b| b > b' ' && b <= 0x7e)
}

/// A memcache client. It is safe to share between threads; every call checks
/// a connection out of the owning shard's pool for its own exclusive use.
pub struct Client<S = ServerList> {
    servers: S,
}

impl Client<ServerList> {
    /// One shard per config, indexed in the given order.
    pub fn new(configs: &[Config]) -> std::result::Result<Self, ConnError> {
        Ok(Self::from_servers(ServerList::new(configs)?))
    }
}

impl<S: Servers> Client<S> {
    pub fn from_servers(servers: S) -> Self {
        Self { servers }
    }

    /// Closes all idle connections and refuses new checkouts.
    pub fn close(&self) {
        self.servers.shutdown_all();
    }

    pub fn open_connections(&self) -> usize {
        self.servers.total_open()
    }

    /// Gets the item for the given key. `CacheMissError` is returned for a
    /// cache miss.
    pub fn get(&self, key: &str) -> Result<Item> {
        let resp = self.with_key_conn(key, |conn| {
            send_command(conn, Opcode::Get, key.as_bytes(), b"", 0, b"")?;
            Ok(parse_response(conn, key, 0)?)
        })?;
        let key = if key.is_empty() && !resp.key.is_empty() {
            String::from_utf8_lossy(&resp.key).into_owned()
        } else {
            key.to_string()
        };
        let (flags, cas) = (resp.flags(), resp.cas());
        Ok(Item::fetched(key, resp.value, flags, cas))
    }

    /// Batch version of `get`. Keys that are not cached are simply absent
    /// from the returned map. Empty keys are rejected with `MalformedKeyError`:
    /// their replies could not be told apart from the noop that ends a shard's
    /// pipeline.
    ///
    /// Each shard is queried from its own thread with a pipeline of quiet
    /// gets closed by a noop. A shard that fails midway contributes whatever
    /// it had already read, and the failure is logged rather than returned.
    pub fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>> {
        let mut by_shard: HashMap<usize, Vec<&str>> = HashMap::new();
        for &key in keys {
            if key.is_empty() || !legal_key(key) {
                return Err(OperationError::MalformedKeyError);
            }
            let shard = self.servers.pick_server(key)?;
            by_shard.entry(shard).or_default().push(key);
        }

        let mut items = HashMap::with_capacity(keys.len());
        std::thread::scope(|scope| {
            let mut receivers = Vec::with_capacity(by_shard.len());
            for (shard, keys) in by_shard {
                let (tx, rx) = crossbeam_channel::unbounded();
                receivers.push(rx);
                scope.spawn(move || self.get_shard(shard, &keys, tx));
            }
            for rx in receivers {
                for item in rx {
                    items.insert(item.key.clone(), item);
                }
            }
        });
        Ok(items)
    }

    fn get_shard(&self, shard: usize, keys: &[&str], tx: Sender<Item>) {
        let mut conn = match self.servers.acquire(shard) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(shard, error = %err, "get_multi: could not acquire connection");
                return;
            }
        };

        let sent = keys
            .iter()
            .try_for_each(|key| send_command(&mut conn, Opcode::GetKQ, key.as_bytes(), b"", 0, b""))
            .and_then(|()| send_command(&mut conn, Opcode::Noop, b"", b"", 0, b""));
        if let Err(err) = sent {
            warn!(shard, error = %err, "get_multi: could not send pipeline");
            self.discard(shard, conn);
            return;
        }

        loop {
            match parse_response(&mut conn, "", 0) {
                // The noop echo carries no key and ends the pipeline.
                Ok(resp) if resp.key.is_empty() => {
                    self.put_back(shard, conn);
                    return;
                }
                Ok(resp) => {
                    let key = String::from_utf8_lossy(&resp.key).into_owned();
                    let (flags, cas) = (resp.flags(), resp.cas());
                    // The collector drains every channel, so this cannot fail.
                    let _ = tx.send(Item::fetched(key, resp.value, flags, cas));
                }
                Err(err) => {
                    // Replies before the noop may still be unread.
                    warn!(shard, error = %err, "get_multi: pipeline aborted");
                    self.discard(shard, conn);
                    return;
                }
            }
        }
    }

    /// Writes the given item, unconditionally.
    pub fn set(&self, item: &mut Item) -> Result<()> {
        self.populate_one(Opcode::Set, item, 0)
    }

    /// Writes the given item only if no value exists for its key;
    /// `NotStoredError` otherwise.
    pub fn add(&self, item: &mut Item) -> Result<()> {
        self.populate_one(Opcode::Add, item, 0)
    }

    /// Writes an item previously returned by `get`, provided it was neither
    /// modified nor evicted in between. A modification yields
    /// `CASConflictError`, an eviction `NotStoredError`.
    pub fn compare_and_swap(&self, item: &mut Item) -> Result<()> {
        let cas_id = item.cas_id();
        self.populate_one(Opcode::Set, item, cas_id)
    }

    fn populate_one(&self, opcode: Opcode, item: &mut Item, cas_id: u64) -> Result<()> {
        let mut extras = [0u8; 8];
        extras[..4].copy_from_slice(&item.flags.to_be_bytes());
        extras[4..].copy_from_slice(&(item.expiration as u32).to_be_bytes());

        let resp = self.with_key_conn(&item.key, |conn| {
            send_command(conn, opcode, item.key.as_bytes(), &item.value, cas_id, &extras)?;
            Ok(parse_response(conn, &item.key, cas_id)?)
        })?;
        item.set_cas_id(resp.cas());
        Ok(())
    }

    /// Deletes the item with the provided key; `CacheMissError` if it was not
    /// cached.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.with_key_conn(key, |conn| {
            send_command(conn, Opcode::Delete, key.as_bytes(), b"", 0, b"")?;
            Ok(parse_response(conn, key, 0)?)
        })?;
        Ok(())
    }

    /// Atomically increments key by delta and returns the new value. The
    /// stored value must be a decimal number. Wraps around on 64-bit overflow.
    pub fn increment(&self, key: &str, delta: u64) -> Result<u64> {
        self.incr_decr(Opcode::Increment, key, delta)
    }

    /// Atomically decrements key by delta and returns the new value. Stops at
    /// zero instead of wrapping.
    pub fn decrement(&self, key: &str, delta: u64) -> Result<u64> {
        self.incr_decr(Opcode::Decrement, key, delta)
    }

    fn incr_decr(&self, opcode: Opcode, key: &str, delta: u64) -> Result<u64> {
        // delta, initial value, expiration. An all-ones expiration makes the
        // server fail on a missing key instead of creating it.
        let mut extras = [0u8; 20];
        extras[..8].copy_from_slice(&delta.to_be_bytes());
        extras[16..].copy_from_slice(&[0xff; 4]);

        let resp = self.with_key_conn(key, |conn| {
            send_command(conn, opcode, key.as_bytes(), b"", 0, &extras)?;
            Ok(parse_response(conn, key, 0)?)
        })?;
        if resp.value.len() != 8 {
            return Err(ProtocolError::CounterLength(resp.value.len()).into());
        }
        Ok(be_u64(&resp.value))
    }

    /// Removes every item on every shard after `expiration` seconds, or right
    /// away when `expiration <= 0`.
    ///
    /// Shards are flushed one after the other; a failing shard does not stop
    /// the others, and all failures come back together in a `FlushError`.
    pub fn flush(&self, expiration: i32) -> Result<()> {
        let delay = expiration.max(0) as u32;
        let extras = delay.to_be_bytes();
        let extras: &[u8] = if delay > 0 { &extras } else { &[] };

        let mut failures = FlushFailures::default();
        for shard in 0..self.servers.server_count() {
            let result = self.with_conn(shard, |conn| {
                send_command(conn, Opcode::Flush, b"", b"", 0, extras)?;
                Ok(parse_response(conn, "", 0)?)
            });
            if let Err(err) = result {
                let name = self.servers.name(shard);
                warn!(server = %name, error = %err, "flush failed");
                failures.push(name, err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OperationError::FlushError(failures))
        }
    }

    fn with_key_conn<F>(&self, key: &str, f: F) -> Result<Response>
    where
        F: FnOnce(&mut S::Conn) -> Result<Response>,
    {
        if !legal_key(key) {
            return Err(OperationError::MalformedKeyError);
        }
        let shard = self.servers.pick_server(key)?;
        self.with_conn(shard, f)
    }

    /// Runs one round trip on a checked out connection, then returns the
    /// connection to its pool or closes it depending on the outcome.
    fn with_conn<F>(&self, shard: usize, f: F) -> Result<Response>
    where
        F: FnOnce(&mut S::Conn) -> Result<Response>,
    {
        let mut conn = self.servers.acquire(shard)?;
        let result = f(&mut conn);
        match &result {
            Ok(_) => self.put_back(shard, conn),
            Err(err) if err.is_resumable() => self.put_back(shard, conn),
            Err(err) => {
                debug!(shard, error = %err, "closing connection");
                self.discard(shard, conn);
            }
        }
        result
    }

    fn put_back(&self, shard: usize, conn: S::Conn) {
        if let Err(err) = self.servers.release(shard, conn) {
            debug!(shard, error = %err, "could not return connection to pool");
        }
    }

    fn discard(&self, shard: usize, conn: S::Conn) {
        if let Err(err) = self.servers.force_close(shard, conn) {
            debug!(shard, error = %err, "could not close connection");
        }
    }
}
