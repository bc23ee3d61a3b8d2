//! # Connection Pools
//!
//! One pool per shard, each holding live connections that have already been
//! dialed and authenticated. The client only talks to pools through the
//! `Servers` trait: check a connection out, then either hand it back or
//! force it closed.
//!
//! A pool is built around a factory closure, so what "a new connection"
//! means (dial, handshake) is decided by whoever builds the pool.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::auth;
use crate::config::Config;
use crate::conn::{Conn, ServerAddr};
use crate::errors::{ConnError, OperationError};
use crate::selector::ServerSelector;

/// What the client needs from the shard pools.
pub trait Servers: ServerSelector + Send + Sync {
    type Conn: Read + Write + Send;

    /// Display name of a shard, used in aggregated errors.
    fn name(&self, shard: usize) -> String;
    fn acquire(&self, shard: usize) -> Result<Self::Conn, OperationError>;
    fn release(&self, shard: usize, conn: Self::Conn) -> Result<(), OperationError>;
    fn force_close(&self, shard: usize, conn: Self::Conn) -> Result<(), OperationError>;
    /// Live connections across every shard, idle or checked out.
    fn total_open(&self) -> usize;
    fn shutdown_all(&self);
}

pub type Factory<C> = Box<dyn Fn() -> Result<C, OperationError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_cap: usize,
    pub max_cap: usize,
    pub max_idle: usize,
    pub idle_timeout: Option<Duration>,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    // Idle plus checked out.
    total: usize,
    closed: bool,
}

pub struct ConnPool<C> {
    config: PoolConfig,
    factory: Factory<C>,
    state: Mutex<PoolState<C>>,
    slot_freed: Condvar,
}

impl<C> ConnPool<C> {
    /// Builds the pool and opens `initial_cap` connections right away.
    pub fn new(config: PoolConfig, factory: Factory<C>) -> Result<Self, OperationError> {
        let initial = config.initial_cap.min(config.max_cap);
        let mut idle = VecDeque::with_capacity(initial);
        for _ in 0..initial {
            idle.push_back(IdleConn {
                conn: factory()?,
                since: Instant::now(),
            });
        }
        Ok(Self {
            state: Mutex::new(PoolState {
                total: idle.len(),
                idle,
                closed: false,
            }),
            config,
            factory,
            slot_freed: Condvar::new(),
        })
    }

    /// Checks out an idle connection, or dials a new one when under
    /// `max_cap`. Blocks while the pool is at capacity.
    pub fn get(&self) -> Result<C, OperationError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(OperationError::PoolClosedError);
            }
            while let Some(idle) = state.idle.pop_front() {
                if self.expired(&idle) {
                    state.total = state.total.saturating_sub(1);
                    continue;
                }
                return Ok(idle.conn);
            }
            if state.total < self.config.max_cap {
                state.total += 1;
                break;
            }
            state = self
                .slot_freed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        match (self.factory)() {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Returns a healthy connection. Past `max_idle`, or after shutdown,
    /// the connection is dropped instead.
    pub fn put(&self, conn: C) {
        let mut state = self.lock();
        if state.closed || state.idle.len() >= self.config.max_idle {
            state.total = state.total.saturating_sub(1);
        } else {
            state.idle.push_back(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        drop(state);
        self.slot_freed.notify_one();
    }

    /// Drops a connection that must not be reused.
    pub fn close(&self, conn: C) {
        drop(conn);
        self.release_slot();
    }

    pub fn len(&self) -> usize {
        self.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every idle connection and refuses further checkouts.
    /// Connections still checked out are dropped when they come back.
    pub fn release(&self) {
        let mut state = self.lock();
        state.closed = true;
        let idle = state.idle.len();
        state.idle.clear();
        state.total = state.total.saturating_sub(idle);
        drop(state);
        self.slot_freed.notify_all();
    }

    fn expired(&self, idle: &IdleConn<C>) -> bool {
        self.config
            .idle_timeout
            .map_or(false, |timeout| idle.since.elapsed() > timeout)
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.slot_freed.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The configured shards, in configuration order.
pub struct ServerList {
    pools: Vec<ConnPool<Conn>>,
    names: Vec<String>,
}

impl ServerList {
    pub fn new(configs: &[Config]) -> Result<Self, ConnError> {
        let mut pools = Vec::with_capacity(configs.len());
        let mut names = Vec::with_capacity(configs.len());
        for config in configs {
            let addr = ServerAddr::resolve(&config.server)?;
            let pool = new_pool(addr, config).map_err(|source| ConnError::InitialConnectError {
                addr: config.server.clone(),
                source,
            })?;
            pools.push(pool);
            names.push(config.server.clone());
        }
        Ok(Self { pools, names })
    }

    fn pool(&self, shard: usize) -> Result<&ConnPool<Conn>, OperationError> {
        self.pools
            .get(shard)
            .ok_or_else(|| OperationError::ClientError(format!("server {} not found", shard)))
    }
}

fn new_pool(addr: ServerAddr, config: &Config) -> Result<ConnPool<Conn>, OperationError> {
    let timeout = config.net_timeout();
    let credentials = config
        .has_credentials()
        .then(|| (config.user.clone(), config.password.clone()));

    let factory: Factory<Conn> = Box::new(move || {
        let mut conn = addr.dial(timeout)?;
        debug!(server = %addr, "dialed new connection");
        if let Some((user, password)) = &credentials {
            auth::negotiate(&mut conn, user, password)?;
        }
        Ok(conn)
    });

    ConnPool::new(
        PoolConfig {
            initial_cap: config.initial_cap,
            max_cap: config.max_cap(),
            max_idle: config.max_idle(),
            idle_timeout: config.idle_timeout(),
        },
        factory,
    )
}

impl ServerSelector for ServerList {
    fn server_count(&self) -> usize {
        self.pools.len()
    }
}

impl Servers for ServerList {
    type Conn = Conn;

    fn name(&self, shard: usize) -> String {
        self.names.get(shard).cloned().unwrap_or_default()
    }

    fn acquire(&self, shard: usize) -> Result<Conn, OperationError> {
        self.pool(shard)?.get()
    }

    fn release(&self, shard: usize, conn: Conn) -> Result<(), OperationError> {
        self.pool(shard)?.put(conn);
        Ok(())
    }

    fn force_close(&self, shard: usize, conn: Conn) -> Result<(), OperationError> {
        self.pool(shard)?.close(conn);
        Ok(())
    }

    fn total_open(&self) -> usize {
        self.pools.iter().map(ConnPool::len).sum()
    }

    fn shutdown_all(&self) {
        for pool in &self.pools {
            pool.release();
        }
    }
}
