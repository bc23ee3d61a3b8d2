use std::fmt;
use std::io;

use crate::protocol::Status;

/// Failures while building the server list, before any operation runs.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("could not resolve the server address {addr}: {source}")]
    AddrResolveError { addr: String, source: io::Error },
    #[error("server address {0} did not resolve to any socket address")]
    NoAddrError(String),
    #[error("could not open the initial connections to {addr}: {source}")]
    InitialConnectError {
        addr: String,
        source: OperationError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("memcache: cache miss")]
    CacheMissError,
    #[error("memcache: compare-and-swap conflict")]
    CASConflictError,
    #[error("memcache: item not stored")]
    NotStoredError,
    #[error("memcache: incr or decr on non-numeric value")]
    BadIncrDecError,
    /// Keys must be at most 250 bytes long, ASCII, and free of whitespace
    /// and control characters.
    #[error("memcache: malformed key is too long or contains invalid characters")]
    MalformedKeyError,
    #[error("memcache: no servers configured or available")]
    NoServersError,
    #[error("memcache: server error: {0}")]
    ServerError(Status),
    #[error("memcache: authentication rejected: {0}")]
    AuthError(Status),
    #[error("memcache: client error: {0}")]
    ClientError(String),
    #[error("memcache: connection pool is closed")]
    PoolClosedError,
    #[error("memcache: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("memcache: IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("memcache: failed to flush some servers: {0}")]
    FlushError(FlushFailures),
}

impl OperationError {
    /// Whether the peer answered with a well formed frame, leaving the
    /// connection aligned on the next request.
    ///
    /// Only these outcomes may hand a connection back to its pool; every
    /// other error leaves the stream in an unknown state.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            OperationError::CacheMissError
                | OperationError::CASConflictError
                | OperationError::NotStoredError
                | OperationError::BadIncrDecError
        )
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic number in response: {0:#04x}")]
    BadMagic(u8),
    #[error("frame body of {total} bytes cannot hold {extras} extras and {key} key bytes")]
    BodyLength { total: u32, extras: u8, key: u16 },
    #[error("counter value must be 8 bytes, got {0}")]
    CounterLength(usize),
}

/// Per-shard failures collected by a flush broadcast.
#[derive(Debug, Default)]
pub struct FlushFailures {
    failures: Vec<(String, OperationError)>,
}

impl FlushFailures {
    pub(crate) fn push(&mut self, server: String, error: OperationError) {
        self.failures.push((server, error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed servers, in shard order, with their error.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OperationError)> {
        self.failures.iter().map(|(name, err)| (name.as_str(), err))
    }
}

impl fmt::Display for FlushFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (server, error)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", server, error)?;
        }
        Ok(())
    }
}
