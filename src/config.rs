use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NET_TIMEOUT: u32 = 500;
const DEFAULT_MAX_IDLE_CONNS: usize = 2;
const DEFAULT_MAX_CAP: usize = 16;

/// One shard: where it lives, how to log in, and how many connections to keep.
///
/// Zero-valued knobs fall back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port`, or a Unix socket path when it contains a `/`.
    pub server: String,
    pub user: String,
    pub password: String,
    /// Connections opened when the client is built.
    pub initial_cap: usize,
    /// Upper bound on live connections, idle or checked out.
    pub max_cap: usize,
    pub max_idle: usize,
    /// Milliseconds an idle connection may sit in the pool; zero keeps it forever.
    pub idle_timeout: u32,
    /// Dial timeout in milliseconds.
    pub connection_timeout: u32,
}

impl Config {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub(crate) fn has_credentials(&self) -> bool {
        !self.user.is_empty() || !self.password.is_empty()
    }

    pub(crate) fn net_timeout(&self) -> Duration {
        let millis = match self.connection_timeout {
            0 => DEFAULT_NET_TIMEOUT,
            _ => self.connection_timeout,
        };
        Duration::from_millis(u64::from(millis))
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout {
            0 => None,
            millis => Some(Duration::from_millis(u64::from(millis))),
        }
    }

    pub(crate) fn max_cap(&self) -> usize {
        match self.max_cap {
            0 => DEFAULT_MAX_CAP.max(self.initial_cap),
            _ => self.max_cap,
        }
    }

    pub(crate) fn max_idle(&self) -> usize {
        match self.max_idle {
            0 => DEFAULT_MAX_IDLE_CONNS,
            _ => self.max_idle,
        }
    }
}
