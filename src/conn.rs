use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConnError;

/// Where a shard listens. Any address containing a `/` is a socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ServerAddr {
    /// Resolves host names up front so every dial reuses the same address.
    pub fn resolve(server: &str) -> Result<Self, ConnError> {
        if server.contains('/') {
            return Ok(ServerAddr::Unix(PathBuf::from(server)));
        }
        let mut addrs = server
            .to_socket_addrs()
            .map_err(|source| ConnError::AddrResolveError {
                addr: server.to_string(),
                source,
            })?;
        addrs
            .next()
            .map(ServerAddr::Tcp)
            .ok_or_else(|| ConnError::NoAddrError(server.to_string()))
    }

    pub(crate) fn dial(&self, timeout: Duration) -> io::Result<Conn> {
        let stream = match self {
            ServerAddr::Tcp(addr) => {
                let stream = TcpStream::connect_timeout(addr, timeout)?;
                // Requests are small and latency bound.
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ))
            }
        };
        Ok(Conn {
            reader: BufReader::new(stream),
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp(addr) => write!(f, "{}", addr),
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A physical connection to one shard.
///
/// Reads go through a buffer since a response is parsed in several small
/// pieces; writes go straight to the socket.
#[derive(Debug)]
pub struct Conn {
    reader: BufReader<Stream>,
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.reader.get_mut() {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.reader.get_mut() {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}
