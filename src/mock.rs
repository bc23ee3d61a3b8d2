//! In-memory connections and servers for unit tests.

use std::io::{self, Cursor, Read, Write};
use std::sync::Mutex;

use crate::errors::OperationError;
use crate::pool::Servers;
use crate::protocol::{write_response, Opcode, Status};
use crate::selector::ServerSelector;

/// Replays canned response bytes and records everything written.
#[derive(Debug, Default)]
pub struct ScriptedConn {
    pub(crate) input: Cursor<Vec<u8>>,
    pub written: Vec<u8>,
    pub fail_writes: bool,
}

impl ScriptedConn {
    pub fn reply(&mut self, opcode: Opcode, status: Status, key: &[u8], value: &[u8]) {
        self.reply_full(opcode, status, key, b"", value, 0);
    }

    pub fn reply_full(
        &mut self,
        opcode: Opcode,
        status: Status,
        key: &[u8],
        extras: &[u8],
        value: &[u8],
        cas: u64,
    ) {
        let buf = self.input.get_mut();
        write_response(buf, opcode as u8, status, key, extras, value, cas).unwrap();
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.input.get_mut().extend_from_slice(bytes);
    }
}

impl Read for ScriptedConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands out pre-scripted connections per shard and records how each one
/// came back.
#[derive(Default)]
pub struct MockServers {
    pub conns: Mutex<Vec<Vec<ScriptedConn>>>,
    pub released: Mutex<Vec<(usize, ScriptedConn)>>,
    pub closed: Mutex<Vec<(usize, ScriptedConn)>>,
    pub unreachable: Vec<usize>,
    /// Record returned connections but report the return as failed.
    pub reject_returns: bool,
}

impl MockServers {
    pub fn new(shards: usize) -> Self {
        Self {
            conns: Mutex::new((0..shards).map(|_| Vec::new()).collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, shard: usize, conn: ScriptedConn) {
        self.conns.lock().unwrap()[shard].push(conn);
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }

    fn returned(&self) -> Result<(), OperationError> {
        if self.reject_returns {
            return Err(OperationError::ClientError("unknown shard".to_string()));
        }
        Ok(())
    }
}

impl ServerSelector for MockServers {
    fn server_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

impl Servers for MockServers {
    type Conn = ScriptedConn;

    fn name(&self, shard: usize) -> String {
        format!("mock-{}", shard)
    }

    fn acquire(&self, shard: usize) -> Result<ScriptedConn, OperationError> {
        if self.unreachable.contains(&shard) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
        }
        self.conns.lock().unwrap()[shard]
            .pop()
            .ok_or_else(|| OperationError::ClientError(format!("no scripted conn for {}", shard)))
    }

    fn release(&self, shard: usize, conn: ScriptedConn) -> Result<(), OperationError> {
        self.released.lock().unwrap().push((shard, conn));
        self.returned()
    }

    fn force_close(&self, shard: usize, conn: ScriptedConn) -> Result<(), OperationError> {
        self.closed.lock().unwrap().push((shard, conn));
        self.returned()
    }

    fn total_open(&self) -> usize {
        self.conns.lock().unwrap().iter().map(Vec::len).sum()
    }

    fn shutdown_all(&self) {
        self.conns.lock().unwrap().iter_mut().for_each(Vec::clear);
    }
}
