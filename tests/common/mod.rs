//! A small in-process binary memcached, enough to drive the client end to end.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use memshard::protocol::{read_request, write_response, Opcode, Request, Status};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
}

impl Store {
    fn bump(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

#[derive(Clone)]
pub struct FakeServer {
    pub addr: String,
    store: Arc<Mutex<Store>>,
    credentials: Option<(String, String)>,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn spawn() -> Self {
        Self::spawn_with(None)
    }

    pub fn spawn_with_auth(user: &str, password: &str) -> Self {
        Self::spawn_with(Some((user.to_string(), password.to_string())))
    }

    fn spawn_with(credentials: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let server = FakeServer {
            addr: listener.local_addr().expect("addr").to_string(),
            store: Arc::default(),
            credentials,
            accepted: Arc::default(),
        };
        let accept = server.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                accept.accepted.fetch_add(1, Ordering::SeqCst);
                let conn = accept.clone();
                thread::spawn(move || conn.serve(stream));
            }
        });
        server
    }

    #[cfg(unix)]
    pub fn spawn_unix(path: &std::path::Path) -> Self {
        use std::os::unix::net::UnixListener;

        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).expect("bind unix");
        let server = FakeServer {
            addr: path.display().to_string(),
            store: Arc::default(),
            credentials: None,
            accepted: Arc::default(),
        };
        let accept = server.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                accept.accepted.fetch_add(1, Ordering::SeqCst);
                let conn = accept.clone();
                thread::spawn(move || conn.serve(stream));
            }
        });
        server
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().unwrap().items.contains_key(key.as_bytes())
    }

    fn serve<S: Read + Write>(&self, stream: S) {
        let mut stream = BufReader::new(stream);
        let mut authed = self.credentials.is_none();
        while let Ok(req) = read_request(&mut stream) {
            let conn = stream.get_mut();
            let is_auth = req.opcode == Opcode::AuthList as u8 || req.opcode == Opcode::AuthStart as u8;
            if !authed && !is_auth {
                reply(conn, &req, Status::AuthError, b"", b"", b"Auth required", 0);
                continue;
            }
            if req.opcode == Opcode::AuthStart as u8 {
                authed = self.auth_start(conn, &req);
                continue;
            }
            self.handle(conn, &req);
        }
    }

    fn auth_start<W: Write>(&self, conn: &mut W, req: &Request) -> bool {
        let (user, password) = self.credentials.clone().unwrap_or_default();
        let expected = format!("\0{}\0{}", user, password);
        if req.key == b"PLAIN" && req.value == expected.as_bytes() {
            reply(conn, req, Status::Ok, b"", b"", b"Authenticated", 0);
            true
        } else {
            reply(conn, req, Status::AuthError, b"", b"", b"Auth failure", 0);
            false
        }
    }

    fn handle<W: Write>(&self, conn: &mut W, req: &Request) {
        let mut store = self.store.lock().unwrap();
        match Opcode::from_u8(req.opcode) {
            Some(Opcode::Get) => match store.items.get(&req.key) {
                Some(entry) => {
                    let flags = entry.flags.to_be_bytes();
                    reply(conn, req, Status::Ok, b"", &flags, &entry.value, entry.cas)
                }
                None => reply(conn, req, Status::KeyNotFound, b"", b"", b"Not found", 0),
            },
            Some(Opcode::GetKQ) => {
                if let Some(entry) = store.items.get(&req.key) {
                    let flags = entry.flags.to_be_bytes();
                    reply(conn, req, Status::Ok, &req.key, &flags, &entry.value, entry.cas);
                }
            }
            Some(Opcode::Noop) => reply(conn, req, Status::Ok, b"", b"", b"", 0),
            Some(Opcode::Set) | Some(Opcode::Add) => {
                let existing = store.items.get(&req.key).map(|entry| entry.cas);
                let status = match (existing, req.cas) {
                    (Some(_), _) if req.opcode == Opcode::Add as u8 => Status::KeyExists,
                    (None, cas) if cas != 0 => Status::KeyNotFound,
                    (Some(current), cas) if cas != 0 && cas != current => Status::KeyExists,
                    _ => Status::Ok,
                };
                if status != Status::Ok {
                    return reply(conn, req, status, b"", b"", b"", 0);
                }
                let cas = store.bump();
                let mut flags = [0u8; 4];
                flags.copy_from_slice(&req.extras[..4]);
                let flags = u32::from_be_bytes(flags);
                store.items.insert(
                    req.key.clone(),
                    Entry {
                        value: req.value.clone(),
                        flags,
                        cas,
                    },
                );
                reply(conn, req, Status::Ok, b"", b"", b"", cas);
            }
            Some(Opcode::Delete) => match store.items.remove(&req.key) {
                Some(_) => reply(conn, req, Status::Ok, b"", b"", b"", 0),
                None => reply(conn, req, Status::KeyNotFound, b"", b"", b"Not found", 0),
            },
            Some(opcode @ (Opcode::Increment | Opcode::Decrement)) => {
                let mut delta = [0u8; 8];
                delta.copy_from_slice(&req.extras[..8]);
                let delta = u64::from_be_bytes(delta);
                let cas = store.bump();
                let Some(entry) = store.items.get_mut(&req.key) else {
                    // Expiration 0xffffffff: never auto-create.
                    return reply(conn, req, Status::KeyNotFound, b"", b"", b"Not found", 0);
                };
                let parsed = std::str::from_utf8(&entry.value).ok().and_then(|v| v.parse::<u64>().ok());
                let Some(current) = parsed else {
                    let msg = b"Non-numeric value";
                    return reply(conn, req, Status::InvalidIncrDecr, b"", b"", msg, 0);
                };
                let next = match opcode {
                    Opcode::Increment => current.wrapping_add(delta),
                    _ => current.saturating_sub(delta),
                };
                entry.value = next.to_string().into_bytes();
                entry.cas = cas;
                reply(conn, req, Status::Ok, b"", b"", &next.to_be_bytes(), cas);
            }
            Some(Opcode::Flush) => {
                store.items.clear();
                reply(conn, req, Status::Ok, b"", b"", b"", 0);
            }
            Some(Opcode::AuthList) => reply(conn, req, Status::Ok, b"", b"", b"PLAIN", 0),
            _ => reply(conn, req, Status::UnknownCommand, b"", b"", b"Unknown command", 0),
        }
    }
}

fn reply<W: Write>(
    conn: &mut W,
    req: &Request,
    status: Status,
    key: &[u8],
    extras: &[u8],
    value: &[u8],
    cas: u64,
) {
    let _ = write_response(conn, req.opcode, status, key, extras, value, cas);
}

/// An address nothing listens on.
pub fn closed_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").to_string()
}

