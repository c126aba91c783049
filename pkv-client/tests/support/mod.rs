#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pkv_client::{ConnectionState, Endpoint, StatefulConnection};

#[derive(Clone, Copy)]
enum Mode {
    Kv,
    Garbage,
}

struct ServerState {
    mode: Mode,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    connections: Mutex<Vec<TcpStream>>,
    accepted: AtomicUsize,
    stopped: AtomicBool,
}

/// In-process server on a std thread. `Kv` speaks enough RESP for the
/// tests; `Garbage` answers every request with a frame no RESP peer sends.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn start() -> Self {
        MockServer::spawn(Mode::Kv)
    }

    pub fn garbage() -> Self {
        MockServer::spawn(Mode::Garbage)
    }

    fn spawn(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(ServerState {
            mode,
            data: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_state.stopped.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                accept_state.accepted.fetch_add(1, Ordering::AcqRel);
                if let Ok(clone) = stream.try_clone() {
                    accept_state.connections.lock().unwrap().push(clone);
                }
                let state = Arc::clone(&accept_state);
                thread::spawn(move || match state.mode {
                    Mode::Kv => serve_kv(stream, &state),
                    Mode::Garbage => serve_garbage(stream),
                });
            }
        });

        MockServer { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port()).with_timeout(Duration::from_secs(5))
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::Acquire)
    }

    /// Drops every client connection from the server side.
    ///
    /// Only connections the accept thread has registered are dropped; see
    /// [`round_trip`] for making sure a fresh connection is among them.
    pub fn kill_connections(&self) {
        let connections: Vec<TcpStream> = self.state.connections.lock().unwrap().drain(..).collect();
        for stream in connections {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.state.stopped.store(true, Ordering::Release);
        self.kill_connections();
        let _ = TcpStream::connect(self.addr);
    }
}

fn serve_kv(mut stream: TcpStream, state: &ServerState) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    while let Ok(args) = read_command(&mut reader) {
        if args.is_empty() {
            write_error(&mut stream, "ERR empty command");
            continue;
        }
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match name.as_str() {
            "PING" => match args.get(1) {
                Some(message) => write_bulk(&mut stream, message),
                None => write_simple(&mut stream, "PONG"),
            },
            "ECHO" if args.len() == 2 => write_bulk(&mut stream, &args[1]),
            "AUTH" | "SELECT" => write_simple(&mut stream, "OK"),
            "SET" if args.len() == 3 => {
                state.data.lock().unwrap().insert(args[1].clone(), args[2].clone());
                write_simple(&mut stream, "OK");
            }
            "GET" if args.len() == 2 => match state.data.lock().unwrap().get(&args[1]) {
                Some(value) => write_bulk(&mut stream, value),
                None => write_null(&mut stream),
            },
            "MGET" => {
                let values: Vec<Option<Vec<u8>>> = {
                    let data = state.data.lock().unwrap();
                    args[1..].iter().map(|key| data.get(key).cloned()).collect()
                };
                write_array_header(&mut stream, values.len());
                for value in values {
                    match value {
                        Some(value) => write_bulk(&mut stream, &value),
                        None => write_null(&mut stream),
                    }
                }
            }
            "DEL" => {
                let mut data = state.data.lock().unwrap();
                let removed = args[1..].iter().filter(|key| data.remove(*key).is_some()).count();
                drop(data);
                write_integer(&mut stream, removed as i64);
            }
            "INFO" => write_bulk(&mut stream, b"# Server\r\nrole:master\r\n"),
            "SLEEP" if args.len() == 2 => {
                let millis = parse_usize(&args[1]).unwrap_or(0) as u64;
                thread::sleep(Duration::from_millis(millis));
                write_simple(&mut stream, "OK");
            }
            "QUIT" => {
                write_simple(&mut stream, "OK");
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            _ => write_error(&mut stream, &format!("ERR unknown command '{name}'")),
        }
    }
}

fn serve_garbage(mut stream: TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let _ = stream.write_all(b"@bogus\r\n");
                let _ = stream.flush();
            }
        }
    }
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    let _ = stream.write_all(format!("+{msg}\r\n").as_bytes());
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    let _ = stream.write_all(format!("-{msg}\r\n").as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut frame = format!("${}\r\n", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    let _ = stream.write_all(&frame);
}

fn write_null(stream: &mut TcpStream) {
    let _ = stream.write_all(b"$-1\r\n");
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    let _ = stream.write_all(format!(":{value}\r\n").as_bytes());
}

fn write_array_header(stream: &mut TcpStream, len: usize) {
    let _ = stream.write_all(format!("*{len}\r\n").as_bytes());
}

/// Waits until the connection reaches `state`, panicking after five seconds.
pub async fn wait_for_state(connection: &StatefulConnection, state: ConnectionState) {
    let mut rx = connection.watch_state();
    let reached = matches!(
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|current| *current == state)).await,
        Ok(Ok(_))
    );
    assert!(reached, "connection never reached {state}, last seen {}", connection.state());
}

/// Completes one PING on `connection`. A reply means the server thread
/// serving its transport has been registered for `kill_connections`.
pub async fn round_trip(connection: &StatefulConnection) {
    let ping = connection.async_view().ping().expect("ping admitted");
    match tokio::time::timeout(Duration::from_secs(5), ping).await {
        Ok(Ok(pong)) => assert_eq!(pong, "PONG"),
        other => panic!("round trip failed: {other:?}"),
    }
}

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` every 10ms until it holds, panicking after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
