//! Request builders for the handful of commands the connection itself needs.
//!
//! Full typed command sets are built on top of `StatefulConnection::submit`
//! by adapter crates; only the commands used for activation, diagnostics and
//! the convenience methods on the views live here.

use pkv_common::Request;

pub fn ping() -> Request {
    Request::new("PING")
}

pub fn echo(message: impl AsRef<[u8]>) -> Request {
    Request::new("ECHO").arg(message)
}

pub fn auth(password: impl AsRef<[u8]>) -> Request {
    Request::new("AUTH").arg(password)
}

pub fn select(database: u32) -> Request {
    Request::new("SELECT").arg_int(i64::from(database))
}

pub fn get(key: impl AsRef<[u8]>) -> Request {
    Request::new("GET").arg(key)
}

pub fn set(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Request {
    Request::new("SET").arg(key).arg(value)
}

pub fn mget<K: AsRef<[u8]>>(keys: &[K]) -> Request {
    keys.iter().fold(Request::new("MGET"), |request, key| request.arg(key))
}

pub fn del<K: AsRef<[u8]>>(keys: &[K]) -> Request {
    keys.iter().fold(Request::new("DEL"), |request, key| request.arg(key))
}

pub fn info() -> Request {
    Request::new("INFO")
}

pub fn quit() -> Request {
    Request::new("QUIT")
}
