//! # Connection Views
//!
//! Three ways to drive the same `StatefulConnection`:
//!
//! - `SyncConnection` blocks the calling thread until the reply arrives or
//!   the connection timeout elapses. It must not be used from inside an
//!   async task; call it from plain threads while a multi-thread runtime
//!   runs the connection.
//! - `AsyncConnection` returns a `CommandFuture` per command.
//! - `PushConnection` returns lazy streams. Nothing is submitted until the
//!   stream is first polled; array replies can be streamed element by element.
//!
//! All views of a connection share its queue, state and listeners, and
//! `stateful_connection()` always returns the originating connection.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use pkv_common::{Request, RespValue};

use crate::command::{output, CommandFuture};
use crate::commands;
use crate::connection::StatefulConnection;
use crate::error::{ClientError, ClientResult};

/// Blocking view.
#[derive(Debug, Clone)]
pub struct SyncConnection {
    connection: StatefulConnection,
}

impl SyncConnection {
    pub(crate) fn new(connection: StatefulConnection) -> Self {
        SyncConnection { connection }
    }

    pub fn stateful_connection(&self) -> &StatefulConnection {
        &self.connection
    }

    /// Changes the timeout for every view of this connection.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.connection.set_timeout(timeout);
    }

    /// Submits a request and waits for its reply.
    ///
    /// On timeout the command is left in the pipeline; its reply is still
    /// consumed when it arrives, it just has no one waiting for it.
    pub fn dispatch<T, F>(&self, request: Request, decoder: F) -> ClientResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
    {
        let future = self.connection.submit(request, decoder)?;
        self.wait(future)
    }

    /// Blocks on `future` for at most the connection timeout.
    fn wait<T>(&self, future: CommandFuture<T>) -> ClientResult<T> {
        let timeout = self.connection.timeout();
        self.connection.runtime().block_on(async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout(limit)),
                },
                None => future.await,
            }
        })
    }

    pub fn ping(&self) -> ClientResult<String> {
        self.dispatch(commands::ping(), output::status)
    }

    pub fn echo(&self, message: impl AsRef<[u8]>) -> ClientResult<String> {
        self.dispatch(commands::echo(message), output::status)
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> ClientResult<Option<Bytes>> {
        self.dispatch(commands::get(key), output::bulk)
    }

    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> ClientResult<String> {
        self.dispatch(commands::set(key, value), output::status)
    }

    pub fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> ClientResult<i64> {
        self.dispatch(commands::del(keys), output::integer)
    }

    pub fn info(&self) -> ClientResult<String> {
        self.dispatch(commands::info(), output::status)
    }

    pub fn quit(&self) -> ClientResult<String> {
        let future = self.connection.quit()?;
        self.wait(future)
    }

    pub fn reset(&self) -> usize {
        self.connection.reset()
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

/// Future-returning view.
#[derive(Debug, Clone)]
pub struct AsyncConnection {
    connection: StatefulConnection,
}

impl AsyncConnection {
    pub(crate) fn new(connection: StatefulConnection) -> Self {
        AsyncConnection { connection }
    }

    pub fn stateful_connection(&self) -> &StatefulConnection {
        &self.connection
    }

    pub fn dispatch<T, F>(&self, request: Request, decoder: F) -> ClientResult<CommandFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
    {
        self.connection.submit(request, decoder)
    }

    pub fn ping(&self) -> ClientResult<CommandFuture<String>> {
        self.dispatch(commands::ping(), output::status)
    }

    pub fn echo(&self, message: impl AsRef<[u8]>) -> ClientResult<CommandFuture<String>> {
        self.dispatch(commands::echo(message), output::status)
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> ClientResult<CommandFuture<Option<Bytes>>> {
        self.dispatch(commands::get(key), output::bulk)
    }

    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> ClientResult<CommandFuture<String>> {
        self.dispatch(commands::set(key, value), output::status)
    }

    pub fn mget<K: AsRef<[u8]>>(&self, keys: &[K]) -> ClientResult<CommandFuture<Vec<RespValue>>> {
        self.dispatch(commands::mget(keys), output::array)
    }

    pub fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> ClientResult<CommandFuture<i64>> {
        self.dispatch(commands::del(keys), output::integer)
    }

    pub fn info(&self) -> ClientResult<CommandFuture<String>> {
        self.dispatch(commands::info(), output::status)
    }

    pub fn quit(&self) -> ClientResult<CommandFuture<String>> {
        self.connection.quit()
    }
}

/// Stream-returning view.
#[derive(Debug, Clone)]
pub struct PushConnection {
    connection: StatefulConnection,
}

impl PushConnection {
    pub(crate) fn new(connection: StatefulConnection) -> Self {
        PushConnection { connection }
    }

    pub fn stateful_connection(&self) -> &StatefulConnection {
        &self.connection
    }

    /// A single-item stream; the request is submitted on first poll.
    pub fn dispatch<T, F>(
        &self,
        request: Request,
        decoder: F,
    ) -> impl Stream<Item = ClientResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        stream::once(async move {
            match connection.submit(request, decoder) {
                Ok(future) => future.await,
                Err(err) => Err(err),
            }
        })
    }

    /// Streams the elements of an array reply through `element`.
    pub fn dispatch_many<T, F>(
        &self,
        request: Request,
        element: F,
    ) -> impl Stream<Item = ClientResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn(RespValue) -> ClientResult<T> + Send + 'static,
    {
        self.dispatch(request, output::array).flat_map(move |reply| {
            let items: Vec<ClientResult<T>> = match reply {
                Ok(values) => values.into_iter().map(&element).collect(),
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        })
    }

    pub fn ping(&self) -> impl Stream<Item = ClientResult<String>> + Send + 'static {
        self.dispatch(commands::ping(), output::status)
    }

    pub fn get(
        &self,
        key: impl AsRef<[u8]>,
    ) -> impl Stream<Item = ClientResult<Option<Bytes>>> + Send + 'static {
        self.dispatch(commands::get(key), output::bulk)
    }

    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> impl Stream<Item = ClientResult<String>> + Send + 'static {
        self.dispatch(commands::set(key, value), output::status)
    }

    /// Values of `keys`, one stream item per key.
    pub fn mget<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> impl Stream<Item = ClientResult<Option<Bytes>>> + Send + 'static {
        self.dispatch_many(commands::mget(keys), output::bulk)
    }
}
