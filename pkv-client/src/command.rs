//! # Commands and Completion Handles
//!
//! Purpose: Pair an encoded request with the decoder for its reply and the
//! channel that delivers the result to whoever submitted it.
//!
//! ## Design Principles
//! 1. **Single Completion**: Completing or cancelling consumes the command,
//!    so a command can reach a terminal state at most once.
//! 2. **Type Erasure at the Queue**: The dispatcher stores `Command`s of any
//!    result type; the typed decoder and sender hide behind `Completion`.
//! 3. **Cross-Task Delivery**: Results travel over `tokio::sync::oneshot`, so
//!    the awaiting side may live on any thread or task.
//! 4. **Never Silent**: Dropping an unfinished command cancels it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use pkv_common::{Request, RespValue};

use crate::error::{ClientError, ClientResult};

/// Where a command currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Admitted, waiting to be flushed to the transport.
    Queued,
    /// Flushed, waiting for its reply.
    Written,
}

trait Completion: Send {
    fn complete(self: Box<Self>, outcome: ClientResult<RespValue>);
}

struct TypedCompletion<T, F> {
    decoder: F,
    tx: oneshot::Sender<ClientResult<T>>,
}

impl<T, F> Completion for TypedCompletion<T, F>
where
    T: Send + 'static,
    F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
{
    fn complete(self: Box<Self>, outcome: ClientResult<RespValue>) {
        let TypedCompletion { decoder, tx } = *self;
        let result = outcome.and_then(|reply| match reply {
            RespValue::Error(message) => Err(ClientError::Server(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            reply => decoder(reply),
        });
        // The caller may have stopped waiting; the command still counts as done.
        let _ = tx.send(result);
    }
}

/// A request travelling through the pipeline together with its completion.
pub struct Command {
    request: Request,
    state: CommandState,
    completion: Option<Box<dyn Completion>>,
}

impl Command {
    /// Builds a command and the future that resolves with its decoded reply.
    pub fn new<T, F>(request: Request, decoder: F) -> (Command, CommandFuture<T>)
    where
        T: Send + 'static,
        F: FnOnce(RespValue) -> ClientResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command = Command {
            request,
            state: CommandState::Queued,
            completion: Some(Box::new(TypedCompletion { decoder, tx })),
        };
        (command, CommandFuture { rx })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub(crate) fn mark_written(&mut self) {
        self.state = CommandState::Written;
    }

    pub(crate) fn mark_queued(&mut self) {
        self.state = CommandState::Queued;
    }

    /// Completes the command with a decoded reply (or server error).
    pub fn complete(mut self, reply: RespValue) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Ok(reply));
        }
    }

    /// Completes the command with an error.
    pub fn fail(mut self, error: ClientError) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(error));
        }
    }

    /// Completes the command as cancelled.
    pub fn cancel(self) {
        self.fail(ClientError::Cancelled);
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(ClientError::Cancelled));
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &String::from_utf8_lossy(self.request.name()))
            .field("state", &self.state)
            .finish()
    }
}

/// Resolves once the command completes, fails or is cancelled.
///
/// Dropping the future does not cancel the command; it keeps its place in
/// the pipeline and its reply is consumed as usual.
#[derive(Debug)]
pub struct CommandFuture<T> {
    rx: oneshot::Receiver<ClientResult<T>>,
}

impl<T> CommandFuture<T> {
    /// Returns the result if the command already finished, without waiting.
    pub fn try_result(&mut self) -> Option<ClientResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::Cancelled)),
        }
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Reply decoders for the common reply shapes.
///
/// Typed command adapters pass one of these (or their own closure) to
/// `StatefulConnection::submit`.
pub mod output {
    use super::*;

    /// Keeps the raw reply.
    pub fn value(reply: RespValue) -> ClientResult<RespValue> {
        Ok(reply)
    }

    /// Status reply (`+OK`) or bulk string as UTF-8 text.
    pub fn status(reply: RespValue) -> ClientResult<String> {
        match reply {
            RespValue::Simple(text) | RespValue::Bulk(Some(text)) => {
                Ok(String::from_utf8_lossy(&text).into_owned())
            }
            other => Err(unexpected("status", &other)),
        }
    }

    /// Integer reply.
    pub fn integer(reply: RespValue) -> ClientResult<i64> {
        match reply {
            RespValue::Integer(value) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Bulk reply, `None` for null.
    pub fn bulk(reply: RespValue) -> ClientResult<Option<Bytes>> {
        match reply {
            RespValue::Bulk(data) => Ok(data),
            other => Err(unexpected("bulk", &other)),
        }
    }

    /// Array reply, empty for a null array.
    pub fn array(reply: RespValue) -> ClientResult<Vec<RespValue>> {
        match reply {
            RespValue::Array(items) => Ok(items.unwrap_or_default()),
            other => Err(unexpected("array", &other)),
        }
    }

    fn unexpected(expected: &str, actual: &RespValue) -> ClientError {
        ClientError::UnexpectedReply(format!("expected {expected}, got {}", actual.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_with_decoded_value() {
        let (command, future) = Command::new(Request::new("INCR").arg("n"), output::integer);
        command.complete(RespValue::Integer(5));
        assert_eq!(future.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn error_reply_becomes_server_error() {
        let (command, future) = Command::new(Request::new("GET"), output::bulk);
        command.complete(RespValue::Error(Bytes::from_static(b"ERR wrong type")));
        match future.await {
            Err(ClientError::Server(message)) => assert_eq!(message, "ERR wrong type"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn decoder_mismatch_is_reported() {
        let (command, future) = Command::new(Request::new("PING"), output::integer);
        command.complete(RespValue::Simple(Bytes::from_static(b"PONG")));
        assert!(matches!(future.await, Err(ClientError::UnexpectedReply(_))));
    }

    #[tokio::test]
    async fn dropping_a_command_cancels_it() {
        let (command, future) = Command::new(Request::new("PING"), output::status);
        drop(command);
        assert!(matches!(future.await, Err(ClientError::Cancelled)));
    }

    #[test]
    fn try_result_does_not_wait() {
        let (command, mut future) = Command::new(Request::new("PING"), output::status);
        assert!(future.try_result().is_none());
        command.complete(RespValue::Simple(Bytes::from_static(b"PONG")));
        assert_eq!(future.try_result().unwrap().unwrap(), "PONG");
    }

    #[test]
    fn null_array_decodes_as_empty() {
        assert!(output::array(RespValue::Array(None)).unwrap().is_empty());
    }
}
