//! # Command Dispatcher
//!
//! Purpose: Admit commands, hand them to the writer in submission order and
//! match decoded replies to the oldest written command.
//!
//! ## Design Principles
//! 1. **Two FIFO Queues**: `write_pending` holds admitted commands not yet
//!    flushed; `response_pending` holds flushed commands in wire order. RESP
//!    has no correlation ids, so the Nth reply belongs to the Nth write.
//! 2. **One Lock**: Admission checks, bound checks, enqueue, reset and close
//!    all happen under the same mutex, so no command can slip between a
//!    cancel pass and a new enqueue.
//! 3. **Fail Fast**: A full queue or a refusing connection is reported to the
//!    caller immediately; nothing is queued in that case.
//! 4. **Complete Outside the Lock**: Decoders and completion channels run
//!    after the queue lock is released.
//!
//! ## Queue Overview
//!
//! ```text
//! submit ──► write_pending ──drain_writes──► response_pending ──complete_next──► caller
//!                 ▲                                  │
//!                 └──────── transport_lost ──────────┘  (replayed on the next transport)
//! ```

use std::collections::VecDeque;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use pkv_common::RespValue;

use crate::command::Command;
use crate::error::{ClientError, ClientResult, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Open,
    Reject(StateError),
}

struct CommandQueue {
    write_pending: VecDeque<Command>,
    response_pending: VecDeque<Command>,
    // Replies still owed by the server for written commands that were reset.
    discard_replies: usize,
    admission: Admission,
}

impl CommandQueue {
    fn depth(&self) -> usize {
        self.write_pending.len() + self.response_pending.len()
    }

    fn take_all(&mut self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.depth());
        commands.extend(self.response_pending.drain(..));
        commands.extend(self.write_pending.drain(..));
        commands
    }
}

/// Ordered command pipeline for one logical connection.
pub struct Dispatcher {
    queue: Mutex<CommandQueue>,
    writable: Notify,
    limit: usize,
}

impl Dispatcher {
    /// Creates a dispatcher admitting at most `limit` pending commands.
    pub fn new(limit: usize) -> Self {
        Dispatcher {
            queue: Mutex::new(CommandQueue {
                write_pending: VecDeque::new(),
                response_pending: VecDeque::new(),
                discard_replies: 0,
                admission: Admission::Open,
            }),
            writable: Notify::new(),
            limit,
        }
    }

    /// Admits a command or rejects it synchronously.
    pub fn submit(&self, command: Command) -> ClientResult<()> {
        let mut queue = self.queue.lock();
        if let Admission::Reject(reason) = queue.admission {
            return Err(reason.into());
        }
        if queue.depth() >= self.limit {
            return Err(ClientError::QueueOverflow { limit: self.limit });
        }

        queue.write_pending.push_back(command);
        drop(queue);
        self.writable.notify_one();
        Ok(())
    }

    /// Waits until new commands may be ready for writing.
    pub async fn writable(&self) {
        self.writable.notified().await;
    }

    /// Encodes every queued command into `out` and moves it to
    /// `response_pending`. Returns the number of commands drained.
    pub fn drain_writes(&self, out: &mut BytesMut) -> usize {
        let mut queue = self.queue.lock();
        let queue = &mut *queue;
        let mut drained = 0;
        while let Some(mut command) = queue.write_pending.pop_front() {
            command.request().encode(out);
            command.mark_written();
            queue.response_pending.push_back(command);
            drained += 1;
        }
        drained
    }

    /// Matches one decoded reply to the oldest written command.
    pub fn complete_next(&self, reply: RespValue) {
        let command = {
            let mut queue = self.queue.lock();
            if queue.discard_replies > 0 {
                queue.discard_replies -= 1;
                debug!(remaining = queue.discard_replies, "dropping reply owed to a reset command");
                return;
            }
            queue.response_pending.pop_front()
        };

        match command {
            Some(command) => command.complete(reply),
            None => warn!(kind = reply.kind(), "received reply with no pending command"),
        }
    }

    /// Fails the oldest written command with `error`, used when its reply
    /// could not be decoded. Returns false when the broken reply was owed to
    /// a reset command or nothing was in flight.
    pub fn fail_next(&self, error: ClientError) -> bool {
        let command = {
            let mut queue = self.queue.lock();
            if queue.discard_replies > 0 {
                queue.discard_replies -= 1;
                return false;
            }
            queue.response_pending.pop_front()
        };

        match command {
            Some(command) => {
                command.fail(error);
                true
            }
            None => false,
        }
    }

    /// Cancels every pending command and leaves the pipeline accepting work.
    ///
    /// Commands already written still have replies on the way; those replies
    /// are dropped when they arrive so later commands stay matched.
    pub fn reset(&self) -> usize {
        let cancelled = {
            let mut queue = self.queue.lock();
            let in_flight = queue.response_pending.len();
            queue.discard_replies += in_flight;
            queue.take_all()
        };

        let count = cancelled.len();
        if count > 0 {
            debug!(count, "reset cancelled pending commands");
        }
        for command in cancelled {
            command.cancel();
        }
        count
    }

    /// Cancels everything and refuses all further work.
    pub fn close(&self) -> usize {
        let cancelled = {
            let mut queue = self.queue.lock();
            queue.admission = Admission::Reject(StateError::Closed);
            queue.discard_replies = 0;
            queue.take_all()
        };

        let count = cancelled.len();
        for command in cancelled {
            command.cancel();
        }
        count
    }

    /// Fails everything pending with `reason` and refuses further work.
    ///
    /// A closed dispatcher stays closed.
    pub fn reject(&self, reason: StateError) -> usize {
        let failed = {
            let mut queue = self.queue.lock();
            if queue.admission != Admission::Reject(StateError::Closed) {
                queue.admission = Admission::Reject(reason);
            }
            queue.discard_replies = 0;
            queue.take_all()
        };

        let count = failed.len();
        for command in failed {
            command.fail(ClientError::State(reason));
        }
        count
    }

    /// Moves written commands back in front of the write queue after the
    /// transport carrying them went away, preserving their order.
    pub fn transport_lost(&self) -> usize {
        let mut queue = self.queue.lock();
        let queue = &mut *queue;
        queue.discard_replies = 0;

        let requeued = queue.response_pending.len();
        while let Some(mut command) = queue.response_pending.pop_back() {
            command.mark_queued();
            queue.write_pending.push_front(command);
        }
        requeued
    }

    /// Total of queued and in-flight commands.
    pub fn depth(&self) -> usize {
        self.queue.lock().depth()
    }

    /// Queued and in-flight counts, for diagnostics.
    pub fn pending_counts(&self) -> (usize, usize) {
        let queue = self.queue.lock();
        (queue.write_pending.len(), queue.response_pending.len())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use pkv_common::{Request, RespError};

    use crate::command::{output, CommandFuture};

    fn echo(dispatcher: &Dispatcher, text: &str) -> CommandFuture<String> {
        let (command, future) = Command::new(Request::new("ECHO").arg(text), output::status);
        dispatcher.submit(command).unwrap();
        future
    }

    fn simple(text: &'static str) -> RespValue {
        RespValue::Simple(Bytes::from_static(text.as_bytes()))
    }

    #[tokio::test]
    async fn replies_complete_in_write_order() {
        let dispatcher = Dispatcher::new(16);
        let first = echo(&dispatcher, "a");
        let second = echo(&dispatcher, "b");

        let mut out = BytesMut::new();
        assert_eq!(dispatcher.drain_writes(&mut out), 2);
        assert!(out.starts_with(b"*2\r\n$4\r\nECHO\r\n$1\r\na\r\n"));
        assert_eq!(dispatcher.pending_counts(), (0, 2));

        dispatcher.complete_next(simple("a"));
        dispatcher.complete_next(simple("b"));
        assert_eq!(first.await.unwrap(), "a");
        assert_eq!(second.await.unwrap(), "b");
        assert_eq!(dispatcher.depth(), 0);
    }

    #[tokio::test]
    async fn overflow_rejects_without_touching_queue() {
        let dispatcher = Dispatcher::new(2);
        let mut first = echo(&dispatcher, "1");
        let _second = echo(&dispatcher, "2");

        let (command, _future) = Command::new(Request::new("PING"), output::status);
        let err = dispatcher.submit(command).unwrap_err();
        assert!(matches!(err, ClientError::QueueOverflow { limit: 2 }));
        assert_eq!(dispatcher.depth(), 2);
        assert!(first.try_result().is_none());
    }

    #[tokio::test]
    async fn in_flight_commands_count_towards_the_limit() {
        let dispatcher = Dispatcher::new(1);
        let _first = echo(&dispatcher, "1");
        dispatcher.drain_writes(&mut BytesMut::new());

        let (command, _future) = Command::new(Request::new("PING"), output::status);
        assert!(matches!(
            dispatcher.submit(command),
            Err(ClientError::QueueOverflow { .. })
        ));
    }

    #[tokio::test]
    async fn reset_cancels_and_skips_owed_replies() {
        let dispatcher = Dispatcher::new(16);
        let written = echo(&dispatcher, "old");
        dispatcher.drain_writes(&mut BytesMut::new());
        let queued = echo(&dispatcher, "queued");

        assert_eq!(dispatcher.reset(), 2);
        assert!(written.await.unwrap_err().is_cancelled());
        assert!(queued.await.unwrap_err().is_cancelled());

        let fresh = echo(&dispatcher, "fresh");
        dispatcher.drain_writes(&mut BytesMut::new());
        dispatcher.complete_next(simple("old"));
        dispatcher.complete_next(simple("fresh"));
        assert_eq!(fresh.await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn close_cancels_and_rejects() {
        let dispatcher = Dispatcher::new(16);
        let pending = echo(&dispatcher, "x");
        assert_eq!(dispatcher.close(), 1);
        assert!(pending.await.unwrap_err().is_cancelled());

        let (command, _future) = Command::new(Request::new("PING"), output::status);
        assert!(matches!(
            dispatcher.submit(command),
            Err(ClientError::State(StateError::Closed))
        ));

        dispatcher.reject(StateError::DisconnectedReconnectDisabled);
        let (command, _future) = Command::new(Request::new("PING"), output::status);
        assert!(matches!(
            dispatcher.submit(command),
            Err(ClientError::State(StateError::Closed))
        ));
    }

    #[tokio::test]
    async fn reject_fails_pending_with_state_error() {
        let dispatcher = Dispatcher::new(16);
        let pending = echo(&dispatcher, "x");
        dispatcher.reject(StateError::DisconnectedReconnectDisabled);
        assert!(matches!(
            pending.await,
            Err(ClientError::State(StateError::DisconnectedReconnectDisabled))
        ));
    }

    #[tokio::test]
    async fn undecodable_reply_fails_only_the_oldest_written_command() {
        let dispatcher = Dispatcher::new(16);
        let first = echo(&dispatcher, "1");
        let second = echo(&dispatcher, "2");
        dispatcher.drain_writes(&mut BytesMut::new());

        assert!(dispatcher.fail_next(RespError::InvalidFirstByte(b'@').into()));
        assert_eq!(dispatcher.transport_lost(), 1);
        assert!(matches!(
            first.await,
            Err(ClientError::Protocol(RespError::InvalidFirstByte(b'@')))
        ));

        dispatcher.drain_writes(&mut BytesMut::new());
        dispatcher.complete_next(simple("2"));
        assert_eq!(second.await.unwrap(), "2");
    }

    #[tokio::test]
    async fn undecodable_reply_owed_to_a_reset_command_fails_nothing() {
        let dispatcher = Dispatcher::new(16);
        let _old = echo(&dispatcher, "old");
        dispatcher.drain_writes(&mut BytesMut::new());
        dispatcher.reset();
        let fresh = echo(&dispatcher, "fresh");
        dispatcher.drain_writes(&mut BytesMut::new());

        assert!(!dispatcher.fail_next(RespError::InvalidLength.into()));
        assert_eq!(dispatcher.pending_counts(), (0, 1));
        dispatcher.complete_next(simple("fresh"));
        assert_eq!(fresh.await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn transport_loss_replays_written_commands_first() {
        let dispatcher = Dispatcher::new(16);
        let first = echo(&dispatcher, "1");
        let second = echo(&dispatcher, "2");
        dispatcher.drain_writes(&mut BytesMut::new());
        let third = echo(&dispatcher, "3");

        assert_eq!(dispatcher.transport_lost(), 2);
        assert_eq!(dispatcher.pending_counts(), (3, 0));

        let mut out = BytesMut::new();
        dispatcher.drain_writes(&mut out);
        let mut expected = BytesMut::new();
        for text in ["1", "2", "3"] {
            Request::new("ECHO").arg(text).encode(&mut expected);
        }
        assert_eq!(out, expected);

        for text in ["1", "2", "3"] {
            dispatcher.complete_next(RespValue::Simple(Bytes::from(text)));
        }
        assert_eq!(first.await.unwrap(), "1");
        assert_eq!(second.await.unwrap(), "2");
        assert_eq!(third.await.unwrap(), "3");
    }
}
