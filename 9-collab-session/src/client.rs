//! Non-blocking session client.
//!
//! [`NetworkClient`] owns a [`Connection`] and a dedicated receiver thread. The
//! receiver moves each decoded message from the connection's channel into a
//! shared swap buffer. Callers never touch the socket on [`NetworkClient::read`]:
//! they swap the buffer out under a short lock, route what they took through
//! the [`Multiplexer`] and drain the queue for the type they asked for.
//!
//! ```text
//! socket -> reader thread -> channel -> receiver thread -> swap buffer
//!                                                              |
//!                            caller: read(kind) <- mux <- swap-+
//! ```

use std::{
    collections::VecDeque,
    mem,
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientConfig, ServerMode},
    connection::Connection,
    error::{NetworkError, Result},
    message::{Message, MessageType, Payload},
    multiplexer::Multiplexer,
};

/// Undelivered messages shared between the receiver thread and callers.
///
/// `pending` is the swap slot the receiver appends to; `mux` is only reached
/// through [`Inbox::take`].
#[derive(Default)]
struct Inbox {
    pending: Mutex<Vec<Message>>,
    mux: Mutex<Multiplexer>,
}

impl Inbox {
    fn push(&self, message: Message) {
        self.pending.lock().push(message);
    }

    fn take(&self, kind: MessageType) -> VecDeque<Message> {
        self.routed().drain(kind)
    }

    fn backlog(&self, kind: MessageType) -> usize {
        self.routed().len(kind)
    }

    /// Moves everything pending into the mux and returns it still locked.
    fn routed(&self) -> MutexGuard<'_, Multiplexer> {
        // Holding the mux while swapping keeps per-type order if two callers race.
        let mut mux = self.mux.lock();
        let arrived = mem::take(&mut *self.pending.lock());
        mux.route_all(arrived);
        mux
    }
}

/// Client-local sequence allocator state.
#[derive(Debug, Clone, Copy)]
enum Sequence {
    Unfetched,
    Next(i64),
    Exhausted,
}

pub struct NetworkClient {
    user: String,
    poll_interval: Duration,
    connection: Connection,
    inbox: Arc<Inbox>,
    sequence: Mutex<Sequence>,
    /// Lock replies still owed for requests that timed out. Holding it also
    /// serializes lock requests, since replies carry no request id.
    abandoned_lock_replies: Mutex<usize>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkClient {
    /// Connects `user` to the development server.
    pub fn connect(user: impl Into<String>) -> Result<Self> {
        Self::connect_with(ClientConfig::for_mode(user, ServerMode::Dev))
    }

    pub fn connect_with(config: ClientConfig) -> Result<Self> {
        let connection = Connection::open(&config)?;
        let inbox = Arc::new(Inbox::default());

        // On spawn failure `connection` drops here, which closes the socket.
        let receiver = spawn_receiver(&config.user, connection.inbound(), Arc::clone(&inbox))
            .map_err(|err| NetworkError::ServerUnavailable {
                server: config.server.clone(),
                reason: format!("failed to start receiver thread: {err}"),
            })?;

        Ok(Self {
            user: config.user,
            poll_interval: config.poll_interval,
            connection,
            inbox,
            sequence: Mutex::new(Sequence::Unfetched),
            abandoned_lock_replies: Mutex::new(0),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Returns every message of `kind` that arrived since the last call, oldest
    /// first. Never waits on the network.
    ///
    /// Messages of every kind are kept until someone reads that kind. Callers
    /// that ignore some traffic (presence, server errors) should still drain it
    /// now and then; [`backlog`](Self::backlog) shows what is waiting.
    pub fn read(&self, kind: MessageType) -> Result<VecDeque<Message>> {
        self.ensure_open()?;
        Ok(self.inbox.take(kind))
    }

    /// Number of undelivered messages of `kind`.
    pub fn backlog(&self, kind: MessageType) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.inbox.backlog(kind))
    }

    pub fn broadcast(&self, payload: impl Into<Payload>, kind: MessageType) -> Result<()> {
        self.ensure_open()?;
        self.sign_and_send(kind, payload)
    }

    /// Announces departure and closes the session. Does nothing once closed.
    pub fn disconnect(&self) {
        if !self.connection.is_closed() {
            match MessageType::Disconnect.build(self.user.as_str(), ()) {
                Ok(goodbye) => {
                    if let Err(err) = self.connection.send(&goodbye) {
                        debug!(user = %self.user, error = %err, "disconnect notice not delivered");
                    }
                }
                Err(err) => debug!(error = %err, "failed to build disconnect notice"),
            }
            info!(user = %self.user, "disconnecting");
        }
        self.shutdown();
    }

    /// Hands out the next collision-free sequence number.
    ///
    /// The first call asks the server for a starting value and blocks until it
    /// arrives; later calls only increment locally. Concurrent callers are
    /// serialized, so no value is returned twice. Once `i64::MAX` has been
    /// handed out, further calls fail with [`NetworkError::SequenceExhausted`].
    pub fn next_sequence_number(&self) -> Result<i64> {
        self.ensure_open()?;
        let mut sequence = self.sequence.lock();
        let value = match *sequence {
            Sequence::Next(value) => value,
            Sequence::Unfetched => self.fetch_starting_sequence()?,
            Sequence::Exhausted => return Err(NetworkError::SequenceExhausted),
        };
        *sequence = value.checked_add(1).map_or(Sequence::Exhausted, Sequence::Next);
        Ok(value)
    }

    /// Requests the lock on object `id` and waits for the server's answer.
    ///
    /// The returned token is whatever the server sent; it may encode a denial.
    /// Blocks until a response arrives or the session ends. Lock requests from
    /// several threads are answered one at a time.
    pub fn try_lock(&self, id: i64) -> Result<String> {
        self.request_lock(id, None)
    }

    /// Like [`try_lock`](Self::try_lock), but gives up with
    /// [`NetworkError::LockTimeout`] after `timeout`.
    pub fn try_lock_within(&self, id: i64, timeout: Duration) -> Result<String> {
        self.request_lock(id, Some(Instant::now() + timeout))
    }

    /// Sends a release request for `id` without waiting for the server.
    pub fn unlock(&self, id: i64) -> Result<()> {
        self.ensure_open()?;
        self.sign_and_send(MessageType::Unlock, id)
    }

    fn request_lock(&self, id: i64, deadline: Option<Instant>) -> Result<String> {
        self.ensure_open()?;
        let mut abandoned = self.abandoned_lock_replies.lock();
        debug!(user = %self.user, id, "requesting lock");
        self.sign_and_send(MessageType::TryLock, id)?;

        let reply = self.await_reply(deadline, || {
            let mut replies = self.read(MessageType::LockResponse)?;
            // Replies arrive in request order; late answers to abandoned
            // requests come first and belong to nobody.
            while *abandoned > 0 && replies.pop_front().is_some() {
                *abandoned -= 1;
                debug!(user = %self.user, "discarded late lock reply");
            }
            Ok(replies.pop_front())
        })?;

        match reply {
            Some(response) => Ok(response.text().unwrap_or_default().to_string()),
            None => {
                *abandoned += 1;
                Err(NetworkError::LockTimeout { id })
            }
        }
    }

    fn fetch_starting_sequence(&self) -> Result<i64> {
        self.sign_and_send(MessageType::SequenceRequest, ())?;
        let start = self
            .await_reply(None, || Ok(self.read(MessageType::SequenceStart)?.pop_front()))?
            .and_then(|reply| reply.integer())
            .ok_or(NetworkError::SessionExpired)?;
        debug!(user = %self.user, start, "received starting sequence number");
        Ok(start)
    }

    /// Calls `poll` until it yields a message, the deadline passes (`Ok(None)`)
    /// or the session ends.
    fn await_reply<F>(&self, deadline: Option<Instant>, mut poll: F) -> Result<Option<Message>>
    where
        F: FnMut() -> Result<Option<Message>>,
    {
        while !self.connection.is_closed() {
            if let Some(reply) = poll()? {
                return Ok(Some(reply));
            }

            let mut pause = self.poll_interval;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                pause = pause.min(remaining);
            }
            thread::sleep(pause);
        }
        Err(NetworkError::SessionExpired)
    }

    fn sign_and_send(&self, kind: MessageType, payload: impl Into<Payload>) -> Result<()> {
        let message = kind.build(self.user.as_str(), payload)?;
        match self.connection.send(&message) {
            Err(NetworkError::Transmission(_)) if self.connection.is_closed() => {
                Err(NetworkError::SessionExpired)
            }
            other => other,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection.is_closed() {
            return Err(NetworkError::SessionExpired);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.connection.close();
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(user = %self.user, "receiver thread panicked");
            }
        }
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Moves messages from the connection into the swap buffer until the
/// connection's channel disconnects.
fn spawn_receiver(
    user: &str,
    inbound: Receiver<Message>,
    inbox: Arc<Inbox>,
) -> std::io::Result<JoinHandle<()>> {
    let user = user.to_string();
    thread::Builder::new()
        .name(format!("collab-recv-{user}"))
        .spawn(move || {
            while let Ok(message) = inbound.recv() {
                inbox.push(message);
            }
            debug!(%user, "receiver stopped");
        })
}
