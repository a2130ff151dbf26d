use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast, watch},
};
use tracing::{debug, info, warn};

use crate::message::{Message, MessageType, Payload, write_message};

/// Sender identity on every message the server originates.
pub const SERVER_NAME: &str = "server";
/// Lock response token meaning somebody else holds the lease.
pub const LOCK_DENIED: &str = "DENIED";
/// Width of the sequence range handed to each client.
pub const SEQUENCE_BLOCK: i64 = 1 << 32;

const LOCK_LEASE: Duration = Duration::from_secs(30);

type ClientId = u64;

/// Reference implementation of the session server the client talks to.
pub struct SessionServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl SessionServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown` resolves, then closes every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let SessionServer { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &ServerState) {
    info!("server shutting down");
    state.shutdown.send_replace(true);
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &Arc<ServerState>) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: ClientId,
    message: Message,
}

struct Lease {
    holder: ClientId,
    expires_at: Instant,
}

struct ServerState {
    clients: Mutex<HashMap<ClientId, String>>,
    locks: Mutex<HashMap<i64, Lease>>,
    broadcaster: broadcast::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    next_block: AtomicI64,
}

impl ServerState {
    fn new() -> Self {
        // Slow sessions fall behind after this many broadcasts and get a warning.
        let (broadcaster, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            clients: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            broadcaster,
            shutdown,
            next_id: AtomicU64::new(1),
            next_block: AtomicI64::new(0),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_client(&self, id: ClientId, name: &str) -> bool {
        let mut clients = self.clients.lock().await;
        if clients.values().any(|existing| existing == name) {
            return false;
        }
        clients.insert(id, name.to_string());
        true
    }

    async fn remove_client(&self, id: ClientId) -> Option<String> {
        self.clients.lock().await.remove(&id)
    }

    fn allocate_sequence_block(&self) -> i64 {
        self.next_block.fetch_add(1, Ordering::Relaxed) * SEQUENCE_BLOCK
    }

    /// Grants the lease on `id` unless another live client holds it.
    async fn try_lock(&self, id: i64, client: ClientId) -> String {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        if let Some(lease) = locks.get(&id) {
            if lease.holder != client && lease.expires_at > now {
                return LOCK_DENIED.to_string();
            }
        }
        locks.insert(
            id,
            Lease {
                holder: client,
                expires_at: now + LOCK_LEASE,
            },
        );
        nanoid::nanoid!()
    }

    async fn unlock(&self, id: i64, client: ClientId) -> bool {
        let mut locks = self.locks.lock().await;
        match locks.get(&id) {
            Some(lease) if lease.holder == client => {
                locks.remove(&id);
                true
            }
            _ => false,
        }
    }

    async fn release_all(&self, client: ClientId) {
        self.locks
            .lock()
            .await
            .retain(|_, lease| lease.holder != client);
    }

    fn broadcast(&self, origin: ClientId, message: Message) {
        // An error only means no session is subscribed right now.
        if self.broadcaster.send(Envelope { origin, message }).is_err() {
            debug!("no sessions to broadcast to");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcaster.subscribe()
    }
}

/// Builds a server-originated message. Payload shapes here are fixed, so a
/// failure is reported as an I/O error on the session.
fn server_message(kind: MessageType, payload: impl Into<Payload>) -> io::Result<Message> {
    kind.build(SERVER_NAME, payload)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let name = perform_handshake(&mut lines, &mut writer).await?;

    let client_id = state.next_id();
    if !state.register_client(client_id, &name).await {
        let refusal = server_message(MessageType::Error, format!("name '{name}' is already in use"))?;
        write_message(&mut writer, &refusal).await?;
        anyhow::bail!("name already taken");
    }

    let session = Session {
        state: &state,
        id: client_id,
        name: &name,
    };
    let outcome = session.serve(peer, &mut lines, &mut writer).await;
    cleanup_client_disconnect(&state, client_id, peer).await;

    outcome
}

async fn perform_handshake<R, W>(lines: &mut Lines<R>, writer: &mut W) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = match next_frame(lines).await? {
        Some(message) => message,
        None => anyhow::bail!("connection closed before handshake"),
    };

    let name = match (hello.kind(), hello.text()) {
        (MessageType::Hello, Some(name)) => name.trim().to_string(),
        _ => {
            let refusal = server_message(MessageType::Error, "expected hello message first")?;
            write_message(writer, &refusal).await?;
            anyhow::bail!("expected hello message first");
        }
    };

    if name.is_empty() {
        let refusal = server_message(MessageType::Error, "name cannot be empty")?;
        write_message(writer, &refusal).await?;
        anyhow::bail!("name cannot be empty");
    }

    Ok(name)
}

/// Reads the next non-blank line as a message. `Lines::next_line` is cancel
/// safe, so this can sit in a `select!` next to the broadcast receiver.
async fn next_frame<R>(lines: &mut Lines<R>) -> io::Result<Option<Message>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message = serde_json::from_str(trimmed)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        return Ok(Some(message));
    }
    Ok(None)
}

struct Session<'a> {
    state: &'a ServerState,
    id: ClientId,
    name: &'a str,
}

impl Session<'_> {
    async fn serve<R, W>(
        &self,
        peer: Option<SocketAddr>,
        lines: &mut Lines<R>,
        writer: &mut W,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Subscribe before the welcome so nothing broadcast after it is missed.
        let mut inbox = self.state.subscribe();
        let mut shutdown = self.state.shutdown.subscribe();
        let welcome = server_message(MessageType::Welcome, self.name)?;
        write_message(writer, &welcome).await?;

        info!(?peer, name = %self.name, "client joined");
        self.state
            .broadcast(self.id, server_message(MessageType::Joined, self.name)?);

        loop {
            select! {
                frame = next_frame(lines) => {
                    if !self.handle_frame(frame, writer).await? {
                        break;
                    }
                }
                envelope = inbox.recv() => {
                    if !self.handle_broadcast(envelope, writer).await? {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    let notice = server_message(MessageType::Error, "server shutting down")?;
                    let _ = write_message(writer, &notice).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame<W>(&self, frame: io::Result<Option<Message>>, writer: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let message = match frame {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                debug!(name = %self.name, error = %err, "malformed frame");
                let notice = server_message(MessageType::Error, "malformed frame")?;
                write_message(writer, &notice).await?;
                return Ok(true);
            }
            Err(err) => return Err(err.into()),
        };

        match message.kind() {
            MessageType::Chat => {
                let text = message.text().unwrap_or_default();
                if !text.trim().is_empty() {
                    // Stamp the session's own name; clients cannot speak for others.
                    let relayed = MessageType::Chat.build(self.name, text)?;
                    self.state.broadcast(self.id, relayed);
                }
            }
            MessageType::TryLock => {
                let id = message.integer().unwrap_or_default();
                let token = self.state.try_lock(id, self.id).await;
                debug!(name = %self.name, id, granted = token != LOCK_DENIED, "lock requested");
                let response = server_message(MessageType::LockResponse, token)?;
                write_message(writer, &response).await?;
            }
            MessageType::Unlock => {
                let id = message.integer().unwrap_or_default();
                let released = self.state.unlock(id, self.id).await;
                debug!(name = %self.name, id, released, "unlock requested");
            }
            MessageType::SequenceRequest => {
                let start = self.state.allocate_sequence_block();
                let response = server_message(MessageType::SequenceStart, start)?;
                write_message(writer, &response).await?;
            }
            MessageType::Disconnect => return Ok(false),
            MessageType::Hello => {
                let notice = server_message(MessageType::Error, "already connected")?;
                write_message(writer, &notice).await?;
            }
            other => {
                let notice =
                    server_message(MessageType::Error, format!("{other} is not accepted from clients"))?;
                write_message(writer, &notice).await?;
            }
        }
        Ok(true)
    }

    async fn handle_broadcast<W>(
        &self,
        envelope: std::result::Result<Envelope, broadcast::error::RecvError>,
        writer: &mut W,
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        match envelope {
            Ok(Envelope { origin, .. }) if origin == self.id => Ok(true),
            Ok(Envelope { message, .. }) => {
                if let Err(err) = write_message(writer, &message).await {
                    debug!(?err, "failed to deliver message to client");
                    return Ok(false);
                }
                Ok(true)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let warning = server_message(
                    MessageType::Error,
                    format!("you are behind by {skipped} messages; consider reconnecting"),
                )?;
                if let Err(err) = write_message(writer, &warning).await {
                    debug!(?err, "failed to notify client about lag");
                    return Ok(false);
                }
                Ok(true)
            }
            Err(broadcast::error::RecvError::Closed) => Ok(false),
        }
    }
}

async fn cleanup_client_disconnect(state: &ServerState, client_id: ClientId, peer: Option<SocketAddr>) {
    state.release_all(client_id).await;
    if let Some(name) = state.remove_client(client_id).await {
        info!(?peer, %name, "client disconnected");
        match server_message(MessageType::Left, name) {
            Ok(left) => state.broadcast(client_id, left),
            Err(err) => warn!(error = %err, "failed to build departure notice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_rejects_duplicate_names() {
        let state = ServerState::new();
        let id_a = state.next_id();
        assert!(state.register_client(id_a, "alice").await);
        let id_b = state.next_id();
        assert!(!state.register_client(id_b, "alice").await);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let state = ServerState::new();
        let token = state.try_lock(42, 1).await;
        assert_ne!(token, LOCK_DENIED);
        assert_eq!(state.try_lock(42, 2).await, LOCK_DENIED);

        // The holder may renew, others may not release it.
        assert_ne!(state.try_lock(42, 1).await, LOCK_DENIED);
        assert!(!state.unlock(42, 2).await);
        assert!(state.unlock(42, 1).await);

        assert_ne!(state.try_lock(42, 2).await, LOCK_DENIED);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let state = ServerState::new();
        state.locks.lock().await.insert(
            7,
            Lease {
                holder: 1,
                expires_at: Instant::now(),
            },
        );
        assert_ne!(state.try_lock(7, 2).await, LOCK_DENIED);
    }

    #[tokio::test]
    async fn departing_client_releases_its_locks() {
        let state = ServerState::new();
        state.try_lock(1, 1).await;
        state.try_lock(2, 1).await;
        state.try_lock(3, 2).await;

        state.release_all(1).await;

        assert_ne!(state.try_lock(1, 3).await, LOCK_DENIED);
        assert_ne!(state.try_lock(2, 3).await, LOCK_DENIED);
        assert_eq!(state.try_lock(3, 3).await, LOCK_DENIED);
    }

    #[test]
    fn sequence_blocks_are_disjoint() {
        let state = ServerState::new();
        let first = state.allocate_sequence_block();
        let second = state.allocate_sequence_block();
        assert_eq!(first, 0);
        assert_eq!(second, SEQUENCE_BLOCK);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let state = ServerState::new();
        let mut rx_one = state.subscribe();
        let mut rx_two = state.subscribe();

        let joined = server_message(MessageType::Joined, "alice").expect("joined");
        state.broadcast(1, joined.clone());

        let first = rx_one.recv().await.expect("first receiver");
        let second = rx_two.recv().await.expect("second receiver");
        assert_eq!(first.message, joined);
        assert_eq!(second.origin, 1);
    }
}
