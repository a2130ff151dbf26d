#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{BufReader, BufWriter},
    net::{SocketAddr, TcpListener as StdTcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use collab_session::{
    ClientConfig, Message, MessageType, NetworkClient,
    message::{read_frame, write_frame},
    server::SessionServer,
};
use tokio::{net::TcpListener, sync::oneshot};

pub const FAST_POLL: Duration = Duration::from_millis(10);
pub const WAIT: Duration = Duration::from_secs(3);

/// A reference server running on its own runtime thread.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0"))?;
        let server = SessionServer::new(listener);
        let addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::spawn(move || {
            runtime.block_on(async move {
                let shutdown = async move {
                    let _ = shutdown_rx.await;
                };
                let _ = server.run_until(shutdown).await;
                // Give sessions a moment to send their shutdown notice.
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self, user: &str) -> ClientConfig {
        ClientConfig::new(user, self.addr.to_string()).with_poll_interval(FAST_POLL)
    }

    pub fn connect(&self, user: &str) -> Result<NetworkClient> {
        Ok(NetworkClient::connect_with(self.config(user))?)
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls `read(kind)` until at least `count` messages have arrived.
pub fn wait_for(client: &NetworkClient, kind: MessageType, count: usize) -> Result<Vec<Message>> {
    let deadline = Instant::now() + WAIT;
    let mut received = Vec::new();
    while received.len() < count {
        if Instant::now() > deadline {
            return Err(anyhow!(
                "timed out waiting for {count} {kind} messages, got {}",
                received.len()
            ));
        }
        let batch: VecDeque<Message> = client.read(kind)?;
        received.extend(batch);
        thread::sleep(FAST_POLL);
    }
    Ok(received)
}

pub fn wait_until_closed(client: &NetworkClient) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while !client.is_closed() {
        if Instant::now() > deadline {
            return Err(anyhow!("client never observed the session ending"));
        }
        thread::sleep(FAST_POLL);
    }
    Ok(())
}

/// How a [`FakeServer`] reacts once the handshake is done.
#[derive(Clone, Copy)]
pub enum FakeBehavior {
    /// Answers the first `TRY_LOCK` with the given token, then idles.
    AnswerLock(&'static str),
    /// Reads the first `TRY_LOCK` and hangs up without answering.
    HangUpOnLock,
    /// Answers every `TRY_LOCK(id)` with `token-for-<id>`, holding the answer
    /// for `slow_id` back by `delay`.
    SlowLock { slow_id: i64, delay: Duration },
    /// Answers `SEQUENCE_REQUEST` with the given start.
    SequenceFrom(i64),
    /// Reads everything and never answers.
    Silent,
}

/// A single-connection server scripted at the frame level.
pub struct FakeServer {
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start(behavior: FakeBehavior) -> Result<Self> {
        let listener = StdTcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let thread = thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let _ = serve_fake(stream, behavior);
        });
        Ok(Self {
            addr,
            thread: Some(thread),
        })
    }

    pub fn config(&self, user: &str) -> ClientConfig {
        ClientConfig::new(user, self.addr.to_string()).with_poll_interval(FAST_POLL)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_fake(stream: TcpStream, behavior: FakeBehavior) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let hello = read_frame(&mut reader)?.ok_or_else(|| anyhow!("no hello"))?;
    let welcome = MessageType::Welcome.build("server", hello.text().unwrap_or_default())?;
    write_frame(&mut writer, &welcome)?;

    while let Some(frame) = read_frame(&mut reader)? {
        match (frame.kind(), behavior) {
            (MessageType::TryLock, FakeBehavior::AnswerLock(token)) => {
                let response = MessageType::LockResponse.build("server", token)?;
                write_frame(&mut writer, &response)?;
            }
            (MessageType::TryLock, FakeBehavior::HangUpOnLock) => return Ok(()),
            (MessageType::TryLock, FakeBehavior::SlowLock { slow_id, delay }) => {
                let id = frame.integer().unwrap_or_default();
                if id == slow_id {
                    thread::sleep(delay);
                }
                let response = MessageType::LockResponse.build("server", format!("token-for-{id}"))?;
                write_frame(&mut writer, &response)?;
            }
            (MessageType::SequenceRequest, FakeBehavior::SequenceFrom(start)) => {
                let response = MessageType::SequenceStart.build("server", start)?;
                write_frame(&mut writer, &response)?;
            }
            (MessageType::Disconnect, _) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}
