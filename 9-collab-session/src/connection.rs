//! Blocking TCP transport to the session server.
//!
//! A [`Connection`] owns its socket exclusively. Opening it performs the
//! `HELLO`/`WELCOME` handshake and then starts a reader thread that decodes
//! every inbound line into a [`Message`] and pushes it onto an unbounded
//! crossbeam channel. The reader is the only producer on that channel; when the
//! socket reaches EOF or fails, it marks the connection closed and drops the
//! sender so consumers observe the disconnect.

use std::{
    io::{self, BufReader, BufWriter},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::{NetworkError, Result},
    message::{Message, MessageType, read_frame, write_frame},
};

pub struct Connection {
    user: String,
    peer: SocketAddr,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    closed: Arc<AtomicBool>,
    inbound: Receiver<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects, announces `config.user` and waits for the server's welcome.
    ///
    /// Any failure here, including a refused handshake, is reported as
    /// [`NetworkError::ServerUnavailable`] and leaves no thread behind.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let unavailable = |reason: String| NetworkError::ServerUnavailable {
            server: config.server.clone(),
            reason,
        };

        let stream = connect(&config.server, config.connect_timeout)
            .map_err(|err| unavailable(format!("connect failed: {err}")))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| unavailable(err.to_string()))?;
        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|err| unavailable(err.to_string()))?,
        );
        let mut writer = BufWriter::new(
            stream
                .try_clone()
                .map_err(|err| unavailable(err.to_string()))?,
        );

        stream
            .set_read_timeout(Some(config.handshake_timeout))
            .map_err(|err| unavailable(err.to_string()))?;
        handshake(&mut reader, &mut writer, &config.user).map_err(unavailable)?;
        stream
            .set_read_timeout(None)
            .map_err(|err| unavailable(err.to_string()))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = unbounded();
        let reader_closed = Arc::clone(&closed);
        let handle = thread::Builder::new()
            .name(format!("collab-conn-{}", config.user))
            .spawn(move || receive_loop(reader, inbound_tx, reader_closed))
            .map_err(|err| unavailable(format!("failed to start reader thread: {err}")))?;

        info!(user = %config.user, %peer, "session opened");

        Ok(Self {
            user: config.user.clone(),
            peer,
            stream,
            writer: Mutex::new(writer),
            closed,
            inbound: inbound_rx,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Messages decoded by the reader thread, in arrival order.
    pub fn inbound(&self) -> Receiver<Message> {
        self.inbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::Transmission(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }

        let mut writer = self.writer.lock();
        if let Err(err) = write_frame(&mut *writer, message) {
            warn!(user = %self.user, error = ?err, "write failed, closing connection");
            self.shutdown_socket();
            return Err(NetworkError::Transmission(err));
        }
        Ok(())
    }

    /// Closes the socket and waits for the reader thread. Safe to call twice.
    pub fn close(&self) {
        self.shutdown_socket();
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(user = %self.user, "connection reader thread panicked");
            }
            debug!(user = %self.user, "session closed");
        }
    }

    fn shutdown_socket(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.stream.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    debug!(user = %self.user, error = ?err, "socket shutdown failed");
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect(server: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in server.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

fn handshake(
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
    user: &str,
) -> std::result::Result<(), String> {
    let hello = MessageType::Hello
        .build(user, user)
        .map_err(|err| err.to_string())?;
    write_frame(writer, &hello).map_err(|err| format!("handshake write failed: {err}"))?;

    match read_frame(reader) {
        Ok(Some(reply)) if reply.kind() == MessageType::Welcome => Ok(()),
        Ok(Some(reply)) if reply.kind() == MessageType::Error => Err(format!(
            "handshake rejected: {}",
            reply.text().unwrap_or_default()
        )),
        Ok(Some(reply)) => Err(format!("unexpected {} during handshake", reply.kind())),
        Ok(None) => Err("server closed the connection during handshake".to_string()),
        Err(err) => Err(format!("handshake read failed: {err}")),
    }
}

fn receive_loop(mut reader: BufReader<TcpStream>, inbound: Sender<Message>, closed: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader) {
            Ok(Some(message)) => {
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, "skipping malformed frame");
            }
            Err(err) => {
                // A local shutdown interrupts the read; that is a normal exit.
                if !closed.load(Ordering::Acquire) {
                    warn!(error = ?err, "connection read failed");
                }
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}
