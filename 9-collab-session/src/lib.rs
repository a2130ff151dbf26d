//! Client-side transport and coordination layer for collaborative editing
//! sessions.
//!
//! Several authoring tools join one session server, exchange chat, negotiate
//! ownership of shared objects and draw collision-free sequence numbers,
//! without ever blocking a UI thread on the network. Each module focuses on a
//! concrete responsibility:
//!
//! - [`message`] defines the closed [`MessageType`] set, validated
//!   [`Message`] construction and the JSON line framing.
//! - [`connection`] owns the socket, performs the handshake and decodes
//!   inbound frames on a reader thread.
//! - [`multiplexer`] routes a mixed stream into per-type queues.
//! - [`client`] is the [`NetworkClient`] facade: non-blocking `read`,
//!   `broadcast`, `disconnect`, the sequence allocator and the advisory lock.
//! - [`server`] is a tokio reference server speaking the same protocol.
//! - [`chat`] and [`cli`] drive the terminal chat front-end.
//!
//! Integration tests run clients against the reference server in-process.

pub mod chat;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod multiplexer;
pub mod server;

pub use client::NetworkClient;
pub use config::{ClientConfig, ServerMode};
pub use error::{NetworkError, Result};
pub use message::{Message, MessageType, Payload};
pub use multiplexer::Multiplexer;
