use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session server, accepting local TCP connections.
    Server(ServerArgs),
    /// Join a session and chat from the terminal.
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// User name announced in the handshake and stamped on every message.
    #[arg(long)]
    pub name: String,

    /// `host:port` of the session server.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: String,

    /// How often to poll for new messages, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
}
