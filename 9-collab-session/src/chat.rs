use std::{
    collections::VecDeque,
    io::{self, BufRead},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::warn;

use crate::{
    cli::ChatArgs,
    client::NetworkClient,
    config::ClientConfig,
    error::{self, NetworkError},
    message::{Message, MessageType},
    server::LOCK_DENIED,
};

const LOCK_WAIT: Duration = Duration::from_secs(5);

const POLLED: [MessageType; 4] = [
    MessageType::Joined,
    MessageType::Chat,
    MessageType::Left,
    MessageType::Error,
];

/// Terminal-facing chat built on a shared [`NetworkClient`].
///
/// The owner is expected to call [`poll`](Self::poll) on a fixed cadence.
pub struct ChatController {
    client: Arc<NetworkClient>,
}

impl ChatController {
    pub fn new(client: Arc<NetworkClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &NetworkClient {
        &self.client
    }

    pub fn send(&self, text: &str) -> error::Result<()> {
        self.client.broadcast(text, MessageType::Chat)
    }

    /// Drains presence, chat and error traffic into display lines.
    ///
    /// If the session ends partway through, the lines already drained are
    /// returned and the next call reports the expiry.
    pub fn poll(&self) -> error::Result<Vec<String>> {
        collect_lines(|kind| self.client.read(kind))
    }
}

fn collect_lines<F>(mut read: F) -> error::Result<Vec<String>>
where
    F: FnMut(MessageType) -> error::Result<VecDeque<Message>>,
{
    let mut lines = Vec::new();
    for kind in POLLED {
        match read(kind) {
            Ok(batch) => lines.extend(batch.iter().filter_map(render)),
            Err(err) if err.is_session_expired() && !lines.is_empty() => break,
            Err(err) => return Err(err),
        }
    }
    Ok(lines)
}

pub fn render(message: &Message) -> Option<String> {
    let text = message.text()?;
    match message.kind() {
        MessageType::Chat => Some(format!("<{}> {text}", message.sender())),
        MessageType::Joined => Some(format!("*** {text} joined the chat")),
        MessageType::Left => Some(format!("*** {text} left the chat")),
        MessageType::Error => Some(format!("!!! {text}")),
        _ => None,
    }
}

pub fn run(args: ChatArgs) -> Result<()> {
    let poll_interval = Duration::from_millis(args.poll_ms);
    let config = ClientConfig::new(&args.name, &args.server).with_poll_interval(poll_interval);
    let client = NetworkClient::connect_with(config)
        .with_context(|| format!("failed to join session at {}", args.server))?;
    let controller = ChatController::new(Arc::new(client));
    println!("*** connected as {}", controller.client().user());

    let input = spawn_stdin_reader()?;
    let outcome = run_chat_loop(&controller, &input, poll_interval);
    controller.client().disconnect();

    outcome
}

fn run_chat_loop(controller: &ChatController, input: &Receiver<String>, poll: Duration) -> Result<()> {
    loop {
        match controller.poll() {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
            }
            Err(err) if err.is_session_expired() => {
                println!("*** server closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // Waiting on stdin doubles as the poll delay.
        match input.recv_timeout(poll) {
            Ok(line) => {
                if !handle_input(controller, &line)? {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Blank,
    Quit,
    Lock(i64),
    Unlock(i64),
    Sequence,
    Say(&'a str),
    Usage(&'static str),
}

fn parse_input(line: &str) -> Input<'_> {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return Input::Blank;
    }
    if !text.starts_with('/') {
        return Input::Say(text);
    }

    let mut words = text.split_whitespace();
    let command = words.next().unwrap_or_default().to_ascii_lowercase();
    let id = words.next().and_then(|word| word.parse::<i64>().ok());
    match (command.as_str(), id) {
        ("/quit", _) => Input::Quit,
        ("/seq", _) => Input::Sequence,
        ("/lock", Some(id)) => Input::Lock(id),
        ("/unlock", Some(id)) => Input::Unlock(id),
        ("/lock", None) => Input::Usage("usage: /lock <id>"),
        ("/unlock", None) => Input::Usage("usage: /unlock <id>"),
        _ => Input::Usage("commands: /lock <id>, /unlock <id>, /seq, /quit"),
    }
}

fn handle_input(controller: &ChatController, line: &str) -> Result<bool> {
    let client = controller.client();
    let outcome = match parse_input(line) {
        Input::Blank => return Ok(true),
        Input::Quit => {
            println!("*** leaving chat");
            return Ok(false);
        }
        Input::Usage(usage) => {
            println!("!!! {usage}");
            return Ok(true);
        }
        Input::Say(text) => controller.send(text).map(|()| {
            // The server relays chat to the other participants only.
            format!("<{}> {text}", client.user())
        }),
        Input::Lock(id) => client.try_lock_within(id, LOCK_WAIT).map(|token| {
            if token == LOCK_DENIED {
                format!("*** lock {id} denied")
            } else {
                format!("*** lock {id} granted")
            }
        }),
        Input::Unlock(id) => client.unlock(id).map(|()| format!("*** unlock {id} sent")),
        Input::Sequence => client
            .next_sequence_number()
            .map(|value| format!("*** sequence {value}")),
    };

    match outcome {
        Ok(line) => {
            println!("{line}");
            Ok(true)
        }
        Err(err) if err.is_session_expired() => {
            println!("*** server closed the connection");
            Ok(false)
        }
        Err(err @ NetworkError::LockTimeout { .. }) => {
            println!("!!! {err}");
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("chat-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(?error, "failed to read stdin");
                        break;
                    }
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}
