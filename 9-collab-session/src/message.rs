use std::{
    fmt,
    io::{self, BufRead, Write},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// The closed set of protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    Welcome,
    Error,
    Chat,
    Joined,
    Left,
    TryLock,
    Unlock,
    LockResponse,
    SequenceRequest,
    SequenceStart,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Empty,
    Integer,
    Text,
}

impl MessageType {
    fn shape(self) -> Shape {
        match self {
            MessageType::SequenceRequest | MessageType::Disconnect => Shape::Empty,
            MessageType::TryLock | MessageType::Unlock | MessageType::SequenceStart => {
                Shape::Integer
            }
            MessageType::Hello
            | MessageType::Welcome
            | MessageType::Error
            | MessageType::Chat
            | MessageType::Joined
            | MessageType::Left
            | MessageType::LockResponse => Shape::Text,
        }
    }

    /// Builds a message of this kind, rejecting payloads of the wrong shape.
    pub fn build(self, sender: impl Into<String>, payload: impl Into<Payload>) -> Result<Message> {
        let sender = sender.into();
        let payload = payload.into();

        if sender.trim().is_empty() {
            return Err(NetworkError::MessageConstruction {
                kind: self,
                reason: "sender must not be empty",
            });
        }

        let reason = match (self.shape(), &payload) {
            (Shape::Empty, Payload::Empty)
            | (Shape::Integer, Payload::Integer(_))
            | (Shape::Text, Payload::Text(_)) => None,
            (Shape::Empty, _) => Some("expected no payload"),
            (Shape::Integer, _) => Some("expected an integer payload"),
            (Shape::Text, _) => Some("expected a text payload"),
        };
        if let Some(reason) = reason {
            return Err(NetworkError::MessageConstruction { kind: self, reason });
        }

        Ok(Message {
            sender,
            kind: self,
            payload,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Error => "ERROR",
            MessageType::Chat => "CHAT",
            MessageType::Joined => "JOINED",
            MessageType::Left => "LEFT",
            MessageType::TryLock => "TRY_LOCK",
            MessageType::Unlock => "UNLOCK",
            MessageType::LockResponse => "LOCK_RESPONSE",
            MessageType::SequenceRequest => "SEQUENCE_REQUEST",
            MessageType::SequenceStart => "SEQUENCE_START",
            MessageType::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    Empty,
    Integer(i64),
    Text(String),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<()> for Payload {
    fn from((): ()) -> Self {
        Payload::Empty
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Integer(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

/// An immutable, validated protocol message.
///
/// Only [`MessageType::build`] creates messages; frames read off the wire pass
/// through the same validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Frame", into = "Frame")]
pub struct Message {
    sender: String,
    kind: MessageType,
    payload: Payload,
}

impl Message {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn integer(&self) -> Option<i64> {
        match self.payload {
            Payload::Integer(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Frame {
    sender: String,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    payload: Payload,
}

impl TryFrom<Frame> for Message {
    type Error = NetworkError;

    fn try_from(frame: Frame) -> Result<Self> {
        frame.kind.build(frame.sender, frame.payload)
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame {
            sender: message.sender,
            kind: message.kind,
            payload: message.payload,
        }
    }
}

/// Reads the next JSON line from a blocking reader. `Ok(None)` means EOF.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<Message>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> io::Result<()> {
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded)?;
    writer.flush()
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Line-oriented framing keeps the protocol readable with netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
