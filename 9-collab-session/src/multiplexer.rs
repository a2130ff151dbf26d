use std::collections::{HashMap, VecDeque};

use crate::message::{Message, MessageType};

/// Splits one inbound stream into per-type queues.
///
/// Arrival order is preserved within a type; nothing is promised across types.
#[derive(Debug, Default)]
pub struct Multiplexer {
    queues: HashMap<MessageType, VecDeque<Message>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, message: Message) {
        self.queues
            .entry(message.kind())
            .or_default()
            .push_back(message);
    }

    pub fn route_all<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        for message in messages {
            self.route(message);
        }
    }

    /// Hands over every queued message of `kind` and leaves that queue empty.
    ///
    /// Taking the queue out of the map is the read and the clear in one step.
    pub fn drain(&mut self, kind: MessageType) -> VecDeque<Message> {
        self.queues.remove(&kind).unwrap_or_default()
    }

    pub fn len(&self, kind: MessageType) -> usize {
        self.queues.get(&kind).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(sender: &str, text: &str) -> Message {
        MessageType::Chat.build(sender, text).expect("chat")
    }

    #[test]
    fn drain_returns_messages_in_arrival_order() {
        let mut mux = Multiplexer::new();
        mux.route_all([chat("alice", "one"), chat("bob", "two"), chat("alice", "three")]);

        let texts: Vec<_> = mux
            .drain(MessageType::Chat)
            .iter()
            .map(|m| m.text().unwrap_or_default().to_string())
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[test]
    fn drain_empties_only_the_requested_type() {
        let mut mux = Multiplexer::new();
        mux.route(chat("alice", "hi"));
        mux.route(MessageType::LockResponse.build("server", "token").expect("lock"));

        assert_eq!(mux.drain(MessageType::Chat).len(), 1);
        assert!(mux.drain(MessageType::Chat).is_empty());
        assert_eq!(mux.len(MessageType::LockResponse), 1);
        assert!(!mux.is_empty());

        mux.drain(MessageType::LockResponse);
        assert!(mux.is_empty());
    }

    #[test]
    fn draining_an_unseen_type_yields_nothing() {
        let mut mux = Multiplexer::new();
        assert!(mux.drain(MessageType::Joined).is_empty());
    }
}
