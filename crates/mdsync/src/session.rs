use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{SyncError, SyncResult};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// The server could not make an update durable
pub const CLOSE_PERSISTENCE_FAILURE: u16 = 1011;

/// Frame pushed from a document actor to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Server side of one real-time connection.
///
/// The transport keeps the receiving half and forwards frames to the
/// client; the actor only ever sends or closes.
#[derive(Debug, Clone)]
pub struct Channel {
    document_id: String,
    tx: mpsc::UnboundedSender<ChannelFrame>,
}

impl Channel {
    /// Create a channel opened for `document_id` and its receiving half
    pub fn pair(
        document_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            document_id: document_id.into(),
            tx,
        };
        (channel, rx)
    }

    /// Document the connection was opened for
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn send(&self, data: Vec<u8>) -> SyncResult<()> {
        self.tx
            .send(ChannelFrame::Binary(data))
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Ask the transport to close the connection; errors are ignored
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(ChannelFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identifier of a session within one document actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered channel plus the awareness client ids it publishes
#[derive(Debug)]
pub struct Session {
    pub channel: Channel,
    pub controlled: HashSet<u64>,
}

/// Connected sessions of one document
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: u64,
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under a fresh id
    pub fn register(&mut self, channel: Channel) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(
            id,
            Session {
                channel,
                controlled: HashSet::new(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and return every session
    pub fn drain(&mut self) -> Vec<(SessionId, Session)> {
        self.sessions.drain().collect()
    }

    /// Send a frame to one session
    pub fn send_to(&self, id: SessionId, frame: Vec<u8>) {
        if let Some(session) = self.sessions.get(&id) {
            if session.channel.send(frame).is_err() {
                debug!("Dropping frame for closed session {}", id);
            }
        }
    }

    /// Send a frame to every session but `except`
    pub fn broadcast(&self, frame: &[u8], except: Option<SessionId>) {
        for (id, session) in &self.sessions {
            if Some(*id) == except {
                continue;
            }
            if session.channel.send(frame.to_vec()).is_err() {
                debug!("Dropping broadcast for closed session {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocates_fresh_ids() {
        let mut registry = SessionRegistry::new();
        let (a, _rx_a) = Channel::pair("doc");
        let (b, _rx_b) = Channel::pair("doc");

        let first = registry.register(a);
        let second = registry.register(b);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(first).is_some());
        assert!(registry.remove(first).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut registry = SessionRegistry::new();
        let (a, mut rx_a) = Channel::pair("doc");
        let (b, mut rx_b) = Channel::pair("doc");
        let sender = registry.register(a);
        registry.register(b);

        registry.broadcast(&[1, 2], Some(sender));

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), ChannelFrame::Binary(vec![1, 2]));
    }

    #[test]
    fn test_closed_channel_is_detected() {
        let (channel, rx) = Channel::pair("doc");
        assert!(!channel.is_closed());
        drop(rx);
        assert!(channel.is_closed());
        assert!(matches!(channel.send(vec![1]), Err(SyncError::ChannelClosed)));
        channel.close(CLOSE_NORMAL, "bye");
    }
}
