//! In-memory loopback for the push channel
//!
//! [`MemoryConnector`] hands out sessions backed by channels; the paired
//! [`MemoryServer`] pushes frames into the current session, drops it to
//! simulate a disconnect, refuses connections or control messages and
//! records what the client sent. Useful for offline demos and for exercising reconnect behaviour.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use taplive_core::{ClientMessage, LiveError, Result};
use tokio::sync::mpsc;

use crate::transport::{Connector, Transport};

#[derive(Default)]
struct Shared {
    refuse: bool,
    reject_sends: bool,
    connects: usize,
    tokens: Vec<String>,
    session: Option<mpsc::UnboundedSender<String>>,
    received: Vec<ClientMessage>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of the loopback
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
}

/// Server side of the loopback
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryConnector {
    /// Create a connector and the server handle that drives it
    pub fn pair() -> (Self, MemoryServer) {
        let connector = Self::default();
        let server = MemoryServer {
            shared: Arc::clone(&connector.shared),
        };
        (connector, server)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, auth_token: &str) -> Result<Box<dyn Transport>> {
        let mut shared = lock(&self.shared);
        shared.connects += 1;
        shared.tokens.push(auth_token.to_string());
        if shared.refuse {
            return Err(LiveError::Transport("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.session = Some(tx);
        Ok(Box::new(MemoryTransport {
            inbound: rx,
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl MemoryServer {
    /// Deliver a text frame to the open session. False if none is open.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        match &lock(&self.shared).session {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Close the open session from the server side
    pub fn drop_session(&self) {
        lock(&self.shared).session = None;
    }

    /// Refuse (or accept again) new connections
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.shared).refuse = refuse;
    }

    /// Fail (or accept again) control messages on every session
    pub fn set_reject_sends(&self, reject: bool) {
        lock(&self.shared).reject_sends = reject;
    }

    /// Whether a client currently holds an open session
    pub fn is_open(&self) -> bool {
        lock(&self.shared)
            .session
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Number of connection attempts so far
    pub fn connects(&self) -> usize {
        lock(&self.shared).connects
    }

    /// Tokens presented on each attempt
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.shared).tokens.clone()
    }

    /// Control messages received, oldest first
    pub fn received(&self) -> Vec<ClientMessage> {
        lock(&self.shared).received.clone()
    }
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.reject_sends {
            return Err(LiveError::Transport("send rejected".to_string()));
        }
        shared.received.push(message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_reaches_open_session() {
        let (connector, server) = MemoryConnector::pair();
        assert!(!server.push("nobody home"));

        let mut transport = connector.connect("token").await.unwrap();
        assert!(server.is_open());
        assert!(server.push("hello"));
        assert_eq!(transport.recv().await.unwrap().unwrap(), "hello");

        server.drop_session();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (connector, server) = MemoryConnector::pair();
        server.set_refuse(true);
        assert!(connector.connect("token").await.is_err());
        assert_eq!(server.connects(), 1);
        assert_eq!(server.tokens(), vec!["token".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_send_is_not_recorded() {
        let (connector, server) = MemoryConnector::pair();
        let mut transport = connector.connect("token").await.unwrap();
        server.set_reject_sends(true);
        assert!(transport
            .send(&ClientMessage::Subscribe { event_id: 1 })
            .await
            .is_err());
        assert!(server.received().is_empty());

        server.set_reject_sends(false);
        transport
            .send(&ClientMessage::Subscribe { event_id: 2 })
            .await
            .unwrap();
        assert_eq!(server.received(), vec![ClientMessage::Subscribe { event_id: 2 }]);
    }

    #[tokio::test]
    async fn test_dropping_transport_closes_session() {
        let (connector, server) = MemoryConnector::pair();
        let mut transport = connector.connect("token").await.unwrap();
        transport
            .send(&ClientMessage::Subscribe { event_id: 3 })
            .await
            .unwrap();
        drop(transport);
        assert!(!server.is_open());
        assert_eq!(server.received(), vec![ClientMessage::Subscribe { event_id: 3 }]);
    }
}
