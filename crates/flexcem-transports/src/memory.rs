// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport
//!
//! [`pair`] returns a [`MemoryConnection`] for the engine and a [`MemoryPeer`]
//! that plays the resource manager. [`listener`] wraps the same thing behind
//! the [`Listener`] trait so accept loops can be exercised without sockets.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Connection, Listener};

/// Engine side of an in-memory connection
pub struct MemoryConnection {
    name: String,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Resource manager side of an in-memory connection
pub struct MemoryPeer {
    name: String,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Create a connected engine/peer pair
pub fn pair(name: impl Into<String>) -> (MemoryConnection, MemoryPeer) {
    let name = name.into();
    let (to_engine, engine_inbound) = mpsc::unbounded_channel();
    let (to_peer, peer_inbound) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        name: name.clone(),
        inbound: engine_inbound,
        outbound: Some(to_peer),
    };
    let peer = MemoryPeer {
        name,
        inbound: peer_inbound,
        outbound: Some(to_engine),
    };
    (connection, peer)
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, frame: Vec<u8>) -> TransportResult<()> {
        let sender = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        sender
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn receive(&mut self) -> Option<Vec<u8>> {
        if self.outbound.is_none() {
            return None;
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }

    fn peer(&self) -> String {
        format!("memory:{}", self.name)
    }
}

impl MemoryPeer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a raw frame to the engine
    pub fn send_raw(&self, frame: Vec<u8>) -> TransportResult<()> {
        let sender = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        sender
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a JSON value as one frame
    pub fn send_json(&self, value: &Value) -> TransportResult<()> {
        let frame = serde_json::to_vec(value).map_err(|e| TransportError::Other(e.to_string()))?;
        self.send_raw(frame)
    }

    /// Next frame from the engine, `None` once the engine closed its side
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Next frame parsed as JSON; frames that are not JSON are skipped
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(frame) = self.inbound.recv().await {
            if let Ok(value) = serde_json::from_slice(&frame) {
                return Some(value);
            }
        }
        None
    }

    /// Frame already queued by the engine, without waiting
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }

    /// Close the peer side; the engine sees end of stream
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

/// Listener yielding connections created through a [`MemoryConnector`]
pub struct MemoryListener {
    name: String,
    pending: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// Dials a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryConnector {
    pending: mpsc::UnboundedSender<MemoryConnection>,
}

/// Create a listener and the connector that feeds it
pub fn listener(name: impl Into<String>) -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryListener {
            name: name.into(),
            pending: rx,
        },
        MemoryConnector { pending: tx },
    )
}

impl MemoryConnector {
    /// Open a new connection; the engine side is handed to the listener
    pub fn connect(&self, name: impl Into<String>) -> TransportResult<MemoryPeer> {
        let (connection, peer) = pair(name);
        self.pending
            .send(connection)
            .map_err(|_| TransportError::ListenerClosed)?;
        Ok(peer)
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> TransportResult<Box<dyn Connection>> {
        match self.pending.recv().await {
            Some(connection) => Ok(Box::new(connection)),
            None => Err(TransportError::ListenerClosed),
        }
    }

    fn local_description(&self) -> String {
        format!("memory:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut connection, mut peer) = pair("rm");

        peer.send_json(&json!({"hello": "cem"})).unwrap();
        let frame = connection.receive().await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&frame).unwrap(), json!({"hello": "cem"}));

        connection.send(b"{\"hello\":\"rm\"}".to_vec()).await.unwrap();
        assert_eq!(peer.recv_json().await, Some(json!({"hello": "rm"})));
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream() {
        let (mut connection, mut peer) = pair("rm");
        peer.send_raw(b"last".to_vec()).unwrap();
        peer.close();

        assert_eq!(connection.receive().await, Some(b"last".to_vec()));
        assert_eq!(connection.receive().await, None);
        assert!(peer.send_raw(b"late".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_engine_close_is_idempotent() {
        let (mut connection, mut peer) = pair("rm");
        connection.close().await.unwrap();
        connection.close().await.unwrap();

        assert!(connection.send(b"x".to_vec()).await.is_err());
        assert_eq!(peer.recv().await, None);
        assert_eq!(connection.receive().await, None);
    }

    #[tokio::test]
    async fn test_listener_accepts_connections() {
        let (mut listener, connector) = listener("test");
        let peer = connector.connect("rm-a").unwrap();

        let mut connection = listener.accept().await.unwrap();
        assert_eq!(connection.peer(), "memory:rm-a");

        peer.send_raw(b"ping".to_vec()).unwrap();
        assert_eq!(connection.receive().await, Some(b"ping".to_vec()));

        drop(connector);
        assert!(matches!(listener.accept().await, Err(TransportError::ListenerClosed)));
    }
}
