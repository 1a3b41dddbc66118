// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! WebSocket listener
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the configured
//! path and hands out one [`WsConnection`] per client. Upgrades run as
//! separate tasks, so a client that stalls its handshake never holds up the
//! ones behind it. Text and binary frames are both delivered as raw bytes.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::traits::{Connection, Listener};

/// Listener settings
#[derive(Debug, Clone)]
pub struct WsListenerConfig {
    /// `host:port` to bind
    pub address: String,
    /// Only upgrade requests for this path are accepted
    pub path: String,
    /// Largest accepted message in bytes
    pub max_message_size: usize,
    /// Upper bound on the upgrade handshake of a single client
    pub handshake_timeout: Duration,
}

impl Default for WsListenerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            path: "/ws".to_string(),
            max_message_size: 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket server listener
pub struct WsListener {
    config: WsListenerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Upgrades in progress; aborted when the listener is dropped
    upgrades: JoinSet<TransportResult<WsConnection>>,
}

impl WsListener {
    /// Bind the TCP socket
    pub async fn bind(config: WsListenerConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", config.address, e)))?;
        let local_addr = listener.local_addr()?;

        info!("🦀 [WS] Listening on ws://{}{}", local_addr, config.path);

        Ok(Self {
            config,
            listener,
            local_addr,
            upgrades: JoinSet::new(),
        })
    }

    /// Bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of clients whose upgrade has not finished yet
    pub fn pending_upgrades(&self) -> usize {
        self.upgrades.len()
    }

    async fn upgrade(
        config: WsListenerConfig,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> TransportResult<WsConnection> {
        let expected_path = config.path;
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected_path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some(format!(
                    "unknown path {}",
                    request.uri().path()
                )));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(config.max_message_size),
            max_frame_size: Some(config.max_message_size),
            ..WebSocketConfig::default()
        };

        let upgrade = accept_hdr_async_with_config(stream, check_path, Some(ws_config));
        let ws_stream = tokio::time::timeout(config.handshake_timeout, upgrade)
            .await
            .map_err(|_| TransportError::HandshakeFailed(format!("{}: timed out", peer_addr)))?
            .map_err(|e| TransportError::HandshakeFailed(format!("{}: {}", peer_addr, e)))?;

        Ok(WsConnection {
            peer_addr,
            stream: ws_stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> TransportResult<Box<dyn Connection>> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) =
                        accepted.map_err(|e| TransportError::AcceptFailed(e.to_string()))?;
                    debug!("[WS] New TCP connection from {}", peer_addr);
                    self.upgrades
                        .spawn(Self::upgrade(self.config.clone(), stream, peer_addr));
                }
                Some(finished) = self.upgrades.join_next(), if !self.upgrades.is_empty() => {
                    match finished {
                        Ok(Ok(connection)) => {
                            info!("[WS] Client {} connected", connection.peer_addr);
                            return Ok(Box::new(connection));
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(e) => warn!("[WS] Upgrade task failed: {}", e),
                    }
                }
            }
        }
    }

    fn local_description(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.config.path)
    }
}

/// One upgraded WebSocket client
pub struct WsConnection {
    peer_addr: SocketAddr,
    stream: WebSocketStream<TcpStream>,
    closed: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return Some(data),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("[WS] Client {} closed the connection", self.peer_addr);
                    self.closed = true;
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("[WS] Client {} read error: {}", self.peer_addr, e);
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!("[WS] Close handshake with {} failed: {}", self.peer_addr, e);
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    fn local_config() -> WsListenerConfig {
        WsListenerConfig {
            address: "127.0.0.1:0".to_string(),
            ..WsListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_text_and_binary_frames() {
        let mut listener = WsListener::bind(local_config()).await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr());

        let client = tokio::spawn(async move {
            let (mut socket, _) = connect_async(url).await.unwrap();
            socket.send(Message::Text("{\"a\":1}".to_string())).await.unwrap();
            socket.send(Message::Binary(vec![0xff, 0x00])).await.unwrap();
            let reply = socket.next().await.unwrap().unwrap();
            socket.close(None).await.unwrap();
            reply
        });

        let mut connection = listener.accept().await.unwrap();
        assert_eq!(connection.receive().await, Some(b"{\"a\":1}".to_vec()));
        assert_eq!(connection.receive().await, Some(vec![0xff, 0x00]));
        connection.send(b"{\"ok\":true}".to_vec()).await.unwrap();

        let reply = client.await.unwrap();
        assert_eq!(reply, Message::Text("{\"ok\":true}".to_string()));
        assert_eq!(connection.receive().await, None);
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_others() {
        let config = WsListenerConfig {
            handshake_timeout: Duration::from_secs(30),
            ..local_config()
        };
        let mut listener = WsListener::bind(config).await.unwrap();
        let addr = listener.local_addr();
        let url = format!("ws://{}/ws", addr);

        // Connects but never sends the upgrade request
        let _silent = TcpStream::connect(addr).await.unwrap();
        let client = tokio::spawn(async move {
            let (mut socket, _) = connect_async(url).await.unwrap();
            socket.send(Message::Text("hello".to_string())).await.unwrap();
            socket
        });

        let mut connection = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("healthy client waited behind the silent one")
            .unwrap();
        assert_eq!(connection.receive().await, Some(b"hello".to_vec()));
        assert_eq!(listener.pending_upgrades(), 1);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let config = WsListenerConfig {
            handshake_timeout: Duration::from_millis(100),
            ..local_config()
        };
        let mut listener = WsListener::bind(config).await.unwrap();
        let _silent = TcpStream::connect(listener.local_addr()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("handshake timeout never fired");
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        assert_eq!(listener.pending_upgrades(), 0);
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let mut listener = WsListener::bind(local_config()).await.unwrap();
        let url = format!("ws://{}/other", listener.local_addr());

        let client = tokio::spawn(async move { connect_async(url).await.is_err() });

        assert!(matches!(
            listener.accept().await,
            Err(TransportError::HandshakeFailed(_))
        ));
        assert!(client.await.unwrap());
    }
}
