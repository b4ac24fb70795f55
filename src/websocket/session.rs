use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Response;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info};
use uuid::Uuid;

use super::broadcast::BroadcastFormatter;
use super::frame::Inbound;
use super::handshake::{HttpRequest, Handshaker};
use super::registry::ConnectionRegistry;
use crate::config::WEBSOCKET_URL;
use crate::error::ConnectionError;

/// Work for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Formatted broadcast text, shared with every other recipient.
    Broadcast(Arc<str>),
    /// Push out control replies the codec has queued (pongs).
    Flush,
    /// Flush whatever the codec has queued (including a close reply) and
    /// close the sink.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "0x{}", &simple[..8])
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    tx: OutboundSender,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, local: Option<SocketAddr>, tx: OutboundSender) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            local,
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> OutboundSender {
        self.tx.clone()
    }

    /// Identity shown to other clients in broadcast messages.
    pub fn identity(&self) -> String {
        match self.local {
            Some(local) => format!("id: {}, L:{} - R:{}", self.id, local, self.peer),
            None => format!("id: {}, R:{}", self.id, self.peer),
        }
    }

    /// Queues `out` for this connection; false once the writer is gone.
    pub fn send(&self, out: Outbound) -> bool {
        self.tx.send(out).is_ok()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PendingHandshake,
    Established,
    Closing,
    Closed,
}

/// What the transport should do after a unit has been dispatched.
#[derive(Debug)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Write this 101 response and switch the stream over to frames.
    Upgrade(Response<String>),
    /// Stop reading; the writer has been asked to finish the close handshake.
    Close,
}

pub struct Session {
    handle: ConnectionHandle,
    state: SessionState,
    handshaker: Option<Handshaker>,
    registry: Arc<ConnectionRegistry>,
    formatter: Arc<BroadcastFormatter>,
}

impl Session {
    pub fn new(
        handle: ConnectionHandle,
        registry: Arc<ConnectionRegistry>,
        formatter: Arc<BroadcastFormatter>,
    ) -> Self {
        Self {
            handle,
            state: SessionState::PendingHandshake,
            handshaker: None,
            registry,
            formatter,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handshaker(&self) -> Option<&Handshaker> {
        self.handshaker.as_ref()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    pub async fn dispatch(&mut self, inbound: Inbound) -> Result<Flow, ConnectionError> {
        match (self.state, inbound) {
            (SessionState::PendingHandshake, Inbound::HttpUpgradeRequest(request)) => {
                self.handle_handshake(request).await
            }
            (SessionState::PendingHandshake, other) => Err(ConnectionError::ProtocolViolation(
                format!("{} received before the handshake", other.kind()),
            )),
            (SessionState::Established, Inbound::HttpUpgradeRequest(_)) => Err(
                ConnectionError::ProtocolViolation("http request on an upgraded connection".to_string()),
            ),
            (SessionState::Established, Inbound::Close(frame)) => Ok(self.handle_close(frame).await),
            (SessionState::Established, Inbound::Ping(data)) => {
                // The codec queued a pong echoing `data` while decoding the ping.
                debug!("Ping from {} ({} bytes)", self.handle, data.len());
                self.handle.send(Outbound::Flush);
                Ok(Flow::Continue)
            }
            (SessionState::Established, Inbound::Text(text)) => {
                self.handle_text(&text).await;
                Ok(Flow::Continue)
            }
            (SessionState::Established, other @ (Inbound::Binary(_) | Inbound::Pong(_))) => {
                Err(ConnectionError::UnsupportedFrameType(other.kind()))
            }
            (SessionState::Closing | SessionState::Closed, other) => {
                debug!("Ignoring {} on closing connection {}", other.kind(), self.handle);
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_handshake(&mut self, request: HttpRequest) -> Result<Flow, ConnectionError> {
        if let Some(reason) = request.decode_failure() {
            return Err(ConnectionError::MalformedHandshakeRequest(reason.to_string()));
        }
        if !request.is_websocket_upgrade() {
            return Err(ConnectionError::MalformedHandshakeRequest(
                "missing Upgrade: websocket".to_string(),
            ));
        }

        let handshaker = Handshaker::new(WEBSOCKET_URL, &request)?;
        let response = handshaker.handshake_response();
        self.handshaker = Some(handshaker);
        self.state = SessionState::Established;
        self.registry.register(&self.handle).await;

        info!(
            "Handshake complete for {} on {}",
            self.handle,
            request.head().uri().path()
        );
        Ok(Flow::Upgrade(response))
    }

    async fn handle_close(&mut self, frame: Option<CloseFrame<'static>>) -> Flow {
        info!("Client initiated close for connection {}: {:?}", self.handle, frame);
        self.state = SessionState::Closing;
        self.registry.remove(&self.handle.id()).await;
        self.handle.send(Outbound::Close);
        Flow::Close
    }

    async fn handle_text(&self, text: &str) {
        let message = self.formatter.message(&self.handle.identity(), text);
        let delivered = self.registry.broadcast_all(&message).await;
        debug!("Broadcast from {} reached {} connections", self.handle, delivered);
    }
}
