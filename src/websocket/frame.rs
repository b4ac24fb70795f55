use std::fmt;

use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::handshake::HttpRequest;

/// One unit of inbound data for a connection: the upgrade request before the
/// handshake, decoded frames after it.
#[derive(Debug)]
pub enum Inbound {
    HttpUpgradeRequest(HttpRequest),
    Close(Option<CloseFrame<'static>>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    HttpRequest,
    Close,
    Ping,
    Pong,
    Text,
    Binary,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::HttpRequest => "http request",
            FrameKind::Close => "close",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::Text => "text",
            FrameKind::Binary => "binary",
        };
        f.write_str(name)
    }
}

impl Inbound {
    pub fn kind(&self) -> FrameKind {
        match self {
            Inbound::HttpUpgradeRequest(_) => FrameKind::HttpRequest,
            Inbound::Close(_) => FrameKind::Close,
            Inbound::Ping(_) => FrameKind::Ping,
            Inbound::Pong(_) => FrameKind::Pong,
            Inbound::Text(_) => FrameKind::Text,
            Inbound::Binary(_) => FrameKind::Binary,
        }
    }
}

impl From<Message> for Inbound {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Inbound::Text(text),
            Message::Binary(data) => Inbound::Binary(data),
            Message::Ping(data) => Inbound::Ping(data),
            Message::Pong(data) => Inbound::Pong(data),
            Message::Close(frame) => Inbound::Close(frame),
            // Raw frames only surface on the write path; anything else is opaque payload.
            Message::Frame(frame) => Inbound::Binary(frame.into_data()),
        }
    }
}
