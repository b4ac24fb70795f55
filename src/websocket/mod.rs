//! WebSocket module for the broadcast server
//!
//! This module handles the upgrade handshake, per-connection session state,
//! frame dispatch, and fan-out of text messages to the broadcast group.

pub mod broadcast;
pub mod frame;
pub mod handshake;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod session;

pub use broadcast::{format_broadcast, BroadcastFormatter, BroadcastMessage};
pub use frame::{FrameKind, Inbound};
pub use handshake::{Handshaker, HttpRequest};
pub use lifecycle::ConnectionHooks;
pub use registry::ConnectionRegistry;
pub use server::WebSocketServer;
pub use session::{ConnectionHandle, ConnectionId, Flow, Outbound, Session, SessionState};
