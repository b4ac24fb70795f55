//! Connect, disconnect and fault notifications from the transport.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::broadcast::BroadcastFormatter;
use super::registry::ConnectionRegistry;
use super::session::{ConnectionHandle, OutboundSender, Session, SessionState};
use crate::error::ConnectionError;

pub struct ConnectionHooks {
    registry: Arc<ConnectionRegistry>,
    formatter: Arc<BroadcastFormatter>,
}

impl ConnectionHooks {
    pub fn new(registry: Arc<ConnectionRegistry>, formatter: Arc<BroadcastFormatter>) -> Self {
        Self { registry, formatter }
    }

    /// A new transport connection. The session starts outside the group.
    pub fn on_connect(
        &self,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        tx: OutboundSender,
    ) -> Session {
        let handle = ConnectionHandle::new(peer, local, tx);
        info!("Connection opened: {}", handle);
        Session::new(handle, self.registry.clone(), self.formatter.clone())
    }

    /// Transport teardown, whatever the cause. Safe to call after the close
    /// frame path already left the group, and safe to call twice; returns
    /// whether this call removed the connection.
    pub async fn on_disconnect(&self, session: &mut Session) -> bool {
        if session.state() == SessionState::Closed {
            return false;
        }
        let removed = self.registry.remove(&session.id()).await;
        session.mark_closed();
        info!("Connection closed: {}", session.handle());
        removed
    }

    /// A unit of work failed. The caller tears the connection down afterwards.
    pub fn on_fault(&self, session: &Session, err: &ConnectionError) {
        if err.is_protocol_error() {
            warn!("Closing connection {}: {}", session.handle(), err);
        } else {
            error!("Closing connection {}: {}", session.handle(), err);
        }
    }
}
