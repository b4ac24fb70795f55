use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::ConnectionError;
use crate::websocket::broadcast::BroadcastFormatter;
use crate::websocket::frame::Inbound;
use crate::websocket::handshake;
use crate::websocket::lifecycle::ConnectionHooks;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{ConnectionId, Flow, Outbound, Session};

type FrameSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// How the frame phase of a connection ended.
enum Teardown {
    /// Close handshake in progress; let the writer flush the reply.
    Graceful,
    /// Peer vanished or the writer died.
    Abrupt,
}

pub struct WebSocketServer {
    registry: Arc<ConnectionRegistry>,
    hooks: ConnectionHooks,
    max_request_bytes: usize,
    shutdown_grace: Duration,
}

impl WebSocketServer {
    pub fn new(settings: &Settings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let formatter = Arc::new(BroadcastFormatter::new(
            settings.broadcast.timestamp_format.clone(),
        ));
        Self {
            hooks: ConnectionHooks::new(registry.clone(), formatter),
            registry,
            max_request_bytes: settings.server.max_request_bytes,
            shutdown_grace: Duration::from_secs(settings.server.shutdown_grace_secs),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves, then asks every
    /// established connection to close and waits up to the grace period for
    /// the connection tasks to finish. Stragglers are aborted.
    pub async fn run<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        connections.spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }
        drop(listener);

        let closing = self.registry.close_all().await;
        info!("Asked {} connections to close", closing);

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting them",
                connections.len(),
                self.shutdown_grace
            );
            connections.shutdown().await;
        }
        Ok(())
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let local = stream.local_addr().ok();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = self.hooks.on_connect(addr, local, tx);

        if let Err(e) = self.drive(&mut session, stream, rx).await {
            self.hooks.on_fault(&session, &e);
        }

        self.hooks.on_disconnect(&mut session).await;
    }

    async fn drive(
        &self,
        session: &mut Session,
        mut stream: TcpStream,
        rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<(), ConnectionError> {
        let (request, leftover) =
            match handshake::read_request(&mut stream, self.max_request_bytes).await? {
                Some(read) => read,
                None => {
                    debug!("Peer {} left before sending a request", session.handle());
                    return Ok(());
                }
            };

        let response = match session.dispatch(Inbound::HttpUpgradeRequest(request)).await {
            Ok(Flow::Upgrade(response)) => response,
            Ok(_) => {
                return Err(ConnectionError::ProtocolViolation(
                    "handshake did not produce an upgrade".to_string(),
                ))
            }
            Err(e) => {
                if let Some(response) = e.http_response() {
                    handshake::send_http_response(&mut stream, &response).await?;
                }
                return Err(e);
            }
        };
        handshake::send_http_response(&mut stream, &response).await?;

        let ws_stream =
            WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;
        let (ws_sink, mut ws_stream) = ws_stream.split();

        let mut send_task = tokio::spawn(write_outbound(ws_sink, rx, session.id()));
        let mut send_done = false;

        let outcome = loop {
            tokio::select! {
                message = ws_stream.next() => match message {
                    Some(Ok(msg)) => match session.dispatch(Inbound::from(msg)).await {
                        Ok(Flow::Continue) => {}
                        Ok(_) => break Ok(Teardown::Graceful),
                        Err(e) => break Err(e),
                    },
                    Some(Err(e)) => break Err(ConnectionError::from(e)),
                    None => break Ok(Teardown::Abrupt),
                },
                _ = &mut send_task => {
                    send_done = true;
                    break Ok(Teardown::Abrupt);
                }
            }
        };

        if !send_done {
            if let Ok(Teardown::Graceful) = outcome {
                if tokio::time::timeout(self.shutdown_grace, &mut send_task).await.is_err() {
                    debug!("Writer for {} did not finish the close handshake in time", session.handle());
                }
            }
            send_task.abort();
        }

        outcome.map(|_| ())
    }
}

/// Drains a connection's outbound queue into the socket, flushing once the
/// queue runs dry.
async fn write_outbound(
    mut ws_sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    id: ConnectionId,
) {
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(out) = next.take() {
            match out {
                Outbound::Broadcast(text) => {
                    if let Err(e) = ws_sink.feed(Message::Text(text.to_string())).await {
                        error!("Error sending WebSocket message to {}: {}", id, e);
                        return;
                    }
                }
                Outbound::Flush => {}
                Outbound::Close => {
                    if let Err(e) = ws_sink.close().await {
                        debug!("Error closing WebSocket connection {}: {}", id, e);
                    }
                    return;
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = ws_sink.flush().await {
            error!("Error flushing WebSocket connection {}: {}", id, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::sleep;
    use tokio_tungstenite::connect_async;

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    async fn start() -> (Arc<WebSocketServer>, SocketAddr) {
        let settings = Settings::defaults().expect("default settings");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(&settings));
        tokio::spawn(server.clone().run(listener, std::future::pending()));
        (server, addr)
    }

    async fn wait_for_count(server: &WebSocketServer, expected: usize) {
        for _ in 0..100 {
            if server.registry().connection_count().await == expected {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!(
            "registry never reached {} connections (has {})",
            expected,
            server.registry().connection_count().await
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_websocket_server() {
        let (server, addr) = start().await;

        let (mut ws, _) = connect_async(format!("ws://{}/websocket", addr)).await.unwrap();
        wait_for_count(&server, 1).await;

        ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Pong(data) => assert_eq!(data, b"hb"),
            other => panic!("expected pong, got {:?}", other),
        }

        ws.send(Message::Text("hello".into())).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => assert!(text.ends_with("] ===>>> hello")),
            other => panic!("expected text, got {:?}", other),
        }

        ws.close(None).await.unwrap();
        wait_for_count(&server, 0).await;
    }

    #[tokio::test]
    async fn test_frames_pipelined_with_the_request() {
        let (server, addr) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut bytes = b"GET /websocket HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n"
            .to_vec();
        // Masked ping carrying "ab" sent before the 101 arrives.
        bytes.extend_from_slice(&[0x89, 0x82, 0, 0, 0, 0, b'a', b'b']);
        stream.write_all(&bytes).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        while !received.ends_with(&[0x8a, 0x02, b'a', b'b']) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert!(received.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        wait_for_count(&server, 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let settings = Settings::defaults().expect("default settings");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(&settings));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.clone().run(listener, async {
            let _ = stop_rx.await;
        }));

        let (mut ws, _) = connect_async(format!("ws://{}/websocket", addr)).await.unwrap();
        wait_for_count(&server, 1).await;

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        // run() only returns once the connection task has finished.
        assert_eq!(server.registry().connection_count().await, 0);

        match ws.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_close_frames_survive_runtime_shutdown() {
        let server_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let client_rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let settings = Settings::defaults().expect("default settings");
        let listener = server_rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(&settings));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = server_rt.spawn(server.clone().run(listener, async {
            let _ = stop_rx.await;
        }));

        let mut clients = client_rt.block_on(async {
            let mut clients = Vec::new();
            for _ in 0..10 {
                let (ws, _) = connect_async(format!("ws://{}/websocket", addr)).await.unwrap();
                clients.push(ws);
            }
            clients
        });
        server_rt.block_on(wait_for_count(&server, 10));

        // Same sequence as the binary: stop, wait for run(), then tear the runtime down.
        stop_tx.send(()).unwrap();
        server_rt.block_on(running).unwrap().unwrap();
        server_rt.shutdown_timeout(Duration::from_millis(100));

        client_rt.block_on(async {
            for ws in clients.iter_mut() {
                match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
                    Ok(Some(Ok(Message::Close(_)))) => {}
                    other => panic!("expected close frame, got {:?}", other),
                }
            }
        });
    }
}
