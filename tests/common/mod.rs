#![allow(dead_code)]

use broadcast_server::{Settings, WebSocketServer};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub server: Arc<WebSocketServer>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub async fn start() -> Self {
        let settings = Settings::defaults().expect("default settings");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(&settings));
        tokio::spawn(server.clone().run(listener, std::future::pending()));
        Self { server, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    pub async fn connect(&self) -> (Client, SocketAddr) {
        let (ws, response) = connect_async(self.url()).await.expect("handshake");
        assert_eq!(response.status(), 101);
        let local = match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.local_addr().unwrap(),
            _ => unreachable!("plain tcp only"),
        };
        (ws, local)
    }

    pub async fn connection_count(&self) -> usize {
        self.server.registry().connection_count().await
    }

    pub async fn wait_for_count(&self, expected: usize) {
        for _ in 0..250 {
            if self.connection_count().await == expected {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!(
            "registry never reached {} connections (has {})",
            expected,
            self.connection_count().await
        );
    }
}

/// Next text frame, skipping nothing; panics on anything else.
pub async fn recv_text(ws: &mut Client) -> String {
    match timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// True when nothing arrives within `wait`.
pub async fn stays_quiet(ws: &mut Client, wait: Duration) -> bool {
    timeout(wait, ws.next()).await.is_err()
}

/// The next frame must be a Close; a dropped socket does not count.
pub async fn expect_close_frame(ws: &mut Client) {
    match timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Close(_)))) => {}
        other => panic!("expected a close frame, got {:?}", other),
    }
}

/// Reads until the server closes the connection.
pub async fn wait_for_close(ws: &mut Client) {
    loop {
        match timeout(RECV_TIMEOUT, ws.next()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(other))) => panic!("unexpected frame before close: {:?}", other),
            Err(_) => panic!("server did not close the connection"),
        }
    }
}
