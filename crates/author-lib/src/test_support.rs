// Test helpers
// Scripted agent runtime and health endpoint for async tests

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::models::events::AgentEvent;

const WAIT: Duration = Duration::from_secs(5);

/// WebSocket server that hands each accepted socket to the test
pub struct FakeBackend {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<FakeConnection>,
    acceptor: JoinHandle<()>,
}

/// One accepted client socket
pub struct FakeConnection {
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        let acceptor = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(socket) = accept_async(tcp).await else {
                    continue;
                };
                let (mut sink, mut source) = socket.split();
                let (in_tx, incoming) = mpsc::unbounded_channel();
                let (outgoing, mut out_rx) = mpsc::unbounded_channel::<String>();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                                    let _ = in_tx.send(value);
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            out = out_rx.recv() => match out {
                                Some(text) => {
                                    if sink.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });

                if tx.send(FakeConnection { incoming, outgoing }).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            connections,
            acceptor,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/ws/agent", self.addr)).unwrap()
    }

    pub async fn next_connection(&mut self) -> FakeConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no client connected")
            .expect("acceptor stopped")
    }

    pub fn try_next_connection(&mut self) -> Option<FakeConnection> {
        self.connections.try_recv().ok()
    }

    /// Stop listening; later connection attempts are refused
    pub fn shutdown(&self) {
        self.acceptor.abort();
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl FakeConnection {
    /// Next JSON message from the client
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("client sent nothing")
            .expect("client disconnected")
    }

    pub fn send(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        self.outgoing.send(text.to_string()).unwrap();
    }

    /// Expect `init` and acknowledge it
    pub async fn accept_init(&mut self) -> Value {
        let init = self.recv().await;
        assert_eq!(init["type"], "init");
        self.send(json!({
            "type": "initialized",
            "project_path": init["project_path"],
            "author_mode": init["author_mode"],
        }));
        init
    }

    pub async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Some(value)) = tokio::time::timeout(window, self.incoming.recv()).await {
            panic!("unexpected client message: {}", value);
        }
    }

    /// Wait until the client closes its side
    pub async fn wait_closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.incoming.recv().await.is_some() {}
        })
        .await
        .expect("client kept the socket open");
    }

    /// Close the socket from the runtime side
    pub fn close(self) {}
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> AgentEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no event emitted")
        .expect("event channel closed")
}

/// Stream-scoped events up to and including the next terminal one
pub async fn collect_stream(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        if event.stream_id().is_none() {
            continue;
        }
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Serve `GET /health` like the agent runtime does
pub async fn health_server() -> SocketAddr {
    use axum::{routing::get, Json, Router};

    let app = Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "healthy"})) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}
