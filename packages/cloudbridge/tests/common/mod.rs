//! In-process relay double for integration tests.
//!
//! Each accepted WebSocket becomes a [`RelaySession`] that a test can drive
//! directly, or two sessions can be wired together with [`pair`] so that
//! envelopes addressed to one client's id are delivered to the other.

#![allow(dead_code)]

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, StatusCode, header::AUTHORIZATION};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct MockRelay {
    url: String,
    sessions: mpsc::UnboundedReceiver<RelaySession>,
    task: JoinHandle<()>,
}

pub struct RelaySession {
    pub authorization: Option<String>,
    pub path: String,
    ws: WebSocketStream<TcpStream>,
}

impl MockRelay {
    /// Accept any client.
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Reject clients whose bearer token differs from `token` with 401.
    pub async fn with_token(token: &str) -> Self {
        Self::spawn(Some(format!("Bearer {token}"))).await
    }

    async fn spawn(expected_auth: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, sessions) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let expected_auth = expected_auth.clone();
                tokio::spawn(async move {
                    let mut authorization = None;
                    let mut path = String::new();
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        authorization = req
                            .headers()
                            .get(AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        path = req.uri().path().to_string();
                        match &expected_auth {
                            Some(expected) if authorization.as_deref() != Some(expected.as_str()) => {
                                Err(http::Response::builder()
                                    .status(StatusCode::UNAUTHORIZED)
                                    .body(Some("invalid token".to_string()))
                                    .unwrap())
                            }
                            _ => Ok(resp),
                        }
                    };
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                        let _ = tx.send(RelaySession {
                            authorization,
                            path,
                            ws,
                        });
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/v1/connect"),
            sessions,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn next_session(&mut self) -> RelaySession {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a relay client")
            .expect("relay stopped")
    }

    /// A session opened within `wait`, if any.
    pub async fn try_next_session(&mut self, wait: Duration) -> Option<RelaySession> {
        tokio::time::timeout(wait, self.sessions.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RelaySession {
    /// Next text frame sent by the client, parsed as JSON.
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client disconnected")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(_) => panic!("client closed the relay connection"),
                _ => continue,
            }
        }
    }

    /// Next p2p frame as `(peer_id, decoded payload)`.
    pub async fn next_p2p(&mut self) -> (String, Vec<u8>) {
        let frame = self.next_frame().await;
        assert_eq!(frame["type"], "p2p", "unexpected frame {frame}");
        let peer = frame["peer_id"].as_str().unwrap().to_string();
        let payload = STANDARD
            .decode(frame["payload"].as_str().unwrap())
            .unwrap();
        (peer, payload)
    }

    pub async fn send_p2p(&mut self, peer_id: &str, payload: &[u8]) {
        let frame = json!({
            "type": "p2p",
            "peer_id": peer_id,
            "payload": STANDARD.encode(payload),
        });
        self.send_text(&frame.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Close the WebSocket from the relay side.
    pub async fn disconnect(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the client acknowledges so the close is observed.
        while let Ok(Some(Ok(_))) = tokio::time::timeout(WAIT, self.ws.next()).await {}
    }
}

/// Forward envelopes between two sessions, rewriting `peer_id` so each side
/// sees the other's id as the sender.
pub fn pair(a: RelaySession, a_id: &str, b: RelaySession, b_id: &str) -> JoinHandle<()> {
    let (mut a_sink, mut a_stream) = a.ws.split();
    let (mut b_sink, mut b_stream) = b.ws.split();
    let a_id = a_id.to_string();
    let b_id = b_id.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(Ok(Message::Text(text))) = a_stream.next() => {
                    if let Some(frame) = readdress(text.as_str(), &b_id, &a_id) {
                        let _ = b_sink.send(Message::text(frame)).await;
                    }
                }
                Some(Ok(Message::Text(text))) = b_stream.next() => {
                    if let Some(frame) = readdress(text.as_str(), &a_id, &b_id) {
                        let _ = a_sink.send(Message::text(frame)).await;
                    }
                }
                else => break,
            }
        }
    })
}

fn readdress(text: &str, expected_target: &str, sender: &str) -> Option<String> {
    let mut frame: Value = serde_json::from_str(text).ok()?;
    if frame["type"] != "p2p" || frame["peer_id"] != expected_target {
        return None;
    }
    frame["peer_id"] = Value::String(sender.to_string());
    Some(frame.to_string())
}

/// Local TCP echo service; returns its port.
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}
