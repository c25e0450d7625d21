//! Shared harness for the integration tests: a tiny in-process WebSocket
//! server and JSON frame helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub type ServerWs = WebSocketStream<TcpStream>;

static LOG_INIT: Once = Once::new();

/// Route client diagnostics to the test output, filtered by `RUST_LOG`.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Bind a local listener and serve every accepted socket with `serve`.
/// Each connection runs in its own task, so a test server survives client
/// reconnects.
pub async fn spawn_server<F, Fut>(serve: F) -> SocketAddr
where
    F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            match accept_ws(stream).await {
                Ok(ws) => {
                    tokio::spawn(serve(ws));
                }
                Err(_) => continue,
            }
        }
    });
    addr
}

/// Accept a WebSocket, echoing the requested sub-protocol back the way a
/// conforming server does.
pub async fn accept_ws(
    stream: TcpStream,
) -> Result<ServerWs, tokio_tungstenite::tungstenite::Error> {
    accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        if let Some(proto) = req.headers().get("sec-websocket-protocol") {
            resp.headers_mut()
                .insert("sec-websocket-protocol", proto.clone());
        }
        Ok(resp)
    })
    .await
}

pub async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame parsed as JSON; `None` once the socket is gone.
pub async fn recv_json(ws: &mut ServerWs) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Read frames until `connection_init` arrives, then acknowledge it.
/// Returns the init frame so tests can inspect the forwarded params.
pub async fn ack_init(ws: &mut ServerWs) -> Option<Value> {
    loop {
        let frame = recv_json(ws).await?;
        if frame["type"] == "connection_init" {
            send_json(ws, json!({"type": "connection_ack"})).await;
            return Some(frame);
        }
    }
}

/// Read frames until the given type arrives.
pub async fn recv_until(ws: &mut ServerWs, kind: &str) -> Option<Value> {
    loop {
        let frame = recv_json(ws).await?;
        if frame["type"] == kind {
            return Some(frame);
        }
    }
}

pub async fn close_with(ws: &mut ServerWs, code: u16, reason: &str) {
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })))
        .await;
}
