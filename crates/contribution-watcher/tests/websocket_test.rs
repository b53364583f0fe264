//! Websocket handshake tests against a listening server
//!
//! The in-process router tests cannot perform an upgrade, so these bind a
//! real socket and connect with a websocket client.

use futures::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use contribution_watcher::auth::hash_secret;
use contribution_watcher::notifier::{NotifierSet, Sink, WebSocketHub};
use contribution_watcher::{api, Config, MockNode, Watcher};

const SECRET: &str = "websocket-secret";
const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

async fn serve() -> SocketAddr {
    let node = MockNode::new(1_000);
    let config = Config::for_mock(hash_secret(SECRET), XPUB);
    let notifier = NotifierSet::new(vec![Sink::WebSocket(WebSocketHub::new(16))]);

    let (watcher, _fatal) = Watcher::new(config, Arc::new(node), notifier, None).unwrap();
    let app = api::create_router(Arc::new(watcher));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(
    addr: SocketAddr,
    protocol: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(protocol).unwrap());

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("handshake failed");
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
        protocol
    );
    stream
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_valid_secret_is_accepted() {
    let addr = serve().await;
    let mut stream = connect(addr, SECRET).await;

    let message = next_json(&mut stream).await;
    assert_eq!(message["type"], "auth");
    assert_eq!(message["payload"], "accepted");
}

#[tokio::test]
async fn test_invalid_secret_is_told_and_closed() {
    let addr = serve().await;
    let mut stream = connect(addr, "not-the-secret").await;

    let message = next_json(&mut stream).await;
    assert_eq!(message["type"], "auth");
    assert_eq!(message["payload"], "rejected");

    match stream.next().await {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected the server to close, got {:?}", other),
    }
}
